use std::{io, path::PathBuf};

use anyhow::Result;
use clap::Args;

use etcd_archive::{archive::ArchiveStore, config};

#[derive(Args)]
pub struct DumpArgs {
    /// Archive to read; defaults to the configured path
    #[arg(long)]
    pub archive: Option<PathBuf>,
}

pub fn execute(config_path: Option<PathBuf>, args: DumpArgs) -> Result<()> {
    let (cfg, _path) = config::load_or_default(config_path)?;
    let path = args.archive.unwrap_or(cfg.archive_path);

    let store = ArchiveStore::open_read_only(&path)?;
    store.dump(&mut io::stdout())?;
    Ok(())
}
