mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use etcd_archive::{
    config::{self, ConfigUpdate},
    logging,
};

use crate::commands::{dump::DumpArgs, start::StartArgs};

#[derive(Parser)]
#[command(author, version, about = "Archives etcd change history for cluster resources")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.etcd-archive/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start archiving changes from etcd
    Start(StartArgs),
    /// Print the contents of the archive
    Dump(DumpArgs),
    /// Update stored configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// The address etcd can be reached on
    #[arg(long)]
    etcd: Option<String>,

    /// Where the archive lives on disk
    #[arg(long)]
    archive: Option<PathBuf>,

    /// How far behind the etcd horizon watches begin
    #[arg(long)]
    window: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => commands::start::execute(cli.config, args).await,
        Commands::Dump(args) => commands::dump::execute(cli.config, args),
        Commands::Config(args) => configure(cli.config, args),
    }
}

fn configure(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut cfg, path) = config::load_or_default(config_path)?;
    cfg.apply_update(ConfigUpdate {
        etcd_endpoint: args.etcd,
        archive_path: args.archive,
        window: args.window,
    });
    cfg.save(&path)?;
    println!("configuration written to {}", path.display());
    Ok(())
}
