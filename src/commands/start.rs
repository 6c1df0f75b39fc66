use std::{env, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Args;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use etcd_archive::{
    archive::{ArchiveStore, Archiver, LogArchiver},
    config::{self, ConfigUpdate},
    pipeline::Pipeline,
    source::etcd::EtcdClient,
};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const ETCD_ADDR_ENV: &str = "ETCD_ADDR";

#[derive(Args, Clone)]
pub struct StartArgs {
    /// Override the configured etcd endpoint
    #[arg(long)]
    pub etcd: Option<String>,

    /// Override the configured archive path
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Override the configured watch window
    #[arg(long)]
    pub window: Option<u64>,

    /// Log operations instead of writing the archive
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut cfg, _path) = config::load_or_default(config_path)?;
    cfg.apply_update(ConfigUpdate {
        etcd_endpoint: args.etcd.or_else(|| env::var(ETCD_ADDR_ENV).ok()),
        archive_path: args.archive,
        window: args.window,
    });

    let client = EtcdClient::new(&cfg.etcd_endpoint)?;
    info!("waiting for etcd at {}", cfg.etcd_endpoint);
    client.check().await?;

    let store = if args.dry_run {
        None
    } else {
        Some(Arc::new(ArchiveStore::open(&cfg.archive_path)?))
    };
    let archiver: Arc<dyn Archiver> = match &store {
        Some(store) => Arc::clone(store) as Arc<dyn Archiver>,
        None => Arc::new(LogArchiver),
    };

    let pipeline =
        Arc::new(Pipeline::new(client, archiver, cfg.prefixes.clone()).with_window(cfg.window));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = store
        .clone()
        .map(|store| tokio::spawn(report_loop(store, shutdown_rx.clone())));

    let mut run = tokio::spawn(Arc::clone(&pipeline).run(shutdown_rx));
    tokio::select! {
        result = &mut run => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }
    run.await??;

    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    Ok(())
}

async fn report_loop(store: Arc<ArchiveStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.dump(&mut io::stdout()) {
                    error!("unable to dump archive: {err}");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
