//! Change capture: watches the source store and projects its events into
//! the archive.
//!
//! Two long-lived tasks cooperate. The watcher establishes watches against
//! the source and hands each event stream through a bounded channel; the
//! consumer drains one stream end-to-end before accepting the next. There is
//! no persisted cursor: the start position is re-derived from the source's
//! horizon, so history further back than the window is not recoverable.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::{
    archive::Archiver,
    error::{ArchiveError, Result},
    mapper::PrefixMap,
    source::{extract_uid, WatchEvent, WatchSource},
};

pub const DEFAULT_WINDOW: u64 = 1000;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 64;

pub struct Pipeline<S> {
    source: Arc<S>,
    archiver: Arc<dyn Archiver>,
    mapper: PrefixMap,
    window: u64,
}

impl<S: WatchSource + 'static> Pipeline<S> {
    pub fn new(source: S, archiver: Arc<dyn Archiver>, mapper: PrefixMap) -> Self {
        Self {
            source: Arc::new(source),
            archiver,
            mapper,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window.max(1);
        self
    }

    /// Runs the watcher and consumer until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let horizon = self.source.get("/", false, false).await?.etcd_index;
        let recent = Arc::new(AtomicU64::new(initial_index(horizon, self.window)));

        let (handoff_tx, handoff_rx) = mpsc::channel(1);

        let watcher = tokio::spawn({
            let pipeline = Arc::clone(&self);
            let recent = Arc::clone(&recent);
            let shutdown = shutdown.clone();
            async move { pipeline.watch_loop(handoff_tx, recent, shutdown).await }
        });
        let consumer = tokio::spawn({
            let pipeline = Arc::clone(&self);
            async move { pipeline.consume_loop(handoff_rx, recent).await }
        });

        watcher
            .await
            .map_err(|err| ArchiveError::Internal(err.to_string()))?;
        consumer
            .await
            .map_err(|err| ArchiveError::Internal(err.to_string()))?;
        Ok(())
    }

    async fn watch_loop(
        &self,
        handoff: mpsc::Sender<mpsc::Receiver<WatchEvent>>,
        recent: Arc<AtomicU64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut window = RetryWindow::new(self.window);
        while !*shutdown.borrow() {
            let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
            if handoff.send(events_rx).await.is_err() {
                break;
            }

            let from = recent.load(Ordering::SeqCst);
            tokio::select! {
                result = self.source.watch("/", from, true, events_tx) => match result {
                    Ok(()) => window.reset(),
                    Err(err) => {
                        let distance = window.shrink();
                        if let Some(current) = err.current_index() {
                            recent.store(current.saturating_sub(distance), Ordering::SeqCst);
                        }
                        error!("unable to watch: {err}");
                    }
                },
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn consume_loop(
        &self,
        mut handoff: mpsc::Receiver<mpsc::Receiver<WatchEvent>>,
        recent: Arc<AtomicU64>,
    ) {
        info!("ready to archive changes from etcd");
        while let Some(mut events) = handoff.recv().await {
            info!("watching");
            while let Some(event) = events.recv().await {
                match self.apply(&event) {
                    Err(err) => error!("error: {err}"),
                    Ok(0) => break,
                    Ok(index) => recent.store(index, Ordering::SeqCst),
                }
            }
        }
    }

    /// Translates one raw watch event into archive operations and returns
    /// the position to advance to. Zero means the stream yielded nothing to
    /// position against and the consumer should await the next watch.
    pub fn apply(&self, event: &WatchEvent) -> Result<u64> {
        let (path, index) = match (&event.node, &event.prev_node) {
            (Some(node), _) => (node.key.as_str(), node.modified_index),
            (None, Some(prev)) => {
                return Err(ArchiveError::MalformedEvent(format!(
                    "event {} at {} for {} has no current node",
                    event.action, event.etcd_index, prev.key
                )));
            }
            (None, None) => return Ok(event.etcd_index),
        };

        let Some(key) = self.mapper.key_for_path(path) else {
            debug!("ignoring path {path}");
            return Ok(index);
        };

        match event.action.as_str() {
            // deletions surface the final contents on the previous node
            "expire" | "delete" | "compareAndDelete" => {
                let (Some(node), Some(prev)) = (&event.node, &event.prev_node) else {
                    return Err(ArchiveError::MalformedEvent(format!(
                        "event {} at {} had no previous node, cannot record deletion",
                        event.action, event.etcd_index
                    )));
                };
                let uid = extract_uid(prev.value.as_bytes()).unwrap_or_default();
                self.archiver.delete(
                    &key.resource,
                    &key.namespace,
                    &key.name,
                    &uid,
                    node.modified_index,
                )?;
                Ok(index)
            }

            "create" | "set" | "compareAndSwap" => match (&event.node, &event.prev_node) {
                (Some(node), Some(prev)) => {
                    // The replaced version is observable exactly once, on
                    // this event. Archive it under its own index before
                    // recording the replacement, so a watch that started
                    // mid-stream still backfills that point in history.
                    let mut errs = Vec::new();

                    let prev_value = prev.value.as_bytes();
                    let uid = extract_uid(prev_value).unwrap_or_default();
                    let archived = if prev.created_index != prev.modified_index {
                        self.archiver.update(
                            &key.resource,
                            &key.namespace,
                            &key.name,
                            &uid,
                            prev.modified_index,
                            prev_value,
                        )
                    } else {
                        self.archiver.create(
                            &key.resource,
                            &key.namespace,
                            &key.name,
                            &uid,
                            prev.modified_index,
                            prev_value,
                        )
                    };
                    if let Err(err) = archived {
                        errs.push(err);
                    }

                    let value = node.value.as_bytes();
                    let uid = extract_uid(value).unwrap_or_default();
                    if let Err(err) = self.archiver.update(
                        &key.resource,
                        &key.namespace,
                        &key.name,
                        &uid,
                        node.modified_index,
                        value,
                    ) {
                        errs.push(err);
                    }

                    match ArchiveError::aggregate(errs) {
                        Some(err) => Err(err),
                        None => Ok(index),
                    }
                }
                (Some(node), None) => {
                    let value = node.value.as_bytes();
                    let uid = extract_uid(value).unwrap_or_default();
                    self.archiver.create(
                        &key.resource,
                        &key.namespace,
                        &key.name,
                        &uid,
                        node.created_index,
                        value,
                    )?;
                    Ok(index)
                }
                (None, _) => Err(ArchiveError::MalformedEvent(format!(
                    "event {} at {index} had no node",
                    event.action
                ))),
            },

            // quorum reads echo through the watch; nothing to record
            "get" => Ok(index),

            other => Err(ArchiveError::UnrecognizedAction {
                action: other.to_string(),
                index: event.etcd_index,
            }),
        }
    }
}

fn initial_index(horizon: u64, window: u64) -> u64 {
    if horizon > window {
        horizon - window + 1
    } else {
        1
    }
}

/// Watch restart distance behind the source's reported index, shrunk toward
/// the live range on consecutive failures.
#[derive(Debug)]
struct RetryWindow {
    base: u64,
    current: u64,
}

impl RetryWindow {
    fn new(base: u64) -> Self {
        Self {
            base,
            current: base,
        }
    }

    /// Shrinks by a tenth, truncating, and returns the new distance.
    fn shrink(&mut self) -> u64 {
        self.current = self.current * 9 / 10;
        self.current
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}
