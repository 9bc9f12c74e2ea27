//! Kernel-event file discovery.
//!
//! A recursive `notify` watcher on the spool subtree, narrowed to the two
//! events that mean "the producer is done with this file": close-after-write
//! and moved-into-the-tree. Raw notifications arrive on the notify thread
//! and cross into async land over a buffered channel; an async loop filters
//! them and forwards the survivors to the cache.

use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::filename::SystemPath;
use crate::metrics;

/// Mirrors the inbound cache buffer so a burst of events cannot stall the
/// notify callback thread.
const EVENT_BUFFER: usize = 1_000_000;

pub struct Watcher {
    // Held for its Drop: dropping the notify handle stops the kernel watch.
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<Event>,
    outbound: mpsc::Sender<SystemPath>,
    datatype: String,
}

impl Watcher {
    /// Starts a recursive watch on `directory`. The directory must already
    /// exist; producers create their dated subdirectories later and those are
    /// picked up automatically.
    pub fn new(
        directory: &Path,
        datatype: &str,
        outbound: mpsc::Sender<SystemPath>,
    ) -> Result<Self> {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if let Err(err) = events_tx.blocking_send(event) {
                        warn!("watch event channel send failed: {err}");
                    }
                }
                Err(err) => warn!("filesystem watch error: {err}"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(directory, RecursiveMode::Recursive)?;
        info!("watching {} for {datatype} files", directory.display());
        Ok(Self {
            _watcher: watcher,
            events,
            outbound,
            datatype: datatype.to_string(),
        })
    }

    /// Forwards eligible event paths into the cache channel until the context
    /// cancels or either channel closes.
    pub async fn listen_forever(mut self, ctx: CancellationToken) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("stopping {} watcher", self.datatype);
                    return;
                }
                received = self.events.recv() => match received {
                    Some(event) => {
                        if !self.forward(event).await {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Returns false when the downstream channel has closed.
    async fn forward(&self, event: Event) -> bool {
        let (source, paths) = match classify(&event) {
            Some(classified) => classified,
            None => return true,
        };
        for path in paths {
            metrics::FILE_EVENTS
                .with_label_values(&[&self.datatype, source])
                .inc();
            // Sanity check before emitting: events for files that vanished or
            // were never readable are suppressed here rather than making the
            // cache chase them.
            if std::fs::File::open(&path).is_err() {
                metrics::FILE_EVENT_ERRORS
                    .with_label_values(&[&self.datatype, "open"])
                    .inc();
                warn!("could not open {} for {source} event", path.display());
                continue;
            }
            if self.outbound.send(SystemPath::from(path.as_path())).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Picks out close-write and moved-to events and the paths that matter for
/// each. A rename observed with both endpoints only surfaces the destination.
fn classify(event: &Event) -> Option<(&'static str, Vec<PathBuf>)> {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            Some(("closewrite", event.paths.clone()))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(("movedto", event.paths.clone()))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some((
            "movedto",
            event.paths.last().cloned().into_iter().collect(),
        )),
        _ => None,
    }
}
