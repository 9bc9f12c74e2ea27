//! The per-datatype batching cache and its event loop.
//!
//! All mutation of the subdir → tarball map happens on the one task that runs
//! [`TarCache::listen_forever`]; discovery tasks only ever touch the inbound
//! channel. The channel's very large buffer is the pipeline's whole
//! flow-control story: while an upload retries, new filenames pile up there
//! instead of being dropped.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bytecount::ByteCount;
use crate::filename::SystemPath;
use crate::metrics;
use crate::spread::Spread;
use crate::tarball::{Tarball, TimerHandle};
use crate::uploader::Uploader;

/// Sized so that discovery never blocks on a stalled upload in practice.
const INBOUND_BUFFER: usize = 1_000_000;

/// Immutable settings for one datatype's cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// The root that archive member names are relative to. Discovery may be
    /// scoped to a subtree of it. Stored internally with a trailing `/`.
    pub directory: String,
    pub datatype: String,
    pub size_threshold: ByteCount,
    /// Distribution the per-tarball age timers draw from.
    pub age_delays: Spread,
    /// Fraction of files to archive; the rest are deleted unarchived.
    pub sample_ratio: f64,
    /// Extra key/value pairs recorded on every archive member.
    pub metadata: BTreeMap<String, String>,
}

pub struct TarCache {
    root: String,
    config: CacheConfig,
    uploader: Arc<dyn Uploader>,
    tarballs: HashMap<String, Tarball>,
    inbound: mpsc::Receiver<SystemPath>,
    timeout_tx: mpsc::UnboundedSender<String>,
    timeout_rx: mpsc::UnboundedReceiver<String>,
}

impl TarCache {
    /// Creates the cache and the channel discovery feeds into.
    pub fn new(config: CacheConfig, uploader: Arc<dyn Uploader>) -> (Self, mpsc::Sender<SystemPath>) {
        let mut root = config.directory.clone();
        if !root.ends_with('/') {
            root.push('/');
        }
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let cache = Self {
            root,
            config,
            uploader,
            tarballs: HashMap::new(),
            inbound,
            timeout_tx,
            timeout_rx,
        };
        (cache, inbound_tx)
    }

    /// Runs until the inbound channel closes or `kill` fires. `term` triggers
    /// one emergency flush of everything in progress but leaves the loop
    /// alive, so stragglers delivered during the grace period still get
    /// archived; `kill` triggers a final flush and exits.
    pub async fn listen_forever(mut self, term: CancellationToken, kill: CancellationToken) {
        let mut term_fired = false;
        loop {
            tokio::select! {
                received = self.inbound.recv() => match received {
                    Some(path) => self.add(path).await,
                    None => {
                        info!("inbound channel closed, stopping {} cache", self.config.datatype);
                        return;
                    }
                },
                Some(subdir) = self.timeout_rx.recv() => {
                    self.flush(&subdir, "age_threshold_met").await;
                }
                _ = term.cancelled(), if !term_fired => {
                    term_fired = true;
                    info!("terminating: uploading all open {} tarballs", self.config.datatype);
                    self.flush_all().await;
                }
                _ = kill.cancelled() => {
                    info!("killed: uploading all open {} tarballs", self.config.datatype);
                    self.flush_all().await;
                    return;
                }
            }
        }
    }

    /// Routes one discovered file into its subdirectory's tarball, possibly
    /// flushing afterwards. Every failure mode here is advisory.
    async fn add(&mut self, path: SystemPath) {
        let internal = path.internal(&self.root);
        if let Some(problem) = internal.lint() {
            metrics::STRANGE_FILENAMES
                .with_label_values(&[&self.config.datatype])
                .inc();
            warn!("strange filename: {problem}");
        }
        let mut file = match std::fs::File::open(path.as_path()) {
            Ok(file) => file,
            Err(err) => {
                metrics::FILE_OPEN_ERRORS
                    .with_label_values(&[&self.config.datatype])
                    .inc();
                warn!("could not open {path} (error: {err})");
                return;
            }
        };
        let subdir = internal.subdir();

        let timeout_tx = self.timeout_tx.clone();
        let age_delays = self.config.age_delays;
        let mut make_timer = move |subdir: &str| {
            let tx = timeout_tx.clone();
            let subdir = subdir.to_string();
            let delay = age_delays.draw();
            TimerHandle::new(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(subdir);
            }))
        };

        let oversize = {
            let tarball = self.tarballs.entry(subdir.clone()).or_insert_with(|| {
                Tarball::new(
                    subdir.clone(),
                    self.config.datatype.clone(),
                    self.config.metadata.clone(),
                    self.config.sample_ratio,
                )
            });
            tarball.add(internal, path, &mut file, &mut make_timer);
            tarball.size() > self.config.size_threshold
        };
        if oversize {
            self.flush(&subdir, "size_threshold_met").await;
        }
    }

    /// Seals and uploads one subdirectory's tarball. A timer firing for a
    /// subdirectory that was already flushed by size is a no-op.
    async fn flush(&mut self, subdir: &str, reason: &str) {
        let Some(tarball) = self.tarballs.remove(subdir) else {
            debug!("no open tarball for subdirectory {subdir:?}");
            return;
        };
        metrics::UPLOAD_CALLS
            .with_label_values(&[&self.config.datatype, reason])
            .inc();
        tarball.upload_and_delete(self.uploader.as_ref()).await;
    }

    /// Uploads every open tarball concurrently and empties the map. Runs on
    /// the loop task itself, so the map needs no lock.
    async fn flush_all(&mut self) {
        let datatype = self.config.datatype.clone();
        let uploads: Vec<_> = self
            .tarballs
            .drain()
            .map(|(_, tarball)| {
                metrics::UPLOAD_CALLS
                    .with_label_values(&[&datatype, "emergency_upload"])
                    .inc();
                let uploader = Arc::clone(&self.uploader);
                async move { tarball.upload_and_delete(uploader.as_ref()).await }
            })
            .collect();
        join_all(uploads).await;
    }
}

/// The per-datatype spool subtree watched by one pipeline.
pub fn datatype_directory(directory: &Path, datatype: &str) -> std::path::PathBuf {
    directory.join(datatype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::UploadError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingUploader {
        fn uploads(&self) -> Vec<(String, usize)> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, subdir: &str, contents: &[u8]) -> Result<(), UploadError> {
            self.uploads
                .lock()
                .unwrap()
                .push((subdir.to_string(), contents.len()));
            Ok(())
        }
    }

    fn config(dir: &Path, size_threshold: ByteCount, age: Duration) -> CacheConfig {
        CacheConfig {
            directory: dir.to_string_lossy().into_owned(),
            datatype: "test".to_string(),
            size_threshold,
            age_delays: Spread::fixed(age),
            sample_ratio: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    fn write_file(dir: &Path, rel: &str, contents: &[u8]) -> SystemPath {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        SystemPath::from(path.as_path())
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let tiny = write_file(dir.path(), "a/b/tiny", b"abcdefgh");
        let big_contents: Vec<u8> = (0..2000).map(|_| rand::random::<u8>()).collect();
        let big = write_file(dir.path(), "a/b/big", &big_contents);

        let uploader = Arc::new(RecordingUploader::default());
        let (cache, tx) = TarCache::new(
            config(dir.path(), ByteCount(1000), Duration::from_secs(3600)),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
        );
        let term = CancellationToken::new();
        let kill = term.child_token();
        let loop_task = tokio::spawn(cache.listen_forever(term.clone(), kill.clone()));

        tx.send(tiny.clone()).await.unwrap();
        tx.send(big.clone()).await.unwrap();
        drop(tx);
        loop_task.await.unwrap();

        let uploads = uploader.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "a/b");
        assert!(!tiny.as_path().exists());
        assert!(!big.as_path().exists());
    }

    #[tokio::test]
    async fn age_timer_flushes_each_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_file(dir.path(), "a/b/tiny", b"abcdefgh");
        let two = write_file(dir.path(), "c/d/tiny", b"abcdefgh");

        let uploader = Arc::new(RecordingUploader::default());
        let (cache, tx) = TarCache::new(
            config(dir.path(), ByteCount(1000), Duration::from_millis(100)),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
        );
        let term = CancellationToken::new();
        let kill = term.child_token();
        let loop_task = tokio::spawn(cache.listen_forever(term.clone(), kill.clone()));

        tx.send(one.clone()).await.unwrap();
        tx.send(two.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_millis(500), async {
            while uploader.uploads().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("age flushes did not happen in time");

        let mut subdirs: Vec<String> = uploader.uploads().into_iter().map(|(s, _)| s).collect();
        subdirs.sort();
        assert_eq!(subdirs, vec!["a/b".to_string(), "c/d".to_string()]);
        assert!(!one.as_path().exists());
        assert!(!two.as_path().exists());

        drop(tx);
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn term_flushes_but_keeps_listening() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_file(dir.path(), "a/b/tiny", b"abcdefgh");
        let two = write_file(dir.path(), "c/d/tiny", b"abcdefgh");

        let uploader = Arc::new(RecordingUploader::default());
        let (cache, tx) = TarCache::new(
            config(dir.path(), ByteCount(1_000_000), Duration::from_secs(3600)),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
        );
        let kill = CancellationToken::new();
        let term = kill.child_token();
        let loop_task = tokio::spawn(cache.listen_forever(term.clone(), kill.clone()));

        tx.send(one.clone()).await.unwrap();
        tx.send(two.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        term.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while uploader.uploads().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("emergency flush did not happen");

        // The loop is still alive: a file delivered after term starts a
        // fresh tarball, flushed by the kill pass.
        let three = write_file(dir.path(), "e/f/tiny", b"abcdefgh");
        tx.send(three.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        kill.cancel();
        loop_task.await.unwrap();
        assert_eq!(uploader.uploads().len(), 3);
        assert!(!three.as_path().exists());
    }

    #[tokio::test]
    async fn channel_close_exits_without_flushing() {
        let dir = tempfile::tempdir().unwrap();
        let one = write_file(dir.path(), "a/b/tiny", b"abcdefgh");

        let uploader = Arc::new(RecordingUploader::default());
        let (cache, tx) = TarCache::new(
            config(dir.path(), ByteCount(1_000_000), Duration::from_secs(3600)),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
        );
        let term = CancellationToken::new();
        let kill = term.child_token();
        let loop_task = tokio::spawn(cache.listen_forever(term.clone(), kill.clone()));

        tx.send(one.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        loop_task.await.unwrap();

        assert!(uploader.uploads().is_empty());
        assert!(one.as_path().exists(), "unflushed source must stay on disk");
    }
}
