//! The in-memory gzipped tar archive for one subdirectory.
//!
//! A `Tarball` accumulates members one open file at a time and tracks its own
//! compressed size so the cache can flush on a byte threshold. Uploading and
//! source deletion live here too, so that a tarball handed off for an
//! emergency flush carries everything it needs.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::time::{Duration, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff;
use crate::bytecount::ByteCount;
use crate::filename::{InternalPath, SystemPath};
use crate::metrics;
use crate::uploader::Uploader;

const UPLOAD_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const UPLOAD_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A handle on a one-shot age timer. Dropping the handle does not stop the
/// timer; `stop` must be called, which `upload_and_delete` does.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

pub struct Tarball {
    datatype: String,
    subdir: String,
    builder: tar::Builder<GzEncoder<Vec<u8>>>,
    admitted: HashSet<InternalPath>,
    admitted_paths: Vec<SystemPath>,
    skipped: HashSet<InternalPath>,
    metadata: BTreeMap<String, String>,
    sample_ratio: f64,
    timer: Option<TimerHandle>,
}

impl Tarball {
    pub fn new(
        subdir: String,
        datatype: String,
        metadata: BTreeMap<String, String>,
        sample_ratio: f64,
    ) -> Self {
        metrics::TARBALLS_CREATED
            .with_label_values(&[&datatype])
            .inc();
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        Self {
            datatype,
            subdir,
            builder: tar::Builder::new(encoder),
            admitted: HashSet::new(),
            admitted_paths: Vec::new(),
            skipped: HashSet::new(),
            metadata,
            sample_ratio,
            timer: None,
        }
    }

    pub fn subdir(&self) -> &str {
        &self.subdir
    }

    /// The current length of the compressed archive. Accurate because `add`
    /// flushes the framing writers after every member.
    pub fn size(&self) -> ByteCount {
        ByteCount(self.builder.get_ref().get_ref().len() as u64)
    }

    /// Admits one file, or deletes it outright when the sampling roll
    /// rejects it. Repeat presentations of a name already admitted or
    /// already sampled out are counted and otherwise ignored. Local read
    /// problems drop the member; failures of the tar or gzip framing are
    /// unrecoverable because the archive stream is already corrupt, so they
    /// abort the process and leave the files on disk for the next run.
    pub fn add(
        &mut self,
        name: InternalPath,
        path: SystemPath,
        file: &mut std::fs::File,
        make_timer: &mut dyn FnMut(&str) -> TimerHandle,
    ) {
        if self.skipped.contains(&name) {
            metrics::DUPLICATE_FILES
                .with_label_values(&[&self.datatype, "skip_file"])
                .inc();
            warn!("{name} was already sampled out of this tarball");
            return;
        }
        if self.admitted.contains(&name) {
            metrics::DUPLICATE_FILES
                .with_label_values(&[&self.datatype, "add_file"])
                .inc();
            warn!("not adding {name} to the tarball a second time");
            return;
        }
        if rand::random::<f64>() >= self.sample_ratio {
            metrics::FILES_SKIPPED
                .with_label_values(&[&self.datatype])
                .inc();
            // An all-skipped tarball never flushes, so this is the only
            // deletion point for a sampled-out source.
            remove_source(&self.datatype, &path, "skipped");
            self.skipped.insert(name);
            return;
        }

        let stat = match file.metadata() {
            Ok(stat) => stat,
            Err(err) => {
                metrics::FILE_READ_ERRORS
                    .with_label_values(&[&self.datatype])
                    .inc();
                warn!("could not stat {name} (error: {err})");
                return;
            }
        };
        let size = stat.len();
        // Buffer the whole file up front: a read error at this point skips
        // the member, while a read error in the middle of streaming into the
        // tar writer would corrupt the archive.
        let mut contents = Vec::with_capacity(size as usize);
        match file.read_to_end(&mut contents) {
            Ok(_) if contents.len() as u64 == size => {}
            Ok(n) => {
                metrics::FILE_READ_ERRORS
                    .with_label_values(&[&self.datatype])
                    .inc();
                warn!("read {n} bytes from {name}, expected {size}");
                return;
            }
            Err(err) => {
                metrics::FILE_READ_ERRORS
                    .with_label_values(&[&self.datatype])
                    .inc();
                warn!("could not read {name} (error: {err})");
                return;
            }
        }
        let mtime = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let pax: Vec<(String, Vec<u8>)> = std::iter::once(("baler.datatype".to_string(),
            self.datatype.clone().into_bytes()))
            .chain(
                self.metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone().into_bytes())),
            )
            .collect();
        self.builder
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
            .unwrap_or_else(|err| panic!("could not write pax records for {name}: {err}"));

        let mut header = tar::Header::new_ustar();
        header.set_mode(0o666);
        header.set_size(size);
        header.set_mtime(mtime);
        self.builder
            .append_data(&mut header, name.as_str(), contents.as_slice())
            .unwrap_or_else(|err| panic!("could not write tarball member {name}: {err}"));
        // Push the compressed bytes through to the buffer so size() tells the
        // truth.
        self.builder
            .get_mut()
            .flush()
            .unwrap_or_else(|err| panic!("could not flush the gzip writer: {err}"));

        if self.admitted.is_empty() {
            self.timer = Some(make_timer(&self.subdir));
        }
        metrics::BYTES_PER_FILE
            .with_label_values(&[&self.datatype])
            .observe(size as f64);
        metrics::FILES_ADDED
            .with_label_values(&[&self.datatype])
            .inc();
        self.admitted.insert(name);
        self.admitted_paths.push(path);
    }

    /// Uploads the archive (retrying forever) and then removes every admitted
    /// source file. Never fails: a tarball handed to this method is finished
    /// one way or the other.
    pub async fn upload_and_delete(mut self, uploader: &dyn Uploader) {
        if self.admitted.is_empty() {
            metrics::EMPTY_UPLOADS
                .with_label_values(&[&self.datatype])
                .inc();
            stamp_success(&self.datatype);
            info!("upload_and_delete called on an empty tarball");
            return;
        }
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }

        // Close the inner frame first: the tar terminator has to be
        // compressed before the gzip stream can end.
        let encoder = self
            .builder
            .into_inner()
            .unwrap_or_else(|err| panic!("could not close the tar writer: {err}"));
        let contents = encoder
            .finish()
            .unwrap_or_else(|err| panic!("could not close the gzip writer: {err}"));

        metrics::FILES_PER_TARBALL
            .with_label_values(&[&self.datatype])
            .observe(self.admitted.len() as f64);
        metrics::BYTES_PER_TARBALL
            .with_label_values(&[&self.datatype])
            .observe(contents.len() as f64);

        backoff::retry(
            || uploader.upload(&self.subdir, &contents),
            UPLOAD_INITIAL_BACKOFF,
            UPLOAD_MAX_BACKOFF,
            "upload",
        )
        .await;

        metrics::TARBALLS_UPLOADED
            .with_label_values(&[&self.datatype])
            .inc();
        stamp_success(&self.datatype);

        for path in &self.admitted_paths {
            remove_source(&self.datatype, path, "uploaded");
        }
    }
}

/// Best-effort removal. A file that is already gone (or otherwise sticks
/// around) is counted and left for the sweep to sort out.
fn remove_source(datatype: &str, path: &SystemPath, condition: &str) {
    match std::fs::remove_file(path.as_path()) {
        Ok(()) => metrics::FILES_REMOVED
            .with_label_values(&[datatype, condition])
            .inc(),
        Err(err) => {
            metrics::FILE_REMOVE_ERRORS
                .with_label_values(&[datatype, condition])
                .inc();
            warn!("failed to remove {path} (error: {err})");
        }
    }
}

fn stamp_success(datatype: &str) {
    metrics::SUCCESS_TIMESTAMP
        .with_label_values(&[datatype])
        .set(chrono::Utc::now().timestamp() as f64);
}
