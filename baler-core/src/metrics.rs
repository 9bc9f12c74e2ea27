//! Prometheus collectors for the whole pipeline, registered with the default
//! registry at first use. Every metric carries a `datatype` label except the
//! retry family, which is shared by all retried operations.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};

pub static TARBALLS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_tarballs_created_total",
        "The number of tarballs created",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static TARBALLS_UPLOADED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_tarballs_successful_uploads_total",
        "The number of tarballs uploaded",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static UPLOAD_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_tarballs_upload_calls_total",
        "The number of times upload has been called, by trigger",
        &["datatype", "reason"]
    )
    .expect("collector registration")
});

pub static FILES_PER_TARBALL: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "baler_files_per_tarball",
        "The number of files in each uploaded tarball",
        &["datatype"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0]
    )
    .expect("collector registration")
});

pub static BYTES_PER_TARBALL: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "baler_bytes_per_tarball",
        "The compressed size of each uploaded tarball",
        &["datatype"],
        vec![1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9]
    )
    .expect("collector registration")
});

pub static BYTES_PER_FILE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "baler_bytes_per_file",
        "The size of each file added to a tarball",
        &["datatype"],
        vec![1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9]
    )
    .expect("collector registration")
});

pub static DUPLICATE_FILES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_tarballs_duplicates_total",
        "The number of times a file was presented twice to the same tarball",
        &["datatype", "condition"]
    )
    .expect("collector registration")
});

pub static FILE_READ_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_file_read_errors_total",
        "The number of files we could not stat or read while adding to a tarball",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FILE_OPEN_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_file_open_errors_total",
        "The number of discovered files that could not be opened",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FILES_ADDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_files_added_total",
        "The number of files added to tarballs",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FILES_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_files_skipped_total",
        "The number of files sampled out of their tarball",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FILES_REMOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_files_removed_total",
        "The number of source files removed from disk",
        &["datatype", "condition"]
    )
    .expect("collector registration")
});

pub static FILE_REMOVE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_file_remove_errors_total",
        "The number of failed source-file removals",
        &["datatype", "condition"]
    )
    .expect("collector registration")
});

pub static EMPTY_UPLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_empty_uploads_total",
        "The number of upload calls on a tarball with no members",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static STRANGE_FILENAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_strange_filenames_total",
        "The number of files whose names failed the lint",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FILE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_file_events_total",
        "The number of filesystem events heard, by kind",
        &["datatype", "type"]
    )
    .expect("collector registration")
});

pub static FILE_EVENT_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_file_event_errors_total",
        "The number of filesystem events that could not be acted on",
        &["datatype", "type"]
    )
    .expect("collector registration")
});

pub static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_retries_total",
        "The number of times a retried function has failed",
        &["function"]
    )
    .expect("collector registration")
});

pub static MAX_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_max_retries_total",
        "The number of times a retried function hit the backoff ceiling",
        &["function"]
    )
    .expect("collector registration")
});

pub static RETRY_RUNTIME: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "baler_retry_runtime",
        "Seconds taken by each attempt of a retried operation",
        &["kind", "success"],
        vec![
            0.1, 0.15, 0.25, 0.4, 0.6, 1.0, 1.5, 2.5, 4.0, 6.0, 10.0, 15.0, 25.0, 40.0, 60.0,
            100.0, 150.0, 250.0, 400.0, 600.0, 1000.0, 1500.0, 2500.0, 4000.0, 6000.0
        ]
    )
    .expect("collector registration")
});

pub static FINDER_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_finder_runs_total",
        "How many sweeps the finder has completed",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FINDER_FILES_FOUND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_finder_files_found_total",
        "How many aged files the finder has surfaced",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FINDER_BYTES_FOUND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "baler_finder_bytes_found_total",
        "How many bytes of aged files the finder has surfaced",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static FINDER_MTIME_LOWER_BOUND: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "baler_finder_mtime_lower_bound",
        "Unix mtime of the oldest file seen by the most recent sweep",
        &["datatype"]
    )
    .expect("collector registration")
});

pub static SUCCESS_TIMESTAMP: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "baler_success_timestamp",
        "Unix timestamp of the most recent successful upload",
        &["datatype"]
    )
    .expect("collector registration")
});
