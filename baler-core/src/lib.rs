//! # baler-core
//!
//! The archive-and-upload pipeline behind the baler sidecar. A collocated
//! producer writes finished files into a spool directory; this crate watches
//! the directory (kernel events fused with a periodic age-based sweep), bales
//! the files into in-memory gzipped tarballs grouped by subdirectory, uploads
//! each tarball to an object store when it is big enough or old enough, and
//! deletes the source files only after the upload succeeds.
//!
//! The pieces compose left to right:
//!
//! ```text
//! producer -> watcher/finder -> tarcache -> tarball -> uploader -> object store
//! ```
//!
//! Everything is at-least-once: uploads retry forever, deletions are best
//! effort, and anything left behind is re-discovered by the next sweep or
//! the next process.

pub mod backoff;
pub mod bytecount;
pub mod error;
pub mod filename;
pub mod finder;
pub mod metrics;
pub mod namer;
pub mod spread;
pub mod tarball;
pub mod tarcache;
pub mod uploader;
pub mod watcher;

pub use bytecount::ByteCount;
pub use error::{BalerError, Result};
pub use filename::{InternalPath, SystemPath};
pub use namer::{node_from_fqdn, Namer, StandardNamer};
pub use spread::Spread;
pub use tarball::{Tarball, TimerHandle};
pub use tarcache::{CacheConfig, TarCache};
pub use uploader::{StoreUploader, UploadError, Uploader};
pub use watcher::Watcher;
