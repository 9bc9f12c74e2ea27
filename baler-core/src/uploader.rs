//! Streaming upload of finished archives to an object store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::namer::Namer;

/// An upload failure. Every variant is retryable: transient store errors
/// (429s, 5xx, connection resets) and per-attempt timeouts all look the same
/// to the backoff loop, which will re-issue the attempt with a fresh object
/// name. The object path is carried for logging.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload of {object} did not finish within {timeout:?}")]
    Timeout { object: String, timeout: Duration },

    #[error("could not write {object}: {source}")]
    Write {
        object: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, subdir: &str, contents: &[u8]) -> Result<(), UploadError>;
}

/// Uploads archives through an [`ObjectStore`] handle, naming each object
/// with the wall-clock time of the attempt.
pub struct StoreUploader {
    store: Arc<dyn ObjectStore>,
    namer: Box<dyn Namer>,
    attempt_timeout: Option<Duration>,
}

impl StoreUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namer: Box<dyn Namer>,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            namer,
            attempt_timeout,
        }
    }

    async fn put(&self, object: &str, contents: &[u8]) -> Result<(), UploadError> {
        let path = ObjectPath::from(object);
        let mut writer = BufWriter::new(Arc::clone(&self.store), path);
        writer
            .write_all(contents)
            .await
            .map_err(|source| UploadError::Write {
                object: object.to_string(),
                source,
            })?;
        // Shutdown completes the (possibly multipart) write. This is the
        // commit point: an object either exists in full or not at all.
        writer.shutdown().await.map_err(|source| UploadError::Write {
            object: object.to_string(),
            source,
        })?;
        debug!("uploaded {} ({} bytes)", object, contents.len());
        Ok(())
    }
}

#[async_trait]
impl Uploader for StoreUploader {
    async fn upload(&self, subdir: &str, contents: &[u8]) -> Result<(), UploadError> {
        let object = self.namer.object_name(subdir, Utc::now());
        match self.attempt_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.put(&object, contents))
                .await
                .map_err(|_| UploadError::Timeout { object, timeout })?,
            None => self.put(&object, contents).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namer::StandardNamer;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn uploads_land_under_the_named_key() {
        let store = Arc::new(InMemory::new());
        let namer = StandardNamer::new("ndt", "mlab", "mlab5-abc0t");
        let uploader =
            StoreUploader::new(Arc::clone(&store) as Arc<dyn ObjectStore>, Box::new(namer), None);

        uploader.upload("a/b", b"payload").await.unwrap();

        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert_eq!(objects.len(), 1);
        let key = objects[0].location.to_string();
        assert!(key.starts_with("mlab/ndt/a/b/"), "unexpected key {key}");
        assert!(key.ends_with("-ndt-mlab5-abc0t-mlab.tgz"), "unexpected key {key}");

        let body = store.get(&objects[0].location).await.unwrap();
        assert_eq!(body.bytes().await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn each_attempt_gets_a_fresh_name() {
        let store = Arc::new(InMemory::new());
        let namer = StandardNamer::new("ndt", "mlab", "mlab5-abc0t");
        let uploader =
            StoreUploader::new(Arc::clone(&store) as Arc<dyn ObjectStore>, Box::new(namer), None);

        uploader.upload("a", b"one").await.unwrap();
        uploader.upload("a", b"two").await.unwrap();

        let objects: Vec<_> = store.list(None).try_collect().await.unwrap();
        assert_eq!(objects.len(), 2);
    }
}
