//! Object storage for rendered overlays.
//!
//! [`ObjectStore`] is the seam between the pipeline and the bucket. The
//! production backend is [`crate::gcs::GcsStore`]; [`MemoryStore`] keeps
//! objects in process for local runs and tests.

use crate::error::{Result, SegmentError};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::path::Path;
use std::time::Duration;

pub const PUBLIC_HOST: &str = "https://storage.googleapis.com";

/// Public URL of `object` in `bucket`.
pub fn public_url(bucket: &str, object: &str) -> String {
    format!("{}/{}/{}", PUBLIC_HOST, bucket, object)
}

/// Object name for an overlay: `{prefix}/{plane}/{id}.png`.
pub fn overlay_object_name(prefix: &str, plane: &str, id: &uuid::Uuid) -> String {
    if prefix.is_empty() {
        format!("{}/{}.png", plane, id)
    } else {
        format!("{}/{}/{}.png", prefix, plane, id)
    }
}

pub trait ObjectStore: Send + Sync {
    /// Bucket objects are written to.
    fn bucket(&self) -> &str;

    /// Upload the file at `path` as `object`.
    fn put_file<'a>(
        &'a self,
        object: &'a str,
        path: &'a Path,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// V4-signed URL allowing a single `PUT` of `object` in `bucket`.
    fn signed_put_url<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        content_type: &'a str,
        expires: Duration,
    ) -> BoxFuture<'a, Result<String>> {
        let _ = (bucket, object, content_type, expires);
        Box::pin(async {
            Err(SegmentError::Credentials(
                "signed upload URLs require the gcs storage backend".to_string(),
            ))
        })
    }

    fn public_url(&self, object: &str) -> String {
        public_url(self.bucket(), object)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// In-process object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bucket: String,
    objects: DashMap<String, StoredObject>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
        }
    }

    pub fn get(&self, object: &str) -> Option<StoredObject> {
        self.objects.get(object).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_file<'a>(
        &'a self,
        object: &'a str,
        path: &'a Path,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                SegmentError::Upload(format!("failed to read {}: {}", path.display(), e))
            })?;
            self.objects.insert(
                object.to_string(),
                StoredObject {
                    content_type: content_type.to_string(),
                    bytes,
                },
            );
            Ok(())
        })
    }
}
