//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  The trait is
//! the boundary to the remote object store: listing by glob, ranged reads,
//! resumable uploads, server-side composition and deletion.  Each call is
//! assumed atomic at the single-object level.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Listing / upload metadata for one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object name inside the bucket.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Base64-encoded MD5 of the content, when the store reports one.
    /// Composite objects have none.
    pub md5_hash: Option<String>,
}

/// Async object storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// List objects in `bucket` whose names match `glob`, in the store's
    /// stable listing order.  No match is an empty vector, not an error.
    fn list_objects(
        &self,
        bucket: &str,
        glob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectInfo>>> + Send + '_>>;

    /// Read bytes `[start, end)` of an object.
    ///
    /// Returns fewer bytes than requested when the object ends first
    /// (including none at all when `start` is past the end).  A missing
    /// object is an error.
    fn read_range(
        &self,
        bucket: &str,
        object: &str,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;

    /// Begin a resumable upload to `object`, returning the session id.
    fn start_upload(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Send `data` at byte `offset` of an upload session.
    ///
    /// With `finalize`, the upload completes and the resulting object
    /// metadata is returned; `None` means the store did not report one.
    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        finalize: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectInfo>>> + Send + '_>>;

    /// Concatenate `sources` (in order) into `destination`, replacing it
    /// atomically.  On failure `destination` is unchanged.
    fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ObjectInfo>> + Send + '_>>;

    /// Delete an object.  Returns `false` when it did not exist.
    fn delete(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;
}
