//! In-memory storage backend.
//!
//! Buckets, objects and pending resumable uploads live in plain maps
//! behind `std::sync` locks that are never held across an `.await`, so the
//! backend can be seeded and inspected from synchronous code as well as
//! from inside the driver's runtime.
//!
//! Listing order is lexicographic by object name, which matches what GCS
//! returns.  Fault injection switches let tests provoke every failure path
//! of the driver without a network.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use super::backend::{ObjectInfo, StorageBackend};

/// Same limit as the GCS compose API.
const MAX_COMPOSE_SOURCES: usize = 32;

struct MemoryObject {
    data: Bytes,
    md5_hash: Option<String>,
    /// Size reported by listings when it should differ from `data.len()`.
    listed_size: Option<u64>,
}

impl MemoryObject {
    fn info(&self, name: &str) -> ObjectInfo {
        ObjectInfo {
            name: name.to_string(),
            size: self.listed_size.unwrap_or(self.data.len() as u64),
            md5_hash: self.md5_hash.clone(),
        }
    }
}

struct PendingUpload {
    bucket: String,
    object: String,
    data: BytesMut,
}

/// Failure switches.
#[derive(Default)]
struct Faults {
    read_objects: HashSet<String>,
    list: bool,
    upload: bool,
    compose: bool,
    delete: bool,
    /// Finalized uploads report an `md5Hash` that matches nothing.
    corrupt_checksums: bool,
    /// Finalizing an upload returns no object metadata.
    omit_metadata: bool,
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryBackend {
    /// bucket -> object name -> object.
    buckets: RwLock<BTreeMap<String, BTreeMap<String, MemoryObject>>>,
    /// session id -> pending upload.
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<Faults>,
    range_reads: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base64 MD5, as GCS reports it in `md5Hash`.
    pub fn compute_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    // -- Seeding and inspection ---------------------------------------------

    /// Store `data` at `bucket/object`, replacing any previous content.
    pub fn insert(&self, bucket: &str, object: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let md5_hash = Some(Self::compute_md5(&data));
        self.store(
            bucket,
            object,
            MemoryObject {
                data,
                md5_hash,
                listed_size: None,
            },
        );
    }

    /// Content of `bucket/object`, if present.
    pub fn object(&self, bucket: &str, object: &str) -> Option<Bytes> {
        let buckets = self.buckets.read().expect("memory backend lock poisoned");
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(object))
            .map(|o| o.data.clone())
    }

    /// All object names in `bucket`, in listing order.
    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read().expect("memory backend lock poisoned");
        buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of `read_range` calls served so far.
    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    /// Number of resumable uploads started but not finalized.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().expect("memory backend lock poisoned").len()
    }

    /// Make listings report `size` for `bucket/object` regardless of content.
    pub fn misreport_size(&self, bucket: &str, object: &str, size: u64) {
        let mut buckets = self.buckets.write().expect("memory backend lock poisoned");
        if let Some(obj) = buckets.get_mut(bucket).and_then(|o| o.get_mut(object)) {
            obj.listed_size = Some(size);
        }
    }

    // -- Fault injection ----------------------------------------------------

    /// Fail every ranged read of an object with this name, in any bucket.
    pub fn fail_reads_of(&self, object: &str) {
        self.faults()
            .read_objects
            .insert(object.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.faults().list = fail;
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.faults().upload = fail;
    }

    pub fn fail_compose(&self, fail: bool) {
        self.faults().compose = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.faults().delete = fail;
    }

    pub fn corrupt_checksums(&self, corrupt: bool) {
        self.faults().corrupt_checksums = corrupt;
    }

    pub fn omit_upload_metadata(&self, omit: bool) {
        self.faults().omit_metadata = omit;
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().expect("memory backend lock poisoned")
    }

    fn store(&self, bucket: &str, object: &str, value: MemoryObject) {
        let mut buckets = self.buckets.write().expect("memory backend lock poisoned");
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(object.to_string(), value);
    }

    fn list_sync(&self, bucket: &str, glob: &str) -> anyhow::Result<Vec<ObjectInfo>> {
        if self.faults().list {
            anyhow::bail!("injected listing failure for bucket {bucket}");
        }
        let pattern = glob::Pattern::new(glob)
            .map_err(|e| anyhow::anyhow!("invalid match glob {glob:?}: {e}"))?;
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let buckets = self.buckets.read().expect("memory backend lock poisoned");
        Ok(buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(name, _)| pattern.matches_with(name, options))
                    .map(|(name, obj)| obj.info(name))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_sync(&self, bucket: &str, object: &str, start: u64, end: u64) -> anyhow::Result<Bytes> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        if self.faults().read_objects.contains(object) {
            anyhow::bail!("injected read failure for {bucket}/{object}");
        }
        let buckets = self.buckets.read().expect("memory backend lock poisoned");
        let obj = buckets
            .get(bucket)
            .and_then(|objects| objects.get(object))
            .ok_or_else(|| anyhow::anyhow!("No such object: {bucket}/{object}"))?;

        let len = obj.data.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len).max(start as u64) as usize;
        Ok(obj.data.slice(start..end))
    }

    fn upload_sync(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        finalize: bool,
    ) -> anyhow::Result<Option<ObjectInfo>> {
        if self.faults().upload {
            anyhow::bail!("injected upload failure for session {session}");
        }
        let mut uploads = self.uploads.lock().expect("memory backend lock poisoned");
        let pending = uploads
            .get_mut(session)
            .ok_or_else(|| anyhow::anyhow!("unknown upload session {session}"))?;
        if pending.data.len() as u64 != offset {
            anyhow::bail!(
                "upload offset mismatch: session has {} bytes, chunk starts at {offset}",
                pending.data.len()
            );
        }
        pending.data.extend_from_slice(&data);

        if !finalize {
            return Ok(None);
        }

        let pending = uploads
            .remove(session)
            .ok_or_else(|| anyhow::anyhow!("unknown upload session {session}"))?;
        drop(uploads);

        let (corrupt, omit) = {
            let faults = self.faults();
            (faults.corrupt_checksums, faults.omit_metadata)
        };
        let data = pending.data.freeze();
        let md5_hash = if corrupt {
            "corrupted".to_string()
        } else {
            Self::compute_md5(&data)
        };
        let object = MemoryObject {
            md5_hash: Some(md5_hash),
            data,
            listed_size: None,
        };
        let info = object.info(&pending.object);
        self.store(&pending.bucket, &pending.object, object);
        Ok((!omit).then_some(info))
    }

    fn compose_sync(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> anyhow::Result<ObjectInfo> {
        if self.faults().compose {
            anyhow::bail!("injected compose failure for {bucket}/{destination}");
        }
        if sources.is_empty() || sources.len() > MAX_COMPOSE_SOURCES {
            anyhow::bail!("compose takes 1 to {MAX_COMPOSE_SOURCES} sources, got {}", sources.len());
        }

        let mut buckets = self.buckets.write().expect("memory backend lock poisoned");
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| anyhow::anyhow!("No such bucket: {bucket}"))?;

        let mut combined = BytesMut::new();
        for source in sources {
            let obj = objects
                .get(source)
                .ok_or_else(|| anyhow::anyhow!("compose source not found: {bucket}/{source}"))?;
            combined.extend_from_slice(&obj.data);
        }

        let object = MemoryObject {
            data: combined.freeze(),
            md5_hash: None,
            listed_size: None,
        };
        let info = object.info(destination);
        objects.insert(destination.to_string(), object);
        Ok(info)
    }

    fn delete_sync(&self, bucket: &str, object: &str) -> anyhow::Result<bool> {
        if self.faults().delete {
            anyhow::bail!("injected delete failure for {bucket}/{object}");
        }
        let mut buckets = self.buckets.write().expect("memory backend lock poisoned");
        Ok(buckets
            .get_mut(bucket)
            .and_then(|objects| objects.remove(object))
            .is_some())
    }
}

impl StorageBackend for MemoryBackend {
    fn list_objects(
        &self,
        bucket: &str,
        glob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectInfo>>> + Send + '_>> {
        let result = self.list_sync(bucket, glob);
        Box::pin(async move { result })
    }

    fn read_range(
        &self,
        bucket: &str,
        object: &str,
        start: u64,
        end: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let result = self.read_sync(bucket, object, start, end);
        Box::pin(async move { result })
    }

    fn start_upload(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let bucket = bucket.to_string();
        let object = object.to_string();
        Box::pin(async move {
            if self.faults().upload {
                anyhow::bail!("injected upload failure for {bucket}/{object}");
            }
            let session = uuid::Uuid::new_v4().to_string();
            self.uploads
                .lock()
                .expect("memory backend lock poisoned")
                .insert(
                    session.clone(),
                    PendingUpload {
                        bucket,
                        object,
                        data: BytesMut::new(),
                    },
                );
            Ok(session)
        })
    }

    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        finalize: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectInfo>>> + Send + '_>> {
        let result = self.upload_sync(session, offset, data, finalize);
        Box::pin(async move { result })
    }

    fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ObjectInfo>> + Send + '_>> {
        let result = self.compose_sync(bucket, sources, destination);
        Box::pin(async move { result })
    }

    fn delete(
        &self,
        bucket: &str,
        object: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let result = self.delete_sync(bucket, object);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_matches_glob_in_name_order() {
        let backend = MemoryBackend::new();
        backend.insert("b", "export/part-002.csv", "c");
        backend.insert("b", "export/part-000.csv", "a");
        backend.insert("b", "export/part-001.csv", "bb");
        backend.insert("b", "export/other.txt", "x");
        backend.insert("b", "export/nested/part-003.csv", "x");

        let listed = backend.list_objects("b", "export/part-*.csv").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            ["export/part-000.csv", "export/part-001.csv", "export/part-002.csv"]
        );
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn test_list_unknown_bucket_is_empty() {
        let backend = MemoryBackend::new();
        assert!(backend.list_objects("nope", "*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_range_is_clamped() {
        let backend = MemoryBackend::new();
        backend.insert("b", "o", "hello world");

        let data = backend.read_range("b", "o", 6, 100).await.unwrap();
        assert_eq!(&data[..], b"world");
        let data = backend.read_range("b", "o", 50, 60).await.unwrap();
        assert!(data.is_empty());
        assert!(backend.read_range("b", "missing", 0, 1).await.is_err());
        assert_eq!(backend.range_reads(), 3);
    }

    #[tokio::test]
    async fn test_resumable_upload() {
        let backend = MemoryBackend::new();
        let session = backend.start_upload("b", "up").await.unwrap();

        let partial = backend
            .upload_chunk(&session, 0, Bytes::from("abc"), false)
            .await
            .unwrap();
        assert!(partial.is_none());
        assert!(backend.object("b", "up").is_none());

        // Out-of-order chunk is rejected.
        assert!(backend
            .upload_chunk(&session, 1, Bytes::from("x"), false)
            .await
            .is_err());

        let info = backend
            .upload_chunk(&session, 3, Bytes::from("def"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(info.md5_hash, Some(MemoryBackend::compute_md5(b"abcdef")));
        assert_eq!(backend.object("b", "up").unwrap(), Bytes::from("abcdef"));
        assert_eq!(backend.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_compose_and_delete() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a", "123");
        backend.insert("b", "t", "45");

        let info = backend
            .compose("b", &["a".to_string(), "t".to_string()], "a")
            .await
            .unwrap();
        assert_eq!(info.size, 5);
        assert!(info.md5_hash.is_none());
        assert_eq!(backend.object("b", "a").unwrap(), Bytes::from("12345"));

        assert!(backend.delete("b", "t").await.unwrap());
        assert!(!backend.delete("b", "t").await.unwrap());
    }

    #[tokio::test]
    async fn test_compose_missing_source_leaves_destination() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a", "keep");
        let result = backend
            .compose("b", &["a".to_string(), "ghost".to_string()], "a")
            .await;
        assert!(result.is_err());
        assert_eq!(backend.object("b", "a").unwrap(), Bytes::from("keep"));
    }

    #[tokio::test]
    async fn test_faults() {
        let backend = MemoryBackend::new();
        backend.insert("b", "o", "data");

        backend.fail_reads_of("o");
        assert!(backend.read_range("b", "o", 0, 4).await.is_err());

        backend.fail_listing(true);
        assert!(backend.list_objects("b", "*").await.is_err());
        backend.fail_listing(false);

        backend.misreport_size("b", "o", 10);
        assert_eq!(backend.list_objects("b", "o").await.unwrap()[0].size, 10);

        backend.fail_deletes(true);
        assert!(backend.delete("b", "o").await.is_err());

        backend.fail_uploads(true);
        assert!(backend.start_upload("b", "new").await.is_err());
        backend.fail_uploads(false);

        backend.corrupt_checksums(true);
        backend.omit_upload_metadata(true);
        let session = backend.start_upload("b", "new").await.unwrap();
        let info = backend
            .upload_chunk(&session, 0, Bytes::from("xy"), true)
            .await
            .unwrap();
        assert!(info.is_none());
        assert_eq!(backend.object("b", "new").unwrap(), Bytes::from("xy"));
        let listed = backend.list_objects("b", "new").await.unwrap();
        assert_eq!(listed[0].md5_hash.as_deref(), Some("corrupted"));
    }
}
