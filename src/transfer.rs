//! Bulk copies between a bucket and the local filesystem.

use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::errors::{DriverError, DriverResult};
use crate::storage::backend::StorageBackend;
use crate::uri::ObjectPath;
use crate::vfile;
use crate::writer::WriteSession;

/// Size of the buffer bytes are relayed through.
pub const RELAY_BUFFER_SIZE: usize = 1024 * 1024;

/// Download the virtual file behind `remote` into `local`.
///
/// Goes through the multi-part reader, so only the first shard's header
/// lands in the output when the shards share one.  Returns the number of
/// bytes written.
pub async fn copy_to_local(
    backend: &dyn StorageBackend,
    remote: &ObjectPath,
    local: &Path,
) -> DriverResult<u64> {
    let mut file = vfile::build_index(backend, remote).await?;

    let mut out = tokio::fs::File::create(local).await.map_err(|e| {
        DriverError::local_io(
            format!("Failed to open local file for writing: {}", local.display()),
            e,
        )
    })?;

    let mut relay = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = vfile::read_into(backend, &mut file, &mut relay).await?;
        if n == 0 {
            break;
        }
        out.write_all(&relay[..n]).await.map_err(|e| {
            DriverError::local_io("Error while writing data to local file", e)
        })?;
        copied += n as u64;
    }
    out.flush()
        .await
        .map_err(|e| DriverError::local_io("Error while writing data to local file", e))?;

    debug!("copied {} ({} bytes) to {}", remote, copied, local.display());
    Ok(copied)
}

/// Upload `local` to `remote` as a single object.  Returns the number of
/// bytes uploaded.
pub async fn copy_from_local(
    backend: &dyn StorageBackend,
    local: &Path,
    remote: &ObjectPath,
    upload_buffer_size: usize,
) -> DriverResult<u64> {
    let mut input = tokio::fs::File::open(local).await.map_err(|e| {
        DriverError::local_io(format!("Failed to open local file: {}", local.display()), e)
    })?;

    let mut session =
        WriteSession::open(backend, &remote.bucket, &remote.object, upload_buffer_size).await?;

    let mut relay = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = input
            .read(&mut relay)
            .await
            .map_err(|e| DriverError::local_io("Error while reading local file", e))?;
        if n == 0 {
            break;
        }
        session.write(backend, &relay[..n]).await?;
    }

    let info = session.close(backend).await?;
    debug!("copied {} to {} ({} bytes)", local.display(), remote, info.size);
    Ok(info.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;

    fn path(object: &str) -> ObjectPath {
        ObjectPath {
            bucket: "b".to_string(),
            object: object.to_string(),
        }
    }

    #[tokio::test]
    async fn test_copy_to_local_skips_repeated_headers() {
        let backend = MemoryBackend::new();
        backend.insert("b", "out/part-0.csv", "id,name\n1,a\n");
        backend.insert("b", "out/part-1.csv", "id,name\n2,b\n");
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("all.csv");

        let n = copy_to_local(&backend, &path("out/part-*.csv"), &local)
            .await
            .unwrap();
        assert_eq!(n, 16);
        assert_eq!(std::fs::read(&local).unwrap(), b"id,name\n1,a\n2,b\n");
    }

    #[tokio::test]
    async fn test_copy_to_local_spans_relay_buffers() {
        let backend = MemoryBackend::new();
        let data: Vec<u8> = (0..RELAY_BUFFER_SIZE + 123).map(|i| (i % 251) as u8).collect();
        backend.insert("b", "blob", data.clone());
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("blob");

        copy_to_local(&backend, &path("blob"), &local).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn test_copy_to_local_missing_remote() {
        let backend = MemoryBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("none");
        let err = copy_to_local(&backend, &path("ghost"), &local).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_copy_from_local() {
        let backend = MemoryBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, b"payload bytes").unwrap();

        let n = copy_from_local(&backend, &local, &path("dest.bin"), 0)
            .await
            .unwrap();
        assert_eq!(n, 13);
        assert_eq!(backend.object("b", "dest.bin").unwrap(), Bytes::from("payload bytes"));
    }

    #[tokio::test]
    async fn test_copy_from_missing_local_starts_no_upload() {
        let backend = MemoryBackend::new();
        let err = copy_from_local(&backend, Path::new("/no/such/file"), &path("x"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LocalIo");
        assert_eq!(backend.pending_uploads(), 0);
    }
}
