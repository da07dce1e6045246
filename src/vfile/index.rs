//! Shard enumeration and header reconciliation.

use tracing::debug;

use super::VirtualFile;
use crate::checked::{self, Offset};
use crate::errors::{BackendContext, DriverError, DriverResult};
use crate::storage::backend::{ObjectInfo, StorageBackend};
use crate::uri::ObjectPath;

/// Bytes requested per ranged read while looking for the end of a header.
pub const HEADER_PROBE_SIZE: u64 = 4096;

/// List every object matching `glob`, in backend order.
///
/// Zero matches is `NotFound`.
pub async fn list_shards(
    backend: &dyn StorageBackend,
    bucket: &str,
    glob: &str,
) -> DriverResult<Vec<ObjectInfo>> {
    let shards = backend
        .list_objects(bucket, glob)
        .await
        .backend_context(|| format!("Error while listing gs://{bucket}/{glob}"))?;
    if shards.is_empty() {
        return Err(DriverError::not_found(format!(
            "No object matches gs://{bucket}/{glob}"
        )));
    }
    Ok(shards)
}

/// First line of an object, terminator included.  The whole object when
/// it holds no `\n`.
pub async fn read_first_line(
    backend: &dyn StorageBackend,
    bucket: &str,
    object: &str,
) -> DriverResult<Vec<u8>> {
    read_first_line_probing(backend, bucket, object, HEADER_PROBE_SIZE).await
}

async fn read_first_line_probing(
    backend: &dyn StorageBackend,
    bucket: &str,
    object: &str,
    probe: u64,
) -> DriverResult<Vec<u8>> {
    let mut line = Vec::new();
    let mut start = 0u64;
    loop {
        let chunk = backend
            .read_range(bucket, object, start, start + probe)
            .await
            .backend_context(|| format!("Error while reading header of gs://{bucket}/{object}"))?;
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&chunk[..=pos]);
            return Ok(line);
        }
        line.extend_from_slice(&chunk);
        if (chunk.len() as u64) < probe {
            return Ok(line);
        }
        start += probe;
    }
}

/// Length of the header line shared by every shard, or 0.
///
/// All or nothing: one shard whose first line differs from the first
/// shard's forfeits deduplication for the whole file, and the remaining
/// shards are not read.  An empty first line in any shard read is an
/// error.
pub async fn common_header_len(
    backend: &dyn StorageBackend,
    bucket: &str,
    shards: &[ObjectInfo],
) -> DriverResult<Offset> {
    let Some((first, rest)) = shards.split_first() else {
        return Ok(0);
    };
    if rest.is_empty() {
        return Ok(0);
    }

    let header = read_first_line(backend, bucket, &first.name).await?;
    if header.is_empty() {
        return Err(DriverError::inconsistent(format!(
            "Empty header in gs://{bucket}/{}",
            first.name
        )));
    }

    for shard in rest {
        let line = read_first_line(backend, bucket, &shard.name).await?;
        if line.is_empty() {
            return Err(DriverError::inconsistent(format!(
                "Empty header in gs://{bucket}/{}",
                shard.name
            )));
        }
        if line != header {
            debug!(
                "header of {} differs from {}, keeping every header",
                shard.name, first.name
            );
            return Ok(0);
        }
    }

    checked::from_u64(header.len() as u64, "header length")
}

/// Cumulative logical sizes, with `header_len` dropped from every shard
/// after the first.
pub fn cumulative_sizes(shards: &[ObjectInfo], header_len: Offset) -> DriverResult<Vec<Offset>> {
    let mut cumulative = Vec::with_capacity(shards.len());
    let mut total: Offset = 0;
    for (i, shard) in shards.iter().enumerate() {
        let mut size = checked::from_u64(shard.size, "shard size")?;
        if i > 0 {
            size = checked::sub(size, header_len, "shard size without header")?;
        }
        total = checked::add(total, size, "cumulative shard size")?;
        cumulative.push(total);
    }
    Ok(cumulative)
}

/// Enumerate the shards behind `path` and build their index.
pub async fn build_index(
    backend: &dyn StorageBackend,
    path: &ObjectPath,
) -> DriverResult<VirtualFile> {
    let shards = list_shards(backend, &path.bucket, &path.object).await?;
    let header_len = common_header_len(backend, &path.bucket, &shards).await?;
    let cumulative = cumulative_sizes(&shards, header_len)?;

    debug!(
        "indexed {}: shards={} header_len={} total_size={}",
        path,
        shards.len(),
        header_len,
        cumulative.last().copied().unwrap_or(0)
    );

    Ok(VirtualFile::new(
        path.bucket.clone(),
        path.object.clone(),
        header_len,
        shards.into_iter().map(|s| s.name).collect(),
        cumulative,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    fn path(object: &str) -> ObjectPath {
        ObjectPath {
            bucket: "b".to_string(),
            object: object.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_line_spans_several_probes() {
        let backend = MemoryBackend::new();
        backend.insert("b", "o", "0123456789\nrest");
        let line = read_first_line_probing(&backend, "b", "o", 4).await.unwrap();
        assert_eq!(line, b"0123456789\n");
        assert_eq!(backend.range_reads(), 3);
    }

    #[tokio::test]
    async fn test_first_line_without_terminator() {
        let backend = MemoryBackend::new();
        backend.insert("b", "o", "no newline");
        let line = read_first_line_probing(&backend, "b", "o", 4).await.unwrap();
        assert_eq!(line, b"no newline");
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let backend = MemoryBackend::new();
        let err = build_index(&backend, &path("missing*")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_single_shard_is_not_reconciled() {
        let backend = MemoryBackend::new();
        backend.insert("b", "one.csv", "h\n123");
        let file = build_index(&backend, &path("one.csv")).await.unwrap();
        assert_eq!(file.common_header_len(), 0);
        assert_eq!(file.total_size(), 5);
        assert_eq!(backend.range_reads(), 0);
    }

    #[tokio::test]
    async fn test_common_header_counted_once() {
        let backend = MemoryBackend::new();
        backend.insert("b", "p-0", "col1,col2\nabc\n");
        backend.insert("b", "p-1", "col1,col2\nde\n");
        backend.insert("b", "p-2", "col1,col2\nf\n");
        let file = build_index(&backend, &path("p-*")).await.unwrap();
        assert_eq!(file.common_header_len(), 10);
        // 14 + 13 + 12 - 2 * 10
        assert_eq!(file.total_size(), 19);
        assert_eq!(file.cumulative_size(), &[14, 17, 19]);
        assert_eq!(file.shard_names(), &["p-0", "p-1", "p-2"]);
    }

    #[tokio::test]
    async fn test_header_only_in_first_shard() {
        let backend = MemoryBackend::new();
        backend.insert("b", "s-0", "header,line\nabcdefghijklm");
        backend.insert("b", "s-1", "0123456789abc");
        backend.insert("b", "s-2", "nopqrstuvwxyz");
        let file = build_index(&backend, &path("s-*")).await.unwrap();
        assert_eq!(file.common_header_len(), 0);
        assert_eq!(file.total_size(), 51);
    }

    #[tokio::test]
    async fn test_mismatch_stops_reading_remaining_shards() {
        let backend = MemoryBackend::new();
        backend.insert("b", "m-0", "h\n1");
        backend.insert("b", "m-1", "x\n2");
        backend.insert("b", "m-2", "h\n3");
        backend.fail_reads_of("m-2");
        let file = build_index(&backend, &path("m-*")).await.unwrap();
        assert_eq!(file.common_header_len(), 0);
        assert_eq!(file.total_size(), 9);
        assert_eq!(backend.range_reads(), 2);
    }

    #[tokio::test]
    async fn test_empty_first_shard_is_inconsistent() {
        let backend = MemoryBackend::new();
        backend.insert("b", "e-0", "");
        backend.insert("b", "e-1", "data");
        let err = build_index(&backend, &path("e-*")).await.unwrap_err();
        assert_eq!(err.code(), "InconsistentState");
    }

    #[tokio::test]
    async fn test_empty_later_shard_is_inconsistent() {
        let backend = MemoryBackend::new();
        backend.insert("b", "e-0", "h\n1");
        backend.insert("b", "e-1", "");
        let err = build_index(&backend, &path("e-*")).await.unwrap_err();
        assert_eq!(err.code(), "InconsistentState");
    }

    #[tokio::test]
    async fn test_header_read_failure_aborts() {
        let backend = MemoryBackend::new();
        backend.insert("b", "f-0", "h\n1");
        backend.insert("b", "f-1", "h\n2");
        backend.fail_reads_of("f-1");
        let err = build_index(&backend, &path("f-*")).await.unwrap_err();
        assert_eq!(err.code(), "BackendFailure");
    }

    #[tokio::test]
    async fn test_listing_failure_is_backend_error() {
        let backend = MemoryBackend::new();
        backend.fail_listing(true);
        let err = build_index(&backend, &path("*")).await.unwrap_err();
        assert_eq!(err.code(), "BackendFailure");
    }

    #[test]
    fn test_cumulative_sizes_overflow() {
        let shards = vec![
            ObjectInfo {
                name: "a".into(),
                size: i64::MAX as u64,
                md5_hash: None,
            },
            ObjectInfo {
                name: "b".into(),
                size: 1,
                md5_hash: None,
            },
        ];
        assert_eq!(
            cumulative_sizes(&shards, 0).unwrap_err().code(),
            "Overflow"
        );
        assert_eq!(cumulative_sizes(&shards[..1], 0).unwrap(), vec![i64::MAX]);
    }
}
