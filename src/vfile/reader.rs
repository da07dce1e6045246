//! Reads stitched across shard boundaries.

use tracing::debug;

use super::VirtualFile;
use crate::checked::{self, Offset};
use crate::errors::{BackendContext, DriverError, DriverResult};
use crate::storage::backend::StorageBackend;

/// Fill `buf` from the cursor onwards and advance the cursor by the bytes
/// delivered.
///
/// One ranged read is issued per shard traversed.  A short read ends the
/// request successfully with whatever was gathered.  On error the cursor
/// is left where it was.
pub async fn read_into(
    backend: &dyn StorageBackend,
    file: &mut VirtualFile,
    buf: &mut [u8],
) -> DriverResult<usize> {
    let mut offset = file.offset;
    let mut filled = 0usize;

    while filled < buf.len() {
        let shard = file.cumulative_size.partition_point(|&c| c <= offset);
        if shard >= file.shard_names.len() {
            break;
        }

        let (shard_begin, header) = if shard == 0 {
            (0, 0)
        } else {
            (file.cumulative_size[shard - 1], file.common_header_len)
        };
        let within = checked::sub(offset, shard_begin, "offset within shard")?;
        let start = checked::add(header, within, "physical start")?;
        let left_in_shard = checked::sub(file.cumulative_size[shard], offset, "bytes left in shard")?;
        let remaining = checked::from_u64((buf.len() - filled) as u64, "remaining length")?;
        let want = remaining.min(left_in_shard);
        let end = checked::add(start, want, "physical end")?;

        let name = &file.shard_names[shard];
        let data = backend
            .read_range(
                &file.bucket,
                name,
                checked::to_u64(start, "physical start")?,
                checked::to_u64(end, "physical end")?,
            )
            .await
            .backend_context(|| format!("Error while reading from gs://{}/{}", file.bucket, name))?;

        let got = data.len().min(checked::to_usize(want, "read length")?);
        buf[filled..filled + got].copy_from_slice(&data[..got]);
        filled += got;
        offset = checked::add(offset, got as Offset, "offset after read")?;

        if (got as Offset) < want {
            debug!(
                "short read from gs://{}/{}: wanted {} got {}",
                file.bucket, name, want, got
            );
            break;
        }
    }

    file.offset = offset;
    Ok(filled)
}

/// Element-oriented read: `count` elements of `size` bytes into `buf`.
///
/// Returns the number of bytes read.  A zero element size is rejected
/// before anything else; zero elements is then a no-op.  Reading at or
/// past the end of the file is an error.  The request is clamped to the
/// bytes left in the file.
pub async fn read(
    backend: &dyn StorageBackend,
    file: &mut VirtualFile,
    buf: &mut [u8],
    size: usize,
    count: usize,
) -> DriverResult<Offset> {
    if size == 0 {
        return Err(DriverError::invalid_argument("Element size must be positive"));
    }
    if count == 0 {
        return Ok(0);
    }

    let requested = checked::byte_count(size, count)?;
    if (buf.len() as u64) < requested as u64 {
        return Err(DriverError::invalid_argument(format!(
            "Buffer of {} bytes cannot hold {requested} bytes",
            buf.len()
        )));
    }
    checked::add(file.offset, requested, "read end offset")?;

    let total = file.total_size();
    if file.offset >= total {
        return Err(DriverError::invalid_argument(format!(
            "Read at offset {} is past the end of {} ({total} bytes)",
            file.offset, file.object_glob
        )));
    }

    let length = requested.min(total - file.offset);
    let length = checked::to_usize(length, "read length")?;
    let n = read_into(backend, file, &mut buf[..length]).await?;
    checked::from_u64(n as u64, "bytes read")
}
