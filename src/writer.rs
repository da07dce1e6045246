//! Write sessions and append emulation.
//!
//! A [`WriteSession`] owns one resumable upload.  Bytes are buffered and
//! shipped in multiples of [`UPLOAD_QUANTUM`]; the tail goes out with the
//! final chunk on close.
//!
//! GCS has no append.  An [`AppendSession`] uploads the new bytes to a
//! temporary object and, on close, composes `[target, temporary]` back into
//! the target before deleting the temporary.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::errors::{BackendContext, DriverError, DriverResult};
use crate::registry::Handle;
use crate::storage::backend::{ObjectInfo, StorageBackend};
use crate::uri::ObjectPath;

/// Chunk granularity of resumable uploads.
pub const UPLOAD_QUANTUM: usize = 256 * 1024;

/// Default amount buffered before an upload is triggered.
pub const DEFAULT_UPLOAD_BUFFER_SIZE: usize = 32 * UPLOAD_QUANTUM;

/// Name prefix of temporary objects created by appends.
pub const APPEND_TMP_PREFIX: &str = "tmp_object_to_append_";

/// Round `size` down to the upload quantum, keeping at least one quantum.
pub fn align_buffer_size(size: usize) -> usize {
    (size / UPLOAD_QUANTUM).max(1) * UPLOAD_QUANTUM
}

pub struct WriteSession {
    bucket: String,
    object: String,
    upload_id: String,
    buffer: BytesMut,
    buffer_limit: usize,
    /// Bytes already accepted by the backend.
    uploaded: u64,
    hasher: Md5,
    poisoned: bool,
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("bucket", &self.bucket)
            .field("object", &self.object)
            .field("buffered", &self.buffer.len())
            .field("uploaded", &self.uploaded)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl WriteSession {
    /// Start a resumable upload to `bucket/object`.
    pub async fn open(
        backend: &dyn StorageBackend,
        bucket: &str,
        object: &str,
        buffer_size: usize,
    ) -> DriverResult<Self> {
        let upload_id = backend
            .start_upload(bucket, object)
            .await
            .backend_context(|| format!("Error while opening writer stream to gs://{bucket}/{object}"))?;
        debug!("opened upload to gs://{}/{}", bucket, object);

        let buffer_limit = align_buffer_size(buffer_size);
        Ok(Self {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id,
            buffer: BytesMut::with_capacity(buffer_limit),
            buffer_limit,
            uploaded: 0,
            hasher: Md5::new(),
            poisoned: false,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Bytes accepted by `write` so far, sent or buffered.
    pub fn bytes_written(&self) -> u64 {
        self.uploaded + self.buffer.len() as u64
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub async fn write(&mut self, backend: &dyn StorageBackend, data: &[u8]) -> DriverResult<()> {
        self.check_usable()?;
        self.buffer.extend_from_slice(data);
        self.hasher.update(data);
        if self.buffer.len() >= self.buffer_limit {
            self.send_aligned(backend).await?;
        }
        Ok(())
    }

    /// Upload every whole quantum currently buffered.
    pub async fn flush(&mut self, backend: &dyn StorageBackend) -> DriverResult<()> {
        self.check_usable()?;
        self.send_aligned(backend).await
    }

    /// Send the rest and finalize the object.
    pub async fn close(mut self, backend: &dyn StorageBackend) -> DriverResult<ObjectInfo> {
        let info = self.finalize(backend).await?;
        self.verify(&info)?;
        debug!("closed upload to gs://{}/{} ({} bytes)", self.bucket, self.object, info.size);
        Ok(info)
    }

    /// Ship the buffered tail as the last chunk.  Once this succeeds the
    /// object exists.
    async fn finalize(&mut self, backend: &dyn StorageBackend) -> DriverResult<ObjectInfo> {
        self.check_usable()?;
        let tail = self.buffer.split().freeze();
        backend
            .upload_chunk(&self.upload_id, self.uploaded, tail, true)
            .await
            .backend_context(|| format!("Error during upload to gs://{}/{}", self.bucket, self.object))?
            .ok_or_else(|| {
                DriverError::backend(
                    format!("Error during upload to gs://{}/{}", self.bucket, self.object),
                    anyhow::anyhow!("no object metadata returned for the final chunk"),
                )
            })
    }

    /// Compare the stored checksum, when there is one, with the bytes sent.
    fn verify(&self, info: &ObjectInfo) -> DriverResult<()> {
        let Some(ref remote) = info.md5_hash else {
            return Ok(());
        };
        let local = BASE64_STANDARD.encode(self.hasher.clone().finalize());
        if *remote != local {
            return Err(DriverError::inconsistent(format!(
                "Checksum mismatch for gs://{}/{}: uploaded {local}, stored {remote}",
                self.bucket, self.object
            )));
        }
        Ok(())
    }

    fn check_usable(&self) -> DriverResult<()> {
        if self.poisoned {
            return Err(DriverError::inconsistent(format!(
                "Upload to gs://{}/{} failed earlier, stream is unusable",
                self.bucket, self.object
            )));
        }
        Ok(())
    }

    async fn send_aligned(&mut self, backend: &dyn StorageBackend) -> DriverResult<()> {
        let aligned = self.buffer.len() / UPLOAD_QUANTUM * UPLOAD_QUANTUM;
        if aligned == 0 {
            return Ok(());
        }
        let chunk = self.buffer.split_to(aligned).freeze();
        if let Err(source) = backend
            .upload_chunk(&self.upload_id, self.uploaded, chunk, false)
            .await
        {
            self.poisoned = true;
            return Err(DriverError::backend(
                format!("Error during upload to gs://{}/{}", self.bucket, self.object),
                source,
            ));
        }
        self.uploaded += aligned as u64;
        Ok(())
    }
}

/// Write session on a temporary object, composed onto `target` at close.
#[derive(Debug)]
pub struct AppendSession {
    session: WriteSession,
    target: String,
}

impl AppendSession {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn temporary(&self) -> &str {
        self.session.object()
    }

    pub fn session(&self) -> &WriteSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut WriteSession {
        &mut self.session
    }

    /// Finalize the temporary, compose it onto the target, then delete it.
    ///
    /// A failed compose leaves the target as it was.  Once the temporary
    /// exists it is deleted whatever happens next; failing to delete it is
    /// only logged.
    pub async fn close(self, backend: &dyn StorageBackend) -> DriverResult<ObjectInfo> {
        let AppendSession {
            mut session,
            target,
        } = self;
        let bucket = session.bucket().to_string();
        let temporary = session.object().to_string();

        let info = session.finalize(backend).await?;
        let result = match session.verify(&info) {
            Ok(()) => {
                let sources = [target.clone(), temporary.clone()];
                backend
                    .compose(&bucket, &sources, &target)
                    .await
                    .backend_context(|| {
                        format!("Error while uploading the data to append to gs://{bucket}/{target}")
                    })
            }
            Err(e) => Err(e),
        };

        match backend.delete(&bucket, &temporary).await {
            Ok(true) => debug!("deleted temporary gs://{}/{}", bucket, temporary),
            Ok(false) => warn!("temporary gs://{}/{} was already gone", bucket, temporary),
            Err(e) => warn!("failed to delete temporary gs://{}/{}: {:#}", bucket, temporary, e),
        }

        result
    }
}

/// Open `path` for appending.
///
/// When nothing matches, this is a plain write to `path.object`.  Otherwise
/// the last listed object is the target.
pub async fn open_append(
    backend: &dyn StorageBackend,
    path: &ObjectPath,
    buffer_size: usize,
) -> DriverResult<Handle> {
    let listed = backend
        .list_objects(&path.bucket, &path.object)
        .await
        .backend_context(|| format!("Error opening file in append mode: {path}"))?;

    let Some(last) = listed.into_iter().last() else {
        debug!("{} does not exist, appending as a plain write", path);
        let session = WriteSession::open(backend, &path.bucket, &path.object, buffer_size).await?;
        return Ok(Handle::Write(session));
    };

    let temporary = format!("{APPEND_TMP_PREFIX}{}", uuid::Uuid::new_v4());
    let session = WriteSession::open(backend, &path.bucket, &temporary, buffer_size)
        .await
        .map_err(|e| {
            DriverError::backend(
                "Error opening file in append mode, cannot open tmp object",
                anyhow::Error::new(e),
            )
        })?;
    debug!("appending to gs://{}/{} through {}", path.bucket, last.name, temporary);

    Ok(Handle::Append(AppendSession {
        session,
        target: last.name,
    }))
}
