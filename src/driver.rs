//! The driver context and its boundary operations.
//!
//! [`Driver`] owns everything the operations touch: the storage backend,
//! the configuration, the open handles and the last error.  Each boundary
//! call is synchronous and blocks on the driver's own current-thread
//! runtime.  Failures never escape as `Err`: they are logged, stored in
//! the last-error slot, and turned into the sentinel of the call.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::checked;
use crate::config::Config;
use crate::errors::{DriverError, DriverResult};
use crate::metrics;
use crate::registry::{Handle, HandleId, HandleKind, HandleRegistry};
use crate::storage::backend::StorageBackend;
use crate::storage::gcp::GcsBackend;
use crate::storage::memory::MemoryBackend;
use crate::transfer;
use crate::uri::{self, ObjectPath};
use crate::vfile::{self, Whence};
use crate::writer::{self, WriteSession};

pub const DRIVER_NAME: &str = "GCS driver";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reported by `disk_free_space`; buckets have no meaningful limit.
pub const DISK_FREE_SPACE: i64 = 5 * 1024 * 1024 * 1024 * 1024;

/// Outcome of [`Driver::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Closed,
    /// The handle was released but flushing it failed.
    Failed,
    /// Unknown or already closed handle.
    NotFound,
}

impl CloseStatus {
    pub fn code(self) -> i32 {
        match self {
            CloseStatus::Closed => 0,
            CloseStatus::Failed => 1,
            CloseStatus::NotFound => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl TryFrom<char> for OpenMode {
    type Error = DriverError;

    fn try_from(mode: char) -> Result<Self, Self::Error> {
        match mode {
            'r' => Ok(OpenMode::Read),
            'w' => Ok(OpenMode::Write),
            'a' => Ok(OpenMode::Append),
            other => Err(DriverError::invalid_argument(format!(
                "Invalid open mode: {other}"
            ))),
        }
    }
}

pub struct Driver {
    runtime: tokio::runtime::Runtime,
    config: Config,
    /// Backend handed in by the caller instead of built from `config`.
    provided: Option<Arc<dyn StorageBackend>>,
    /// Set while connected.
    backend: Option<Arc<dyn StorageBackend>>,
    registry: HandleRegistry,
    last_error: Option<String>,
}

impl Driver {
    /// Driver over the backend named by `config.storage.backend`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            config,
            provided: None,
            backend: None,
            registry: HandleRegistry::new(),
            last_error: None,
        })
    }

    /// Default configuration overlaid with the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        Self::new(config)
    }

    /// Driver over an existing backend.
    pub fn with_backend(config: Config, backend: Arc<dyn StorageBackend>) -> anyhow::Result<Self> {
        let mut driver = Self::new(config)?;
        driver.provided = Some(backend);
        Ok(driver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Identity ------------------------------------------------------------

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn version(&self) -> &'static str {
        DRIVER_VERSION
    }

    pub fn scheme(&self) -> &'static str {
        uri::SCHEME
    }

    pub fn is_read_only(&self) -> bool {
        false
    }

    pub fn preferred_buffer_size(&self) -> i64 {
        self.config.driver.preferred_buffer_size as i64
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.registry.len()
    }

    pub fn handle_kind(&self, id: HandleId) -> Option<HandleKind> {
        self.registry.get(id).map(Handle::kind)
    }

    // -- Connection ----------------------------------------------------------

    pub fn connect(&mut self) -> bool {
        crate::logging::init(&self.config.logging);
        if self.backend.is_some() {
            return true;
        }
        let result = self.build_backend();
        match self.finish("connect", || "Error connecting".to_string(), result) {
            Some(backend) => {
                info!(
                    "connected: backend={} default_bucket='{}'",
                    self.backend_label(),
                    self.config.driver.default_bucket
                );
                self.backend = Some(backend);
                true
            }
            None => false,
        }
    }

    /// Close every handle, flushing writers, and drop the backend.
    ///
    /// Every handle is released even when some fail to flush; the failures
    /// are reported together.
    pub fn disconnect(&mut self) -> bool {
        let handles = self.registry.drain();
        let mut failures = Vec::new();
        if let Some(backend) = self.backend.take() {
            for (id, handle) in handles {
                let kind = handle.kind();
                if let Err(e) = self.runtime.block_on(close_handle(backend.as_ref(), handle)) {
                    failures.push(format!("{kind} handle {id}: {e}"));
                }
            }
        }

        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(DriverError::internal(failures.join("\n")))
        };
        self.finish(
            "disconnect",
            || "Errors occurred during disconnection".to_string(),
            result,
        )
        .is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    // -- Handles -------------------------------------------------------------

    /// Open `path` with mode `'r'`, `'w'` or `'a'`.
    pub fn open(&mut self, path: &str, mode: char) -> Option<HandleId> {
        debug!("open {} {}", path, mode);
        let result = self.try_open(path, mode);
        self.finish("open", || format!("Error opening {path}"), result)
    }

    pub fn close(&mut self, id: HandleId) -> CloseStatus {
        debug!("close {}", id);
        let Some(handle) = self.registry.remove(id) else {
            let err = DriverError::not_found(format!("Cannot identify stream {id}"));
            self.finish::<()>("close", || "Error closing".to_string(), Err(err));
            return CloseStatus::NotFound;
        };

        let result = match handle {
            Handle::Read(_) => Ok(()),
            handle => match self.connected() {
                Ok(backend) => self.runtime.block_on(close_handle(backend.as_ref(), handle)),
                Err(e) => Err(e),
            },
        };
        match self.finish("close", || "Error while closing writer stream".to_string(), result) {
            Some(()) => CloseStatus::Closed,
            None => CloseStatus::Failed,
        }
    }

    /// Read `count` elements of `size` bytes.  Bytes read, or -1.
    pub fn read(&mut self, id: HandleId, buf: &mut [u8], size: usize, count: usize) -> i64 {
        let result = self.try_read(id, buf, size, count);
        match self.finish("read", || "Error while reading".to_string(), result) {
            Some(n) => {
                metrics::record_bytes_read(n as u64);
                n
            }
            None => -1,
        }
    }

    /// Write `count` elements of `size` bytes.  Bytes written, or -1.
    pub fn write(&mut self, id: HandleId, buf: &[u8], size: usize, count: usize) -> i64 {
        let result = self.try_write(id, buf, size, count);
        match self.finish("write", || "Error during upload".to_string(), result) {
            Some(n) => {
                metrics::record_bytes_written(n as u64);
                n
            }
            None => -1,
        }
    }

    /// Move a read cursor.  `whence` is 0 (start), 1 (current) or 2 (end).
    pub fn seek(&mut self, id: HandleId, delta: i64, whence: i32) -> i32 {
        let result = self.try_seek(id, delta, whence);
        match self.finish("seek", || "Error while seeking".to_string(), result) {
            Some(_) => 0,
            None => -1,
        }
    }

    /// Current cursor of a read handle, or -1.
    pub fn tell(&self, id: HandleId) -> i64 {
        match self.registry.get(id) {
            Some(Handle::Read(file)) => file.offset(),
            _ => -1,
        }
    }

    pub fn flush(&mut self, id: HandleId) -> i32 {
        let result = self.try_flush(id);
        match self.finish("flush", || "Error during upload".to_string(), result) {
            Some(()) => 0,
            None => -1,
        }
    }

    // -- Paths ---------------------------------------------------------------

    /// Directory paths (trailing `/`) always exist; anything else must
    /// match at least one object.
    pub fn exists(&mut self, path: &str) -> bool {
        if path.ends_with('/') {
            self.dir_exists(path)
        } else {
            self.file_exists(path)
        }
    }

    pub fn file_exists(&mut self, path: &str) -> bool {
        debug!("file_exists {}", path);
        match self.try_file_exists(path) {
            Err(e) if e.is_not_found() => {
                metrics::record_operation("file_exists", true);
                false
            }
            result => self
                .finish("file_exists", || "Error checking if file exists".to_string(), result)
                .is_some(),
        }
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        debug!("dir_exists {}", path);
        true
    }

    /// Logical size of the virtual file behind `path`, or -1.
    pub fn get_file_size(&mut self, path: &str) -> i64 {
        debug!("get_file_size {}", path);
        let result = self.try_file_size(path);
        self.finish("get_file_size", || "Error getting file size".to_string(), result)
            .unwrap_or(-1)
    }

    /// Delete one object.  An object that is already gone counts as removed.
    pub fn remove(&mut self, path: &str) -> bool {
        debug!("remove {}", path);
        let result = self.try_remove(path);
        self.finish("remove", || "Error deleting object".to_string(), result)
            .is_some()
    }

    pub fn mkdir(&self, path: &str) -> bool {
        debug!("mkdir {} (no-op)", path);
        true
    }

    pub fn rmdir(&self, path: &str) -> bool {
        debug!("rmdir {} (no-op)", path);
        true
    }

    pub fn disk_free_space(&self, _path: &str) -> i64 {
        DISK_FREE_SPACE
    }

    // -- Transfers -----------------------------------------------------------

    pub fn copy_to_local(&mut self, remote: &str, local: impl AsRef<Path>) -> bool {
        let local = local.as_ref();
        debug!("copy_to_local {} {}", remote, local.display());
        let result = self.try_copy_to_local(remote, local);
        match self.finish("copy_to_local", || format!("Error copying {remote} to local"), result) {
            Some(n) => {
                metrics::record_bytes_read(n);
                true
            }
            None => false,
        }
    }

    pub fn copy_from_local(&mut self, local: impl AsRef<Path>, remote: &str) -> bool {
        let local = local.as_ref();
        debug!("copy_from_local {} {}", local.display(), remote);
        let result = self.try_copy_from_local(local, remote);
        match self.finish("copy_from_local", || format!("Error copying to {remote}"), result) {
            Some(n) => {
                metrics::record_bytes_written(n);
                true
            }
            None => false,
        }
    }

    // -- Internals -----------------------------------------------------------

    fn build_backend(&self) -> DriverResult<Arc<dyn StorageBackend>> {
        if let Some(ref backend) = self.provided {
            return Ok(Arc::clone(backend));
        }
        match self.config.storage.backend.as_str() {
            "gcp" => {
                let backend = GcsBackend::new(&self.config.storage.gcp)
                    .map_err(|e| DriverError::backend("Error initializing GCS client", e))?;
                Ok(Arc::new(backend))
            }
            "memory" => Ok(Arc::new(MemoryBackend::new())),
            other => Err(DriverError::invalid_argument(format!(
                "Unknown storage backend: {other}"
            ))),
        }
    }

    /// Backend name for logs: `provided` when handed in by the caller.
    fn backend_label(&self) -> &str {
        if self.provided.is_some() {
            "provided"
        } else {
            self.config.storage.backend.as_str()
        }
    }

    fn connected(&self) -> DriverResult<Arc<dyn StorageBackend>> {
        self.backend.clone().ok_or(DriverError::NotConnected)
    }

    fn resolve(&self, path: &str) -> DriverResult<ObjectPath> {
        uri::resolve(path, Some(self.config.driver.default_bucket.as_str()))
    }

    /// Log a failure and remember it as the last error.
    fn finish<T>(
        &mut self,
        operation: &'static str,
        context: impl FnOnce() -> String,
        result: DriverResult<T>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                metrics::record_operation(operation, true);
                Some(value)
            }
            Err(e) => {
                let message = format!("{}: {e}", context());
                error!(code = e.code(), "{}", message);
                metrics::record_operation(operation, false);
                self.last_error = Some(message);
                None
            }
        }
    }

    fn try_open(&mut self, path: &str, mode: char) -> DriverResult<HandleId> {
        let mode = OpenMode::try_from(mode)?;
        let backend = self.connected()?;
        let path = self.resolve(path)?;
        let buffer_size = self.config.driver.aligned_upload_buffer_size();

        let handle = match mode {
            OpenMode::Read => {
                Handle::Read(self.runtime.block_on(vfile::build_index(backend.as_ref(), &path))?)
            }
            OpenMode::Write => Handle::Write(self.runtime.block_on(WriteSession::open(
                backend.as_ref(),
                &path.bucket,
                &path.object,
                buffer_size,
            ))?),
            OpenMode::Append => self.runtime.block_on(writer::open_append(
                backend.as_ref(),
                &path,
                buffer_size,
            ))?,
        };

        let id = self.registry.insert(handle);
        debug!("opened {} as {} handle {}", path, mode_name(mode), id);
        Ok(id)
    }

    fn try_read(
        &mut self,
        id: HandleId,
        buf: &mut [u8],
        size: usize,
        count: usize,
    ) -> DriverResult<i64> {
        let backend = self.connected()?;
        let handle = self
            .registry
            .get_mut(id)
            .ok_or_else(|| DriverError::not_found(format!("Cannot identify stream {id}")))?;
        let Handle::Read(file) = handle else {
            return Err(DriverError::invalid_argument("Cannot read on not reading stream"));
        };
        self.runtime
            .block_on(vfile::read(backend.as_ref(), file, buf, size, count))
    }

    fn try_write(&mut self, id: HandleId, buf: &[u8], size: usize, count: usize) -> DriverResult<i64> {
        if size == 0 {
            return Err(DriverError::invalid_argument("Error passing size 0 to write"));
        }
        let backend = self.connected()?;
        let handle = self
            .registry
            .get_mut(id)
            .ok_or_else(|| DriverError::not_found(format!("Cannot identify stream {id}")))?;
        let session = match handle {
            Handle::Write(session) => session,
            Handle::Append(append) => append.session_mut(),
            Handle::Read(_) => {
                return Err(DriverError::invalid_argument("Cannot write on not writing stream"))
            }
        };
        if count == 0 {
            return Ok(0);
        }

        let length = checked::byte_count(size, count)?;
        let data = buf.get(..checked::to_usize(length, "write length")?).ok_or_else(|| {
            DriverError::invalid_argument(format!(
                "Buffer of {} bytes does not hold {length} bytes",
                buf.len()
            ))
        })?;
        self.runtime.block_on(session.write(backend.as_ref(), data))?;
        Ok(length)
    }

    fn try_seek(&mut self, id: HandleId, delta: i64, whence: i32) -> DriverResult<i64> {
        let handle = self
            .registry
            .get_mut(id)
            .ok_or_else(|| DriverError::not_found(format!("Cannot identify stream {id}")))?;
        let Handle::Read(file) = handle else {
            return Err(DriverError::invalid_argument("Cannot seek on not reading stream"));
        };
        let whence = Whence::try_from(whence)?;
        vfile::seek(file, delta, whence)
    }

    fn try_flush(&mut self, id: HandleId) -> DriverResult<()> {
        let backend = self.connected()?;
        let handle = self
            .registry
            .get_mut(id)
            .ok_or_else(|| DriverError::not_found(format!("Cannot identify stream {id}")))?;
        let session = match handle {
            Handle::Write(session) => session,
            Handle::Append(append) => append.session_mut(),
            Handle::Read(_) => {
                return Err(DriverError::invalid_argument("Cannot flush on not writing stream"))
            }
        };
        self.runtime.block_on(session.flush(backend.as_ref()))
    }

    fn try_file_exists(&self, path: &str) -> DriverResult<()> {
        let backend = self.connected()?;
        let path = self.resolve(path)?;
        self.runtime
            .block_on(vfile::index::list_shards(backend.as_ref(), &path.bucket, &path.object))?;
        Ok(())
    }

    fn try_file_size(&self, path: &str) -> DriverResult<i64> {
        let backend = self.connected()?;
        let path = self.resolve(path)?;
        let file = self
            .runtime
            .block_on(vfile::build_index(backend.as_ref(), &path))?;
        Ok(file.total_size())
    }

    fn try_remove(&self, path: &str) -> DriverResult<()> {
        let backend = self.connected()?;
        let path = self.resolve(path)?;
        let existed = self
            .runtime
            .block_on(backend.delete(&path.bucket, &path.object))
            .map_err(|e| DriverError::backend(format!("deleting {path}"), e))?;
        if !existed {
            debug!("{} was already absent", path);
        }
        Ok(())
    }

    fn try_copy_to_local(&self, remote: &str, local: &Path) -> DriverResult<u64> {
        let backend = self.connected()?;
        let remote = self.resolve(remote)?;
        self.runtime
            .block_on(transfer::copy_to_local(backend.as_ref(), &remote, local))
    }

    fn try_copy_from_local(&self, local: &Path, remote: &str) -> DriverResult<u64> {
        let backend = self.connected()?;
        let remote = self.resolve(remote)?;
        self.runtime.block_on(transfer::copy_from_local(
            backend.as_ref(),
            local,
            &remote,
            self.config.driver.aligned_upload_buffer_size(),
        ))
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

/// Flush and release a handle.
async fn close_handle(backend: &dyn StorageBackend, handle: Handle) -> DriverResult<()> {
    match handle {
        Handle::Read(_) => Ok(()),
        Handle::Write(session) => session.close(backend).await.map(|_| ()),
        Handle::Append(append) => append.close(backend).await.map(|_| ()),
    }
}

fn mode_name(mode: OpenMode) -> &'static str {
    match mode {
        OpenMode::Read => "read",
        OpenMode::Write => "write",
        OpenMode::Append => "append",
    }
}
