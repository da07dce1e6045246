//! gcs-driver -- Google Cloud Storage as a seekable file system.
//!
//! A glob such as `gs://bucket/export/part-*.csv` names a *virtual file*:
//! every matching shard, in listing order, read as one byte stream in which
//! a header line repeated at the top of every shard appears only once.
//! Objects can also be written and appended to, the latter emulated with
//! server-side compose.
//!
//! [`driver::Driver`] is the entry point.  It owns the storage backend and
//! the open handles and exposes the file operations with integer sentinel
//! results suitable for a host file-driver interface.

pub mod checked;
pub mod config;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod transfer;
pub mod uri;
pub mod vfile;
pub mod writer;

pub use driver::{CloseStatus, Driver, OpenMode};
pub use errors::{DriverError, DriverResult};
pub use registry::{HandleId, HandleKind};
