//! Virtual files: every shard matching a glob, read as one byte stream.
//!
//! Shard `i` contributes its whole content when `i == 0` and everything
//! after the common header otherwise.  `cumulative_size[i]` is the number
//! of logical bytes through shard `i`, so the owning shard of a logical
//! offset is the first entry strictly greater than it.

pub mod index;
pub mod reader;
pub mod seek;

use crate::checked::Offset;

pub use index::build_index;
pub use reader::{read, read_into};
pub use seek::{seek, Whence};

/// Read-side state of one open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    bucket: String,
    object_glob: String,
    offset: Offset,
    common_header_len: Offset,
    shard_names: Vec<String>,
    cumulative_size: Vec<Offset>,
}

impl VirtualFile {
    /// Assemble an index.  `shard_names` and `cumulative_size` must be
    /// non-empty and of equal length; `cumulative_size` non-decreasing.
    pub(crate) fn new(
        bucket: String,
        object_glob: String,
        common_header_len: Offset,
        shard_names: Vec<String>,
        cumulative_size: Vec<Offset>,
    ) -> Self {
        debug_assert!(!shard_names.is_empty());
        debug_assert_eq!(shard_names.len(), cumulative_size.len());
        debug_assert!(cumulative_size.windows(2).all(|w| w[0] <= w[1]));
        Self {
            bucket,
            object_glob,
            offset: 0,
            common_header_len,
            shard_names,
            cumulative_size,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object_glob(&self) -> &str {
        &self.object_glob
    }

    /// Current cursor.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Length of the header line dropped from every shard after the first.
    pub fn common_header_len(&self) -> Offset {
        self.common_header_len
    }

    pub fn shard_names(&self) -> &[String] {
        &self.shard_names
    }

    pub fn cumulative_size(&self) -> &[Offset] {
        &self.cumulative_size
    }

    /// Logical size of the whole file.
    pub fn total_size(&self) -> Offset {
        self.cumulative_size.last().copied().unwrap_or(0)
    }
}
