//! Checked signed 64-bit arithmetic for offsets and byte counts.
//!
//! Logical offsets are `i64`.  Every addition, multiplication or width
//! conversion on the read and seek paths goes through these helpers so
//! overflow fails fast with [`DriverError::Overflow`] instead of wrapping.

use crate::errors::{DriverError, DriverResult};

/// Logical offset / size type.
pub type Offset = i64;

/// `a + b`, or `Overflow` naming `what`.
pub fn add(a: Offset, b: Offset, what: &str) -> DriverResult<Offset> {
    a.checked_add(b).ok_or_else(|| DriverError::overflow(what))
}

/// `a - b`, or `Overflow` naming `what`.
pub fn sub(a: Offset, b: Offset, what: &str) -> DriverResult<Offset> {
    a.checked_sub(b).ok_or_else(|| DriverError::overflow(what))
}

/// `a * b`, or `Overflow` naming `what`.
pub fn mul(a: Offset, b: Offset, what: &str) -> DriverResult<Offset> {
    a.checked_mul(b).ok_or_else(|| DriverError::overflow(what))
}

/// Total byte count of `count` elements of `size` bytes.
///
/// The product must fit in an [`Offset`], not merely in `usize`.
pub fn byte_count(size: usize, count: usize) -> DriverResult<Offset> {
    size.checked_mul(count)
        .and_then(|n| Offset::try_from(n).ok())
        .ok_or_else(|| DriverError::overflow("element size * element count"))
}

/// Convert an unsigned object size reported by the backend.
pub fn from_u64(value: u64, what: &str) -> DriverResult<Offset> {
    Offset::try_from(value).map_err(|_| DriverError::overflow(what))
}

/// Convert a non-negative offset for a backend call.
pub fn to_u64(value: Offset, what: &str) -> DriverResult<u64> {
    u64::try_from(value).map_err(|_| DriverError::overflow(what))
}

/// Convert a non-negative in-memory length.
pub fn to_usize(value: Offset, what: &str) -> DriverResult<usize> {
    usize::try_from(value).map_err(|_| DriverError::overflow(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_at_limit() {
        assert_eq!(add(i64::MAX - 1, 1, "t").unwrap(), i64::MAX);
        assert!(matches!(
            add(i64::MAX, 1, "t"),
            Err(DriverError::Overflow { .. })
        ));
        assert!(add(i64::MIN, -1, "t").is_err());
    }

    #[test]
    fn test_mul_and_sub() {
        assert_eq!(mul(3, 12, "t").unwrap(), 36);
        assert!(mul(i64::MAX / 2 + 1, 2, "t").is_err());
        assert_eq!(sub(10, 4, "t").unwrap(), 6);
        assert!(sub(i64::MIN, 1, "t").is_err());
    }

    #[test]
    fn test_byte_count_rejects_products_beyond_i64() {
        assert_eq!(byte_count(4, 8).unwrap(), 32);
        assert_eq!(byte_count(1, 0).unwrap(), 0);
        assert!(byte_count(usize::MAX, 2).is_err());
        // Fits in usize on 64-bit targets but not in i64.
        assert!(byte_count((i64::MAX as usize) / 2 + 1, 2).is_err());
    }

    #[test]
    fn test_width_conversions() {
        assert_eq!(from_u64(42, "t").unwrap(), 42);
        assert!(from_u64(u64::MAX, "t").is_err());
        assert_eq!(to_u64(7, "t").unwrap(), 7);
        assert!(to_u64(-1, "t").is_err());
        assert!(to_usize(-5, "t").is_err());
    }
}
