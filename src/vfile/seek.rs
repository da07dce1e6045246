//! Cursor arithmetic.

use super::VirtualFile;
use crate::checked::{self, Offset};
use crate::errors::{DriverError, DriverResult};

/// Seek origin.  Raw values follow `std::ios::seekdir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = DriverError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(DriverError::invalid_argument(format!(
                "Invalid seek direction: {other}"
            ))),
        }
    }
}

/// Offset that `seek(delta, whence)` would move to.
///
/// `End` is anchored on the last byte: `seek(0, End)` lands on
/// `total_size - 1`, or 0 for an empty file.
pub fn target(file: &VirtualFile, delta: Offset, whence: Whence) -> DriverResult<Offset> {
    let position = match whence {
        Whence::Start => delta,
        Whence::Current => checked::add(file.offset, delta, "seek from current position")?,
        Whence::End => {
            let total = file.total_size();
            if total == 0 {
                delta
            } else {
                checked::add(total - 1, delta, "seek from end")?
            }
        }
    };
    if position < 0 {
        return Err(DriverError::invalid_argument(format!(
            "Invalid seek: resulting offset {position} is negative"
        )));
    }
    Ok(position)
}

/// Move the cursor.  Positions past the end are accepted; the next read
/// reports the failure.  The cursor is untouched on error.
pub fn seek(file: &mut VirtualFile, delta: Offset, whence: Whence) -> DriverResult<Offset> {
    let position = target(file, delta, whence)?;
    file.offset = position;
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(total: Offset) -> VirtualFile {
        VirtualFile::new(
            "b".into(),
            "o".into(),
            0,
            vec!["o".into()],
            vec![total],
        )
    }

    #[test]
    fn test_raw_whence() {
        assert_eq!(Whence::try_from(0).unwrap(), Whence::Start);
        assert_eq!(Whence::try_from(1).unwrap(), Whence::Current);
        assert_eq!(Whence::try_from(2).unwrap(), Whence::End);
        assert_eq!(Whence::try_from(3).unwrap_err().code(), "InvalidArgument");
        assert!(Whence::try_from(-1).is_err());
    }

    #[test]
    fn test_start_then_current_zero() {
        let mut f = file(100);
        assert_eq!(seek(&mut f, 42, Whence::Start).unwrap(), 42);
        assert_eq!(seek(&mut f, 0, Whence::Current).unwrap(), 42);
        assert_eq!(seek(&mut f, -2, Whence::Current).unwrap(), 40);
    }

    #[test]
    fn test_end_is_anchored_on_last_byte() {
        let mut f = file(26);
        assert_eq!(seek(&mut f, 0, Whence::End).unwrap(), 25);
        assert_eq!(seek(&mut f, 1, Whence::End).unwrap(), 26);

        let mut empty = file(0);
        assert_eq!(seek(&mut empty, 0, Whence::End).unwrap(), 0);
        assert_eq!(seek(&mut empty, 5, Whence::End).unwrap(), 5);
    }

    #[test]
    fn test_past_end_is_allowed() {
        let mut f = file(10);
        assert_eq!(seek(&mut f, 1000, Whence::Start).unwrap(), 1000);
        assert_eq!(f.offset(), 1000);
    }

    #[test]
    fn test_negative_result_leaves_offset() {
        let mut f = file(10);
        seek(&mut f, 5, Whence::Start).unwrap();
        assert!(seek(&mut f, -1, Whence::Start).is_err());
        assert!(seek(&mut f, -6, Whence::Current).is_err());
        assert!(seek(&mut f, -11, Whence::End).is_err());
        assert_eq!(f.offset(), 5);
    }

    #[test]
    fn test_overflow_leaves_offset() {
        let mut f = file(10);
        seek(&mut f, 3, Whence::Start).unwrap();
        let err = seek(&mut f, i64::MAX, Whence::Current).unwrap_err();
        assert_eq!(err.code(), "Overflow");
        assert_eq!(f.offset(), 3);

        let mut big = file(i64::MAX);
        assert_eq!(seek(&mut big, 1, Whence::End).unwrap(), i64::MAX);
        assert!(seek(&mut big, 2, Whence::End).is_err());
    }
}
