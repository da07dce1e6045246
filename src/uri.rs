//! `gs://bucket/object` parsing.

use crate::errors::{DriverError, DriverResult};

/// URI scheme handled by this driver.
pub const SCHEME: &str = "gs";

const PREFIX: &str = "gs://";

/// A resolved bucket / object pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub bucket: String,
    /// Object name or glob.
    pub object: String,
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PREFIX}{}/{}", self.bucket, self.object)
    }
}

/// Split a URI into bucket and object without applying any default.
///
/// The bucket may come back empty (`gs:///object`).
pub fn parse(uri: &str) -> DriverResult<ObjectPath> {
    let rest = uri
        .strip_prefix(PREFIX)
        .ok_or_else(|| DriverError::invalid_argument(format!("Invalid GCS URI: {uri}")))?;

    let (bucket, object) = rest.split_once('/').ok_or_else(|| {
        DriverError::invalid_argument(format!("Invalid GCS URI, missing object name: {uri}"))
    })?;

    if object.is_empty() {
        return Err(DriverError::invalid_argument(format!(
            "Invalid GCS URI, empty object name: {uri}"
        )));
    }

    Ok(ObjectPath {
        bucket: bucket.to_string(),
        object: object.to_string(),
    })
}

/// Parse `uri`, substituting `default_bucket` when the bucket is empty.
pub fn resolve(uri: &str, default_bucket: Option<&str>) -> DriverResult<ObjectPath> {
    let mut path = parse(uri)?;
    if path.bucket.is_empty() {
        match default_bucket {
            Some(bucket) if !bucket.is_empty() => path.bucket = bucket.to_string(),
            _ => {
                return Err(DriverError::internal(
                    "No bucket specified and GCS_BUCKET_NAME is not set!",
                ))
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_and_object() {
        let path = parse("gs://my-bucket/dir/part-*.csv").unwrap();
        assert_eq!(path.bucket, "my-bucket");
        assert_eq!(path.object, "dir/part-*.csv");
        assert_eq!(path.to_string(), "gs://my-bucket/dir/part-*.csv");
    }

    #[test]
    fn test_invalid_uris() {
        for uri in [
            "noprefix",
            "s3://bucket/key",
            "gs://not_valid",
            "gs://only_bucket_name/",
            "",
        ] {
            let err = parse(uri).unwrap_err();
            assert_eq!(err.code(), "InvalidArgument", "uri {uri:?}");
        }
    }

    #[test]
    fn test_default_bucket_substitution() {
        let path = resolve("gs:///object.txt", Some("fallback")).unwrap();
        assert_eq!(path.bucket, "fallback");
        assert_eq!(path.object, "object.txt");

        // An explicit bucket wins over the default.
        let path = resolve("gs://explicit/object.txt", Some("fallback")).unwrap();
        assert_eq!(path.bucket, "explicit");
    }

    #[test]
    fn test_missing_default_bucket_is_internal() {
        assert_eq!(resolve("gs:///no_bucket", None).unwrap_err().code(), "Internal");
        assert_eq!(
            resolve("gs:///no_bucket", Some("")).unwrap_err().code(),
            "Internal"
        );
    }
}
