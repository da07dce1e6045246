//! Configuration loading and types for the GCS driver.
//!
//! Configuration is read from an optional YAML file and deserialized into
//! the [`Config`] struct, then overlaid with the driver's environment
//! variables by [`Config::apply_env`].

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::writer::{align_buffer_size, DEFAULT_UPLOAD_BUFFER_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Driver behaviour.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Driver settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Bucket used for `gs:///object` URIs.  Empty means none.
    #[serde(default)]
    pub default_bucket: String,

    /// I/O size advertised to hosts (default 4 MiB).
    #[serde(default = "default_preferred_buffer_size")]
    pub preferred_buffer_size: usize,

    /// Bytes buffered per write session before uploading (default 8 MiB).
    #[serde(default = "default_upload_buffer_size")]
    pub upload_buffer_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_bucket: String::new(),
            preferred_buffer_size: default_preferred_buffer_size(),
            upload_buffer_size: default_upload_buffer_size(),
        }
    }
}

impl DriverConfig {
    /// Upload buffer rounded to the resumable upload quantum.
    pub fn aligned_upload_buffer_size(&self) -> usize {
        align_buffer_size(self.upload_buffer_size)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: "gcp" or "memory".
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Google Cloud Storage settings.
    #[serde(default)]
    pub gcp: GcpStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            gcp: GcpStorageConfig::default(),
        }
    }
}

/// GCP Cloud Storage connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GcpStorageConfig {
    /// Project billed for requests (`userProject`).  Empty means none.
    #[serde(default)]
    pub project: String,

    /// Service account or authorized-user JSON file.  Empty means the
    /// standard credential lookup.
    #[serde(default)]
    pub credentials_file: String,

    /// API root.
    #[serde(default = "default_gcp_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_gcp_timeout")]
    pub timeout_secs: u64,

    /// Send requests without credentials (local emulators).
    #[serde(default)]
    pub anonymous: bool,
}

impl Default for GcpStorageConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            credentials_file: String::new(),
            endpoint: default_gcp_endpoint(),
            timeout_secs: default_gcp_timeout(),
            anonymous: false,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_preferred_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_upload_buffer_size() -> usize {
    DEFAULT_UPLOAD_BUFFER_SIZE
}

fn default_storage_backend() -> String {
    "gcp".to_string()
}

fn default_gcp_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_gcp_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Environment -------------------------------------------------------------

impl Config {
    /// Overlay the driver's environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables obtained through `lookup`.  Empty values are
    /// treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(bucket) = get("GCS_BUCKET_NAME") {
            self.driver.default_bucket = bucket;
        }
        if let Some(level) = get("GCS_DRIVER_LOGLEVEL") {
            self.logging.level = level;
        }
        if let Some(raw) = get("GCS_PREFERRED_BUFFER_SIZE") {
            match raw.parse::<usize>() {
                Ok(size) if size > 0 => self.driver.preferred_buffer_size = size,
                _ => warn!(
                    "ignoring GCS_PREFERRED_BUFFER_SIZE={:?}: not a positive integer",
                    raw
                ),
            }
        }
        if let Some(path) = get("GCP_TOKEN") {
            self.storage.gcp.credentials_file = path;
        }
        if let Some(project) = get("CLOUD_ML_PROJECT_ID") {
            self.storage.gcp.project = project;
        }
    }
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.driver.default_bucket, "");
        assert_eq!(config.driver.preferred_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.driver.upload_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.storage.backend, "gcp");
        assert_eq!(config.storage.gcp.endpoint, "https://storage.googleapis.com");
        assert_eq!(config.storage.gcp.timeout_secs, 300);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "driver:\n  default_bucket: exports\n  upload_buffer_size: 300000\nstorage:\n  backend: memory\nlogging:\n  format: json\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.driver.default_bucket, "exports");
        assert_eq!(config.driver.preferred_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.driver.aligned_upload_buffer_size(), 256 * 1024);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.storage.gcp.timeout_secs, 300);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_config("/nonexistent/gcs-driver.yaml").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GCS_BUCKET_NAME", "from-env"),
            ("GCS_DRIVER_LOGLEVEL", "debug"),
            ("GCS_PREFERRED_BUFFER_SIZE", "65536"),
            ("GCP_TOKEN", "/secrets/key.json"),
            ("CLOUD_ML_PROJECT_ID", "my-project"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.driver.default_bucket, "from-env");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.driver.preferred_buffer_size, 65536);
        assert_eq!(config.storage.gcp.credentials_file, "/secrets/key.json");
        assert_eq!(config.storage.gcp.project, "my-project");
    }

    #[test]
    fn test_bad_buffer_size_is_ignored() {
        for raw in ["0", "-4", "lots", ""] {
            let mut config = Config::default();
            config.apply_env_from(|k| (k == "GCS_PREFERRED_BUFFER_SIZE").then(|| raw.to_string()));
            assert_eq!(config.driver.preferred_buffer_size, 4 * 1024 * 1024, "{raw:?}");
        }
    }
}
