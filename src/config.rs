use crate::error::ConfigError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    /// Grace period for in-flight requests on shutdown.
    pub exit_timeout_secs: u64,
    pub kv: KvSettings,
    pub s3: S3Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Largest profile upload accepted, in bytes.
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvSettings {
    /// Storage directory. Empty disables the embedded backend.
    pub dir: String,
    pub profile_ttl_secs: u64,
    pub gc_interval_secs: u64,
    pub gc_discard_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    /// Bucket name. Empty disables the object storage backend.
    pub bucket: String,
    pub region: String,
    /// Custom endpoint, e.g. a MinIO server. Non-empty switches to path-style
    /// addressing.
    pub endpoint_url: String,
    pub disable_ssl: bool,
    pub max_retries: u32,
}

/// The one storage backend this process runs with.
#[derive(Debug, Clone, Copy)]
pub enum StorageBackend<'a> {
    Kv(&'a KvSettings),
    S3(&'a S3Settings),
}

impl Settings {
    /// `config/default.toml`, then `config/{RUN_MODE}.toml`, then
    /// `PROFSTORE__*` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Self::builder()?
            .add_source(File::new("config/default", FileFormat::Toml).required(false))
            .add_source(File::new(&format!("config/{}", env), FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("PROFSTORE").separator("__"))
            .build()?;

        Self::from_config(config)
    }

    /// Builder preloaded with defaults for every key.
    pub fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 10100)?
            .set_default("server.max_payload_bytes", DEFAULT_MAX_PAYLOAD_BYTES as u64)?
            .set_default("exit_timeout_secs", 5)?
            .set_default("kv.dir", "")?
            .set_default("kv.profile_ttl_secs", 72 * 3600)?
            .set_default("kv.gc_interval_secs", 300)?
            .set_default("kv.gc_discard_ratio", 0.7)?
            .set_default("s3.bucket", "")?
            .set_default("s3.region", "us-east-1")?
            .set_default("s3.endpoint_url", "")?
            .set_default("s3.disable_ssl", false)?
            .set_default("s3.max_retries", 3)?)
    }

    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let settings: Settings = config.try_deserialize()?;
        if settings.server.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "server.max_payload_bytes must be positive".to_string(),
            ));
        }
        settings.storage_backend()?;
        Ok(settings)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    /// Picks the embedded store when `kv.dir` is set, otherwise S3 when
    /// `s3.bucket` is set. Validates only the selected backend.
    pub fn storage_backend(&self) -> Result<StorageBackend<'_>, ConfigError> {
        if !self.kv.dir.is_empty() {
            self.kv.validate()?;
            Ok(StorageBackend::Kv(&self.kv))
        } else if !self.s3.bucket.is_empty() {
            self.s3.validate()?;
            Ok(StorageBackend::S3(&self.s3))
        } else {
            Err(ConfigError::NoStorageConfigured)
        }
    }
}

impl KvSettings {
    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.profile_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "kv.profile_ttl_secs must be positive".to_string(),
            ));
        }
        if self.gc_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "kv.gc_interval_secs must be positive".to_string(),
            ));
        }
        if !(self.gc_discard_ratio > 0.0 && self.gc_discard_ratio < 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "kv.gc_discard_ratio must be in (0, 1), got {}",
                self.gc_discard_ratio
            )));
        }
        Ok(())
    }
}

impl S3Settings {
    /// Endpoint to hand to the SDK, if the default AWS one won't do.
    pub fn endpoint(&self) -> Option<String> {
        let scheme = if self.disable_ssl { "http" } else { "https" };
        if !self.endpoint_url.is_empty() {
            if self.endpoint_url.contains("://") {
                Some(self.endpoint_url.clone())
            } else {
                Some(format!("{}://{}", scheme, self.endpoint_url))
            }
        } else if self.disable_ssl {
            Some(format!("http://s3.{}.amazonaws.com", self.region))
        } else {
            None
        }
    }

    pub fn force_path_style(&self) -> bool {
        !self.endpoint_url.is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() {
            return Err(ConfigError::InvalidValue(
                "s3.region is required".to_string(),
            ));
        }
        Ok(())
    }
}
