//! Configuration parsing and structures

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;
use crate::mount::MountOptions;
use crate::translator::MkdirPolicy;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backend defaults shared by every mount
    #[serde(default)]
    pub backends: BackendDefaults,

    /// Mount points
    pub mounts: Vec<RawMountConfig>,
}

/// Top-level backend defaults section
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendDefaults {
    /// Client settings for every `s3://` source
    #[serde(default)]
    pub s3: S3Overrides,
}

/// S3 client settings where every field may be left to a lower layer
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Overrides {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: Option<bool>,
}

/// Raw mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Backend namespace to expose, e.g. `s3://bucket/prefix`
    pub source: Source,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub mkdir: MkdirPolicy,

    /// Kernel attribute cache lifetime
    #[serde(default = "default_attr_ttl", with = "humantime_serde")]
    pub attr_ttl: Duration,

    #[serde(default)]
    pub allow_other: bool,

    pub uid: Option<u32>,
    pub gid: Option<u32>,

    /// Per-mount S3 settings (override `backends.s3`)
    #[serde(default)]
    pub s3: S3Overrides,
}

fn default_attr_ttl() -> Duration {
    Duration::from_secs(1)
}

// =============================================================================
// Sources
// =============================================================================

/// Where a mount's entries live
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Source {
    /// A directory on local disk
    Local(PathBuf),
    /// An S3 bucket, optionally narrowed to a key prefix
    S3 {
        bucket: String,
        prefix: Option<String>,
    },
    /// A process-local tree that vanishes on exit
    Memory,
}

impl Source {
    /// Backend path every virtual path is resolved under
    pub fn mount_root(&self) -> PathBuf {
        match self {
            Source::Local(path) => path.clone(),
            Source::S3 {
                prefix: Some(prefix),
                ..
            } => Path::new("/").join(prefix),
            Source::S3 { prefix: None, .. } | Source::Memory => PathBuf::from("/"),
        }
    }
}

impl FromStr for Source {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "S3 source '{}' has no bucket",
                    s
                )));
            }
            return Ok(Source::S3 {
                bucket: bucket.to_string(),
                prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            });
        }

        if let Some(rest) = s.strip_prefix("memory://") {
            if !rest.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "memory source takes no path, got '{}'",
                    s
                )));
            }
            return Ok(Source::Memory);
        }

        let path = s.strip_prefix("file://").unwrap_or(s);
        if path.is_empty() {
            return Err(ConfigError::ValidationError(
                "source path cannot be empty".to_string(),
            ));
        }
        if let Some((scheme, _)) = path.split_once("://") {
            return Err(ConfigError::ValidationError(format!(
                "unknown source scheme '{}'",
                scheme
            )));
        }
        Ok(Source::Local(PathBuf::from(path)))
    }
}

impl TryFrom<String> for Source {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local(path) => write!(f, "{}", path.display()),
            Source::S3 {
                bucket,
                prefix: Some(prefix),
            } => write!(f, "s3://{}/{}", bucket, prefix),
            Source::S3 {
                bucket,
                prefix: None,
            } => write!(f, "s3://{}", bucket),
            Source::Memory => f.write_str("memory://"),
        }
    }
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Mount points (fully resolved)
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// S3 client settings (fully resolved)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Settings {
    /// AWS region
    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible stores)
    pub endpoint: Option<String>,

    /// Force path-style addressing (for MinIO, LocalStack, etc.)
    pub force_path_style: bool,
}

/// Mount point configuration (resolved)
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub path: PathBuf,
    pub source: Source,
    pub read_only: bool,
    pub mkdir: MkdirPolicy,
    pub attr_ttl: Duration,
    pub allow_other: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Only consulted for `s3://` sources
    pub s3: S3Settings,
}

impl MountConfig {
    /// A mount with default options
    pub fn new(path: impl Into<PathBuf>, source: Source) -> Self {
        Self {
            path: path.into(),
            source,
            read_only: false,
            mkdir: MkdirPolicy::default(),
            attr_ttl: default_attr_ttl(),
            allow_other: false,
            uid: None,
            gid: None,
            s3: S3Settings::default(),
        }
    }

    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            fs_name: self.source.to_string(),
            read_only: self.read_only,
            allow_other: self.allow_other,
            attr_ttl: self.attr_ttl,
            uid: self.uid,
            gid: self.gid,
        }
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount overrides with defaults
    pub fn resolve(self) -> Config {
        let RawConfig {
            logging,
            backends,
            mounts,
        } = self;

        let mounts = mounts
            .into_iter()
            .map(|raw| MountConfig {
                s3: Self::resolve_s3(&backends.s3, raw.s3),
                path: raw.path,
                source: raw.source,
                read_only: raw.read_only,
                mkdir: raw.mkdir,
                attr_ttl: raw.attr_ttl,
                allow_other: raw.allow_other,
                uid: raw.uid,
                gid: raw.gid,
            })
            .collect();

        Config { logging, mounts }
    }

    fn resolve_s3(defaults: &S3Overrides, mount: S3Overrides) -> S3Settings {
        S3Settings {
            region: mount.region.or_else(|| defaults.region.clone()),
            endpoint: mount.endpoint.or_else(|| defaults.endpoint.clone()),
            force_path_style: mount
                .force_path_style
                .or(defaults.force_path_style)
                .unwrap_or(false),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, expanding `${VAR}` references first
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(raw.resolve())
    }

    /// Configuration for a single mount given on the command line
    pub fn single(mount: MountConfig) -> Self {
        Self {
            logging: LoggingConfig::default(),
            mounts: vec![mount],
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount point is required".to_string(),
            ));
        }

        // Check for duplicate mount paths
        let mut paths = std::collections::HashSet::new();
        for mount in &self.mounts {
            if !paths.insert(&mount.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount path: {:?}",
                    mount.path
                )));
            }
        }

        for mount in &self.mounts {
            if let Source::S3 { bucket, .. } = &mount.source {
                if bucket.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Mount {:?}: S3 bucket cannot be empty",
                        mount.path
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
