//! Query service configuration.
//!
//! Loaded once from TOML, validated, and shared as `Arc<QueryConfig>`.
//! Every section has defaults, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use quarry_protocol::defaults::{
    DEFAULT_DOWNLOAD_FORMAT, DEFAULT_STORE_PATH, DEFAULT_SYNC_TIMEOUT_SECS, DEFAULT_UPLOAD_SCHEMA,
    DEFAULT_USER_SCHEMA_PREFIX,
};
use quarry_protocol::{display_name, AccessLevel, Identity};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Sizes and limits
// ============================================================================

/// Parse a human readable size ("100Mb", "1.5 GB", "512") into bytes.
/// Units are binary multiples; a bare number is bytes.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("Invalid size '{}'", value))?;

    let exponent = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" => 1,
        "m" | "mb" => 2,
        "g" | "gb" => 3,
        "t" | "tb" => 4,
        "p" | "pb" => 5,
        other => return Err(format!("Invalid size unit '{}' in '{}'", other, value)),
    };
    Ok((number * 1024f64.powi(exponent)) as u64)
}

/// A non-negative limit; `0` means unlimited.
///
/// Accepts integers or size strings in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Limit(pub u64);

impl Limit {
    pub const UNLIMITED: Limit = Limit(0);

    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LimitVisitor;

        impl<'de> Visitor<'de> for LimitVisitor {
            type Value = Limit;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a size string such as \"100Mb\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Limit, E> {
                Ok(Limit(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Limit, E> {
                u64::try_from(v)
                    .map(Limit)
                    .map_err(|_| E::custom("limit must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Limit, E> {
                parse_size(v).map(Limit).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(LimitVisitor)
    }
}

/// Per-identity limit table: per-user overrides, then the largest group
/// value, then the user or anonymous default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitTable {
    pub anonymous: Limit,
    pub user: Limit,
    pub users: BTreeMap<String, Limit>,
    pub groups: BTreeMap<String, Limit>,
}

impl LimitTable {
    pub fn resolve(&self, identity: Option<&Identity>) -> Limit {
        let Some(identity) = identity else {
            return self.anonymous;
        };

        if let Some(limit) = self.users.get(&identity.username) {
            if !limit.is_unlimited() {
                return *limit;
            }
        }

        let group_limit = identity
            .groups
            .iter()
            .filter_map(|group| self.groups.get(group))
            .max()
            .copied();

        match group_limit {
            Some(limit) => limit,
            None => self.user,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Tasks run inline in the submitting task.
    Sync,
    /// Tasks are enqueued and picked up by workers.
    #[default]
    Async,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Sync => "sync",
            DispatchMode::Async => "async",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
}

/// An execution lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub key: String,
    #[serde(default)]
    pub label: String,
    /// Execution budget in seconds (0 = none)
    pub timeout: f64,
    pub priority: i64,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl QueueConfig {
    pub fn permits(&self, identity: Option<&Identity>) -> bool {
        self.access_level.permits(identity, &self.groups)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub key: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_quote_char")]
    pub quote_char: String,
}

impl LanguageConfig {
    /// `key` or `key-version`
    pub fn matches(&self, requested: &str) -> bool {
        if requested == self.key {
            return true;
        }
        match &self.version {
            Some(version) => requested == format!("{}-{}", self.key, version),
            None => false,
        }
    }
}

fn default_quote_char() -> String {
    "\"".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatConfig {
    pub key: String,
    pub extension: String,
    pub content_type: String,
    #[serde(default)]
    pub label: String,
}

/// Grants consulted by the built-in permission checker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Schemas every identity may read
    pub public_schemas: Vec<String>,
    /// group name -> schemas its members may read
    pub group_schemas: BTreeMap<String, Vec<String>>,
    /// Functions allowed in queries; empty allows every function
    pub functions: Vec<String>,
    /// Keywords rejected outright
    pub blocked_keywords: Vec<String>,
    /// Schema assumed for unqualified table names
    pub default_schema: Option<String>,
}

/// Canned query shown to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub order: i32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub query_language: String,
    pub query_string: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A directory whose files may be bundled by archive jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub groups: Vec<String>,
}

// ============================================================================
// QueryConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// SQLite job store
    pub store_path: String,
    /// PostgreSQL URL of the result backend; in-memory backend when absent
    pub database_url: Option<String>,
    pub dispatch: DispatchConfig,
    pub user_schema_prefix: String,
    pub upload_schema: String,
    /// Budget (seconds) of synchronous queries
    pub sync_timeout: f64,
    pub download_dir: PathBuf,
    pub default_download_format: String,
    /// Base URL of table documentation, linked from downloaded files
    pub metadata_base_url: Option<String>,
    pub quota: LimitTable,
    pub max_active_jobs: LimitTable,
    pub upload_limit: LimitTable,
    pub queues: Vec<QueueConfig>,
    pub languages: Vec<LanguageConfig>,
    pub download_formats: Vec<FormatConfig>,
    pub permissions: PermissionConfig,
    pub examples: Vec<Example>,
    pub directories: Vec<DirectoryConfig>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            store_path: DEFAULT_STORE_PATH.to_string(),
            database_url: None,
            dispatch: DispatchConfig::default(),
            user_schema_prefix: DEFAULT_USER_SCHEMA_PREFIX.to_string(),
            upload_schema: DEFAULT_UPLOAD_SCHEMA.to_string(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT_SECS,
            download_dir: PathBuf::from("downloads"),
            default_download_format: DEFAULT_DOWNLOAD_FORMAT.to_string(),
            metadata_base_url: None,
            quota: LimitTable {
                anonymous: Limit(100 * 1024 * 1024),
                user: Limit(10_000 * 1024 * 1024),
                ..LimitTable::default()
            },
            max_active_jobs: LimitTable {
                anonymous: Limit(1),
                ..LimitTable::default()
            },
            upload_limit: LimitTable {
                anonymous: Limit(10 * 1024 * 1024),
                user: Limit(100 * 1024 * 1024),
                ..LimitTable::default()
            },
            queues: vec![QueueConfig {
                key: "default".to_string(),
                label: "Default".to_string(),
                timeout: 10.0,
                priority: 1,
                access_level: AccessLevel::Public,
                groups: Vec::new(),
            }],
            languages: vec![
                LanguageConfig {
                    key: "adql".to_string(),
                    version: Some("2.0".to_string()),
                    label: "ADQL".to_string(),
                    quote_char: default_quote_char(),
                },
                LanguageConfig {
                    key: "postgresql".to_string(),
                    version: Some("16".to_string()),
                    label: "PostgreSQL".to_string(),
                    quote_char: default_quote_char(),
                },
            ],
            download_formats: vec![
                FormatConfig {
                    key: "votable".to_string(),
                    extension: "xml".to_string(),
                    content_type: "application/xml".to_string(),
                    label: "IVOA VOTable XML file - TABLEDATA serialization".to_string(),
                },
                FormatConfig {
                    key: "csv".to_string(),
                    extension: "csv".to_string(),
                    content_type: "text/csv".to_string(),
                    label: "Comma separated Values".to_string(),
                },
            ],
            permissions: PermissionConfig::default(),
            examples: Vec::new(),
            directories: Vec::new(),
        }
    }
}

impl QueryConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: QueryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("at least one queue is required".into()));
        }
        if self.languages.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one query language is required".into(),
            ));
        }
        for (i, queue) in self.queues.iter().enumerate() {
            if self.queues[..i].iter().any(|q| q.key == queue.key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate queue key '{}'",
                    queue.key
                )));
            }
            if queue.timeout < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "queue '{}' has a negative timeout",
                    queue.key
                )));
            }
        }
        if self.format(&self.default_download_format).is_none() {
            return Err(ConfigError::Invalid(format!(
                "default download format '{}' is not configured",
                self.default_download_format
            )));
        }
        if self.sync_timeout < 0.0 {
            return Err(ConfigError::Invalid("sync_timeout must not be negative".into()));
        }
        Ok(())
    }

    pub fn queue(&self, key: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.key == key)
    }

    /// Queues `identity` may submit to, in configuration order.
    pub fn permitted_queues(&self, identity: Option<&Identity>) -> Vec<&QueueConfig> {
        self.queues.iter().filter(|q| q.permits(identity)).collect()
    }

    pub fn language(&self, requested: &str) -> Option<&LanguageConfig> {
        self.languages.iter().find(|l| l.matches(requested))
    }

    pub fn format(&self, key: &str) -> Option<&FormatConfig> {
        self.download_formats.iter().find(|f| f.key == key)
    }

    pub fn quota_for(&self, identity: Option<&Identity>) -> Limit {
        self.quota.resolve(identity)
    }

    pub fn max_active_jobs_for(&self, identity: Option<&Identity>) -> Limit {
        self.max_active_jobs.resolve(identity)
    }

    pub fn upload_limit_for(&self, identity: Option<&Identity>) -> Limit {
        self.upload_limit.resolve(identity)
    }

    /// `<prefix><username>`, with "anonymous" for anonymous submitters.
    pub fn user_schema(&self, identity: Option<&Identity>) -> String {
        format!("{}{}", self.user_schema_prefix, display_name(identity))
    }

    /// Examples visible to `identity`, ordered by `order`.
    pub fn examples_for(&self, identity: Option<&Identity>) -> Vec<&Example> {
        let mut examples: Vec<&Example> = self
            .examples
            .iter()
            .filter(|e| e.access_level.permits(identity, &e.groups))
            .collect();
        examples.sort_by_key(|e| e.order);
        examples
    }
}
