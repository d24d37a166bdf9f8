//! Regwatch Configuration
//!
//! User configuration for database profiles, dashboard API access, mail
//! delivery, and issue query policy.
//! Config file: ~/.config/regwatch/config.toml or /etc/regwatch/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn default_profile() -> String {
    "kcidb".to_string()
}

fn default_profiles() -> BTreeMap<String, String> {
    let mut profiles = BTreeMap::new();
    profiles.insert("kcidb".to_string(), "kcidb.sqlite".to_string());
    profiles
}

/// Database access: a named connection profile resolved to a database path.
///
/// Profiles keep filesystem locations out of source; the active profile is
/// selected by name, the same way a pg_service-style setup would.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Active profile name
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Profile name -> database path
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            profiles: default_profiles(),
        }
    }
}

impl DatabaseConfig {
    /// Resolve the active profile to a database path
    pub fn resolve_path(&self) -> Result<PathBuf> {
        self.profiles
            .get(&self.profile)
            .map(PathBuf::from)
            .with_context(|| {
                format!(
                    "Database profile '{}' not found in [database.profiles]",
                    self.profile
                )
            })
    }
}

fn default_base_url() -> String {
    "https://dashboard.kernelci.org/api/".to_string()
}

fn default_cache_dir() -> String {
    "dashboard_json_cache".to_string()
}

/// Dashboard REST API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Base URL of the dashboard API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Directory holding one cached JSON file per request URL
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_sender() -> String {
    "KernelCI bot <bot@kernelci.org>".to_string()
}

fn default_token_file() -> String {
    "token.json".to_string()
}

/// Mail delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// From address for outgoing reports
    #[serde(default = "default_sender")]
    pub sender: String,

    /// Default To address when none is given on the command line
    #[serde(default)]
    pub default_to: String,

    /// OAuth client secrets file used to provision the token file.
    /// Only referenced in operator-facing messages; this tool never runs
    /// the consent flow itself.
    #[serde(default)]
    pub credentials_file: Option<String>,

    /// Persisted OAuth token file
    #[serde(default = "default_token_file")]
    pub token_file: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: default_sender(),
            default_to: String::new(),
            credentials_file: None,
            token_file: default_token_file(),
        }
    }
}

fn default_origin() -> String {
    "maestro".to_string()
}

fn default_window_days() -> i64 {
    4
}

fn default_boot_paths_only() -> bool {
    true
}

fn default_lookback_days() -> i64 {
    18
}

fn default_exclude_marker() -> String {
    "error_return_code".to_string()
}

/// Issue query policy
///
/// `window_days` and `boot_paths_only` select between the historical query
/// variants (3-day unrestricted vs 4-day boot-restricted); the defaults
/// follow the newest definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Origin tag issues and incidents are filtered to
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Trailing detection window in days
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Restrict the test side of the first-incident union to boot paths
    #[serde(default = "default_boot_paths_only")]
    pub boot_paths_only: bool,

    /// Lookback bound in days for the strict last-known-good search
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Issues whose comment contains this marker are not real regressions
    #[serde(default = "default_exclude_marker")]
    pub exclude_comment_marker: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            window_days: default_window_days(),
            boot_paths_only: default_boot_paths_only(),
            lookback_days: default_lookback_days(),
            exclude_comment_marker: default_exclude_marker(),
        }
    }
}

/// Main regwatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegwatchConfig {
    /// Database profiles
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Dashboard API settings
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Mail delivery settings
    #[serde(default)]
    pub mail: MailConfig,

    /// Issue query policy
    #[serde(default)]
    pub query: QueryConfig,
}

impl RegwatchConfig {
    /// Get default user config path: ~/.config/regwatch/config.toml
    pub fn user_config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("XDG_CONFIG_HOME"))
            .context("Cannot determine home directory")?;

        let config_dir = if home.contains("/.config") {
            PathBuf::from(home)
        } else {
            Path::new(&home).join(".config")
        };

        Ok(config_dir.join("regwatch").join("config.toml"))
    }

    /// Get system config path: /etc/regwatch/config.toml
    pub fn system_config_path() -> PathBuf {
        PathBuf::from("/etc/regwatch/config.toml")
    }

    /// Load configuration from file
    ///
    /// Priority:
    /// 1. User config (~/.config/regwatch/config.toml)
    /// 2. System config (/etc/regwatch/config.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self> {
        if let Ok(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Self::load_from(&user_path);
            }
        }

        let system_path = Self::system_config_path();
        if system_path.exists() {
            return Self::load_from(&system_path);
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: RegwatchConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let toml_string =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Set a configuration value from a "section.key=value" expression
    pub fn set(&mut self, expr: &str) -> Result<()> {
        let (key, value) = expr
            .split_once('=')
            .context("Expected key=value (e.g. query.window_days=3)")?;

        match key.trim() {
            "database.profile" => self.database.profile = value.trim().to_string(),
            "dashboard.base_url" => self.dashboard.base_url = value.trim().to_string(),
            "dashboard.cache_dir" => self.dashboard.cache_dir = value.trim().to_string(),
            "mail.sender" => self.mail.sender = value.trim().to_string(),
            "mail.default_to" => self.mail.default_to = value.trim().to_string(),
            "mail.token_file" => self.mail.token_file = value.trim().to_string(),
            "query.origin" => self.query.origin = value.trim().to_string(),
            "query.window_days" => {
                self.query.window_days = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid window_days: '{}'", value))?
            }
            "query.boot_paths_only" => {
                self.query.boot_paths_only = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid boot_paths_only: '{}'", value))?
            }
            "query.lookback_days" => {
                self.query.lookback_days = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid lookback_days: '{}'", value))?
            }
            other => anyhow::bail!("Unknown configuration key: '{}'", other),
        }

        Ok(())
    }
}
