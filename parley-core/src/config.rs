//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/parley/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/parley/` (~/.config/parley/)
//! - Data: `$XDG_DATA_HOME/parley/` (~/.local/share/parley/)
//! - State/Logs: `$XDG_STATE_HOME/parley/` (~/.local/state/parley/)

use crate::db::{DatabaseOptions, MigrationSource};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `claude.api_key`
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Claude API settings
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Application behavior
    #[serde(default)]
    pub app: AppConfig,

    /// Storage location overrides
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Attachment limits
    #[serde(default)]
    pub file: FileConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Claude API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Upper bound on generated tokens per reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature, 0.0 to 1.0
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// API base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            endpoint: default_endpoint(),
            api_key: None,
        }
    }
}

impl ClaudeConfig {
    /// Effective API key: the environment wins over the config file.
    pub fn api_key(&self) -> Option<String> {
        self.resolve_api_key(std::env::var(API_KEY_ENV).ok())
    }

    fn resolve_api_key(&self, from_env: Option<String>) -> Option<String> {
        from_env
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }
}

fn default_model() -> String {
    "claude-3-haiku-20240307".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

fn default_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => Err(format!(
                "unknown environment '{}' (expected development or production)",
                other
            )),
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Destructive database operations are only allowed in development
    #[serde(default)]
    pub environment: Environment,

    /// Project context prepended to outgoing user messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_file_path: Option<PathBuf>,
}

/// Database location overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file (default `$XDG_DATA_HOME/parley/chat.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Read migrations from this folder instead of the built-in set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations_dir: Option<PathBuf>,
}

/// Attachment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Attachments larger than this many bytes are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Extensions (with leading dot) accepted as text attachments
    #[serde(default = "default_allowed_file_types")]
    pub allowed_file_types: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_file_types: default_allowed_file_types(),
        }
    }
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_file_types() -> Vec<String> {
    [
        ".txt", ".md", ".json", ".js", ".ts", ".jsx", ".tsx", ".py", ".java", ".cpp", ".c", ".h",
        ".css", ".html", ".xml", ".yaml", ".yml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Outcome of [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {}: {}", key, e)))
}

fn non_empty(key: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Config(format!("{} cannot be empty", key)));
    }
    Ok(value.to_string())
}

fn optional_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Write the configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Write the configuration to `path`, creating its directory.
    ///
    /// The API key is never written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Change one setting by its dotted `section.field` name.
    ///
    /// Empty values clear optional paths. `claude.api_key` is refused since
    /// the key is never persisted.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "claude.model" => self.claude.model = non_empty(key, value)?,
            "claude.max_tokens" => {
                let max_tokens: u32 = parse_value(key, value)?;
                if max_tokens == 0 {
                    return Err(Error::Config(format!("{} must be at least 1", key)));
                }
                self.claude.max_tokens = max_tokens;
            }
            "claude.temperature" => {
                let temperature: f64 = parse_value(key, value)?;
                if !(0.0..=1.0).contains(&temperature) {
                    return Err(Error::Config(format!("{} must be between 0 and 1", key)));
                }
                self.claude.temperature = temperature;
            }
            "claude.endpoint" => self.claude.endpoint = non_empty(key, value)?,
            "claude.api_key" => {
                return Err(Error::Config(format!(
                    "the API key is not stored in the config file; set {} instead",
                    API_KEY_ENV
                )))
            }
            "app.environment" => self.app.environment = parse_value(key, value)?,
            "app.context_file_path" => self.app.context_file_path = optional_path(value),
            "database.path" => self.database.path = optional_path(value),
            "database.migrations_dir" => self.database.migrations_dir = optional_path(value),
            "file.max_file_size" => {
                let size: u64 = parse_value(key, value)?;
                if size == 0 {
                    return Err(Error::Config(format!("{} must be at least 1", key)));
                }
                self.file.max_file_size = size;
            }
            "file.allowed_file_types" => {
                self.file.allowed_file_types = value
                    .split(',')
                    .map(|ext| ext.trim())
                    .filter(|ext| !ext.is_empty())
                    .map(|ext| {
                        if ext.starts_with('.') {
                            ext.to_ascii_lowercase()
                        } else {
                            format!(".{}", ext.to_ascii_lowercase())
                        }
                    })
                    .collect();
            }
            "logging.level" => self.logging.level = non_empty(key, value)?,
            "logging.max_files" => self.logging.max_files = parse_value(key, value)?,
            _ => return Err(Error::Config(format!("unknown configuration key: {}", key))),
        }

        tracing::debug!(%key, %value, "Configuration value changed");
        Ok(())
    }

    /// Check the settings a chat round trip depends on.
    pub fn validate(&self) -> ValidationReport {
        self.validate_with_key(self.claude.api_key().as_deref())
    }

    fn validate_with_key(&self, api_key: Option<&str>) -> ValidationReport {
        let mut errors = Vec::new();

        if api_key.is_none() {
            errors.push(format!(
                "no Anthropic API key configured (set {} or claude.api_key)",
                API_KEY_ENV
            ));
        }
        if self.claude.max_tokens == 0 {
            errors.push("claude.max_tokens must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.claude.temperature) {
            errors.push("claude.temperature must be between 0 and 1".to_string());
        }
        if self.file.max_file_size == 0 {
            errors.push("file.max_file_size must be at least 1".to_string());
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Effective database file path
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(Self::default_database_path)
    }

    /// Connection options for this configuration.
    ///
    /// Destructive reset is only enabled in the development environment.
    pub fn database_options(&self) -> DatabaseOptions {
        let migrations = match &self.database.migrations_dir {
            Some(dir) => MigrationSource::Directory(dir.clone()),
            None => MigrationSource::Embedded,
        };

        DatabaseOptions::file(self.database_path())
            .with_migrations(migrations)
            .allow_destructive_reset(self.app.environment == Environment::Development)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/parley/config.toml` (~/.config/parley/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("parley").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/parley/` (~/.local/share/parley/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("parley")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/parley/` (~/.local/state/parley/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("parley")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/parley/chat.db` (~/.local/share/parley/chat.db)
    pub fn default_database_path() -> PathBuf {
        Self::data_dir().join("chat.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Location;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.claude.model, "claude-3-haiku-20240307");
        assert_eq!(config.claude.max_tokens, 4096);
        assert_eq!(config.claude.endpoint, "https://api.anthropic.com");
        assert_eq!(config.app.environment, Environment::Production);
        assert_eq!(config.file.max_file_size, 10_485_760);
        assert!(config.file.allowed_file_types.contains(&".md".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[claude]
model = "claude-3-5-sonnet-20241022"
temperature = 0.2

[app]
environment = "development"

[database]
path = "/tmp/parley/test.db"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.claude.model, "claude-3-5-sonnet-20241022");
        assert_eq!(config.claude.temperature, 0.2);
        assert_eq!(config.claude.max_tokens, 4096);
        assert_eq!(config.app.environment, Environment::Development);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/parley/test.db"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_environment_api_key_wins() {
        let mut claude = ClaudeConfig::default();
        assert_eq!(claude.resolve_api_key(None), None);

        claude.api_key = Some("from-file".to_string());
        assert_eq!(claude.resolve_api_key(None).as_deref(), Some("from-file"));
        assert_eq!(
            claude.resolve_api_key(Some("from-env".to_string())).as_deref(),
            Some("from-env")
        );
        // A blank variable does not mask the file value
        assert_eq!(
            claude.resolve_api_key(Some("  ".to_string())).as_deref(),
            Some("from-file")
        );
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.claude.max_tokens = 0;
        config.claude.temperature = 1.5;
        config.file.max_file_size = 0;

        let report = config.validate_with_key(None);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 4);

        let report = Config::default().validate_with_key(Some("sk-test"));
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_save_omits_api_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.claude.api_key = Some("sk-secret".to_string());
        config.claude.model = "custom-model".to_string();
        config.save_to(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("sk-secret"));
        assert!(!written.contains("api_key"));

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.claude.model, "custom-model");
        assert_eq!(reloaded.claude.api_key, None);
    }

    #[test]
    fn test_set_updates_sections() {
        let mut config = Config::default();
        config.set("claude.model", "claude-3-opus-20240229").unwrap();
        config.set("claude.temperature", "0.25").unwrap();
        config.set("app.environment", "Development").unwrap();
        config.set("database.path", "/tmp/parley/other.db").unwrap();
        config.set("file.allowed_file_types", "rs, .TOML,").unwrap();

        assert_eq!(config.claude.model, "claude-3-opus-20240229");
        assert_eq!(config.claude.temperature, 0.25);
        assert_eq!(config.app.environment, Environment::Development);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/parley/other.db"));
        assert_eq!(config.file.allowed_file_types, vec![".rs", ".toml"]);

        // Empty clears an optional path
        config.set("database.path", "").unwrap();
        assert_eq!(config.database.path, None);
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let mut config = Config::default();

        for (key, value) in [
            ("claude.max_tokens", "lots"),
            ("claude.max_tokens", "0"),
            ("claude.temperature", "1.5"),
            ("claude.model", "  "),
            ("app.environment", "staging"),
            ("claude.colour", "blue"),
        ] {
            let err = config.set(key, value).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{key}={value}: {err:?}");
        }

        let err = config.set("claude.api_key", "sk-nope").unwrap_err();
        assert!(err.to_string().contains(API_KEY_ENV));
        assert_eq!(config.claude.api_key, None);

        // Failed sets leave the config untouched
        assert_eq!(config.claude.max_tokens, 4096);
        assert_eq!(config.app.environment, Environment::Production);
    }

    #[test]
    fn test_set_then_save_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.claude.api_key = Some("sk-secret".to_string());
        config.set("logging.level", "debug").unwrap();
        config.set("app.context_file_path", "/work/CONTEXT.md").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.logging.level, "debug");
        assert_eq!(
            reloaded.app.context_file_path,
            Some(PathBuf::from("/work/CONTEXT.md"))
        );
        assert!(!std::fs::read_to_string(&path).unwrap().contains("sk-secret"));
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[claude\nmodel = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_database_options_follow_environment() {
        let mut config = Config::default();
        config.database.path = Some(PathBuf::from("/tmp/chat.db"));

        let options = config.database_options();
        assert_eq!(options.location, Location::File(PathBuf::from("/tmp/chat.db")));
        assert_eq!(options.migrations, MigrationSource::Embedded);
        assert!(!options.allow_destructive_reset);

        config.app.environment = Environment::Development;
        config.database.migrations_dir = Some(PathBuf::from("/tmp/migrations"));
        let options = config.database_options();
        assert!(options.allow_destructive_reset);
        assert_eq!(
            options.migrations,
            MigrationSource::Directory(PathBuf::from("/tmp/migrations"))
        );
    }

    #[test]
    fn test_paths_use_parley_namespace() {
        assert!(Config::config_path().ends_with("parley/config.toml"));
        assert!(Config::default_database_path().ends_with("parley/chat.db"));
        assert!(Config::state_dir().ends_with("parley"));
    }
}
