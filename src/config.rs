//! Configuration loader and validator for the posting bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Empty means `sqlite://{data_dir}/postbot.db`.
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_latest_limit")]
    pub latest_posts_limit: u32,
    #[serde(default = "default_archived_limit")]
    pub archived_posts_limit: u32,
    #[serde(default = "default_inactive_days")]
    pub inactive_channel_days: u32,
}

fn default_latest_limit() -> u32 {
    10
}

fn default_archived_limit() -> u32 {
    50
}

fn default_inactive_days() -> u32 {
    30
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Users treated as administrators regardless of stored roles.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` from the environment wins over the file.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.file_database_url())
    }

    fn file_database_url(&self) -> String {
        if self.app.database_url.trim().is_empty() {
            format!(
                "sqlite://{}/postbot.db",
                self.app.data_dir.trim_end_matches('/')
            )
        } else {
            self.app.database_url.clone()
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.latest_posts_limit == 0 {
        return Err(ConfigError::Invalid("app.latest_posts_limit must be > 0"));
    }
    if cfg.app.archived_posts_limit == 0 {
        return Err(ConfigError::Invalid("app.archived_posts_limit must be > 0"));
    }
    if cfg.app.inactive_channel_days == 0 {
        return Err(ConfigError::Invalid("app.inactive_channel_days must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.admin_ids.iter().any(|id| *id <= 0) {
        return Err(ConfigError::Invalid("telegram.admin_ids must be positive"));
    }

    Ok(())
}

/// Example YAML with every key spelled out.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  database_url: ""
  latest_posts_limit: 10
  archived_posts_limit: 50
  inactive_channel_days: 30

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  admin_ids:
    - 123456789
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.latest_posts_limit, 10);
        assert_eq!(cfg.file_database_url(), "sqlite://./data/postbot.db");
    }

    #[test]
    fn limits_default_when_omitted() {
        let yaml = "app:\n  data_dir: /tmp/x\ntelegram:\n  bot_token: t\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.archived_posts_limit, 50);
        assert_eq!(cfg.app.inactive_channel_days, 30);
        assert!(cfg.telegram.admin_ids.is_empty());
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_limits_and_admins() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.latest_posts_limit = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.inactive_channel_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.admin_ids.push(-5);
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("admin_ids")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn explicit_database_url_is_kept() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.database_url = "sqlite::memory:".into();
        assert_eq!(cfg.file_database_url(), "sqlite::memory:");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.telegram.admin_ids, vec![123456789]);
    }
}
