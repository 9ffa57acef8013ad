//! Data directory and engine configuration loader.
//!
//! The data directory is `HOOKFLOW_DATA_DIR`, or `~/.hookflow/` when unset. It
//! holds `hookflow.toml` and, unless `database_url` says otherwise, the SQLite
//! database. A missing config file yields the defaults; a file that cannot be
//! read, parsed or validated is an error.

use std::path::{Path, PathBuf};

use hookflow_types::config::EngineConfig;
use hookflow_types::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "hookflow.toml";
pub const DATABASE_FILE_NAME: &str = "hookflow.db";
pub const DATA_DIR_ENV: &str = "HOOKFLOW_DATA_DIR";

/// Resolve the data directory from the environment.
pub fn default_data_dir() -> PathBuf {
    resolve_data_dir(
        std::env::var(DATA_DIR_ENV).ok(),
        std::env::var("HOME").ok(),
    )
}

fn resolve_data_dir(explicit: Option<String>, home: Option<String>) -> PathBuf {
    match explicit.filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(home.unwrap_or_else(|| ".".to_string())).join(".hookflow"),
    }
}

/// The configured `database_url`, or a file in the data directory created on
/// first use.
pub fn database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config.database_url.clone().unwrap_or_else(|| {
        format!(
            "sqlite://{}?mode=rwc",
            data_dir.join(DATABASE_FILE_NAME).display()
        )
    })
}

/// Load and validate engine configuration from `{data_dir}/hookflow.toml`.
pub async fn load_engine_config(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "No {CONFIG_FILE_NAME} found at {}, using defaults",
                config_path.display()
            );
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            return Err(ConfigError::Io(format!(
                "{}: {err}",
                config_path.display()
            )));
        }
    };

    let config = parse_engine_config(&content)?;
    tracing::debug!(path = %config_path.display(), "Loaded engine configuration");
    Ok(config)
}

/// Parse and validate a TOML document.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookflow_types::config::PersistenceMode;
    use tempfile::TempDir;

    #[test]
    fn data_dir_prefers_environment_over_home() {
        assert_eq!(
            resolve_data_dir(Some("/srv/hookflow".into()), Some("/home/ops".into())),
            PathBuf::from("/srv/hookflow")
        );
        assert_eq!(
            resolve_data_dir(Some("  ".into()), Some("/home/ops".into())),
            PathBuf::from("/home/ops/.hookflow")
        );
        assert_eq!(resolve_data_dir(None, None), PathBuf::from("./.hookflow"));
    }

    #[test]
    fn database_url_defaults_into_data_dir() {
        let mut config = EngineConfig::default();
        let url = database_url(&config, Path::new("/srv/hookflow"));
        assert_eq!(url, "sqlite:///srv/hookflow/hookflow.db?mode=rwc");

        config.database_url = Some("sqlite::memory:".to_string());
        assert_eq!(database_url(&config, Path::new("/srv/hookflow")), "sqlite::memory:");
    }

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await.unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
persistence = "disabled"

[retry]
max_attempts = 5

[dead_letter]
retention_days = 7
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await.unwrap();
        assert_eq!(config.persistence, PersistenceMode::Disabled);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_secs, 1);
        assert_eq!(config.dead_letter.retention_days, Some(7));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_is_an_error() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let err = load_engine_config(tmp.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn load_engine_config_rejects_invalid_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[retry]\nmax_attempts = 0\n",
        )
        .await
        .unwrap();

        let err = load_engine_config(tmp.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.max_attempts", .. }));
    }

    #[test]
    fn parse_rejects_timeout_longer_than_lease() {
        let err = parse_engine_config(
            "execution_timeout_secs = 600\n\n[lock]\nlease_ttl_secs = 300\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "execution_timeout_secs", .. }));

        let ok = parse_engine_config("persistence = \"disabled\"\nexecution_timeout_secs = 0\n");
        assert!(ok.is_ok());
    }

    #[test]
    fn parse_rejects_unknown_persistence_mode() {
        let err = parse_engine_config("persistence = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
