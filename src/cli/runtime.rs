use std::env;
use std::fs as stdfs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WaitConfig;

const LOCAL_ENV_PATH: &str = "config/local.env";
const LOCAL_CONFIG_PATH: &str = "config/wait.yaml";

/// Exports `KEY=value` lines from `config/local.env` unless the variable is already set.
pub fn load_local_env_overrides() {
    let path = Path::new(LOCAL_ENV_PATH);
    if !path.exists() {
        return;
    }

    match stdfs::read_to_string(path) {
        Ok(contents) => {
            let applied = apply_env_lines(&contents);
            info!(path = %path.display(), applied, "loaded environment overrides");
        }
        Err(err) => {
            warn!(path = %path.display(), ?err, "failed to read local.env overrides");
        }
    }
}

fn apply_env_lines(contents: &str) -> usize {
    let mut applied = 0;
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = idx + 1, "invalid local.env entry; skipping");
            continue;
        };
        let key = key.trim();
        if key.is_empty() || env::var(key).is_ok() {
            continue;
        }
        env::set_var(key, unescape_value(value.trim()));
        applied += 1;
    }
    applied
}

pub fn init_logging(level: &str, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

pub struct LoadedConfig {
    pub config: WaitConfig,
    pub path: PathBuf,
    pub found: bool,
}

pub async fn load_config(config_path: Option<&PathBuf>) -> Result<LoadedConfig> {
    let config_path = match config_path {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };

    if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let config: WaitConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok(LoadedConfig {
            config,
            path: config_path,
            found: true,
        })
    } else {
        warn!(
            "Config file not found, using defaults: {}",
            config_path.display()
        );
        Ok(LoadedConfig {
            config: WaitConfig::default(),
            path: config_path,
            found: false,
        })
    }
}

/// `./config/wait.yaml` when present, otherwise the per-user config directory.
fn default_config_path() -> Result<PathBuf> {
    let local_config = PathBuf::from(LOCAL_CONFIG_PATH);
    if local_config.exists() {
        return Ok(local_config);
    }
    let mut path = dirs::config_dir().context("Failed to get config directory")?;
    path.push("soulbrowser");
    path.push("wait.yaml");
    Ok(path)
}

/// Environment variables that take precedence over the file.
pub fn apply_runtime_overrides(config: &mut WaitConfig) {
    if let Ok(url) = env::var("SOULBROWSER_WS_URL") {
        let url = url.trim();
        if !url.is_empty() {
            info!("Using browser websocket from SOULBROWSER_WS_URL");
            config.cdp.websocket_url = Some(url.to_string());
        }
    }
}

fn unescape_value(value: &str) -> String {
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        let inner = &value[1..value.len() - 1];
        inner
            .replace("\\\"", "\"")
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\t", "\t")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use soulbrowser_wait_task::Polling;
    use std::io::Write;

    #[tokio::test]
    async fn reads_an_explicit_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wait:\n  polling: mutation\n  timeout_ms: 500").unwrap();

        let loaded = load_config(Some(&file.path().to_path_buf())).await.unwrap();
        assert!(loaded.found);
        assert_eq!(loaded.config.wait.polling, Polling::Mutation);
        assert_eq!(loaded.config.wait.timeout_ms, 500);
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let loaded = load_config(Some(&path)).await.unwrap();
        assert!(!loaded.found);
        assert_eq!(loaded.path, path);
        assert_eq!(loaded.config, WaitConfig::default());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wait: [not, a, map]").unwrap();
        assert!(load_config(Some(&file.path().to_path_buf())).await.is_err());
    }

    #[test]
    #[serial]
    fn env_lines_do_not_clobber_existing_variables() {
        env::set_var("SOULWAIT_TEST_KEEP", "original");
        env::remove_var("SOULWAIT_TEST_NEW");

        let applied = apply_env_lines(
            "# comment\nSOULWAIT_TEST_KEEP=changed\nexport SOULWAIT_TEST_NEW=\"a\\tb\"\nbroken line\n",
        );

        assert_eq!(applied, 1);
        assert_eq!(env::var("SOULWAIT_TEST_KEEP").unwrap(), "original");
        assert_eq!(env::var("SOULWAIT_TEST_NEW").unwrap(), "a\tb");
        env::remove_var("SOULWAIT_TEST_KEEP");
        env::remove_var("SOULWAIT_TEST_NEW");
    }

    #[test]
    #[serial]
    fn websocket_override_replaces_file_value() {
        env::set_var("SOULBROWSER_WS_URL", "ws://127.0.0.1:9222/devtools/browser/x");
        let mut config = WaitConfig::default();
        apply_runtime_overrides(&mut config);
        env::remove_var("SOULBROWSER_WS_URL");

        assert_eq!(
            config.cdp.websocket_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/x")
        );
    }
}
