// crates/server/src/config.rs
//! Environment-driven server configuration.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use tempfile::NamedTempFile;
use thiserror::Error;
use vault_backup_jobs::{PipelineSteps, StepCommand};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_SETUP_SCRIPT: &str = "./setup-rclone.sh";
const DEFAULT_BACKUP_SCRIPT: &str = "./scripts/backup.sh";
const DEFAULT_RCLONE_BINARY: &str = "rclone";
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_CLEANUP_SECS: u64 = 3600;
const DEFAULT_MAX_AGE_DAYS: u64 = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("RCLONE_CONFIG_BASE64 is not valid base64: {0}")]
    RcloneConfigDecode(#[from] base64::DecodeError),

    #[error("Failed to write rclone config: {0}")]
    RcloneConfigWrite(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_token: String,
    /// `None` selects the in-process store.
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub setup_script: PathBuf,
    pub backup_script: PathBuf,
    /// rclone executable checked by the health and version endpoints.
    pub rclone_binary: PathBuf,
    pub rclone_config_base64: Option<String>,
    pub stream_poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub job_max_age: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_token = var("API_TOKEN").ok_or(ConfigError::Missing("API_TOKEN"))?;
        let poll_ms: u64 = parse(&var, "JOB_STREAM_POLL_MS", DEFAULT_POLL_MS)?;
        let cleanup_secs: u64 = parse(&var, "JOB_CLEANUP_INTERVAL_SECS", DEFAULT_CLEANUP_SECS)?;
        let max_age_days: u64 = parse(&var, "JOB_MAX_AGE_DAYS", DEFAULT_MAX_AGE_DAYS)?;
        if poll_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "JOB_STREAM_POLL_MS",
                value: "0".into(),
            });
        }
        if cleanup_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "JOB_CLEANUP_INTERVAL_SECS",
                value: "0".into(),
            });
        }
        let max_age_secs = max_age_days.checked_mul(86_400).ok_or_else(|| ConfigError::Invalid {
            name: "JOB_MAX_AGE_DAYS",
            value: max_age_days.to_string(),
        })?;

        Ok(Self {
            api_token,
            redis_url: var("REDIS_URL"),
            host: var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse(&var, "PORT", DEFAULT_PORT)?,
            setup_script: var("SETUP_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_SCRIPT)),
            backup_script: var("BACKUP_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_SCRIPT)),
            rclone_binary: var("RCLONE_BINARY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RCLONE_BINARY)),
            rclone_config_base64: var("RCLONE_CONFIG_BASE64"),
            stream_poll_interval: Duration::from_millis(poll_ms),
            cleanup_interval: Duration::from_secs(cleanup_secs),
            job_max_age: Duration::from_secs(max_age_secs),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `rclone version`, used to check the tool is installed and working.
    pub fn rclone_version_command(&self) -> StepCommand {
        StepCommand::new(self.rclone_binary.clone()).arg("version")
    }

    /// Setup and backup steps, pointed at `rclone_config` when one was written.
    pub fn pipeline_steps(&self, rclone_config: Option<&Path>) -> PipelineSteps {
        let mut setup = StepCommand::new(self.setup_script.clone());
        let mut backup = StepCommand::new(self.backup_script.clone());
        if let Some(path) = rclone_config {
            let path = path.display().to_string();
            for key in ["RCLONE_CONFIG", "PROJECT_RCLONE_CONFIG_FILE"] {
                setup = setup.env(key, path.as_str());
                backup = backup.env(key, path.as_str());
            }
        }
        PipelineSteps { setup, backup }
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Decode a base64 rclone config into a temp file. The file is removed when
/// the handle drops, so keep it alive for as long as jobs may run.
pub fn write_rclone_config(encoded: &str) -> Result<NamedTempFile, ConfigError> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let mut file = tempfile::Builder::new()
        .prefix("rclone-")
        .suffix(".conf")
        .tempfile()?;
    file.write_all(&decoded)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("API_TOKEN", "secret")]).unwrap();
        assert_eq!(cfg.api_token, "secret");
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.setup_script, PathBuf::from("./setup-rclone.sh"));
        assert_eq!(cfg.backup_script, PathBuf::from("./scripts/backup.sh"));
        assert_eq!(cfg.rclone_version_command().program(), Path::new("rclone"));
        assert_eq!(cfg.stream_poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(cfg.job_max_age, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_missing_token() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("API_TOKEN"))));
        assert!(matches!(
            config(&[("API_TOKEN", "  ")]),
            Err(ConfigError::Missing("API_TOKEN"))
        ));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("API_TOKEN", "t"),
            ("REDIS_URL", "redis://cache:6379/0"),
            ("HOST", "127.0.0.1"),
            ("PORT", "9001"),
            ("JOB_STREAM_POLL_MS", "100"),
            ("JOB_MAX_AGE_DAYS", "1"),
            ("RCLONE_BINARY", "/usr/local/bin/rclone"),
        ])
        .unwrap();
        assert_eq!(cfg.rclone_binary, PathBuf::from("/usr/local/bin/rclone"));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379/0"));
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9001");
        assert_eq!(cfg.stream_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.job_max_age, Duration::from_secs(86_400));
    }

    #[test]
    fn test_invalid_values() {
        match config(&[("API_TOKEN", "t"), ("PORT", "eighty")]) {
            Err(ConfigError::Invalid { name, value }) => {
                assert_eq!(name, "PORT");
                assert_eq!(value, "eighty");
            }
            other => panic!("expected invalid PORT, got {other:?}"),
        }
        assert!(config(&[("API_TOKEN", "t"), ("JOB_STREAM_POLL_MS", "0")]).is_err());
        match config(&[("API_TOKEN", "t"), ("JOB_MAX_AGE_DAYS", "300000000000000")]) {
            Err(ConfigError::Invalid { name, value }) => {
                assert_eq!(name, "JOB_MAX_AGE_DAYS");
                assert_eq!(value, "300000000000000");
            }
            other => panic!("expected invalid JOB_MAX_AGE_DAYS, got {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_steps_carry_rclone_config() {
        let cfg = config(&[("API_TOKEN", "t")]).unwrap();
        let steps = cfg.pipeline_steps(Some(Path::new("/tmp/rclone.conf")));
        assert_eq!(steps.setup.program(), Path::new("./setup-rclone.sh"));
        assert_eq!(steps.backup.program(), Path::new("./scripts/backup.sh"));
        let envs: Vec<(&str, &str)> = steps.backup.envs().collect();
        assert_eq!(
            envs,
            vec![
                ("RCLONE_CONFIG", "/tmp/rclone.conf"),
                ("PROJECT_RCLONE_CONFIG_FILE", "/tmp/rclone.conf"),
            ]
        );
        assert_eq!(cfg.pipeline_steps(None).setup.envs().count(), 0);
    }

    #[test]
    fn test_write_rclone_config() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("[gdrive]\ntype = drive\n");
        let file = write_rclone_config(&encoded).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written, "[gdrive]\ntype = drive\n");
    }

    #[test]
    fn test_write_rclone_config_rejects_garbage() {
        assert!(matches!(
            write_rclone_config("not base64!!"),
            Err(ConfigError::RcloneConfigDecode(_))
        ));
    }
}
