use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rollcall_core::liveness::DEFAULT_MOTION_THRESHOLD;
use rollcall_core::matcher::{MatchPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub match_threshold: Option<f64>,
    pub match_policy: Option<MatchPolicy>,
    pub liveness_threshold: Option<f64>,
    pub attendance_cooldown_secs: Option<u64>,
}

/// Resolved configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    /// Raw 32-byte embedding key, created on first use.
    pub key_path: PathBuf,
    /// Euclidean distance a match must stay strictly below. On unit-length
    /// ArcFace embeddings this is `sqrt(2 - 2·cos)`: the 0.6 default is
    /// cosine 0.82, so deployments usually raise it toward 1.0.
    pub match_threshold: f64,
    pub match_policy: MatchPolicy,
    /// Mean luminance difference two enrollment frames must exceed.
    pub liveness_threshold: f64,
    /// 0 disables the attendance cooldown.
    pub attendance_cooldown_secs: u64,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key} ({value:?}): {message}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        message: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from `explicit` (which must exist) or from the default config
    /// location (which may be absent), then apply the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let (file, source) = match explicit {
            Some(path) => (read_config_file(path)?, Some(path.to_path_buf())),
            None => {
                let path = config_dir(&env).join(CONFIG_FILE_NAME);
                match read_config_file(&path) {
                    Ok(file) => (file, Some(path)),
                    Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                        (ConfigFile::default(), None)
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        Self::resolve(file, source, env)
    }

    pub fn resolve(
        file: ConfigFile,
        source: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = data_dir(&env);

        let config = Self {
            model_dir: env_path(&env, "ROLLCALL_MODEL_DIR")
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: env_path(&env, "ROLLCALL_DB_PATH")
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("rollcall.db")),
            key_path: env_path(&env, "ROLLCALL_KEY_PATH")
                .or(file.key_path)
                .unwrap_or_else(|| data_dir.join("embedding.key")),
            match_threshold: env_parsed(&env, "ROLLCALL_MATCH_THRESHOLD")?
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            match_policy: env_parsed(&env, "ROLLCALL_MATCH_POLICY")?
                .or(file.match_policy)
                .unwrap_or_default(),
            liveness_threshold: env_parsed(&env, "ROLLCALL_LIVENESS_THRESHOLD")?
                .or(file.liveness_threshold)
                .unwrap_or(DEFAULT_MOTION_THRESHOLD),
            attendance_cooldown_secs: env_parsed(&env, "ROLLCALL_ATTENDANCE_COOLDOWN_SECS")?
                .or(file.attendance_cooldown_secs)
                .unwrap_or(0),
            source,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if !self.liveness_threshold.is_finite() || self.liveness_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "liveness_threshold must be a non-negative number, got {}",
                self.liveness_threshold
            )));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("rollcall")
}

fn config_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
        .join("rollcall")
}

fn env_path(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parsed<T>(env: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                key,
                message: e.to_string(),
                value,
            }),
    }
}
