use nix::sys::signal::Signal;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level settings, optionally loaded from a TOML file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct UpgradeConfig {
    pub supervisor: SupervisorConfig,
    pub channel: ChannelConfig,
    pub flake: FlakeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Sleep between poll cycles of a running command.
    pub poll_interval_ms: u64,
    /// Wait after SIGTERM before SIGKILL.
    pub term_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub liveness_token: String,
    pub liveness_attempts: u32,
    pub liveness_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FlakeConfig {
    pub default_dir: PathBuf,
    /// Diff command; the two closures are appended.
    pub diff_command: Vec<String>,
}

// --- Default implementations ---

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            term_grace_secs: 5,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            liveness_token: "PONG".to_string(),
            liveness_attempts: 100,
            liveness_interval_ms: 10,
        }
    }
}

impl Default for FlakeConfig {
    fn default() -> Self {
        Self {
            default_dir: PathBuf::from("/etc/nixos/"),
            diff_command: vec![
                "nvd".to_string(),
                "--color=always".to_string(),
                "diff".to_string(),
            ],
        }
    }
}

/// Errors loading settings or the launch environment.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        path: PathBuf,
        reason: String,
    },
    MissingEnv {
        name: &'static str,
    },
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
            ConfigError::Invalid { path, reason } => {
                write!(f, "invalid config {}: {reason}", path.display())
            }
            ConfigError::MissingEnv { name } => {
                write!(f, "environment variable {name} is not set")
            }
            ConfigError::InvalidEnv {
                name,
                value,
                reason,
            } => write!(f, "environment variable {name}={value:?}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl UpgradeConfig {
    /// Load settings from `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if self.supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms must be positive"));
        }
        if self.channel.liveness_attempts == 0 {
            return Err(invalid("channel.liveness_attempts must be positive"));
        }
        if self.channel.liveness_token.is_empty() {
            return Err(invalid("channel.liveness_token must not be empty"));
        }
        if self.flake.diff_command.is_empty() {
            return Err(invalid("flake.diff_command must not be empty"));
        }
        Ok(())
    }
}

/// Program name exported by the launcher.
pub const NAME_ENV: &str = "NAME";

/// Values handed to us by the launcher that also started the privileged
/// worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    /// Program name for messages and the commit header.
    pub name: String,
    /// Descriptor we write requests to (`PY_SH_FD`).
    pub request_fd: i32,
    /// Descriptor we read results from (`SH_PY_FD`).
    pub result_fd: i32,
    /// Descriptor the commit message is written to.
    pub commit_msg_fd: i32,
    /// Request field separator.
    pub separator: char,
    /// Staging copy of the flake the worker builds from.
    pub tmp_dir: PathBuf,
    /// Signals that mean "stop".
    pub term_signals: Vec<Signal>,
}

impl LaunchEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).ok_or(ConfigError::MissingEnv { name });
        let invalid = |name: &'static str, value: &str, reason: String| ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
            reason,
        };
        let fd = |name: &'static str| -> Result<i32, ConfigError> {
            let value = get(name)?;
            match value.trim().parse::<i32>() {
                Ok(n) if n >= 0 => Ok(n),
                Ok(_) => Err(invalid(name, &value, "descriptor must not be negative".into())),
                Err(e) => Err(invalid(name, &value, e.to_string())),
            }
        };

        let ifs = get("CMD_IFS")?;
        let mut chars = ifs.chars();
        let separator = match (chars.next(), chars.next()) {
            (Some(c), None) if c != '\n' => c,
            _ => {
                return Err(invalid(
                    "CMD_IFS",
                    &ifs,
                    "must be a single character other than newline".into(),
                ))
            }
        };

        let sigs = get("TERM_CORE_SIGS")?;
        let term_signals = sigs
            .split_whitespace()
            .map(|s| {
                s.parse::<i32>()
                    .map_err(|e| e.to_string())
                    .and_then(|n| Signal::try_from(n).map_err(|e| e.to_string()))
                    .map_err(|reason| invalid("TERM_CORE_SIGS", &sigs, reason))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: get(NAME_ENV)?,
            request_fd: fd("PY_SH_FD")?,
            result_fd: fd("SH_PY_FD")?,
            commit_msg_fd: fd("COMMIT_MSG_W_FD")?,
            separator,
            tmp_dir: PathBuf::from(get("TMP_DIR")?),
            term_signals,
        })
    }
}
