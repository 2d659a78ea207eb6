use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credential::DEFAULT_DESCRIPTION;

/// Environment variable naming the running agent's socket.
pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Key container path.  Defaults to `~/.ssh/id_rsa`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Comment attached to the identity.  Defaults to the container path.
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_description")]
    pub description: String,
    /// Upper bound on the store lookup, including any unlock prompt.
    #[serde(default = "default_credential_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            description: default_description(),
            timeout_secs: default_credential_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent socket.  Overrides `SSH_AUTH_SOCK` when set.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Upper bound on connect + request + response.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    /// Ask the agent to forget the key after this many seconds.
    #[serde(default)]
    pub lifetime_secs: Option<u32>,
    /// Ask the agent to confirm every use of the key.
    #[serde(default)]
    pub confirm: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: default_agent_timeout_secs(),
            lifetime_secs: None,
            confirm: false,
        }
    }
}

fn default_description() -> String {
    DEFAULT_DESCRIPTION.to_string()
}

fn default_credential_timeout_secs() -> u64 {
    60
}

fn default_agent_timeout_secs() -> u64 {
    10
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("resolving {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot determine home directory (HOME is not set)")]
    NoHome,
}

impl Config {
    /// Parse a config file.  A missing file is not an error; defaults are used.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = std::fs::metadata(path)
                && meta.mode() & 0o077 != 0
            {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", meta.mode() & 0o777),
                    "config file is readable by group or others, recommend: chmod 600 {}",
                    path.display()
                );
            }
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The key container path: `override_path`, then `[key] path`, then
    /// `~/.ssh/id_rsa`.  Relative paths are resolved against the working
    /// directory.
    pub fn key_path(&self, override_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = match override_path.or(self.key.path.as_deref()) {
            Some(p) => expand_home(p)?,
            None => home_dir()?.join(".ssh").join("id_rsa"),
        };
        std::path::absolute(&path).map_err(|source| ConfigError::Resolve { path, source })
    }

    /// The agent socket: `[agent] socket`, then a non-empty `SSH_AUTH_SOCK`.
    pub fn agent_socket(&self) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(p) = &self.agent.socket {
            return expand_home(p).map(Some);
        }
        Ok(std::env::var_os(AGENT_SOCKET_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from))
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential.timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }
}

/// `$XDG_CONFIG_HOME/agentload/config.toml`, else `~/.config/agentload/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = match std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home_dir()?.join(".config"),
    };
    Ok(base.join("agentload").join("config.toml"))
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or(ConfigError::NoHome)
}

/// Expand a leading `~` or `$HOME` component.
pub fn expand_home(path: &Path) -> Result<PathBuf, ConfigError> {
    let mut components = path.components();
    match components.next() {
        Some(first) if first.as_os_str() == "~" || first.as_os_str() == "$HOME" => {
            Ok(home_dir()?.join(components.as_path()))
        }
        _ => Ok(path.to_path_buf()),
    }
}
