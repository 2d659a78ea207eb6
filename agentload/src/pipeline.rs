//! The decrypt → parse → register pipeline.
//!
//! One [`Pipeline::run`] call moves a single key container through
//!
//! ```text
//! Idle ─► Decoded ─► PlaintextReady ─► Parsed ─► Registered ─► Done
//!   └────────┴────────────┴──────────────┴──► Failed(kind)
//! ```
//!
//! Nothing is retried.  The first failure ends the run and is returned as a
//! [`LoadError`] carrying the last stage reached and the identifier involved.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentload_core::credential::DEFAULT_DESCRIPTION;
use agentload_core::{CredentialError, CredentialQuery, CredentialStore};
use agentload_ssh_agent::{
    AgentClient, AgentError, Constraint, ContainerError, DecryptError, EncodedContainer, KeyError,
    KeyMaterial, key,
};
use tracing::debug;
use zeroize::Zeroizing;

const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline states.  `Failed` is represented by the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Decoded,
    PlaintextReady,
    Parsed,
    Registered,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Decoded => "decoded",
            Self::PlaintextReady => "plaintext-ready",
            Self::Parsed => "parsed",
            Self::Registered => "registered",
            Self::Done => "done",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    Format,
    CredentialLookup,
    Decryption,
    Parse,
    Connection,
    Protocol,
    AgentRejection,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io => "IOError",
            Self::Format => "FormatError",
            Self::CredentialLookup => "CredentialLookupError",
            Self::Decryption => "DecryptionError",
            Self::Parse => "ParseError",
            Self::Connection => "ConnectionError",
            Self::Protocol => "ProtocolError",
            Self::AgentRejection => "AgentRejection",
            Self::Timeout => "Timeout",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: ContainerError,
    },

    #[error("passphrase lookup for {identifier}: {source}")]
    Credential {
        identifier: String,
        #[source]
        source: CredentialError,
    },

    #[error("decrypting {}: {source}", .path.display())]
    Decryption {
        path: PathBuf,
        stage: Stage,
        #[source]
        source: DecryptError,
    },

    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: KeyError,
    },

    #[error("{source}")]
    Connection {
        socket: Option<PathBuf>,
        #[source]
        source: AgentError,
    },

    #[error("agent at {}: {source}", .socket.display())]
    Protocol {
        socket: PathBuf,
        #[source]
        source: AgentError,
    },

    #[error("agent at {}: {source}", .socket.display())]
    Rejected {
        socket: PathBuf,
        #[source]
        source: AgentError,
    },

    #[error("{operation} for {identifier} timed out after {after:?}")]
    Timeout {
        stage: Stage,
        operation: &'static str,
        identifier: String,
        after: Duration,
    },
}

impl LoadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Io { .. } => FailureKind::Io,
            Self::Format { .. } => FailureKind::Format,
            Self::Credential { .. } => FailureKind::CredentialLookup,
            Self::Decryption { .. } => FailureKind::Decryption,
            Self::Parse { .. } => FailureKind::Parse,
            Self::Connection { .. } => FailureKind::Connection,
            Self::Protocol { .. } => FailureKind::Protocol,
            Self::Rejected { .. } => FailureKind::AgentRejection,
            Self::Timeout { .. } => FailureKind::Timeout,
        }
    }

    /// Container path, credential identifier or agent socket involved.
    pub fn identifier(&self) -> Option<String> {
        match self {
            Self::Io { path, .. }
            | Self::Format { path, .. }
            | Self::Decryption { path, .. }
            | Self::Parse { path, .. } => Some(path.display().to_string()),
            Self::Credential { identifier, .. } | Self::Timeout { identifier, .. } => {
                Some(identifier.clone())
            }
            Self::Connection { socket, .. } => socket.as_ref().map(|s| s.display().to_string()),
            Self::Protocol { socket, .. } | Self::Rejected { socket, .. } => {
                Some(socket.display().to_string())
            }
        }
    }

    /// Last stage the pipeline reached before failing.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Io { .. } | Self::Format { .. } => Stage::Idle,
            Self::Credential { .. } => Stage::Decoded,
            Self::Decryption { stage, .. } | Self::Timeout { stage, .. } => *stage,
            Self::Parse { .. } => Stage::PlaintextReady,
            Self::Connection { .. } | Self::Protocol { .. } | Self::Rejected { .. } => {
                Stage::Parsed
            }
        }
    }
}

/// Everything one run needs.  Built by the caller; the pipeline reads no
/// environment or configuration of its own.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub key_path: PathBuf,
    /// Agent-side comment.  Defaults to the key path.
    pub comment: Option<String>,
    pub description: String,
    pub credential_timeout: Duration,
    pub agent_socket: Option<PathBuf>,
    pub agent_timeout: Duration,
    pub constraints: Vec<Constraint>,
}

impl LoadRequest {
    /// Request with the default description and timeouts.
    pub fn new(key_path: impl Into<PathBuf>, agent_socket: Option<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            comment: None,
            description: DEFAULT_DESCRIPTION.to_string(),
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
            agent_socket,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            constraints: Vec::new(),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded {
    pub key_path: PathBuf,
    pub fingerprint: String,
}

pub struct Pipeline<'a> {
    store: &'a dyn CredentialStore,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a dyn CredentialStore) -> Self {
        Self { store }
    }

    pub async fn run(&self, req: &LoadRequest) -> Result<Loaded, LoadError> {
        // Also the keyring service name.
        let key_path = std::path::absolute(&req.key_path).map_err(|source| LoadError::Io {
            path: req.key_path.clone(),
            source,
        })?;
        let path = key_path.as_path();
        let identifier = path.to_string_lossy().into_owned();

        // Idle → Decoded
        let raw = Zeroizing::new(tokio::fs::read(path).await.map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?);
        let container = EncodedContainer::decode(&raw).map_err(|source| LoadError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        drop(raw);
        debug!(
            stage = %Stage::Decoded,
            path = %path.display(),
            label = container.label(),
            encrypted = container.is_encrypted(),
            "container decoded"
        );

        // Decoded → PlaintextReady
        let plaintext = if container.is_encrypted() {
            self.decrypt(&container, req, path, &identifier).await?
        } else {
            Zeroizing::new(container.body().to_vec())
        };
        debug!(stage = %Stage::PlaintextReady, "plaintext ready");

        // PlaintextReady → Parsed
        let material = key::parse_labeled(container.label(), &plaintext)
            .map_err(|e| parse_failure(path, container.is_encrypted(), e))?;
        drop(plaintext);
        let fingerprint = material.fingerprint().map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(stage = %Stage::Parsed, fingerprint = %fingerprint, "parsed {material:?}");

        // Parsed → Registered
        self.register(&material, req, path, &identifier).await?;
        drop(material);
        debug!(stage = %Stage::Registered, "agent accepted identity");

        debug!(stage = %Stage::Done, path = %path.display(), "done");
        Ok(Loaded {
            key_path: path.to_path_buf(),
            fingerprint,
        })
    }

    async fn decrypt(
        &self,
        container: &EncodedContainer,
        req: &LoadRequest,
        path: &Path,
        identifier: &str,
    ) -> Result<Zeroizing<Vec<u8>>, LoadError> {
        let query = CredentialQuery::new(identifier, req.description.as_str());
        debug!(store = self.store.name(), service = %query.service, "resolving passphrase");

        let passphrase = tokio::time::timeout(req.credential_timeout, self.store.resolve(&query))
            .await
            .map_err(|_| LoadError::Timeout {
                stage: Stage::Decoded,
                operation: "passphrase lookup",
                identifier: identifier.to_string(),
                after: req.credential_timeout,
            })?
            .map_err(|source| LoadError::Credential {
                identifier: identifier.to_string(),
                source,
            })?;

        // The passphrase is dropped (and zeroed) when this returns.
        container
            .decrypt(&passphrase)
            .map_err(|source| LoadError::Decryption {
                path: path.to_path_buf(),
                stage: Stage::Decoded,
                source,
            })
    }

    async fn register(
        &self,
        material: &KeyMaterial,
        req: &LoadRequest,
        path: &Path,
        identifier: &str,
    ) -> Result<(), LoadError> {
        let client = AgentClient::from_socket(req.agent_socket.clone(), req.agent_timeout)
            .map_err(|source| LoadError::Connection {
                socket: None,
                source,
            })?;

        let comment = req.comment.as_deref().unwrap_or(identifier);
        let identity = material
            .to_identity(comment, req.constraints.clone())
            .map_err(|source| LoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        client
            .add_identity(&identity)
            .await
            .map_err(|e| agent_failure(client.socket(), e))
    }
}

/// A parse failure after a successful decrypt most likely means the
/// passphrase was wrong, unless the container label itself is unsupported.
fn parse_failure(path: &Path, encrypted: bool, err: KeyError) -> LoadError {
    if encrypted && !matches!(err, KeyError::UnsupportedLabel(_)) {
        LoadError::Decryption {
            path: path.to_path_buf(),
            stage: Stage::PlaintextReady,
            source: DecryptError::Unparseable(err),
        }
    } else {
        LoadError::Parse {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

fn agent_failure(socket: &Path, err: AgentError) -> LoadError {
    match err {
        AgentError::Timeout(after) => LoadError::Timeout {
            stage: Stage::Parsed,
            operation: "agent exchange",
            identifier: socket.display().to_string(),
            after,
        },
        AgentError::Protocol(_) => LoadError::Protocol {
            socket: socket.to_path_buf(),
            source: err,
        },
        AgentError::Rejected { .. } => LoadError::Rejected {
            socket: socket.to_path_buf(),
            source: err,
        },
        AgentError::NotConfigured | AgentError::Connect { .. } | AgentError::Io(_) => {
            LoadError::Connection {
                socket: Some(socket.to_path_buf()),
                source: err,
            }
        }
    }
}
