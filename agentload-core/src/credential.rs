//! Credential store abstraction.
//!
//! A [`CredentialStore`] answers one question: which passphrase is stored
//! for this identifier?  Lookups are read-only and must match **exactly one**
//! entry.  Zero matches is [`CredentialError::NotFound`]; several matches is
//! [`CredentialError::Ambiguous`], since there is no sound way to pick one.
//!
//! Two implementations exist:
//! - `agentload_secret_service::SecretServiceStore` talks to the desktop
//!   keyring over D-Bus.
//! - [`MemoryStore`] is a deterministic in-process store for tests.
//!
//! The pipeline receives the store as `&dyn CredentialStore`, so the choice is
//! made by the caller and never by a global.

use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::Passphrase;

/// Description attribute that marks passphrase entries written for SSH keys.
pub const DEFAULT_DESCRIPTION: &str = "ssh key passphrase";

/// A lookup against the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialQuery {
    /// Value of the `service` attribute.  The key container path.
    pub service: String,
    /// Value of the `description` attribute separating our entries from
    /// unrelated generic passwords.
    pub description: String,
}

impl CredentialQuery {
    pub fn new(service: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            description: description.into(),
        }
    }

    /// Query with the default description tag.
    pub fn for_service(service: impl Into<String>) -> Self {
        Self::new(service, DEFAULT_DESCRIPTION)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("no passphrase stored for {service}")]
    NotFound { service: String },
    #[error("{count} passphrases stored for {service}, expected exactly one")]
    Ambiguous { service: String, count: usize },
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Short name used in log lines (e.g. `"secret-service"`).
    fn name(&self) -> &str;

    /// Return the single passphrase matching `query`.
    ///
    /// Implementations must not modify the store.
    async fn resolve(&self, query: &CredentialQuery) -> Result<Passphrase, CredentialError>;
}

/// Apply the exactly-one rule to a list of matches.
pub fn exactly_one<T>(mut matches: Vec<T>, query: &CredentialQuery) -> Result<T, CredentialError> {
    match matches.len() {
        0 => Err(CredentialError::NotFound {
            service: query.service.clone(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(CredentialError::Ambiguous {
            service: query.service.clone(),
            count,
        }),
    }
}

struct MemoryEntry {
    service: String,
    description: String,
    secret: Passphrase,
}

/// In-memory credential store.
///
/// Entries are never de-duplicated, so inserting the same `(service,
/// description)` twice produces an ambiguous lookup exactly like a keyring
/// holding two matching items would.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<MemoryEntry>>,
    lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn insert(&self, service: &str, description: &str, secret: &[u8]) {
        // The entry list stays consistent even if a holder panicked.
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(MemoryEntry {
            service: service.to_string(),
            description: description.to_string(),
            secret: Passphrase::new(secret.to_vec()),
        });
    }

    /// Builder-style [`insert`](Self::insert) using the default description.
    pub fn with_passphrase(self, service: &str, secret: &str) -> Self {
        self.insert(service, DEFAULT_DESCRIPTION, secret.as_bytes());
        self
    }

    /// Number of `resolve` calls made so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("MemoryStore")
            .field("entries", &len)
            .field("lookups", &self.lookups())
            .finish()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve(&self, query: &CredentialQuery) -> Result<Passphrase, CredentialError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let matches: Vec<Passphrase> = entries
            .iter()
            .filter(|e| e.service == query.service && e.description == query.description)
            .map(|e| Passphrase::new(e.secret.as_bytes().to_vec()))
            .collect();

        debug!(service = %query.service, matches = matches.len(), "memory store: lookup");
        exactly_one(matches, query)
    }
}
