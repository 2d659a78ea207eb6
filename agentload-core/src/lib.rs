use zeroize::Zeroizing;

pub mod config;
pub mod credential;

pub use config::Config;
pub use credential::{CredentialError, CredentialQuery, CredentialStore, MemoryStore};

/// Crate-wide mutex used by tests that mutate `HOME` / `XDG_CONFIG_HOME`.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// A passphrase fetched from a credential store.
///
/// Held in a zeroizing buffer so the bytes are scrubbed as soon as the value
/// is dropped.  Deliberately not `Clone`: a passphrase is fetched for a single
/// decrypt call and discarded straight after.
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase([redacted])")
    }
}
