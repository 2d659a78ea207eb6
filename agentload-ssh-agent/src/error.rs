//! Error types for the container codec, key parser and agent client.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// The byte sequence is not a recognisable key container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container is not text")]
    NotText,

    #[error("no -----BEGIN ...----- line found")]
    MissingBegin,

    #[error("no -----END {label}----- line found")]
    MissingEnd { label: String },

    #[error("END label {end:?} does not match BEGIN label {begin:?}")]
    MismatchedEnd { begin: String, end: String },

    #[error("container body is empty")]
    EmptyBody,

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Proc-Type declares encryption but DEK-Info is missing")]
    MissingDekInfo,

    #[error("malformed DEK-Info header: {0}")]
    MalformedDekInfo(String),

    #[error("unsupported cipher {0:?}")]
    UnsupportedCipher(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("container is not encrypted")]
    NotEncrypted,

    #[error("incorrect passphrase")]
    IncorrectPassphrase,

    #[error("corrupt ciphertext: {0}")]
    Corrupt(String),

    /// Decryption produced bytes that passed the cipher's checks but do not
    /// parse as a key.  Reported as a decryption failure because a wrong
    /// passphrase is by far the likeliest cause.
    #[error("decrypted data is not a valid key (incorrect passphrase?)")]
    Unparseable(#[source] KeyError),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported key container label {0:?}")]
    UnsupportedLabel(String),

    #[error("malformed PKCS#1 RSA private key: {0}")]
    Pkcs1(#[from] rsa::pkcs1::Error),

    #[error("malformed PKCS#8 private key: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("RSA keys with {0} primes are not supported")]
    MultiPrime(usize),

    #[error("invalid key: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no agent socket configured (SSH_AUTH_SOCK is not set)")]
    NotConfigured,

    #[error("connecting to agent at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("agent I/O: {0}")]
    Io(#[from] io::Error),

    #[error("malformed agent response: {0}")]
    Protocol(String),

    #[error("agent refused the request{}", reason_suffix(.reason))]
    Rejected { reason: Option<String> },

    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_includes_reason_when_present() {
        let bare = AgentError::Rejected { reason: None };
        assert_eq!(bare.to_string(), "agent refused the request");

        let with = AgentError::Rejected {
            reason: Some("key type not supported".to_string()),
        };
        assert_eq!(
            with.to_string(),
            "agent refused the request: key type not supported"
        );
    }
}
