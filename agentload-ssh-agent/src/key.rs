//! Private key parsing.
//!
//! Turns decrypted DER into [`KeyMaterial`]: the field set needed to re-create
//! the private operation inside the agent and to name the public half.
//! Only RSA is supported; the container label selects PKCS#1
//! (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use ssh_key::public::{KeyData, RsaPublicKey};
use ssh_key::{HashAlg, Mpint};
use zeroize::Zeroizing;

use crate::error::KeyError;
use crate::proto::{AgentIdentity, Constraint, KeyField};

pub const LABEL_PKCS1: &str = "RSA PRIVATE KEY";
pub const LABEL_PKCS8: &str = "PRIVATE KEY";

/// Parsed private key.  Transient: lives only between parse and registration.
pub enum KeyMaterial {
    Rsa(RsaPrivateKey),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(key) => f
                .debug_struct("KeyMaterial::Rsa")
                .field("bits", &(key.size() * 8))
                .field("private", &"[redacted]")
                .finish(),
        }
    }
}

/// Parse a PKCS#1 `RSAPrivateKey`.
pub fn parse(plaintext: &[u8]) -> Result<KeyMaterial, KeyError> {
    let key = RsaPrivateKey::from_pkcs1_der(plaintext)?;
    KeyMaterial::from_rsa(key)
}

/// Parse according to the container label.
pub fn parse_labeled(label: &str, plaintext: &[u8]) -> Result<KeyMaterial, KeyError> {
    match label {
        LABEL_PKCS1 => parse(plaintext),
        LABEL_PKCS8 => {
            let key = RsaPrivateKey::from_pkcs8_der(plaintext)?;
            KeyMaterial::from_rsa(key)
        }
        other => Err(KeyError::UnsupportedLabel(other.to_string())),
    }
}

impl KeyMaterial {
    fn from_rsa(key: RsaPrivateKey) -> Result<Self, KeyError> {
        // The agent wire format carries exactly p and q.
        if key.primes().len() != 2 {
            return Err(KeyError::MultiPrime(key.primes().len()));
        }
        Ok(Self::Rsa(key))
    }

    /// SSH key type name.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "ssh-rsa",
        }
    }

    /// OpenSSH public key data for the public half.
    pub fn public_key_data(&self) -> Result<KeyData, KeyError> {
        match self {
            Self::Rsa(key) => {
                let e = Mpint::from_positive_bytes(&key.e().to_bytes_be())
                    .map_err(|e| KeyError::Invalid(format!("public exponent: {e}")))?;
                let n = Mpint::from_positive_bytes(&key.n().to_bytes_be())
                    .map_err(|e| KeyError::Invalid(format!("modulus: {e}")))?;
                Ok(KeyData::Rsa(RsaPublicKey { e, n }))
            }
        }
    }

    /// SHA-256 fingerprint in OpenSSH notation (`SHA256:...`).
    pub fn fingerprint(&self) -> Result<String, KeyError> {
        Ok(self
            .public_key_data()?
            .fingerprint(HashAlg::Sha256)
            .to_string())
    }

    /// Build the add-identity request body for this key.
    pub fn to_identity(
        &self,
        comment: &str,
        constraints: Vec<Constraint>,
    ) -> Result<AgentIdentity, KeyError> {
        match self {
            Self::Rsa(key) => {
                let [p, q] = key.primes() else {
                    return Err(KeyError::MultiPrime(key.primes().len()));
                };
                let iqmp = key
                    .crt_coefficient()
                    .ok_or_else(|| KeyError::Invalid("q has no inverse mod p".to_string()))?;

                // ssh-agent order: n, e, d, iqmp, p, q
                let fields = [key.n(), key.e(), key.d(), &iqmp, p, q]
                    .into_iter()
                    .map(|v| KeyField::Mpint(Zeroizing::new(v.to_bytes_be())))
                    .collect();

                Ok(AgentIdentity {
                    key_type: self.algorithm().to_string(),
                    fields,
                    comment: comment.to_string(),
                    constraints,
                })
            }
        }
    }
}
