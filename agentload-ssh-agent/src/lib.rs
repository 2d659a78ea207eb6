//! Key containers and the OpenSSH agent client.
//!
//! Everything needed to get from an on-disk PEM file to a registered agent
//! identity, minus the passphrase lookup:
//!
//! ```text
//! bytes ──decode──► EncodedContainer ──decrypt──► DER ──parse──► KeyMaterial
//!                                                                    │
//!                               AgentClient ◄──to_identity── AgentIdentity
//! ```
//!
//! Only the legacy OpenSSL encryption (`Proc-Type` / `DEK-Info` headers) is
//! understood.  Only RSA keys are parsed.

pub mod cipher;
pub mod client;
pub mod container;
pub mod error;
pub mod key;
pub mod proto;

pub use cipher::LegacyCipher;
pub use client::AgentClient;
pub use container::{EncodedContainer, Encryption};
pub use error::{AgentError, ContainerError, DecryptError, KeyError};
pub use key::KeyMaterial;
pub use proto::{AgentIdentity, Constraint};
