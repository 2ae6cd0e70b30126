//! Cohort PKI — certificate minting, verification, and rotating sources.
//!
//! Provides the building blocks every TLS listener and dialer in a
//! cohort node consumes: ECDSA P-256 node keys, CA operations that mint
//! cohort-signed leaf certificates (with the node's logical name encoded
//! as a `cohort:<name>` URI SAN), chain verification against a supplied
//! root set, pluggable expiry policies, and composable certificate
//! sources (filesystem, self-signed, authority-derived, cached, sets).

pub mod authority;
pub mod ca;
pub mod cached;
pub mod error;
pub mod expiry;
pub mod keys;
pub mod pemchain;
pub mod source;
pub mod verify;

pub use error::PkiError;
pub use source::{CertSource, TlsIdentity};

/// URI SAN scheme carrying a node's logical name inside its certificate.
pub const NODE_NAME_URI_SCHEME: &str = "cohort";

/// Encode a logical node name as the URI SAN embedded in its certificates.
pub fn node_name_uri(name: &str) -> String {
    format!("{NODE_NAME_URI_SCHEME}:{name}")
}
