//! Certificate source backed by a signing authority.
//!
//! `AuthoritySource` turns any source whose identity can sign (a CA
//! identity) into a source of leaf identities for this node: each call
//! takes the authority's current identity and mints a certificate for
//! the configured name and SANs.

use std::sync::Arc;

use crate::ca::{self, SigningAuthority};
use crate::error::PkiError;
use crate::keys::NodeKeyPair;
use crate::source::{CertSource, TlsIdentity};

pub struct AuthoritySource {
    authority: Arc<dyn CertSource>,
    name: String,
    sans: Vec<String>,
    key: Arc<NodeKeyPair>,
}

impl AuthoritySource {
    pub fn new(
        authority: Arc<dyn CertSource>,
        name: impl Into<String>,
        sans: Vec<String>,
        key: Arc<NodeKeyPair>,
    ) -> Self {
        Self {
            authority,
            name: name.into(),
            sans,
            key,
        }
    }
}

impl CertSource for AuthoritySource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let ca_identity = self.authority.certs()?;
        let authority = SigningAuthority::from_identity(&ca_identity)?;
        ca::create_signed_identity(&authority, &self.name, &self.sans, &self.key)?.checked()
    }
}
