//! ECDSA P-256 node key handling.
//!
//! Every cohort node holds one long-lived P-256 keypair. All
//! certificates minted for the node — self-signed bootstrap certs and
//! cohort-signed enrollment certs alike — certify this key, which is
//! how the enrollment server proves a manager signed for *this* node.

use std::path::Path;

use p256::ecdsa::SigningKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;

use crate::error::PkiError;

/// ECDSA P-256 node keypair. The inner scalar is zeroized by `p256`
/// on drop.
pub struct NodeKeyPair {
    signing_key: SigningKey,
}

impl NodeKeyPair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Parse a keypair from PKCS#8 PEM.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, PkiError> {
        let signing_key =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| PkiError::Key(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Load the key at `path`, or generate and persist one if the file
    /// does not exist. The key file is written with 0600 permissions on
    /// Unix.
    pub fn load_or_generate(path: &Path) -> Result<Self, PkiError> {
        if path.exists() {
            let pem = std::fs::read_to_string(path)?;
            return Self::from_pkcs8_pem(&pem);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, key.private_key_pem().as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), "Generated node keypair");
        Ok(key)
    }

    /// Export the private key in PKCS#8 PEM format.
    /// Caller is responsible for zeroizing the returned string.
    pub fn private_key_pem(&self) -> zeroize::Zeroizing<String> {
        self.signing_key
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .expect("private key PEM encoding should not fail")
    }

    /// Export the public key as DER SubjectPublicKeyInfo bytes.
    ///
    /// This is the representation compared against the SPKI of a
    /// received leaf certificate during enrollment validation.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_public_key_der()
            .expect("public key DER encoding should not fail")
            .into_vec()
    }
}
