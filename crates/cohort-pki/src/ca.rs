//! Certificate Authority operations.
//!
//! Mints the three certificate shapes the cohort needs: enrollment
//! certificates (signed for a *remote* node's existing public key),
//! locally-signed service certificates, and self-signed bootstrap
//! certificates. All leaves carry the node's logical name as a
//! `cohort:<name>` URI SAN alongside the usual DNS/IP SANs.
//!
//! Chain construction is a pure function of its inputs — no I/O, no
//! external calls; failures are argument or signing errors only.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePublicKey;
use rand::RngCore;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair, KeyUsagePurpose,
    RemoteKeyPair, SanType, SerialNumber,
};
use zeroize::Zeroizing;

use crate::error::PkiError;
use crate::keys::NodeKeyPair;
use crate::node_name_uri;
use crate::pemchain;
use crate::source::TlsIdentity;
use crate::verify;

/// Lifetime of issued leaf certificates. Rotation via an
/// `AfterProgress(0.5)` policy gives a 15-day retry window.
pub const CERT_LIFETIME_DAYS: i64 = 30;

/// Lifetime of self-signed root CA certificates.
pub const CA_LIFETIME_DAYS: i64 = 3650;

/// Read-only signing material for a certificate authority.
///
/// Constructed from a `TlsIdentity` whose leaf is the CA certificate;
/// never mutated after construction.
pub struct SigningAuthority {
    /// The CA certificate, single PEM block.
    pub cert_pem: String,
    /// Intermediates above the CA cert, leaf-first order preserved.
    pub intermediates_pem: Vec<String>,
    /// Trust roots that validate certificates this authority signs.
    pub roots_pem: String,
    key_pem: Zeroizing<String>,
}

impl SigningAuthority {
    pub fn from_identity(identity: &TlsIdentity) -> Result<Self, PkiError> {
        let ders = pemchain::decode_certificates(&identity.cert_chain_pem)?;
        let cert_pem = pemchain::encode_certificates([&ders[0]]);
        let intermediates_pem = ders[1..]
            .iter()
            .map(|der| pemchain::encode_certificates([der]))
            .collect();
        let roots_pem = if identity.roots_pem.trim().is_empty() {
            cert_pem.clone()
        } else {
            identity.roots_pem.clone()
        };
        Ok(Self {
            cert_pem,
            intermediates_pem,
            roots_pem,
            key_pem: Zeroizing::new(identity.private_key_pem.clone()),
        })
    }

    /// Rebuild the rcgen issuer pair for signing operations.
    ///
    /// rcgen cannot consume an existing certificate directly; the
    /// issuer params are reconstructed from the CA cert PEM and
    /// re-signed with the same key, which leaves child signatures
    /// verifiable against the original certificate.
    fn issuer(&self) -> Result<(rcgen::Certificate, KeyPair), PkiError> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Key(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        Ok((cert, key))
    }
}

/// Result of minting a certificate for a cohort member.
#[derive(Debug)]
pub struct IssuedCert {
    /// The leaf certificate, single PEM block.
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    /// Leaf + CA cert + intermediates, sequential PEM blocks.
    pub chain_pem: String,
    pub fingerprint: String,
    pub expires: DateTime<Utc>,
}

/// A peer's P-256 public key, wrapped so rcgen can mint a certificate
/// for a key whose private half we never see. `sign` is unreachable:
/// only the issuer signs during issuance.
struct RemotePeerKey {
    public_key_raw: Vec<u8>,
}

impl RemotePeerKey {
    fn from_spki_der(spki_der: &[u8]) -> Result<Self, PkiError> {
        let key = p256::PublicKey::from_public_key_der(spki_der)
            .map_err(|e| PkiError::Key(format!("peer public key: {e}")))?;
        Ok(Self {
            public_key_raw: key.to_encoded_point(false).as_bytes().to_vec(),
        })
    }
}

impl RemoteKeyPair for RemotePeerKey {
    fn public_key(&self) -> &[u8] {
        &self.public_key_raw
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

/// Create a cohort-signed enrollment certificate for a remote node.
///
/// The leaf certifies `peer_spki_der` — the node's own long-lived
/// public key captured during the TOFU handshake — with
/// `CommonName = target_name`, client+server EKUs, a SAN for
/// `target_address` (DNS or IP, auto-detected), and the
/// `cohort:<target_name>` URI SAN.
pub fn create_enrollment_certificate(
    authority: &SigningAuthority,
    target_name: &str,
    target_address: &str,
    peer_spki_der: &[u8],
) -> Result<IssuedCert, PkiError> {
    let mut params = leaf_params(target_name)?;
    push_address_san(&mut params, target_address)?;
    push_name_uri_san(&mut params, target_name)?;

    let remote = KeyPair::from_remote(Box::new(RemotePeerKey::from_spki_der(peer_spki_der)?))
        .map_err(|e| PkiError::Key(e.to_string()))?;

    sign_leaf(authority, params, &remote)
}

/// Create a locally-signed identity for this process's own key,
/// embedding the authority's full chain. This is how a node obtains a
/// rotating cohort-signed identity without re-enrolling.
pub fn create_signed_identity(
    authority: &SigningAuthority,
    name: &str,
    sans: &[String],
    key: &NodeKeyPair,
) -> Result<TlsIdentity, PkiError> {
    let mut params = leaf_params(name)?;
    for san in sans {
        push_address_san(&mut params, san)?;
    }
    push_name_uri_san(&mut params, name)?;

    let key_pem = key.private_key_pem();
    let subject =
        KeyPair::from_pem(&key_pem).map_err(|e| PkiError::Key(e.to_string()))?;
    let issued = sign_leaf(authority, params, &subject)?;

    Ok(TlsIdentity {
        cert_chain_pem: issued.chain_pem,
        private_key_pem: key_pem.to_string(),
        roots_pem: authority.roots_pem.clone(),
    })
}

/// Create a certificate for local-interface use (`localhost` plus the
/// machine hostname), signed by the authority.
pub fn create_local_certificate(
    authority: &SigningAuthority,
    name: &str,
    key: &NodeKeyPair,
) -> Result<TlsIdentity, PkiError> {
    create_signed_identity(authority, name, &local_sans(), key)
}

/// Create a self-signed identity from a name and the node key. The
/// identity trusts itself: its own certificate doubles as the root set.
pub fn create_self_signed_certificate(
    name: &str,
    key: &NodeKeyPair,
    sans: &[String],
) -> Result<TlsIdentity, PkiError> {
    let mut params = leaf_params(name)?;
    push_dns_san(&mut params, name)?;
    push_dns_san(&mut params, "localhost")?;
    for san in sans {
        push_address_san(&mut params, san)?;
    }
    push_name_uri_san(&mut params, name)?;

    let key_pem = key.private_key_pem();
    let keypair =
        KeyPair::from_pem(&key_pem).map_err(|e| PkiError::Key(e.to_string()))?;
    let cert = params
        .self_signed(&keypair)
        .map_err(|e| PkiError::Certificate(e.to_string()))?;

    let cert_pem = cert.pem();
    Ok(TlsIdentity {
        roots_pem: cert_pem.clone(),
        cert_chain_pem: cert_pem,
        private_key_pem: key_pem.to_string(),
    })
}

/// Create a self-signed root CA identity for a manager. Unlike
/// `create_self_signed_certificate` the result carries the CA basic
/// constraint and cert-signing key usage, so chains it signs pass
/// webpki path validation on renewing clients.
pub fn create_root_authority(name: &str, key: &NodeKeyPair) -> Result<TlsIdentity, PkiError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, name);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let not_before = Utc::now();
    let not_after = not_before + Duration::days(CA_LIFETIME_DAYS);
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());

    let key_pem = key.private_key_pem();
    let keypair = KeyPair::from_pem(&key_pem).map_err(|e| PkiError::Key(e.to_string()))?;
    let cert = params
        .self_signed(&keypair)
        .map_err(|e| PkiError::Certificate(e.to_string()))?;

    let cert_pem = cert.pem();
    Ok(TlsIdentity {
        roots_pem: cert_pem.clone(),
        cert_chain_pem: cert_pem,
        private_key_pem: key_pem.to_string(),
    })
}

/// Concatenate a minted leaf with the authority's cert and
/// intermediates — the wire format enrollment messages use.
pub fn encode_certificate_chain(leaf_pem: &str, authority: &SigningAuthority) -> String {
    let mut chain = leaf_pem.to_string();
    chain.push_str(&authority.cert_pem);
    for intermediate in &authority.intermediates_pem {
        chain.push_str(intermediate);
    }
    chain
}

/// SANs for local-interface certificates: `localhost` plus the machine
/// hostname when it resolves.
pub fn local_sans() -> Vec<String> {
    let mut sans = vec!["localhost".to_string()];
    if let Ok(host) = hostname::get() {
        let host = host.to_string_lossy().to_string();
        if !host.is_empty() {
            sans.push(host);
        }
    }
    sans
}

// ── Internal ────────────────────────────────────────────────────────

fn leaf_params(common_name: &str) -> Result<CertificateParams, PkiError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    // 128-bit cryptographically random serial
    let mut serial = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let not_before = Utc::now();
    let not_after = not_before + Duration::days(CERT_LIFETIME_DAYS);
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc());

    Ok(params)
}

fn push_address_san(params: &mut CertificateParams, address: &str) -> Result<(), PkiError> {
    let host = verify::split_host(address);
    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        push_dns_san(params, host)?;
    }
    Ok(())
}

fn push_dns_san(params: &mut CertificateParams, host: &str) -> Result<(), PkiError> {
    let name = Ia5String::try_from(host)
        .map_err(|e| PkiError::Certificate(format!("bad DNS SAN '{host}': {e}")))?;
    params.subject_alt_names.push(SanType::DnsName(name));
    Ok(())
}

fn push_name_uri_san(params: &mut CertificateParams, name: &str) -> Result<(), PkiError> {
    let uri = Ia5String::try_from(node_name_uri(name).as_str())
        .map_err(|e| PkiError::Certificate(format!("bad URI SAN for '{name}': {e}")))?;
    params.subject_alt_names.push(SanType::URI(uri));
    Ok(())
}

fn sign_leaf(
    authority: &SigningAuthority,
    params: CertificateParams,
    subject_key: &KeyPair,
) -> Result<IssuedCert, PkiError> {
    let (issuer_cert, issuer_key) = authority.issuer()?;
    let cert = params
        .signed_by(subject_key, &issuer_cert, &issuer_key)
        .map_err(|e| PkiError::Certificate(format!("signing failed: {e}")))?;

    let cert_pem = cert.pem();
    let cert_der = cert.der().to_vec();
    let fingerprint = verify::fingerprint_sha256(&cert_der);
    let chain_pem = encode_certificate_chain(&cert_pem, authority);
    let expires = Utc::now() + Duration::days(CERT_LIFETIME_DAYS);

    Ok(IssuedCert {
        cert_pem,
        cert_der,
        chain_pem,
        fingerprint,
        expires,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pemchain;

    fn make_authority() -> SigningAuthority {
        let key = NodeKeyPair::generate();
        let identity = create_root_authority("hub", &key).unwrap();
        SigningAuthority::from_identity(&identity).unwrap()
    }

    #[test]
    fn root_authority_carries_ca_constraint() {
        let key = NodeKeyPair::generate();
        let identity = create_root_authority("hub", &key).unwrap();
        let der = identity.leaf_der().unwrap();

        use x509_parser::prelude::FromDer;
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&der).unwrap();
        assert!(cert.is_ca());
    }

    #[test]
    fn self_signed_certificate_trusts_itself() {
        let key = NodeKeyPair::generate();
        let identity = create_self_signed_certificate("ac-01", &key, &[]).unwrap();
        assert_eq!(identity.cert_chain_pem, identity.roots_pem);
        assert!(identity.cert_chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(identity.private_key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn enrollment_certificate_carries_peer_key() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();

        let issued = create_enrollment_certificate(
            &authority,
            "ac-02",
            "192.168.4.20:23557",
            &node_key.public_key_der(),
        )
        .unwrap();

        let leaf = verify::leaf_info(&issued.cert_der).unwrap();
        assert_eq!(leaf.spki_der, node_key.public_key_der());
        assert_eq!(leaf.subject_cn.as_deref(), Some("ac-02"));
        assert!(leaf.ip_sans.iter().any(|ip| ip.to_string() == "192.168.4.20"));
        assert!(leaf.uri_sans.iter().any(|u| u == "cohort:ac-02"));
    }

    #[test]
    fn enrollment_certificate_dns_address() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();

        let issued = create_enrollment_certificate(
            &authority,
            "bc-1",
            "bc-1.building.example:8443",
            &node_key.public_key_der(),
        )
        .unwrap();

        let leaf = verify::leaf_info(&issued.cert_der).unwrap();
        assert!(leaf.dns_sans.iter().any(|d| d == "bc-1.building.example"));
        assert!(leaf.ip_sans.is_empty());
    }

    #[test]
    fn chain_pem_is_leaf_first_with_authority() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();

        let issued = create_enrollment_certificate(
            &authority,
            "ac-03",
            "ac-03.local",
            &node_key.public_key_der(),
        )
        .unwrap();

        let ders = pemchain::decode_certificates(&issued.chain_pem).unwrap();
        assert_eq!(ders.len(), 2);
        assert_eq!(ders[0], issued.cert_der);
        // second block is the authority cert
        let authority_der = pemchain::first_certificate(&authority.cert_pem).unwrap();
        assert_eq!(ders[1], authority_der);
    }

    #[test]
    fn serial_numbers_are_unique() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();
        let spki = node_key.public_key_der();

        let a = create_enrollment_certificate(&authority, "n", "n.local", &spki).unwrap();
        let b = create_enrollment_certificate(&authority, "n", "n.local", &spki).unwrap();
        assert_ne!(a.cert_der, b.cert_der);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn signed_identity_embeds_authority_roots() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();

        let identity =
            create_signed_identity(&authority, "ac-04", &["ac-04.local".into()], &node_key)
                .unwrap();
        assert_eq!(identity.roots_pem, authority.roots_pem);

        let ders = pemchain::decode_certificates(&identity.cert_chain_pem).unwrap();
        assert_eq!(ders.len(), 2);
    }

    #[test]
    fn local_certificate_includes_localhost() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();

        let identity = create_local_certificate(&authority, "ac-05", &node_key).unwrap();
        let leaf = verify::leaf_info(&identity.leaf_der().unwrap()).unwrap();
        assert!(leaf.dns_sans.iter().any(|d| d == "localhost"));
    }

    #[test]
    fn bad_peer_key_is_rejected() {
        let authority = make_authority();
        let result =
            create_enrollment_certificate(&authority, "x", "x.local", b"not a key");
        assert!(matches!(result, Err(PkiError::Key(_))));
    }

    #[test]
    fn cert_lifetime_is_thirty_days() {
        let authority = make_authority();
        let node_key = NodeKeyPair::generate();
        let issued =
            create_enrollment_certificate(&authority, "t", "t.local", &node_key.public_key_der())
                .unwrap();

        let leaf = verify::leaf_info(&issued.cert_der).unwrap();
        let days = (leaf.not_after - leaf.not_before).num_days();
        assert_eq!(days, CERT_LIFETIME_DAYS);
    }
}
