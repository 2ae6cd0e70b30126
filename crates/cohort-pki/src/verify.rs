//! Leaf introspection, chain verification, and fingerprints.
//!
//! Parsing here is limited to what trust bootstrapping needs: SANs,
//! SPKI bytes, and the validity window of a leaf, plus a linear
//! issuer/subject walk with per-link signature checks. Cohort chains
//! are leaf → (intermediates) → root by construction, so no general
//! X.509 path building is attempted.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::error::PkiError;
use crate::node_name_uri;

/// Longest chain the verifier will walk before giving up.
const MAX_CHAIN_LEN: usize = 8;

/// The subset of a parsed leaf certificate that trust decisions need.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub subject_cn: Option<String>,
    pub dns_sans: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
    pub uri_sans: Vec<String>,
    /// Raw DER SubjectPublicKeyInfo bytes.
    pub spki_der: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Parse the fields of a DER-encoded leaf certificate.
pub fn leaf_info(der: &[u8]) -> Result<LeafInfo, PkiError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Certificate(format!("leaf parse: {e}")))?;

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);

    let mut dns_sans = Vec::new();
    let mut ip_sans = Vec::new();
    let mut uri_sans = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_sans.push((*dns).to_string()),
                GeneralName::URI(uri) => uri_sans.push((*uri).to_string()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => {
                        let octets: [u8; 4] = (*bytes).try_into().expect("length checked");
                        ip_sans.push(IpAddr::from(octets));
                    }
                    16 => {
                        let octets: [u8; 16] = (*bytes).try_into().expect("length checked");
                        ip_sans.push(IpAddr::from(octets));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| PkiError::Certificate("leaf notBefore out of range".into()))?;
    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| PkiError::Certificate("leaf notAfter out of range".into()))?;

    Ok(LeafInfo {
        subject_cn,
        dns_sans,
        ip_sans,
        uri_sans,
        spki_der: cert.tbs_certificate.subject_pki.raw.to_vec(),
        not_before,
        not_after,
    })
}

/// Recover the logical node name from a peer certificate's
/// `cohort:<name>` URI SAN.
pub fn uri_node_name(leaf: &LeafInfo) -> Option<String> {
    leaf.uri_sans.iter().find_map(|uri| {
        uri.strip_prefix(&format!("{}:", crate::NODE_NAME_URI_SCHEME))
            .map(str::to_owned)
    })
}

/// Does the leaf's SAN set cover `name`, either as the cohort URI SAN
/// or as a plain DNS name?
pub fn san_matches_name(leaf: &LeafInfo, name: &str) -> bool {
    leaf.uri_sans.iter().any(|u| u == &node_name_uri(name))
        || leaf.dns_sans.iter().any(|d| d == name)
}

/// Does the leaf's SAN set cover `address` (host part, DNS or IP)?
pub fn san_matches_address(leaf: &LeafInfo, address: &str) -> bool {
    let host = split_host(address);
    if let Ok(ip) = host.parse::<IpAddr>() {
        leaf.ip_sans.contains(&ip)
    } else {
        leaf.dns_sans.iter().any(|d| d == host)
    }
}

/// Strip an optional `:port` suffix from a dial address.
pub fn split_host(address: &str) -> &str {
    // Bracketed IPv6 form first
    if let Some(rest) = address.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host
        }
        _ => address,
    }
}

/// Verify that `leaf_der` chains to one of `roots_der` through
/// `intermediates_der`, checking each link's signature and the leaf's
/// validity window.
pub fn verify_chain(
    leaf_der: &[u8],
    intermediates_der: &[Vec<u8>],
    roots_der: &[Vec<u8>],
) -> Result<(), PkiError> {
    if roots_der.is_empty() {
        return Err(PkiError::Verification("no trust roots supplied".into()));
    }

    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| PkiError::Verification(format!("leaf parse: {e}")))?;
    if !leaf.validity().is_valid() {
        return Err(PkiError::Verification(
            "leaf certificate is outside its validity window".into(),
        ));
    }

    let intermediates: Vec<X509Certificate> = intermediates_der
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, c)| c)
                .map_err(|e| PkiError::Verification(format!("intermediate parse: {e}")))
        })
        .collect::<Result<_, _>>()?;
    let roots: Vec<X509Certificate> = roots_der
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, c)| c)
                .map_err(|e| PkiError::Verification(format!("root parse: {e}")))
        })
        .collect::<Result<_, _>>()?;

    let mut current = &leaf;
    for _ in 0..MAX_CHAIN_LEN {
        // A root whose subject matches the current issuer terminates
        // the walk once its signature checks out.
        if let Some(root) = roots
            .iter()
            .find(|r| r.subject().as_raw() == current.issuer().as_raw())
        {
            return current
                .verify_signature(Some(&root.tbs_certificate.subject_pki))
                .map_err(|e| PkiError::Verification(format!("signature check: {e}")));
        }

        let parent = intermediates
            .iter()
            .find(|i| i.subject().as_raw() == current.issuer().as_raw())
            .ok_or_else(|| {
                PkiError::Verification(format!(
                    "no issuer found for '{}'",
                    current.subject()
                ))
            })?;
        current
            .verify_signature(Some(&parent.tbs_certificate.subject_pki))
            .map_err(|e| PkiError::Verification(format!("signature check: {e}")))?;
        current = parent;
    }

    Err(PkiError::Verification("chain too long".into()))
}

/// Compute a SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint as a lowercase hex string.
pub fn fingerprint_sha256(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    let mut s = String::with_capacity(hash.len() * 2);
    for b in hash {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Compare two fingerprint strings in constant time.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    a_bytes.ct_eq(b_bytes).into()
}
