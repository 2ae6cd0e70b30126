//! PEM certificate-chain encoding and decoding.
//!
//! The wire format all enrollment messages use for certificates:
//! sequential `CERTIFICATE` blocks, leaf first, ascending toward the
//! root. Root CA sets are a bare concatenation with no ordering
//! requirement.

use crate::error::PkiError;

/// Decode every `CERTIFICATE` block in `pem_str` to DER, in order.
///
/// Non-certificate blocks (keys, CSRs) are skipped. An input with no
/// certificate blocks is an error — enrollment messages always carry
/// at least one.
pub fn decode_certificates(pem_str: &str) -> Result<Vec<Vec<u8>>, PkiError> {
    let blocks = pem::parse_many(pem_str).map_err(|e| PkiError::Pem(e.to_string()))?;
    let ders: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| b.contents().to_vec())
        .collect();
    if ders.is_empty() {
        return Err(PkiError::Pem("no CERTIFICATE blocks found".into()));
    }
    Ok(ders)
}

/// Encode DER certificates as sequential PEM `CERTIFICATE` blocks.
pub fn encode_certificates<I, D>(ders: I) -> String
where
    I: IntoIterator<Item = D>,
    D: AsRef<[u8]>,
{
    let mut out = String::new();
    for der in ders {
        let block = pem::Pem::new("CERTIFICATE", der.as_ref().to_vec());
        out.push_str(&pem::encode(&block));
    }
    out
}

/// Decode the first `CERTIFICATE` block (the leaf of a chain).
pub fn first_certificate(pem_str: &str) -> Result<Vec<u8>, PkiError> {
    let mut ders = decode_certificates(pem_str)?;
    Ok(ders.remove(0))
}
