//! Trust-on-first-use TLS plumbing for manager-side dials.
//!
//! Enrollment has to talk to a node before any shared trust exists, so
//! the manager dials with a verifier that accepts whatever certificate
//! the node presents and records it. The recorded leaf supplies the
//! node's public key for certificate minting. Renewal and forget use
//! the same verifier in delegating mode, where webpki validates the
//! presented chain against the cohort roots.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use cohort_pki::pemchain;
use cohort_pki::source::TlsIdentity;

use crate::error::EnrollError;

/// Cap on dials to nodes we have no trust relationship with yet.
pub const TOFU_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Records the first certificate chain a server presents.
///
/// In TOFU mode every chain is accepted. In verified mode validation
/// delegates to webpki against the supplied roots. Either way only the
/// first presented chain is recorded; reconnects do not overwrite it.
#[derive(Debug)]
pub struct CapturingVerifier {
    captured: OnceLock<Vec<CertificateDer<'static>>>,
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl CapturingVerifier {
    /// Accept-anything capture mode for first contact.
    pub fn tofu() -> Arc<Self> {
        Arc::new(Self {
            captured: OnceLock::new(),
            inner: None,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Capture plus webpki validation against `roots_der`.
    pub fn verified(roots_der: &[Vec<u8>]) -> Result<Arc<Self>, EnrollError> {
        let mut store = RootCertStore::empty();
        for der in roots_der {
            store
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| EnrollError::Transport(format!("bad trust root: {e}")))?;
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(store), provider.clone())
            .build()
            .map_err(|e| EnrollError::Transport(format!("verifier build: {e}")))?;
        Ok(Arc::new(Self {
            captured: OnceLock::new(),
            inner: Some(inner),
            provider,
        }))
    }

    /// The chain captured during the first handshake, leaf first.
    pub fn captured(&self) -> Option<&[CertificateDer<'static>]> {
        self.captured.get().map(Vec::as_slice)
    }

    /// DER of the captured leaf certificate.
    pub fn captured_leaf_der(&self) -> Result<Vec<u8>, EnrollError> {
        self.captured()
            .and_then(|chain| chain.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or(EnrollError::NoPeerCertificate)
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = vec![end_entity.clone().into_owned()];
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        let _ = self.captured.set(chain);

        match &self.inner {
            Some(inner) => {
                inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls12_signature(message, cert, dss),
            None => rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls13_signature(message, cert, dss),
            None => rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            ),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(inner) => inner.supported_verify_schemes(),
            None => self
                .provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

/// Build a rustls client config around a capturing verifier, optionally
/// presenting `identity` for client authentication.
pub fn client_config(
    verifier: Arc<CapturingVerifier>,
    identity: Option<&TlsIdentity>,
) -> Result<rustls::ClientConfig, EnrollError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| EnrollError::Transport(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match identity {
        Some(identity) => {
            let chain = pemchain::decode_certificates(&identity.cert_chain_pem)?
                .into_iter()
                .map(CertificateDer::from)
                .collect();
            let key = private_key_der(&identity.private_key_pem)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| EnrollError::Transport(format!("client identity: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// An HTTPS client over a preconfigured rustls config.
pub fn https_client(
    config: rustls::ClientConfig,
    connect_timeout: Duration,
) -> Result<reqwest::Client, EnrollError> {
    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| EnrollError::Transport(e.to_string()))
}

fn private_key_der(pem_str: &str) -> Result<PrivateKeyDer<'static>, EnrollError> {
    let block = pem::parse(pem_str)
        .map_err(|e| EnrollError::Transport(format!("private key: {e}")))?;
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(block.contents().to_vec().into())),
        other => Err(EnrollError::Transport(format!(
            "unsupported private key type '{other}'"
        ))),
    }
}
