//! Manager-side enrollment controller.
//!
//! Drives the node enrollment API from the manager: first contact over
//! a TOFU dial that captures the node's presented certificate (the
//! source of its public key), later operations over TLS verified
//! against the cohort roots.

use std::sync::Arc;

use cohort_common::error::ErrorCode;
use cohort_pki::ca::{self, SigningAuthority};
use cohort_pki::source::CertSource;
use cohort_pki::{pemchain, verify};

use crate::error::EnrollError;
use crate::protocol::{EnrollmentDoc, ErrorBody};
use crate::tofu::{self, CapturingVerifier, TOFU_CONNECT_TIMEOUT};

pub struct Controller {
    manager_name: String,
    manager_address: String,
    /// The manager's own identity, presented on trusted dials.
    identity: Arc<dyn CertSource>,
}

impl Controller {
    pub fn new(
        manager_name: impl Into<String>,
        manager_address: impl Into<String>,
        identity: Arc<dyn CertSource>,
    ) -> Self {
        Self {
            manager_name: manager_name.into(),
            manager_address: manager_address.into(),
            identity,
        }
    }

    pub fn manager_address(&self) -> &str {
        &self.manager_address
    }

    /// Enroll the node at `target_address` under `target_name`.
    ///
    /// Dials with a TOFU verifier, forces a handshake with a GET (an
    /// unenrolled node answers 404), extracts the node's public key
    /// from the captured leaf, mints an enrollment certificate for it,
    /// and POSTs the resulting document. With `pinned_fingerprint` the
    /// captured leaf must match the pin or enrollment is refused.
    pub async fn enroll(
        &self,
        authority: &SigningAuthority,
        target_name: &str,
        target_address: &str,
        pinned_fingerprint: Option<&str>,
    ) -> Result<EnrollmentDoc, EnrollError> {
        let verifier = CapturingVerifier::tofu();
        let client = tofu::https_client(
            tofu::client_config(verifier.clone(), None)?,
            TOFU_CONNECT_TIMEOUT,
        )?;
        let url = enrollment_url(target_address);

        let probe = client.get(&url).send().await.map_err(transport)?;
        if probe.status().is_success() {
            return Err(EnrollError::Remote {
                code: ErrorCode::AlreadyExists,
                message: "node reports an existing enrollment".into(),
            });
        }
        // 404 is the expected answer from an unenrolled node; anything
        // else is a node-side fault to surface, not a green light.
        if probe.status() != reqwest::StatusCode::NOT_FOUND {
            check(probe).await?;
        }

        let leaf_der = verifier.captured_leaf_der()?;
        if let Some(pin) = pinned_fingerprint {
            let presented = verify::fingerprint_sha256(&leaf_der);
            if !verify::fingerprints_match(pin, &presented) {
                return Err(EnrollError::PinMismatch);
            }
        }
        let leaf = verify::leaf_info(&leaf_der).map_err(EnrollError::Pki)?;
        let issued = ca::create_enrollment_certificate(
            authority,
            target_name,
            target_address,
            &leaf.spki_der,
        )?;
        tracing::info!(
            name = target_name,
            address = target_address,
            fingerprint = %issued.fingerprint,
            "minted enrollment certificate"
        );

        let doc = EnrollmentDoc {
            target_name: target_name.into(),
            target_address: target_address.into(),
            manager_name: self.manager_name.clone(),
            manager_address: self.manager_address.clone(),
            certificate: issued.chain_pem,
            root_cas: authority.roots_pem.clone(),
        };
        check(client.post(&url).json(&doc).send().await.map_err(transport)?).await?;
        Ok(doc)
    }

    /// Renew the node's certificate over TLS verified against the
    /// cohort roots, presenting the manager's own identity.
    pub async fn renew(
        &self,
        authority: &SigningAuthority,
        target_name: &str,
        target_address: &str,
    ) -> Result<EnrollmentDoc, EnrollError> {
        let roots = pemchain::decode_certificates(&authority.roots_pem)?;
        let verifier = CapturingVerifier::verified(&roots)?;
        let identity = self.identity.certs()?;
        let client = tofu::https_client(
            tofu::client_config(verifier.clone(), Some(&identity))?,
            TOFU_CONNECT_TIMEOUT,
        )?;
        let url = enrollment_url(target_address);

        check(client.get(&url).send().await.map_err(transport)?).await?;

        let leaf = verify::leaf_info(&verifier.captured_leaf_der()?)
            .map_err(EnrollError::Pki)?;
        let issued = ca::create_enrollment_certificate(
            authority,
            target_name,
            target_address,
            &leaf.spki_der,
        )?;

        let doc = EnrollmentDoc {
            target_name: target_name.into(),
            target_address: target_address.into(),
            manager_name: self.manager_name.clone(),
            manager_address: self.manager_address.clone(),
            certificate: issued.chain_pem,
            root_cas: authority.roots_pem.clone(),
        };
        check(client.put(&url).json(&doc).send().await.map_err(transport)?).await?;
        Ok(doc)
    }

    /// Remove the node's enrollment. Tries a trusted dial first; if
    /// that fails (a node that lost its cohort certificate serves a
    /// self-signed one), falls back to an untrusted dial, confirming
    /// the node is enrolled with *this* manager before deleting.
    /// Idempotent: an already-unenrolled node is success.
    pub async fn forget(&self, roots_pem: &str, target_address: &str) -> Result<(), EnrollError> {
        let url = enrollment_url(target_address);

        match self.trusted_delete(roots_pem, &url).await {
            Ok(()) => return Ok(()),
            // Only connectivity failures fall through to the untrusted
            // path; an answer from a reachable node stands as-is.
            Err(
                e @ (EnrollError::Transport(_)
                | EnrollError::Remote {
                    code: ErrorCode::Unavailable,
                    ..
                }),
            ) => {
                tracing::debug!(error = %e, "trusted forget failed, trying untrusted");
            }
            Err(e) => return Err(e),
        }

        let verifier = CapturingVerifier::tofu();
        let client = tofu::https_client(
            tofu::client_config(verifier, None)?,
            TOFU_CONNECT_TIMEOUT,
        )?;

        let response = client.get(&url).send().await.map_err(transport)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let doc: EnrollmentDoc = check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        if doc.manager_address != self.manager_address {
            return Err(EnrollError::NotEnrolledWithUs {
                expected: self.manager_address.clone(),
                actual: doc.manager_address,
            });
        }

        let response = client.delete(&url).send().await.map_err(transport)?;
        finish_delete(response).await
    }

    async fn trusted_delete(&self, roots_pem: &str, url: &str) -> Result<(), EnrollError> {
        let roots = pemchain::decode_certificates(roots_pem)?;
        let verifier = CapturingVerifier::verified(&roots)?;
        let identity = self.identity.certs()?;
        let client = tofu::https_client(
            tofu::client_config(verifier, Some(&identity))?,
            TOFU_CONNECT_TIMEOUT,
        )?;
        let response = client.delete(url).send().await.map_err(transport)?;
        finish_delete(response).await
    }
}

async fn finish_delete(response: reqwest::Response) -> Result<(), EnrollError> {
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(());
    }
    check(response).await.map(|_| ())
}

/// Convert an error response into `EnrollError::Remote`, preferring the
/// machine-readable body over the status line.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, EnrollError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(EnrollError::Remote {
            code: body.error,
            message: body.message,
        }),
        Err(_) => Err(EnrollError::Remote {
            code: ErrorCode::from_http_status(status.as_u16()),
            message: format!("HTTP {status}"),
        }),
    }
}

fn transport(e: reqwest::Error) -> EnrollError {
    EnrollError::Transport(e.to_string())
}

fn enrollment_url(address: &str) -> String {
    format!("https://{address}/v1/enrollment")
}
