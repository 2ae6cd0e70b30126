//! Hub operations: enroll, renew, forget, probe, inspect.
//!
//! Enrollment spans two systems that cannot be updated atomically: the
//! remote node accepts the certificate, then the registry row is
//! written. When the second step fails the first is compensated by
//! forgetting the node; a failed compensation is reported as data loss
//! so an operator knows the two sides disagree.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use cohort_enroll::error::EnrollError;
use cohort_enroll::tofu::{self, CapturingVerifier, TOFU_CONNECT_TIMEOUT};
use cohort_enroll::{Controller, EnrollmentDoc};
use cohort_pki::ca::SigningAuthority;
use cohort_pki::source::CertSource;
use cohort_pki::{pemchain, verify};

use crate::error::HubError;
use crate::registry::{HubNode, Registry};

/// Request body for enrolling a new node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub description: String,
    /// Expected SHA-256 fingerprint of the node's bootstrap
    /// certificate, hex-encoded. When set, enrollment is refused if the
    /// node presents anything else; obtain it from `inspect_node` over
    /// a channel the operator trusts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

/// Result of a trusted connectivity probe.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub address: String,
    /// Did the node present a chain our roots validate?
    pub trusted: bool,
    pub enrolled: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertSummary {
    pub subject_cn: Option<String>,
    pub fingerprint: String,
    pub dns_sans: Vec<String>,
    pub uri_sans: Vec<String>,
    pub not_before: chrono::DateTime<Utc>,
    pub not_after: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSummary {
    pub target_name: String,
    pub manager_name: String,
    pub manager_address: String,
}

/// What an untrusted look at a node reveals.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub address: String,
    /// The chain the node presented during the handshake, leaf first.
    pub presented_certificates: Vec<CertSummary>,
    /// The node's enrollment metadata, if it serves any.
    pub enrollment: Option<EnrollmentSummary>,
}

pub struct Hub {
    registry: Arc<Registry>,
    identity: Arc<dyn CertSource>,
    controller: Controller,
}

impl Hub {
    /// `identity` is the hub's CA identity; it signs every enrollment
    /// certificate and authenticates the hub on trusted dials.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        registry: Arc<Registry>,
        identity: Arc<dyn CertSource>,
    ) -> Self {
        let name = name.into();
        let address = address.into();
        let controller = Controller::new(name, address, identity.clone());
        Self {
            registry,
            identity,
            controller,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn authority(&self) -> Result<SigningAuthority, HubError> {
        Ok(SigningAuthority::from_identity(&self.identity.certs()?)?)
    }

    /// Enroll a new node and record it, compensating the remote side if
    /// the record cannot be written.
    pub async fn enroll_node(&self, req: &EnrollRequest) -> Result<HubNode, HubError> {
        if req.name.trim().is_empty() {
            return Err(HubError::InvalidArgument("node name is empty".into()));
        }
        if req.address.trim().is_empty() {
            return Err(HubError::InvalidArgument("node address is empty".into()));
        }
        if self.registry.get(&req.address).await.is_some() {
            return Err(HubError::AlreadyExists(req.address.clone()));
        }

        let authority = self.authority()?;
        let doc = self
            .controller
            .enroll(&authority, &req.name, &req.address, req.pin.as_deref())
            .await?;
        let node = node_from_doc(&doc, &req.description)?;

        match self.registry.insert(node.clone()).await {
            Ok(()) => Ok(node),
            Err(insert_err) => {
                tracing::warn!(
                    address = %req.address,
                    error = %insert_err,
                    "registry insert failed after remote enrollment, compensating"
                );
                match self.controller.forget(&authority.roots_pem, &req.address).await {
                    Ok(()) => Err(HubError::Aborted(format!(
                        "registry write failed ({insert_err}); remote enrollment rolled back"
                    ))),
                    Err(forget_err) => Err(HubError::DataLoss(format!(
                        "registry write failed ({insert_err}) and compensation failed \
                         ({forget_err}); node at {} holds a certificate the hub does not track",
                        req.address
                    ))),
                }
            }
        }
    }

    /// Re-issue a node's certificate over verified TLS and update its
    /// row. An update failure after the remote accepted the renewal has
    /// no compensation; both certificates the node may hold were minted
    /// by us, so this is reported as data loss, not rolled back.
    pub async fn renew_node(&self, address: &str) -> Result<HubNode, HubError> {
        let existing = self
            .registry
            .get(address)
            .await
            .ok_or_else(|| HubError::NotFound(address.into()))?;

        let authority = self.authority()?;
        let doc = self
            .controller
            .renew(&authority, &existing.name, address)
            .await?;

        let mut node = node_from_doc(&doc, &existing.description)?;
        node.enrolled_at = existing.enrolled_at;
        if let Err(update_err) = self.registry.update(node.clone()).await {
            return Err(HubError::DataLoss(format!(
                "node at {address} renewed but registry update failed: {update_err}"
            )));
        }
        Ok(node)
    }

    /// Forget a node remotely and drop its row. With `allow_missing`
    /// the remote side is still told to forget even when the registry
    /// has no row — cleanup for a node enrolled out-of-band.
    pub async fn forget_node(
        &self,
        address: &str,
        allow_missing: bool,
    ) -> Result<Option<HubNode>, HubError> {
        let existing = self.registry.get(address).await;
        if existing.is_none() && !allow_missing {
            return Err(HubError::NotFound(address.into()));
        }

        let authority = self.authority()?;
        self.controller
            .forget(&authority.roots_pem, address)
            .await?;

        match existing {
            Some(_) => Ok(Some(self.registry.remove(address).await?)),
            None => Ok(None),
        }
    }

    /// Probe a node over TLS verified against the cohort roots,
    /// presenting the hub's identity. No state changes.
    pub async fn test_node(&self, address: &str) -> Result<TestReport, HubError> {
        let authority = self.authority()?;
        let roots = pemchain::decode_certificates(&authority.roots_pem)
            .map_err(HubError::Pki)?;
        let verifier = CapturingVerifier::verified(&roots).map_err(HubError::Enroll)?;
        let identity = self.identity.certs()?;
        let client = tofu::https_client(
            tofu::client_config(verifier, Some(&identity)).map_err(HubError::Enroll)?,
            TOFU_CONNECT_TIMEOUT,
        )
        .map_err(HubError::Enroll)?;

        match client
            .get(format!("https://{address}/v1/enrollment"))
            .send()
            .await
        {
            Ok(response) => Ok(TestReport {
                address: address.into(),
                trusted: true,
                enrolled: response.status().is_success(),
                error: None,
            }),
            Err(e) => Ok(TestReport {
                address: address.into(),
                trusted: false,
                enrolled: false,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Look at a node without any trust assumptions: capture whatever
    /// chain it presents and read its enrollment metadata if served.
    pub async fn inspect_node(&self, address: &str) -> Result<InspectReport, HubError> {
        let verifier = CapturingVerifier::tofu();
        let client = tofu::https_client(
            tofu::client_config(verifier.clone(), None).map_err(HubError::Enroll)?,
            TOFU_CONNECT_TIMEOUT,
        )
        .map_err(HubError::Enroll)?;

        let response = client
            .get(format!("https://{address}/v1/enrollment"))
            .send()
            .await
            .map_err(|e| HubError::Enroll(EnrollError::Transport(e.to_string())))?;

        let enrollment = if response.status().is_success() {
            response
                .json::<EnrollmentDoc>()
                .await
                .ok()
                .map(|d| EnrollmentSummary {
                    target_name: d.target_name,
                    manager_name: d.manager_name,
                    manager_address: d.manager_address,
                })
        } else {
            None
        };

        let presented_certificates = verifier
            .captured()
            .unwrap_or_default()
            .iter()
            .map(|der| summarize(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InspectReport {
            address: address.into(),
            presented_certificates,
            enrollment,
        })
    }
}

fn node_from_doc(doc: &EnrollmentDoc, description: &str) -> Result<HubNode, HubError> {
    let leaf_der = pemchain::first_certificate(&doc.certificate).map_err(HubError::Pki)?;
    Ok(HubNode {
        address: doc.target_address.clone(),
        name: doc.target_name.clone(),
        description: description.into(),
        cert_chain_pem: doc.certificate.clone(),
        fingerprint: verify::fingerprint_sha256(&leaf_der),
        enrolled_at: Utc::now(),
    })
}

fn summarize(der: &[u8]) -> Result<CertSummary, HubError> {
    let info = verify::leaf_info(der).map_err(HubError::Pki)?;
    Ok(CertSummary {
        subject_cn: info.subject_cn,
        fingerprint: verify::fingerprint_sha256(der),
        dns_sans: info.dns_sans,
        uri_sans: info.uri_sans,
        not_before: info.not_before,
        not_after: info.not_after,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use axum_server::tls_rustls::RustlsConfig;
    use axum_server::Handle;
    use cohort_enroll::EnrollmentServer;
    use cohort_pki::keys::NodeKeyPair;
    use cohort_pki::source::{DirectSource, TlsIdentity};
    use cohort_pki::{ca, PkiError};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn install_crypto() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    pub struct TestNode {
        pub server: Arc<EnrollmentServer>,
        pub address: String,
        pub bootstrap_fingerprint: String,
        pub dir: std::path::PathBuf,
        pub handle: Handle,
    }

    /// An unenrolled node serving its bootstrap certificate on
    /// loopback.
    pub async fn spawn_node(name: &str) -> TestNode {
        install_crypto();

        let key = Arc::new(NodeKeyPair::generate());
        let identity =
            ca::create_self_signed_certificate("node", &key, &["127.0.0.1".into()]).unwrap();

        let dir = cohort_common::test::scratch_dir(name);
        let server = EnrollmentServer::open(&dir, key).unwrap();

        let bootstrap_leaf = pemchain::decode_certificates(&identity.cert_chain_pem).unwrap();
        let bootstrap_fingerprint = verify::fingerprint_sha256(&bootstrap_leaf[0]);

        let tls = RustlsConfig::from_pem(
            identity.cert_chain_pem.into_bytes(),
            identity.private_key_pem.into_bytes(),
        )
        .await
        .unwrap();

        let handle = Handle::new();
        let app = cohort_enroll::http::routes(server.clone());
        let bind_handle = handle.clone();
        tokio::spawn(async move {
            axum_server::bind_rustls("127.0.0.1:0".parse::<SocketAddr>().unwrap(), tls)
                .handle(bind_handle)
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        let addr = handle.listening().await.unwrap();

        TestNode {
            server,
            address: format!("127.0.0.1:{}", addr.port()),
            bootstrap_fingerprint,
            dir,
            handle,
        }
    }

    pub fn make_hub(name: &str, registry_dir: &std::path::Path) -> Hub {
        let key = NodeKeyPair::generate();
        let identity = ca::create_root_authority(name, &key).unwrap();
        make_hub_with(name, registry_dir, Arc::new(DirectSource::new(identity)))
    }

    pub fn make_hub_with(
        name: &str,
        registry_dir: &std::path::Path,
        identity: Arc<dyn CertSource>,
    ) -> Hub {
        let registry =
            Arc::new(Registry::load_or_create(registry_dir.join("registry.json")).unwrap());
        Hub::new(name, format!("{name}.example:8443"), registry, identity)
    }

    /// Identity source with a call budget; loads past the budget fail.
    pub struct FailingAfter {
        identity: TlsIdentity,
        calls: AtomicUsize,
        budget: usize,
    }

    impl FailingAfter {
        pub fn new(identity: TlsIdentity, budget: usize) -> Self {
            Self {
                identity,
                calls: AtomicUsize::new(0),
                budget,
            }
        }
    }

    impl CertSource for FailingAfter {
        fn certs(&self) -> Result<TlsIdentity, PkiError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.budget {
                Ok(self.identity.clone())
            } else {
                Err(PkiError::Certificate("authority material unavailable".into()))
            }
        }
    }
}
