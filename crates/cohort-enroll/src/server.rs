//! Node-side enrollment state machine.
//!
//! One `EnrollmentServer` guards the node's enrollment record behind a
//! mutex, validates incoming documents before anything touches disk,
//! and exposes the accepted identity as a `CertSource` so the node's
//! TLS listeners pick up the cohort certificate the moment enrollment
//! lands.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use cohort_pki::keys::NodeKeyPair;
use cohort_pki::source::{CertSource, TlsIdentity};
use cohort_pki::{pemchain, verify, PkiError};

use crate::error::EnrollError;
use crate::protocol::EnrollmentDoc;
use crate::record::{Enrollment, EnrollmentStore};

pub struct EnrollmentServer {
    key: Arc<NodeKeyPair>,
    store: Mutex<EnrollmentStore>,
    manager_tx: watch::Sender<Option<String>>,
}

impl EnrollmentServer {
    /// Open the enrollment record under `dir`. An existing record is
    /// loaded; a missing one starts the node unenrolled.
    pub fn open(
        dir: impl Into<std::path::PathBuf>,
        key: Arc<NodeKeyPair>,
    ) -> Result<Arc<Self>, EnrollError> {
        let store = EnrollmentStore::load_or_create(dir)?;
        let initial = store.current().map(|e| e.manager_address.clone());
        let (manager_tx, _) = watch::channel(initial);
        Ok(Arc::new(Self {
            key,
            store: Mutex::new(store),
            manager_tx,
        }))
    }

    /// The current enrollment document, if enrolled.
    pub fn document(&self) -> Result<EnrollmentDoc, EnrollError> {
        let store = self.lock();
        store
            .current()
            .map(doc_from)
            .ok_or(EnrollError::NotEnrolled)
    }

    /// Accept a first enrollment. Single-shot: a second create fails
    /// with `AlreadyEnrolled` and leaves disk untouched.
    pub fn create(&self, doc: &EnrollmentDoc) -> Result<(), EnrollError> {
        let mut store = self.lock();
        if store.current().is_some() {
            return Err(EnrollError::AlreadyEnrolled);
        }
        let enrollment = self.validate(doc)?;
        let manager_address = enrollment.manager_address.clone();
        store.save(enrollment)?;
        // Sent while the store lock is held so watchers observe
        // mutations in commit order.
        self.manager_tx.send_replace(Some(manager_address));
        drop(store);

        tracing::info!(
            manager = %doc.manager_name,
            name = %doc.target_name,
            "enrollment accepted"
        );
        Ok(())
    }

    /// Replace the current enrollment with a renewed document,
    /// validated exactly like a create.
    pub fn renew(&self, doc: &EnrollmentDoc) -> Result<(), EnrollError> {
        let mut store = self.lock();
        if store.current().is_none() {
            return Err(EnrollError::NotEnrolled);
        }
        let enrollment = self.validate(doc)?;
        let manager_address = enrollment.manager_address.clone();
        store.save(enrollment)?;
        self.manager_tx.send_replace(Some(manager_address));
        drop(store);

        tracing::info!(manager = %doc.manager_name, "enrollment renewed");
        Ok(())
    }

    /// Remove the enrollment, returning the removed document.
    pub fn delete(&self) -> Result<EnrollmentDoc, EnrollError> {
        let mut store = self.lock();
        let removed = store.delete()?;
        self.manager_tx.send_replace(None);
        drop(store);

        tracing::info!(manager = %removed.manager_name, "enrollment removed");
        Ok(doc_from(&removed))
    }

    /// Observe the enrolled manager's address. The receiver yields the
    /// current value immediately and the latest value after each
    /// change; `None` means unenrolled.
    pub fn manager_address(&self) -> watch::Receiver<Option<String>> {
        self.manager_tx.subscribe()
    }

    /// Validation pipeline for incoming documents. Nothing is persisted
    /// until every check passes.
    fn validate(&self, doc: &EnrollmentDoc) -> Result<Enrollment, EnrollError> {
        if doc.manager_address.trim().is_empty() {
            return Err(EnrollError::InvalidDocument(
                "manager_address is empty".into(),
            ));
        }
        if doc.target_name.trim().is_empty() {
            return Err(EnrollError::InvalidDocument("target_name is empty".into()));
        }

        // 1. The chain must parse.
        let chain = pemchain::decode_certificates(&doc.certificate)
            .map_err(|e| EnrollError::InvalidDocument(format!("certificate: {e}")))?;
        let leaf = verify::leaf_info(&chain[0])
            .map_err(|e| EnrollError::InvalidDocument(format!("leaf: {e}")))?;

        // 2. The leaf must cover the name the manager assigned us.
        if !verify::san_matches_name(&leaf, &doc.target_name) {
            return Err(EnrollError::NameNotCovered(doc.target_name.clone()));
        }

        // 3. The leaf must certify our key, not one the manager minted.
        if leaf.spki_der != self.key.public_key_der() {
            return Err(EnrollError::SpkiMismatch);
        }

        // 4. The chain must verify against the supplied roots.
        let roots = pemchain::decode_certificates(&doc.root_cas)
            .map_err(|e| EnrollError::InvalidDocument(format!("root_cas: {e}")))?;
        verify::verify_chain(&chain[0], &chain[1..], &roots)?;

        Ok(Enrollment {
            target_name: doc.target_name.clone(),
            target_address: doc.target_address.clone(),
            manager_name: doc.manager_name.clone(),
            manager_address: doc.manager_address.clone(),
            cert_chain_pem: doc.certificate.clone(),
            root_cas_pem: doc.root_cas.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnrollmentStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CertSource for EnrollmentServer {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let store = self.lock();
        match store.current() {
            Some(e) => TlsIdentity {
                cert_chain_pem: e.cert_chain_pem.clone(),
                private_key_pem: self.key.private_key_pem().to_string(),
                roots_pem: e.root_cas_pem.clone(),
            }
            .checked(),
            None => Err(PkiError::NotEnrolled),
        }
    }
}

fn doc_from(enrollment: &Enrollment) -> EnrollmentDoc {
    EnrollmentDoc {
        target_name: enrollment.target_name.clone(),
        target_address: enrollment.target_address.clone(),
        manager_name: enrollment.manager_name.clone(),
        manager_address: enrollment.manager_address.clone(),
        certificate: enrollment.cert_chain_pem.clone(),
        root_cas: enrollment.root_cas_pem.clone(),
    }
}
