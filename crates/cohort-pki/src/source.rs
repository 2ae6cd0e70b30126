//! Composable certificate sources.
//!
//! A `CertSource` yields the current TLS identity for a process. The
//! variants here compose by decoration, never by inheritance: a
//! filesystem reader or self-signing minter is typically wrapped in a
//! `CachedSource` (see `cached`), contributed to a process-wide
//! `SourceSet`, and consumed by every TLS listener and dialer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::ca;
use crate::error::PkiError;
use crate::keys::NodeKeyPair;
use crate::pemchain;
use crate::verify::{self, LeafInfo};

/// A complete TLS identity: leaf-first certificate chain, the matching
/// private key, and the trust roots that validate peers.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// Sequential PEM `CERTIFICATE` blocks, leaf first.
    pub cert_chain_pem: String,
    /// PKCS#8 PEM private key matching the leaf.
    pub private_key_pem: String,
    /// Bare concatenation of PEM `CERTIFICATE` blocks, no ordering.
    pub roots_pem: String,
}

impl TlsIdentity {
    /// DER bytes of the leaf certificate.
    pub fn leaf_der(&self) -> Result<Vec<u8>, PkiError> {
        pemchain::first_certificate(&self.cert_chain_pem)
    }

    /// Parsed view of the leaf certificate.
    pub fn leaf_info(&self) -> Result<LeafInfo, PkiError> {
        verify::leaf_info(&self.leaf_der()?)
    }

    /// DER bytes of every root certificate.
    pub fn roots_der(&self) -> Result<Vec<Vec<u8>>, PkiError> {
        pemchain::decode_certificates(&self.roots_pem)
    }

    /// Reject identities with no certificate material. Every source
    /// runs its output through this before returning.
    pub fn checked(self) -> Result<Self, PkiError> {
        if self.cert_chain_pem.trim().is_empty() {
            return Err(PkiError::EmptyIdentity);
        }
        Ok(self)
    }
}

/// Supplies the current certificate identity for TLS configuration.
///
/// Implementations must be cheap to share (`Arc<dyn CertSource>`) and
/// safe to call from concurrent TLS handshakes.
pub trait CertSource: Send + Sync {
    fn certs(&self) -> Result<TlsIdentity, PkiError>;
}

/// A fixed, already-computed identity. Used in tests and for static
/// configuration.
pub struct DirectSource {
    identity: TlsIdentity,
}

impl DirectSource {
    pub fn new(identity: TlsIdentity) -> Self {
        Self { identity }
    }
}

impl CertSource for DirectSource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        self.identity.clone().checked()
    }
}

/// Reads cert, key, and optional roots from fixed paths on every call.
/// No caching — wrap in a `CachedSource` for anything hot.
pub struct FsSource {
    cert_path: PathBuf,
    key_path: PathBuf,
    roots_path: Option<PathBuf>,
}

impl FsSource {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        roots_path: Option<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            roots_path,
        }
    }
}

impl CertSource for FsSource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let cert_chain_pem = std::fs::read_to_string(&self.cert_path).map_err(|e| {
            PkiError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", self.cert_path.display()),
            ))
        })?;
        let private_key_pem = std::fs::read_to_string(&self.key_path).map_err(|e| {
            PkiError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", self.key_path.display()),
            ))
        })?;
        let roots_pem = match &self.roots_path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                PkiError::Io(std::io::Error::new(
                    e.kind(),
                    format!("{}: {e}", path.display()),
                ))
            })?,
            None => String::new(),
        };
        TlsIdentity {
            cert_chain_pem,
            private_key_pem,
            roots_pem,
        }
        .checked()
    }
}

/// Mints a fresh self-signed certificate on every call. The fallback
/// identity of an unenrolled node — wrap in a `CachedSource` so the
/// mint only happens on rotation.
pub struct SelfSignedSource {
    name: String,
    sans: Vec<String>,
    key: Arc<NodeKeyPair>,
}

impl SelfSignedSource {
    pub fn new(name: impl Into<String>, sans: Vec<String>, key: Arc<NodeKeyPair>) -> Self {
        Self {
            name: name.into(),
            sans,
            key,
        }
    }
}

impl CertSource for SelfSignedSource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        ca::create_self_signed_certificate(&self.name, &self.key, &self.sans)?.checked()
    }
}

/// Defers construction of an inner source until first use, exactly
/// once. Construction errors are cached and replayed.
pub struct LazySource {
    ctor: std::sync::Mutex<Option<Box<dyn FnOnce() -> Result<Arc<dyn CertSource>, PkiError> + Send>>>,
    inner: OnceLock<Result<Arc<dyn CertSource>, String>>,
}

impl LazySource {
    pub fn new<F>(ctor: F) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn CertSource>, PkiError> + Send + 'static,
    {
        Self {
            ctor: std::sync::Mutex::new(Some(Box::new(ctor))),
            inner: OnceLock::new(),
        }
    }
}

impl CertSource for LazySource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let inner = self.inner.get_or_init(|| {
            let ctor = self
                .ctor
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .expect("constructor runs exactly once");
            ctor().map_err(|e| e.to_string())
        });
        match inner {
            Ok(source) => source.certs(),
            Err(msg) => Err(PkiError::Lazy(msg.clone())),
        }
    }
}

/// Token returned by `SourceSet::append`, used to remove the source
/// later without index bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceToken(u64);

/// An ordered, mutable set of sources contributed by independently
/// lifecycled subsystems. `certs()` snapshots the current members and
/// returns the first success; mutation never blocks in-flight
/// handshakes beyond the snapshot copy.
#[derive(Default)]
pub struct SourceSet {
    members: RwLock<Vec<(SourceToken, Arc<dyn CertSource>)>>,
    next_id: AtomicU64,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source at the end of the order.
    pub fn append(&self, source: Arc<dyn CertSource>) -> SourceToken {
        let token = SourceToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.members
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((token, source));
        token
    }

    /// Remove a previously appended source. Returns whether it was
    /// present.
    pub fn remove(&self, token: SourceToken) -> bool {
        let mut members = self
            .members
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = members.len();
        members.retain(|(t, _)| *t != token);
        members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CertSource for SourceSet {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let snapshot: Vec<Arc<dyn CertSource>> = self
            .members
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        if snapshot.is_empty() {
            return Err(PkiError::AllSourcesFailed("no sources registered".into()));
        }

        let mut failures = Vec::new();
        for source in snapshot {
            match source.certs() {
                Ok(identity) => return Ok(identity),
                Err(e) => failures.push(e.to_string()),
            }
        }
        Err(PkiError::AllSourcesFailed(failures.join("; ")))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls and delegates to a fixed identity or error.
    pub struct CountingSource {
        pub calls: AtomicUsize,
        pub result: std::sync::Mutex<Result<TlsIdentity, String>>,
    }

    impl CountingSource {
        pub fn ok(identity: TlsIdentity) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: std::sync::Mutex::new(Ok(identity)),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: std::sync::Mutex::new(Err(message.to_string())),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CertSource for CountingSource {
        fn certs(&self) -> Result<TlsIdentity, PkiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.result.lock().unwrap() {
                Ok(identity) => Ok(identity.clone()),
                Err(msg) => Err(PkiError::Certificate(msg.clone())),
            }
        }
    }

    pub fn test_identity(name: &str) -> TlsIdentity {
        let key = NodeKeyPair::generate();
        ca::create_self_signed_certificate(name, &key, &[]).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{test_identity, CountingSource};
    use super::*;

    #[test]
    fn direct_source_returns_identity() {
        let identity = test_identity("direct");
        let source = DirectSource::new(identity.clone());
        let got = source.certs().unwrap();
        assert_eq!(got.cert_chain_pem, identity.cert_chain_pem);
    }

    #[test]
    fn empty_identity_is_normalized_to_error() {
        let source = DirectSource::new(TlsIdentity {
            cert_chain_pem: String::new(),
            private_key_pem: String::new(),
            roots_pem: String::new(),
        });
        assert!(matches!(source.certs(), Err(PkiError::EmptyIdentity)));
    }

    #[test]
    fn fs_source_reads_files_every_call() {
        let dir = cohort_common::test::scratch_dir("fs-source");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        let first = test_identity("fs-a");
        std::fs::write(&cert_path, &first.cert_chain_pem).unwrap();
        std::fs::write(&key_path, &first.private_key_pem).unwrap();

        let source = FsSource::new(&cert_path, &key_path, None);
        assert_eq!(source.certs().unwrap().cert_chain_pem, first.cert_chain_pem);

        // Replace the files; the source sees the new content immediately.
        let second = test_identity("fs-b");
        std::fs::write(&cert_path, &second.cert_chain_pem).unwrap();
        std::fs::write(&key_path, &second.private_key_pem).unwrap();
        assert_eq!(source.certs().unwrap().cert_chain_pem, second.cert_chain_pem);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fs_source_missing_file_is_io_error() {
        let dir = cohort_common::test::scratch_dir("fs-missing");
        let source = FsSource::new(dir.join("none.pem"), dir.join("none.key"), None);
        assert!(matches!(source.certs(), Err(PkiError::Io(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn self_signed_source_mints_fresh_cert_per_call() {
        let key = Arc::new(NodeKeyPair::generate());
        let source = SelfSignedSource::new("ac-09", vec![], key.clone());

        let a = source.certs().unwrap();
        let b = source.certs().unwrap();
        // Fresh serial each mint, same key.
        assert_ne!(a.leaf_der().unwrap(), b.leaf_der().unwrap());
        assert_eq!(
            a.leaf_info().unwrap().spki_der,
            key.public_key_der()
        );
    }

    #[test]
    fn lazy_source_constructs_exactly_once() {
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();
        let identity = test_identity("lazy");

        let lazy = LazySource::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(DirectSource::new(identity.clone())) as Arc<dyn CertSource>)
        });

        lazy.certs().unwrap();
        lazy.certs().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lazy_source_replays_construction_error() {
        let lazy = LazySource::new(|| Err(PkiError::Certificate("boom".into())));
        assert!(matches!(lazy.certs(), Err(PkiError::Lazy(_))));
        assert!(matches!(lazy.certs(), Err(PkiError::Lazy(_))));
    }

    #[test]
    fn source_set_returns_first_success() {
        let set = SourceSet::new();
        set.append(Arc::new(CountingSource::failing("first down")));
        let winner = Arc::new(CountingSource::ok(test_identity("winner")));
        set.append(winner.clone());
        let never = Arc::new(CountingSource::ok(test_identity("never")));
        set.append(never.clone());

        set.certs().unwrap();
        assert_eq!(winner.call_count(), 1);
        assert_eq!(never.call_count(), 0);
    }

    #[test]
    fn source_set_aggregates_all_errors() {
        let set = SourceSet::new();
        set.append(Arc::new(CountingSource::failing("alpha failed")));
        set.append(Arc::new(CountingSource::failing("beta failed")));

        match set.certs() {
            Err(PkiError::AllSourcesFailed(msg)) => {
                assert!(msg.contains("alpha failed"));
                assert!(msg.contains("beta failed"));
            }
            other => panic!("expected AllSourcesFailed, got {other:?}"),
        }
    }

    #[test]
    fn source_set_empty_is_an_error() {
        let set = SourceSet::new();
        assert!(matches!(set.certs(), Err(PkiError::AllSourcesFailed(_))));
    }

    #[test]
    fn source_set_append_and_remove() {
        let set = SourceSet::new();
        let token = set.append(Arc::new(CountingSource::failing("gone")));
        let keep = set.append(Arc::new(CountingSource::ok(test_identity("keep"))));
        assert_eq!(set.len(), 2);

        assert!(set.remove(token));
        assert!(!set.remove(token));
        assert_eq!(set.len(), 1);
        set.certs().unwrap();

        assert!(set.remove(keep));
        assert!(set.is_empty());
    }
}
