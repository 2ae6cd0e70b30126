//! Caching decorator for certificate sources.
//!
//! `CachedSource` wraps an inner source, refreshing only when its
//! expiry policy fires and optionally mirroring the identity to disk so
//! a restarted process resumes with the same certificate instead of
//! minting a new one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::PkiError;
use crate::expiry::Expiry;
use crate::source::{CertSource, TlsIdentity};

const MIRROR_CHAIN_FILE: &str = "fullchain.pem";
const MIRROR_KEY_FILE: &str = "key.pem";
const MIRROR_ROOTS_FILE: &str = "roots.pem";

struct CacheState {
    expiry: Box<dyn Expiry>,
    cached: Option<TlsIdentity>,
    mirror: Option<PathBuf>,
    mirror_loaded: bool,
}

/// Wraps `inner`, returning a cached identity until `expiry` says it is
/// stale. When a refresh fails but a previous identity is still held,
/// the stale identity is returned rather than the error — a serving
/// process keeps its last known certificate through transient faults.
pub struct CachedSource {
    inner: Arc<dyn CertSource>,
    state: Mutex<CacheState>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn CertSource>, expiry: Box<dyn Expiry>) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState {
                expiry,
                cached: None,
                mirror: None,
                mirror_loaded: true,
            }),
        }
    }

    /// Like `new`, but persists each refreshed identity under `dir` and
    /// seeds the cache from it on first use. A missing or unreadable
    /// mirror is treated as an empty cache.
    pub fn with_mirror(
        inner: Arc<dyn CertSource>,
        expiry: Box<dyn Expiry>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState {
                expiry,
                cached: None,
                mirror: Some(dir.into()),
                mirror_loaded: false,
            }),
        }
    }
}

impl CertSource for CachedSource {
    fn certs(&self) -> Result<TlsIdentity, PkiError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !state.mirror_loaded {
            state.mirror_loaded = true;
            if let Some(dir) = state.mirror.clone() {
                match load_mirror(&dir) {
                    Ok(Some(identity)) => {
                        tracing::debug!(dir = %dir.display(), "loaded mirrored certificate");
                        state.cached = Some(identity);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "ignoring unreadable certificate mirror");
                    }
                }
            }
        }

        let needs_refresh = match &state.cached {
            None => true,
            Some(identity) => match identity.leaf_info() {
                Ok(leaf) => state.expiry.expired(Some(&leaf)),
                // An unparseable cached leaf is as good as no cache.
                Err(_) => true,
            },
        };

        if needs_refresh {
            match self.inner.certs() {
                Ok(identity) => {
                    if let Some(dir) = &state.mirror {
                        if let Err(e) = save_mirror(dir, &identity) {
                            tracing::warn!(dir = %dir.display(), error = %e, "failed to mirror certificate");
                        }
                    }
                    state.cached = Some(identity);
                }
                Err(e) => match &state.cached {
                    Some(_) => {
                        tracing::warn!(error = %e, "certificate refresh failed, serving stale identity");
                    }
                    None => return Err(e),
                },
            }
        }

        state
            .cached
            .clone()
            .ok_or(PkiError::EmptyIdentity)
            .and_then(TlsIdentity::checked)
    }
}

fn load_mirror(dir: &Path) -> Result<Option<TlsIdentity>, PkiError> {
    let chain_path = dir.join(MIRROR_CHAIN_FILE);
    if !chain_path.exists() {
        return Ok(None);
    }
    let cert_chain_pem = std::fs::read_to_string(&chain_path)?;
    let private_key_pem = std::fs::read_to_string(dir.join(MIRROR_KEY_FILE))?;
    let roots_path = dir.join(MIRROR_ROOTS_FILE);
    let roots_pem = if roots_path.exists() {
        std::fs::read_to_string(&roots_path)?
    } else {
        String::new()
    };
    Ok(Some(TlsIdentity {
        cert_chain_pem,
        private_key_pem,
        roots_pem,
    }))
}

fn save_mirror(dir: &Path, identity: &TlsIdentity) -> Result<(), PkiError> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(MIRROR_CHAIN_FILE), &identity.cert_chain_pem)?;
    write_key_file(&dir.join(MIRROR_KEY_FILE), &identity.private_key_pem)?;
    std::fs::write(dir.join(MIRROR_ROOTS_FILE), &identity.roots_pem)?;
    Ok(())
}

#[cfg(unix)]
fn write_key_file(path: &Path, pem: &str) -> Result<(), PkiError> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, pem: &str) -> Result<(), PkiError> {
    std::fs::write(path, pem)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::{After, Manually};
    use crate::source::testutil::{test_identity, CountingSource};
    use chrono::Duration;

    #[test]
    fn first_call_refreshes_then_serves_from_cache() {
        let inner = Arc::new(CountingSource::ok(test_identity("cache-a")));
        let cached = CachedSource::new(inner.clone(), Box::new(After::new(Duration::hours(1))));

        cached.certs().unwrap();
        cached.certs().unwrap();
        cached.certs().unwrap();
        assert_eq!(inner.call_count(), 1);
    }

    #[test]
    fn expired_policy_forces_one_refresh() {
        let inner = Arc::new(CountingSource::ok(test_identity("cache-b")));
        let (policy, trigger) = Manually::new();
        let cached = CachedSource::new(inner.clone(), Box::new(policy));

        cached.certs().unwrap();
        assert_eq!(inner.call_count(), 1);

        trigger.trigger();
        cached.certs().unwrap();
        cached.certs().unwrap();
        assert_eq!(inner.call_count(), 2);
    }

    #[test]
    fn stale_identity_survives_refresh_failure() {
        let inner = Arc::new(CountingSource::ok(test_identity("cache-stale")));
        let (policy, trigger) = Manually::new();
        let cached = CachedSource::new(inner.clone(), Box::new(policy));

        let first = cached.certs().unwrap();

        *inner.result.lock().unwrap() = Err("upstream down".into());
        trigger.trigger();
        let second = cached.certs().unwrap();
        assert_eq!(second.cert_chain_pem, first.cert_chain_pem);
    }

    #[test]
    fn failure_with_no_cache_is_an_error() {
        let inner = Arc::new(CountingSource::failing("never worked"));
        let cached = CachedSource::new(inner, Box::new(After::new(Duration::hours(1))));
        assert!(cached.certs().is_err());
    }

    #[test]
    fn mirror_persists_across_instances() {
        let dir = cohort_common::test::scratch_dir("cert-mirror");
        let identity = test_identity("mirrored");

        let writer = CachedSource::with_mirror(
            Arc::new(CountingSource::ok(identity.clone())),
            Box::new(After::new(Duration::hours(1))),
            &dir,
        );
        writer.certs().unwrap();
        assert!(dir.join(MIRROR_CHAIN_FILE).exists());

        // A fresh instance with a failing inner source still serves the
        // mirrored identity: the policy has not fired yet.
        let failing = Arc::new(CountingSource::failing("offline"));
        let reader = CachedSource::with_mirror(
            failing.clone(),
            Box::new(After::new(Duration::hours(1))),
            &dir,
        );
        let got = reader.certs().unwrap();
        assert_eq!(got.cert_chain_pem, identity.cert_chain_pem);
        assert_eq!(failing.call_count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn mirrored_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = cohort_common::test::scratch_dir("cert-mirror-perms");
        let cached = CachedSource::with_mirror(
            Arc::new(CountingSource::ok(test_identity("perms"))),
            Box::new(After::new(Duration::hours(1))),
            &dir,
        );
        cached.certs().unwrap();

        let mode = std::fs::metadata(dir.join(MIRROR_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
