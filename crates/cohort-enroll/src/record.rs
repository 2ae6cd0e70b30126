//! On-disk enrollment record.
//!
//! Layout under the enrollment directory:
//!
//! ```text
//! enrollment.json        metadata (names and addresses)
//! root-ca.cert.pem       trust roots the chain verifies against
//! enrollment.cert.pem    leaf-first certificate chain
//! ```
//!
//! Certificate files are written before the metadata file, and the
//! metadata file is removed first on delete: its presence marks a
//! complete record, so a crash mid-operation leaves the store either
//! enrolled or unenrolled, never torn.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cohort_common::persist;

use crate::error::EnrollError;

pub const METADATA_FILE: &str = "enrollment.json";
pub const ROOT_CA_FILE: &str = "root-ca.cert.pem";
pub const CERT_FILE: &str = "enrollment.cert.pem";

/// Bounded re-save attempts when removing certificate files fails
/// after the metadata file is already gone.
const ROLLBACK_ATTEMPTS: usize = 3;

/// A node's accepted enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub target_name: String,
    pub target_address: String,
    pub manager_name: String,
    pub manager_address: String,
    /// Leaf-first PEM chain minted by the manager for this node's key.
    pub cert_chain_pem: String,
    /// PEM trust roots.
    pub root_cas_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    target_name: String,
    target_address: String,
    manager_name: String,
    manager_address: String,
}

/// Disk-backed holder of at most one enrollment.
pub struct EnrollmentStore {
    dir: PathBuf,
    current: Option<Enrollment>,
}

impl EnrollmentStore {
    /// Load an existing record or start unenrolled. A missing directory
    /// or metadata file means unenrolled; unreadable or unparseable
    /// files are fatal, not silently discarded.
    pub fn load_or_create(dir: impl Into<PathBuf>) -> Result<Self, EnrollError> {
        let dir = dir.into();
        let metadata: Option<Metadata> = persist::read_json_if_exists(&dir.join(METADATA_FILE))?;
        let current = match metadata {
            None => None,
            Some(m) => {
                let cert_chain_pem = std::fs::read_to_string(dir.join(CERT_FILE))?;
                let root_cas_pem = std::fs::read_to_string(dir.join(ROOT_CA_FILE))?;
                Some(Enrollment {
                    target_name: m.target_name,
                    target_address: m.target_address,
                    manager_name: m.manager_name,
                    manager_address: m.manager_address,
                    cert_chain_pem,
                    root_cas_pem,
                })
            }
        };
        Ok(Self { dir, current })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current(&self) -> Option<&Enrollment> {
        self.current.as_ref()
    }

    /// Persist an enrollment, then flip the in-memory state. A failed
    /// write leaves the previous state intact.
    pub fn save(&mut self, enrollment: Enrollment) -> Result<(), EnrollError> {
        self.write_files(&enrollment)?;
        self.current = Some(enrollment);
        Ok(())
    }

    /// Remove the record from disk and memory, returning the removed
    /// enrollment. If file removal fails partway, the snapshot is
    /// re-saved; if that also fails repeatedly the store is in an
    /// inconsistent state and reports data loss.
    pub fn delete(&mut self) -> Result<Enrollment, EnrollError> {
        let snapshot = self.current.clone().ok_or(EnrollError::NotEnrolled)?;

        // Metadata first: once it is gone the record no longer exists.
        if let Err(e) = remove_if_exists(&self.dir.join(METADATA_FILE)) {
            return Err(EnrollError::Io(e));
        }

        let leftover = remove_if_exists(&self.dir.join(CERT_FILE))
            .and_then(|()| remove_if_exists(&self.dir.join(ROOT_CA_FILE)));

        if let Err(remove_err) = leftover {
            for attempt in 1..=ROLLBACK_ATTEMPTS {
                match self.write_files(&snapshot) {
                    Ok(()) => {
                        tracing::warn!(
                            error = %remove_err,
                            "enrollment delete failed, record restored"
                        );
                        return Err(EnrollError::Io(remove_err));
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "enrollment rollback attempt failed");
                    }
                }
            }
            self.current = None;
            return Err(EnrollError::RollbackFailed(format!(
                "remove failed ({remove_err}) and {ROLLBACK_ATTEMPTS} restore attempts failed"
            )));
        }

        self.current = None;
        Ok(snapshot)
    }

    fn write_files(&self, enrollment: &Enrollment) -> Result<(), EnrollError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(CERT_FILE), &enrollment.cert_chain_pem)?;
        std::fs::write(self.dir.join(ROOT_CA_FILE), &enrollment.root_cas_pem)?;
        // Metadata last: it marks the record complete.
        persist::write_json_pretty(
            &self.dir.join(METADATA_FILE),
            &Metadata {
                target_name: enrollment.target_name.clone(),
                target_address: enrollment.target_address.clone(),
                manager_name: enrollment.manager_name.clone(),
                manager_address: enrollment.manager_address.clone(),
            },
        )?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
