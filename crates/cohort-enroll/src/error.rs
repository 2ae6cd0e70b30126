//! Enrollment domain error types.

use cohort_common::error::ErrorCode;
use cohort_pki::PkiError;

#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error("node is not enrolled")]
    NotEnrolled,

    #[error("node is already enrolled")]
    AlreadyEnrolled,

    #[error("invalid enrollment document: {0}")]
    InvalidDocument(String),

    #[error("certificate does not certify this node's key")]
    SpkiMismatch,

    #[error("certificate does not cover node name '{0}'")]
    NameNotCovered(String),

    #[error("node is enrolled with '{actual}', not '{expected}'")]
    NotEnrolledWithUs { expected: String, actual: String },

    #[error("peer presented no certificate during handshake")]
    NoPeerCertificate,

    #[error("presented certificate does not match the pinned fingerprint")]
    PinMismatch,

    #[error("enrollment removed but rollback failed: {0}")]
    RollbackFailed(String),

    #[error("remote returned {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&EnrollError> for ErrorCode {
    fn from(e: &EnrollError) -> Self {
        match e {
            EnrollError::Pki(pki) => pki.into(),
            // The enrollment document API treats "not enrolled" as an
            // absent resource.
            EnrollError::NotEnrolled => ErrorCode::NotFound,
            EnrollError::AlreadyEnrolled => ErrorCode::AlreadyExists,
            EnrollError::InvalidDocument(_)
            | EnrollError::SpkiMismatch
            | EnrollError::NameNotCovered(_) => ErrorCode::InvalidArgument,
            EnrollError::NotEnrolledWithUs { .. } => ErrorCode::FailedPrecondition,
            EnrollError::PinMismatch => ErrorCode::PermissionDenied,
            EnrollError::NoPeerCertificate | EnrollError::Transport(_) => ErrorCode::Unavailable,
            EnrollError::RollbackFailed(_) => ErrorCode::DataLoss,
            EnrollError::Remote { code, .. } => *code,
            EnrollError::Io(_) => ErrorCode::IoError,
        }
    }
}
