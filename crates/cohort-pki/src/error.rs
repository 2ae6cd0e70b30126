//! PKI domain error types.

use cohort_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("PEM decode error: {0}")]
    Pem(String),

    #[error("chain verification failed: {0}")]
    Verification(String),

    #[error("node is not enrolled")]
    NotEnrolled,

    #[error("source produced an empty certificate chain")]
    EmptyIdentity,

    #[error("all sources failed: {0}")]
    AllSourcesFailed(String),

    #[error("deferred source construction failed: {0}")]
    Lazy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&PkiError> for ErrorCode {
    fn from(e: &PkiError) -> Self {
        match e {
            PkiError::Certificate(_) | PkiError::Pem(_) | PkiError::Verification(_) => {
                ErrorCode::InvalidArgument
            }
            PkiError::NotEnrolled => ErrorCode::NotEnrolled,
            PkiError::Key(_)
            | PkiError::EmptyIdentity
            | PkiError::AllSourcesFailed(_)
            | PkiError::Lazy(_) => ErrorCode::Internal,
            PkiError::Io(_) => ErrorCode::IoError,
        }
    }
}
