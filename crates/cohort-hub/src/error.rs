//! Hub domain error types.

use cohort_common::error::ErrorCode;
use cohort_enroll::EnrollError;
use cohort_pki::PkiError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error("no node registered at '{0}'")]
    NotFound(String),

    #[error("a node is already registered at '{0}'")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("enrollment aborted: {0}")]
    Aborted(String),

    #[error("state diverged: {0}")]
    DataLoss(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&HubError> for ErrorCode {
    fn from(e: &HubError) -> Self {
        match e {
            HubError::Enroll(inner) => inner.into(),
            HubError::Pki(inner) => inner.into(),
            HubError::NotFound(_) => ErrorCode::NotFound,
            HubError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            HubError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            HubError::Aborted(_) => ErrorCode::Aborted,
            HubError::DataLoss(_) => ErrorCode::DataLoss,
            HubError::Io(_) => ErrorCode::IoError,
        }
    }
}
