use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by the enrollment and hub APIs on both sides of the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    PermissionDenied,
    NotEnrolled,
    Unavailable,
    Aborted,
    DataLoss,
    IoError,
    Internal,
    Unknown,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::AlreadyExists | Self::Aborted => 409,
            Self::FailedPrecondition | Self::NotEnrolled => 412,
            Self::Unavailable => 503,
            Self::DataLoss | Self::IoError | Self::Internal | Self::Unknown => 500,
        }
    }

    /// Best-effort reverse mapping for clients that only see a status
    /// line. Codes that share a status map to the more common one.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            412 => Self::NotEnrolled,
            503 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::InvalidArgument).unwrap(),
            "invalid_argument"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NotEnrolled).unwrap(),
            "not_enrolled"
        );
        assert_eq!(serde_json::to_value(ErrorCode::DataLoss).unwrap(), "data_loss");
    }

    /// Exhaustive mapping test. Adding a new ErrorCode variant forces a
    /// compile error here until the mapping is explicitly verified.
    #[test]
    fn all_error_code_variants_map_to_expected_http_status() {
        let cases: Vec<(ErrorCode, u16)> = vec![
            (ErrorCode::InvalidArgument, 400),
            (ErrorCode::PermissionDenied, 403),
            (ErrorCode::NotFound, 404),
            (ErrorCode::AlreadyExists, 409),
            (ErrorCode::Aborted, 409),
            (ErrorCode::FailedPrecondition, 412),
            (ErrorCode::NotEnrolled, 412),
            (ErrorCode::Unavailable, 503),
            (ErrorCode::DataLoss, 500),
            (ErrorCode::IoError, 500),
            (ErrorCode::Internal, 500),
            (ErrorCode::Unknown, 500),
        ];
        for (code, expected) in &cases {
            assert_eq!(
                code.http_status(),
                *expected,
                "{code:?} should map to HTTP {expected}"
            );
        }
    }

    #[test]
    fn from_http_status_round_trips_common_codes() {
        for code in [
            ErrorCode::InvalidArgument,
            ErrorCode::PermissionDenied,
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::Unavailable,
        ] {
            assert_eq!(ErrorCode::from_http_status(code.http_status()), code);
        }
    }

    #[test]
    fn from_http_status_unknown_falls_back() {
        assert_eq!(ErrorCode::from_http_status(418), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_http_status(500), ErrorCode::Unknown);
    }
}
