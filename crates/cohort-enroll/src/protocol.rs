//! Wire types for the node enrollment API.
//!
//! One resource, `/v1/enrollment`, manipulated with plain HTTP verbs:
//! `GET` reads the current enrollment, `POST` creates it, `PUT` renews
//! it, `DELETE` removes it. Errors are `{ "error": <code>, "message" }`.

use cohort_common::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// The enrollment document exchanged between a manager and a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentDoc {
    /// Logical name the manager assigned to the node.
    pub target_name: String,
    /// Address the manager reaches the node at.
    pub target_address: String,
    /// Logical name of the enrolling manager.
    pub manager_name: String,
    /// Address the node can reach the manager at.
    pub manager_address: String,
    /// Leaf-first PEM certificate chain minted for the node's key.
    pub certificate: String,
    /// PEM concatenation of the trust roots the chain verifies against.
    pub root_cas: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}
