//! Cohort enrollment — the trust bootstrap between a manager and its
//! nodes.
//!
//! The node side (`server`, `http`, `record`) holds at most one
//! enrollment on disk and serves it over `/v1/enrollment`. The manager
//! side (`controller`, `tofu`) dials a node it has never met, captures
//! the certificate the node presents, mints a cohort certificate for
//! the node's key, and pushes it back — trust on first use.

pub mod controller;
pub mod error;
pub mod http;
pub mod protocol;
pub mod record;
pub mod server;
pub mod tofu;

pub use controller::Controller;
pub use error::EnrollError;
pub use protocol::EnrollmentDoc;
pub use server::EnrollmentServer;
