//! Cohort hub — the manager that enrolls nodes and tracks them.
//!
//! The hub owns a CA identity, drives the enrollment controller against
//! node APIs, and records every enrolled node in a persistent registry
//! whose mutations stream to subscribers.

pub mod error;
pub mod http;
pub mod ops;
pub mod registry;

pub use error::HubError;
pub use ops::Hub;
pub use registry::{HubNode, NodeChange, Registry};
