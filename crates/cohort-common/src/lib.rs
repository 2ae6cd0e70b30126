//! Shared plumbing for the cohort control plane.
//!
//! Error codes, JSON persistence, and data-directory paths used by
//! every domain crate. Nothing in here knows about certificates or
//! enrollment — it is deliberately boring.

pub mod error;
pub mod paths;
pub mod persist;
