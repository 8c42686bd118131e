//! Shared building blocks of the cluster core.

pub mod error;

pub use error::{ClusterError, ClusterResult, ErrorContext};
