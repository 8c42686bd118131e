//! Upstream cluster management core of the mesh sidecar.
//!
//! A cluster is a named group of upstream hosts. This crate builds clusters
//! from configuration, keeps their membership and healthy subset current,
//! selects a host per request and carries the per cluster circuit breaker
//! and client TLS state.

pub mod config;
pub mod core;
pub mod upstream;
