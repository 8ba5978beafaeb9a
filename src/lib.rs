//! Lattice harness - Kubernetes end-to-end test step runtime
//!
//! The harness gives test suites the two things every step needs: a client
//! that reconciles declared objects against a live cluster, and a runner for
//! the shell commands a step drives the cluster with.
//!
//! # Modules
//!
//! - [`client`] - Retrying object client, upsert, CRD and deletion waits
//! - [`command`] - Command specs, argv construction and process execution
//! - [`manifest`] - Multi-document YAML loading
//! - [`scheme`] - Registry decoding known kinds into typed objects
//! - [`object`] - Helpers over untyped objects
//! - [`context`] - Cancellable deadline contexts
//! - [`retry`] / [`polling`] - Retry and poll loops bounded by a context
//! - [`config`] - Suite configuration and process environment
//! - [`logging`] - Per-step output buffering
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the harness

#![deny(missing_docs)]

pub mod client;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod object;
pub mod polling;
pub mod retry;
pub mod scheme;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Process-wide setup: registers the built-in kinds and installs the default
/// tracing subscriber unless one is already installed.
pub fn init() -> &'static scheme::Scheme {
    // An embedding test binary may have installed its own subscriber
    let _ = telemetry::init_tracing();
    scheme::init()
}
