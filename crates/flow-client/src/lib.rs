//! Flow Client
//!
//! HTTP implementation of `flow_core::WorkflowBackend` for the orchestrator
//! API: starting, polling and controlling executions, searching past runs,
//! and fetching or saving workflow versions and tools.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flow_client::{HttpBackend, HttpBackendConfig};
//!
//! let backend = HttpBackend::new(
//!     HttpBackendConfig::new("https://flows.example.com").with_token(token),
//! )?;
//! let driver = flow_core::FlowDriver::new(session, Arc::new(backend));
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{HttpBackend, TEAM_HEADER};
pub use config::HttpBackendConfig;
pub use error::ClientError;
