//! REST API module for external integrations
//!
//! Provides an HTTP API for inspecting CassandraAccessPolicies and
//! requesting an immediate reconciliation.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server, DEFAULT_BIND_ADDRESS};
