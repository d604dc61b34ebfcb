//! Remote client for ClientSync.
//!
//! This module provides a trait-based interface over the remote service that
//! owns the three datasets, an HTTP implementation and an in-memory one.
//!
//! # Design Principles
//! - Every fetch either yields a structured payload or a categorized error
//!   (network, auth, HTTP status, decode) so callers can tag failures.
//! - Configuration is read on every call; nothing is cached except the
//!   bearer token.

pub mod client;
pub mod memory;
pub mod provider;

pub use client::ApiClient;
pub use memory::MemorySource;
pub use provider::RemoteSource;
