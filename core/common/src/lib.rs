//! Common utilities and types shared across ClientSync modules.
//!
//! This module provides the error taxonomy, the dataset vocabulary and the
//! configuration gateway used by the remote client, the sync core and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{read_config, ConfigData, ConfigSource, Credentials, FileConfig, MemoryConfig};
pub use error::{Error, ErrorCategory, Result};
pub use types::{DatasetKind, Payload, PerDataset, SNAPSHOT_EXTENSION};
