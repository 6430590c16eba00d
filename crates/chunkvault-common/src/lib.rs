//! chunkvault common - shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! structures used by the storage engine, the disk dispatcher and the node
//! binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AllocationPolicy, Config, DispatcherConfig, LoggingConfig, MAX_DEVICES, MAX_DISK_THREADS,
    MonitorConfig, NodeConfig, StorageUnitConfig,
};
pub use error::{Error, Result};
pub use types::*;
