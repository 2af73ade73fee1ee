// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for mockcloud-environment.

use thiserror::Error;

/// Environment server errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Container engine failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Cloud network API failed.
    #[error("Network error: {0}")]
    Network(#[from] crate::cloud_network::NetworkError),

    /// Environment lifecycle operation failed.
    #[error("Provisioning error: {0}")]
    Provision(#[from] crate::provisioner::ProvisionError),

    /// Emulated API action failed.
    #[error("Emulator error: {0}")]
    Emulator(#[from] crate::emulators::EmulatorError),

    /// Sandboxed execution failed.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    /// Billing operation failed.
    #[error("Billing error: {0}")]
    Billing(#[from] crate::billing::BillingError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] mockcloud_core::CoreError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;
