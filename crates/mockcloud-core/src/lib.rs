// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mockcloud Core - Durable State for Mock Cloud Environments
//!
//! This crate owns everything the platform persists: environments, the
//! backing-handle arena that records which real objects realize them, host
//! port allocations, usage periods and metered billing, and the state of
//! every emulated resource (VPC, DynamoDB, SQS, Lambda, DNS).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   mockcloud-environment                      │
//! │   control API · protocol gateway · DNS · workers · sandbox   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ dyn Persistence
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  mockcloud-core (this crate)                 │
//! │        SqlitePersistence        PostgresPersistence          │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                     SQLite / PostgreSQL
//! ```
//!
//! # Concurrency
//!
//! The server runs many request handlers and background workers against one
//! store. No guarantee relies on an in-process lock; each one is a unique
//! index or a conditional update, so several server processes may share a
//! PostgreSQL database. See [`persistence`] for the full list.
//!
//! # Backends
//!
//! | Backend | Constructor | Migrations |
//! |---------|-------------|------------|
//! | SQLite | [`SqlitePersistence::from_path`] | run on open |
//! | PostgreSQL | [`PostgresPersistence::connect`] | run on connect |

#![deny(missing_docs)]

/// Error types for persistence operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Persistence trait, records and backends.
pub mod persistence;

pub use error::{CoreError, Result};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
