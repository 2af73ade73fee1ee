// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MockCloud Environment - on-demand mock cloud environments
//!
//! This crate runs per-user environments that emulate cloud services. An
//! environment declares a set of services; container-backed services
//! (databases, caches, brokers) are started at provision time, while the
//! emulated AWS APIs keep metadata only and create real backing objects
//! lazily on the first data-plane operation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 SDK clients / control API callers                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                  │ HTTP                                │ UDP
//!                  ▼                                     ▼
//! ┌──────────────────────────────────────────┐  ┌──────────────────────┐
//! │ Gateway (axum)                           │  │ DNS responder        │
//! │  EC2 Query │ SQS Query │ DynamoDB JSON   │  │ records of running   │
//! │  Lambda JSON/REST │ /api/v1 control API  │  │ environments         │
//! └──────────────────────────────────────────┘  └──────────────────────┘
//!          │                      │
//!          ▼                      ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   Emulators     │──►│    Materializer     │──►│    Provisioner      │
//! │ VPC SQS Dynamo  │   │ lazy backing objects│   │ lifecycle, ports    │
//! │ Lambda          │   └─────────────────────┘   └─────────────────────┘
//! └─────────────────┘                                  │            │
//!          │                                           ▼            ▼
//!          ▼                                  ┌──────────────┐ ┌──────────┐
//! ┌─────────────────┐                         │ Docker       │ │ OCI VCN  │
//! │ Billing engine  │                         │ (bollard)    │ │ API      │
//! └─────────────────┘                         └──────────────┘ └──────────┘
//!          │
//!          ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │               mockcloud-core persistence (PostgreSQL / SQLite)        │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Environment Status State Machine
//!
//! ```text
//!   provisioning ──► running ◄──► stopped
//!        │              │            │
//!        ▼              ▼            ▼
//!      error ──────► destroying ──► destroyed
//! ```
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`provisioner`]: Environment lifecycle and backing objects
//! - [`materializer`]: Lazy creation of backing objects for emulated resources
//! - [`emulators`]: EC2/VPC, SQS, DynamoDB and Lambda semantics
//! - [`gateway`]: HTTP routing, environment resolution, error shapes
//! - [`sandbox`]: Locked-down code execution
//! - [`dns_server`]: Authoritative UDP DNS
//! - [`billing`]: Metered charges and usage periods
//! - [`runtime`]: Embeddable runtime wiring it all together

/// Caller identity for the control API.
pub mod auth;

/// Metered billing over the credit store.
pub mod billing;

/// Background worker for billing reconciliation.
pub mod billing_worker;

/// Cloud network adapters (OCI, mock).
pub mod cloud_network;

/// Server configuration loaded from environment variables.
pub mod config;

/// Authoritative UDP DNS responder.
pub mod dns_server;

/// Emulated cloud services.
pub mod emulators;

/// Error types for environment operations.
pub mod error;

/// HTTP gateway and control API.
pub mod gateway;

/// Lazy creation of backing objects.
pub mod materializer;

/// Exclusive host port allocation.
pub mod port_allocator;

/// Environment lifecycle.
pub mod provisioner;

/// Container engine adapters (Docker, mock).
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Sandboxed code execution.
pub mod sandbox;

/// Service catalog.
pub mod services;

/// Background worker that stops idle environments.
pub mod shutdown_worker;

pub use error::{Error, Result};
pub use runtime::EnvironmentRuntime;
