// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port allocation for backing containers.
//!
//! Ports come from a fixed inclusive range. There is no in-process lock: an
//! allocation is a plain INSERT guarded by a partial unique index on active
//! ports, and a lost race shows up as a unique violation, after which the
//! allocator re-reads the active set and tries the next candidate.

use std::sync::Arc;

use chrono::Utc;
use mockcloud_core::{CoreError, Persistence};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The range is full or every retry lost a race.
    #[error("No free port in {lo}-{hi}")]
    PortsExhausted {
        /// Low end of the range.
        lo: i32,
        /// High end of the range.
        hi: i32,
    },

    /// The store failed.
    #[error("Port store error: {0}")]
    Core(#[from] CoreError),
}

/// Configuration for the allocator.
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// First port of the range.
    pub lo: i32,
    /// Last port of the range.
    pub hi: i32,
    /// Attempts before giving up.
    pub max_retries: u32,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            lo: 30000,
            hi: 40000,
            max_retries: 100,
        }
    }
}

/// Hands out exclusive host ports.
#[derive(Clone)]
pub struct PortAllocator {
    persistence: Arc<dyn Persistence>,
    config: PortAllocatorConfig,
}

impl PortAllocator {
    /// Create an allocator over `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>, config: PortAllocatorConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }

    /// The configured range.
    pub fn range(&self) -> (i32, i32) {
        (self.config.lo, self.config.hi)
    }

    /// Claim the lowest free port for `service_name` in `environment_id`.
    pub async fn allocate(
        &self,
        environment_id: &str,
        service_name: &str,
    ) -> Result<u16, AllocatorError> {
        let PortAllocatorConfig { lo, hi, max_retries } = self.config;
        let exhausted = || AllocatorError::PortsExhausted { lo, hi };

        for attempt in 0..max_retries {
            let active = self.persistence.list_active_ports(lo, hi).await?;
            let Some(candidate) = lowest_free(lo, hi, &active) else {
                return Err(exhausted());
            };

            match self
                .persistence
                .insert_port_allocation(candidate, environment_id, service_name, Utc::now())
                .await
            {
                Ok(()) => {
                    debug!(
                        environment_id = %environment_id,
                        service = %service_name,
                        port = candidate,
                        attempt,
                        "Port allocated"
                    );
                    return u16::try_from(candidate).map_err(|_| exhausted());
                }
                Err(e) if e.is_unique_violation() => {
                    debug!(port = candidate, attempt, "Port taken concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            environment_id = %environment_id,
            retries = max_retries,
            "Port allocation gave up after retries"
        );
        Err(exhausted())
    }

    /// Release one port. Returns false when it was not active.
    pub async fn release(&self, port: u16) -> Result<bool, AllocatorError> {
        Ok(self
            .persistence
            .release_port(i32::from(port), Utc::now())
            .await?)
    }

    /// Release every active port of an environment.
    pub async fn release_environment(&self, environment_id: &str) -> Result<u64, AllocatorError> {
        Ok(self
            .persistence
            .release_environment_ports(environment_id, Utc::now())
            .await?)
    }
}

// `active` is ascending.
fn lowest_free(lo: i32, hi: i32, active: &[i32]) -> Option<i32> {
    (lo..=hi).find(|p| active.binary_search(p).is_err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockcloud_core::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn allocator(lo: i32, hi: i32) -> PortAllocator {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        mockcloud_core::migrations::run_sqlite(&pool).await.unwrap();
        PortAllocator::new(
            Arc::new(SqlitePersistence::new(pool)),
            PortAllocatorConfig {
                lo,
                hi,
                max_retries: 10,
            },
        )
    }

    #[test]
    fn test_lowest_free() {
        assert_eq!(lowest_free(10, 20, &[]), Some(10));
        assert_eq!(lowest_free(10, 20, &[10, 11, 13]), Some(12));
        assert_eq!(lowest_free(10, 12, &[10, 11, 12]), None);
        assert_eq!(lowest_free(11, 12, &[12]), Some(11));
    }

    #[tokio::test]
    async fn test_allocates_lowest_then_next() {
        let allocator = allocator(31000, 31010).await;
        assert_eq!(allocator.allocate("env-a", "redis").await.unwrap(), 31000);
        assert_eq!(allocator.allocate("env-a", "postgresql").await.unwrap(), 31001);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let allocator = allocator(31000, 31001).await;
        allocator.allocate("env-a", "a").await.unwrap();
        allocator.allocate("env-a", "b").await.unwrap();
        assert!(matches!(
            allocator.allocate("env-a", "c").await,
            Err(AllocatorError::PortsExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_makes_port_reusable() {
        let allocator = allocator(31000, 31001).await;
        let port = allocator.allocate("env-a", "redis").await.unwrap();
        assert!(allocator.release(port).await.unwrap());
        assert!(!allocator.release(port).await.unwrap());
        assert_eq!(allocator.allocate("env-b", "redis").await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_release_environment() {
        let allocator = allocator(31000, 31010).await;
        allocator.allocate("env-a", "a").await.unwrap();
        allocator.allocate("env-a", "b").await.unwrap();
        allocator.allocate("env-b", "a").await.unwrap();
        assert_eq!(allocator.release_environment("env-a").await.unwrap(), 2);
        assert_eq!(allocator.allocate("env-c", "x").await.unwrap(), 31000);
    }
}
