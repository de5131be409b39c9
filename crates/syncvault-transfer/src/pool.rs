//! Transfer manager pool with checkout/return discipline.
//!
//! Most backend clients are not safe for unsynchronized concurrent use, so
//! each in-flight operation checks out a manager exclusively and the guard
//! returns it when dropped.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{TransferError, TransferResult};
use crate::plugin::{Connection, TransferManager};

/// Statistics about the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total managers owned by the pool.
    pub total: usize,
    /// Managers currently available.
    pub idle: usize,
    /// Managers currently checked out.
    pub active: usize,
}

struct PoolInner {
    idle: Mutex<Vec<Box<dyn TransferManager>>>,
    permits: Arc<Semaphore>,
    total: usize,
}

/// A fixed set of transfer managers shared by concurrent pipelines.
#[derive(Clone)]
pub struct TransferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for TransferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TransferPool {
    /// Build a pool from already created managers.
    pub fn from_managers(managers: Vec<Box<dyn TransferManager>>) -> TransferResult<Self> {
        if managers.is_empty() {
            return Err(TransferError::InvalidSettings {
                plugin: "pool".to_string(),
                reason: "transfer pool needs at least one manager".to_string(),
            });
        }
        let total = managers.len();
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(managers),
                permits: Arc::new(Semaphore::new(total)),
                total,
            }),
        })
    }

    /// Create `size` managers from one initialized connection.
    pub fn from_connection(connection: &dyn Connection, size: usize) -> TransferResult<Self> {
        let managers = (0..size.max(1))
            .map(|_| connection.create_transfer_manager())
            .collect::<TransferResult<Vec<_>>>()?;
        debug!(plugin = connection.plugin_id(), size = managers.len(), "Transfer pool created");
        Self::from_managers(managers)
    }

    /// Wait for an idle manager and check it out.
    pub async fn checkout(&self) -> PooledTransferManager {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = match Arc::clone(&self.inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("transfer pool semaphore closed"),
        };
        let manager = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match manager {
            Some(manager) => PooledTransferManager {
                manager: Some(manager),
                pool: Arc::clone(&self.inner),
                _permit: permit,
            },
            None => unreachable!("permit held without idle transfer manager"),
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        PoolStats {
            total: self.inner.total,
            idle,
            active: self.inner.total - idle,
        }
    }
}

/// A checked-out transfer manager; returned to the pool on drop.
pub struct PooledTransferManager {
    manager: Option<Box<dyn TransferManager>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledTransferManager {
    type Target = dyn TransferManager;

    fn deref(&self) -> &Self::Target {
        match &self.manager {
            Some(manager) => manager.as_ref(),
            None => unreachable!("pooled transfer manager used after return"),
        }
    }
}

impl Drop for PooledTransferManager {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(manager);
        }
        // `_permit` is released after the manager is back in the idle list.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalConnection;
    use std::time::Duration;

    fn pool_of(size: usize) -> TransferPool {
        let conn = LocalConnection::with_path("/tmp/syncvault-pool-test");
        TransferPool::from_connection(&conn, size).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(TransferPool::from_managers(Vec::new()).is_err());
    }

    #[test]
    fn test_unconfigured_connection_rejected() {
        let conn = LocalConnection::default();
        assert!(matches!(
            TransferPool::from_connection(&conn, 2),
            Err(TransferError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn test_checkout_and_return() {
        let pool = pool_of(2);
        assert_eq!(pool.stats(), PoolStats { total: 2, idle: 2, active: 0 });
        {
            let _a = pool.checkout().await;
            let _b = pool.checkout().await;
            assert_eq!(pool.stats().active, 2);
        }
        assert_eq!(pool.stats(), PoolStats { total: 2, idle: 2, active: 0 });
    }

    #[tokio::test]
    async fn test_checkout_waits_for_return() {
        let pool = pool_of(1);
        let held = pool.checkout().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _m = pool2.checkout().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.stats().idle, 1);
    }
}
