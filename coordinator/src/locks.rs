use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per device id. Work on different devices never shares a lock.
#[derive(Default)]
pub(crate) struct DeviceLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceLocks {
    pub(crate) async fn acquire(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(device_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops entries nobody is holding or waiting on.
    pub(crate) fn prune(&self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_device_serializes() {
        let locks = Arc::new(DeviceLocks::default());
        let guard = locks.acquire("dev-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("dev-1").await;
            })
        };
        // other devices are not blocked
        let _other = locks.acquire("dev-2").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter never got the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = DeviceLocks::default();
        let held = locks.acquire("dev-1").await;
        drop(locks.acquire("dev-2").await);

        locks.prune();
        assert_eq!(locks.len(), 1);

        drop(held);
        locks.prune();
        assert_eq!(locks.len(), 0);
    }
}
