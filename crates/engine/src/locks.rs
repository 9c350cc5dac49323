use std::{collections::HashMap, sync::Arc};

use shared::domain::ModuleId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes submissions to the same module within this process.
#[derive(Clone, Default)]
pub struct ModuleLocks {
    inner: Arc<Mutex<HashMap<ModuleId, Arc<Mutex<()>>>>>,
}

impl ModuleLocks {
    /// Waits until no other holder is working on `module_id`. The lock is released
    /// when the guard drops.
    pub async fn acquire(&self, module_id: ModuleId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            // Entries only the map still references are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(module_id).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_module_waits_for_holder() {
        let locks = ModuleLocks::default();
        let guard = locks.acquire(ModuleId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(ModuleId(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.expect("contender finishes");
    }

    #[tokio::test]
    async fn different_modules_do_not_block() {
        let locks = ModuleLocks::default();
        let _first = locks.acquire(ModuleId(1)).await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.acquire(ModuleId(2))).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = ModuleLocks::default();
        drop(locks.acquire(ModuleId(1)).await);
        drop(locks.acquire(ModuleId(2)).await);
        let _held = locks.acquire(ModuleId(3)).await;
        assert_eq!(locks.tracked().await, 1);
    }
}
