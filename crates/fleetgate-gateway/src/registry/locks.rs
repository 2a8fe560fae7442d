//! Per-device exclusive execution tokens.
//!
//! All registry/license mutations for a given device UUID run under that
//! device's own async mutex; there is no fleet-wide lock, so one slow
//! device never blocks the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct DeviceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for a device UUID.
    pub fn lock_for(&self, uuid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            map.entry(uuid.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_uuid_shares_a_lock() {
        let locks = DeviceLocks::new();
        let a = locks.lock_for("d1");
        let b = locks.lock_for("d1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_uuids_do_not_block_each_other() {
        let locks = DeviceLocks::new();
        let a = locks.lock_for("d1");
        let _guard = a.lock().await;

        // Locking another device's token must succeed immediately.
        let b = locks.lock_for("d2");
        assert!(b.try_lock().is_ok());
    }
}
