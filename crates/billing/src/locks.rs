//! Per-client serialisation
//!
//! The pipeline and the reactivation engine both take a client's lock before
//! reading and writing its billing rows, so one client's operations never
//! interleave. Locks for different clients are independent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ClientLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ClientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `client_id`
    pub async fn acquire(&self, client_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds so the map does not grow with every client ever seen
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(client_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}
