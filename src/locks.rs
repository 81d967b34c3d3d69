use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-date write serialization for generate, clear and reassign.
///
/// Entries are never evicted; the key space is the set of exam dates.
#[derive(Debug, Default, Clone)]
pub struct DateLocks {
    inner: Arc<Mutex<HashMap<NaiveDate, Arc<AsyncMutex<()>>>>>,
}

impl DateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, date: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(date).or_default().clone()
        };
        lock.lock_owned().await
    }
}
