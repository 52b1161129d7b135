//! Lock manager (C5): mutex and read/write coordination locks with lease
//! expiration and renewal (spec.md §4.5).
//!
//! The default backend is in-process and reaps expired records lazily, on
//! access — there is no background sweeper (spec.md §9 Open Question 1).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, SpiralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Mutex,
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct LockRecord {
    kind: LockKind,
    /// Owner ids holding the record. For `Mutex`/`Write` this has exactly
    /// one entry; for `Read` it may have many.
    owners: Vec<String>,
    acquired_at: Instant,
    expires_at: Instant,
    renewal_count: u32,
}

impl LockRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub name: String,
    pub kind: LockKind,
    pub owners: Vec<String>,
    pub renewal_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LockManagerStats {
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub active_locks: usize,
}

/// Pluggable lock backend — a future remote implementation can satisfy this
/// trait (spec.md §9 Design notes: "pluggable backend interface").
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, name: &str, kind: LockKind, lease: Duration) -> Option<String>;
    async fn release(&self, name: &str, owner_id: &str) -> bool;
    async fn renew(&self, name: &str, owner_id: &str, new_lease: Duration) -> bool;
    async fn is_locked(&self, name: &str) -> bool;
    async fn get_owner(&self, name: &str) -> Option<Vec<String>>;
}

/// Default in-process lock manager.
pub struct LockManager {
    records: Mutex<HashMap<String, LockRecord>>,
    stats: Mutex<LockManagerStats>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stats: Mutex::new(LockManagerStats::default()),
        }
    }

    /// Reaps `name`'s record if it's present and expired. Must be called
    /// with `records` already locked.
    fn reap_if_expired(records: &mut HashMap<String, LockRecord>, name: &str, now: Instant) {
        if let Some(record) = records.get(name) {
            if record.is_expired(now) {
                records.remove(name);
            }
        }
    }

    fn try_acquire_locked(
        records: &mut HashMap<String, LockRecord>,
        name: &str,
        kind: LockKind,
        lease: Duration,
    ) -> Option<String> {
        let now = Instant::now();
        Self::reap_if_expired(records, name, now);

        match records.get_mut(name) {
            Some(existing) => match (kind, existing.kind) {
                (LockKind::Read, LockKind::Read) => {
                    let owner_id = Uuid::new_v4().to_string();
                    existing.owners.push(owner_id.clone());
                    Some(owner_id)
                }
                _ => None,
            },
            None => {
                let owner_id = Uuid::new_v4().to_string();
                records.insert(
                    name.to_string(),
                    LockRecord {
                        kind,
                        owners: vec![owner_id.clone()],
                        acquired_at: now,
                        expires_at: now + lease,
                        renewal_count: 0,
                    },
                );
                Some(owner_id)
            }
        }
    }

    /// Acquires `name`. Polls every 10ms until `acquire_timeout` elapses.
    /// `acquire_timeout = Duration::ZERO` is non-blocking. `cancel`, if
    /// given, aborts the wait with [`SpiralError::Cancelled`] and leaves no
    /// side effect — cancellation is only ever observed between poll
    /// attempts, never instead of a successful acquire (spec.md §5).
    pub async fn acquire(
        &self,
        name: &str,
        kind: LockKind,
        acquire_timeout: Option<Duration>,
        lease_duration: Duration,
        cancel: Option<&Notify>,
    ) -> Result<String> {
        const POLL_INTERVAL: Duration = Duration::from_millis(10);
        let non_blocking = acquire_timeout == Some(Duration::ZERO);
        let deadline = acquire_timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            {
                let mut records = self.records.lock().await;
                if let Some(owner_id) =
                    Self::try_acquire_locked(&mut records, name, kind, lease_duration)
                {
                    drop(records);
                    let mut stats = self.stats.lock().await;
                    stats.acquired += 1;
                    return Ok(owner_id);
                }
            }

            if non_blocking || matches!(deadline, Some(dl) if tokio::time::Instant::now() >= dl) {
                let mut stats = self.stats.lock().await;
                stats.timeouts += 1;
                return Err(SpiralError::timeout(format!(
                    "acquire timed out for lock '{name}'"
                )));
            }

            let cancelled = async {
                match cancel {
                    Some(c) => c.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancelled => return Err(SpiralError::Cancelled),
            }
        }
    }

    pub async fn release(&self, name: &str, owner_id: &str) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return false;
        };
        if !record.owners.iter().any(|o| o == owner_id) {
            return false;
        }

        match record.kind {
            LockKind::Read => {
                record.owners.retain(|o| o != owner_id);
                if record.owners.is_empty() {
                    records.remove(name);
                }
            }
            _ => {
                records.remove(name);
            }
        }
        drop(records);
        let mut stats = self.stats.lock().await;
        stats.released += 1;
        true
    }

    pub async fn renew(&self, name: &str, owner_id: &str, new_lease: Duration) -> bool {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        Self::reap_if_expired(&mut records, name, now);
        let Some(record) = records.get_mut(name) else {
            return false;
        };
        if !record.owners.iter().any(|o| o == owner_id) {
            return false;
        }
        record.expires_at = now + new_lease;
        record.renewal_count += 1;
        true
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        Self::reap_if_expired(&mut records, name, now);
        records.contains_key(name)
    }

    pub async fn get_owner(&self, name: &str) -> Option<Vec<String>> {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        Self::reap_if_expired(&mut records, name, now);
        records.get(name).map(|r| r.owners.clone())
    }

    pub async fn get_lock_info(&self, name: &str) -> Option<LockInfo> {
        let mut records = self.records.lock().await;
        let now = Instant::now();
        Self::reap_if_expired(&mut records, name, now);
        records.get(name).map(|r| LockInfo {
            name: name.to_string(),
            kind: r.kind,
            owners: r.owners.clone(),
            renewal_count: r.renewal_count,
        })
    }

    pub async fn stats(&self) -> LockManagerStats {
        let mut stats = self.stats.lock().await.clone();
        stats.active_locks = self.records.lock().await.len();
        stats
    }
}

#[async_trait::async_trait]
impl LockBackend for LockManager {
    async fn try_acquire(&self, name: &str, kind: LockKind, lease: Duration) -> Option<String> {
        self.acquire(name, kind, Some(Duration::ZERO), lease, None)
            .await
            .ok()
    }

    async fn release(&self, name: &str, owner_id: &str) -> bool {
        LockManager::release(self, name, owner_id).await
    }

    async fn renew(&self, name: &str, owner_id: &str, new_lease: Duration) -> bool {
        LockManager::renew(self, name, owner_id, new_lease).await
    }

    async fn is_locked(&self, name: &str) -> bool {
        LockManager::is_locked(self, name).await
    }

    async fn get_owner(&self, name: &str) -> Option<Vec<String>> {
        LockManager::get_owner(self, name).await
    }
}
