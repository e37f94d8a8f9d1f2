use crate::error::LockResult;
use crate::storage::{format_timestamp, remaining_until, Lease, LockStorage, LockView};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct MemoryRecord {
    token: String,
    metadata: String,
    until: DateTime<Utc>,
    locked_at: DateTime<Utc>,
}

impl MemoryRecord {
    fn from_lease(lease: &Lease) -> Self {
        Self {
            token: lease.token.clone(),
            metadata: lease.metadata.clone(),
            until: lease.until,
            locked_at: Utc::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.until <= Utc::now()
    }
}

/// 进程内存储, 适用于测试和单进程部署
#[derive(Default)]
pub struct MemoryStorage {
    locks: DashMap<String, MemoryRecord>, // lock_key -> record
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理过期的锁, 返回清理数量
    pub fn cleanup_expired(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|key, record| {
            if record.is_expired() {
                log::info!(
                    "[EXPIRED CLEANUP] Removed expired lock - key: {}, token: {}, locked_at: {}",
                    key,
                    record.token,
                    format_timestamp(record.locked_at)
                );
                false
            } else {
                true
            }
        });
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            log::info!("[CLEANUP] Cleaned up {} expired locks", removed);
        }
        removed
    }

    /// 后台定期清理过期的锁, 存储被释放后任务自动退出
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let storage = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(storage) = storage.upgrade() else {
                    log::debug!("[CLEANUP] Memory storage dropped, stop cleanup task");
                    break;
                };
                storage.cleanup_expired();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl LockStorage for MemoryStorage {
    async fn try_acquire(&self, lease: &Lease) -> LockResult<bool> {
        // entry 持有分片写锁, 判断与写入是原子的
        match self.locks.entry(lease.key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(MemoryRecord::from_lease(lease));
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.token == lease.token {
                    log::debug!("[REENTRANT] Same token re-acquiring lock - key: {}", lease.key);
                } else if existing.is_expired() {
                    log::debug!(
                        "[EXPIRED] Taking over expired lock - key: {}, previous token: {}",
                        lease.key,
                        existing.token
                    );
                } else {
                    return Ok(false);
                }
                entry.insert(MemoryRecord::from_lease(lease));
                Ok(true)
            }
        }
    }

    async fn view(&self, key: &str) -> LockResult<LockView> {
        Ok(self
            .locks
            .get(key)
            .map(|record| LockView {
                token: record.token.clone(),
                metadata: record.metadata.clone(),
                until: format_timestamp(record.until),
                locked_at: format_timestamp(record.locked_at),
                ..LockView::default()
            })
            .unwrap_or_default())
    }

    async fn ttl(&self, lease: &mut Lease) -> LockResult<Duration> {
        match self.locks.get(&lease.key) {
            Some(record) if record.token == lease.token => {
                lease.until = record.until;
                Ok(remaining_until(record.until))
            }
            _ => Ok(Duration::ZERO),
        }
    }

    async fn refresh(&self, lease: &mut Lease, ttl: Duration) -> LockResult<bool> {
        if let Some(mut record) = self.locks.get_mut(&lease.key) {
            if record.token == lease.token {
                lease.extend(ttl);
                record.until = lease.until;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn release(&self, lease: &Lease) -> LockResult<bool> {
        let removed = self
            .locks
            .remove_if(&lease.key, |_, record| record.token == lease.token);
        if removed.is_some() {
            log::info!("[RELEASE] Released lock - key: {}", lease.key);
        }
        Ok(removed.is_some())
    }
}
