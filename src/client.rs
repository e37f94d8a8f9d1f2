use crate::config::Config;
use crate::error::{LockError, LockResult};
use crate::options::ObtainOptions;
use crate::storage::{self, Lease, LockStorage, LockView};
use crate::token::random_token;
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// 分布式锁客户端, 与具体存储无关
#[derive(Clone)]
pub struct Locker {
    storage: Arc<dyn LockStorage>,
}

impl Locker {
    pub fn new(storage: Arc<dyn LockStorage>) -> Self {
        Self { storage }
    }

    /// 按配置中的 URI 连接存储
    pub async fn connect(config: &Config) -> LockResult<Self> {
        Ok(Self::new(storage::open(config).await?))
    }

    pub fn storage(&self) -> &Arc<dyn LockStorage> {
        &self.storage
    }

    pub async fn view(&self, key: &str) -> LockResult<LockView> {
        self.storage.view(key).await
    }

    /// 获取锁. 按重试策略反复尝试, 直到成功, 策略耗尽, 取消或超过截止时间.
    ///
    /// 未指定截止时间时默认为 now + ttl, 重试不会超出本次申请的租期.
    pub async fn obtain(
        &self,
        key: &str,
        ttl: Duration,
        mut options: ObtainOptions,
    ) -> LockResult<Lock> {
        if key.is_empty() {
            return Err(LockError::InvalidArgument("empty lock key".to_string()));
        }
        if ttl.is_zero() {
            return Err(LockError::InvalidArgument("ttl must be positive".to_string()));
        }

        let token = options.token.take().unwrap_or_else(random_token);
        let lease = Lease::new(key, token, std::mem::take(&mut options.meta), ttl);
        let mut retry = options.take_retry_strategy();
        let deadline = options.deadline.unwrap_or_else(|| default_deadline(ttl));
        let cancellation = options.cancellation.take().unwrap_or_else(CancellationToken::new);

        loop {
            if cancellation.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(LockError::DeadlineExceeded);
            }

            if self.storage.try_acquire(&lease).await? {
                debug!("[OBTAINED] key: {}, token: {}", lease.key, lease.token);
                return Ok(Lock {
                    storage: self.storage.clone(),
                    lease,
                });
            }

            let backoff = retry.next_backoff();
            if backoff.is_zero() {
                debug!("[NOT OBTAINED] key: {}, token: {}", lease.key, lease.token);
                return Err(LockError::NotObtained);
            }

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(LockError::Cancelled),
                _ = sleep_until(deadline) => return Err(LockError::DeadlineExceeded),
                _ = sleep(backoff) => {}
            }
        }
    }

    pub async fn close(&self) -> LockResult<()> {
        self.storage.close().await
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker").finish_non_exhaustive()
    }
}

/// 重试截止时间默认为 now + ttl, 溢出时取一个足够远的时间点
fn default_deadline(ttl: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// 已获取的锁
pub struct Lock {
    storage: Arc<dyn LockStorage>,
    lease: Lease,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.lease.key
    }

    pub fn token(&self) -> &str {
        &self.lease.token
    }

    pub fn metadata(&self) -> &str {
        &self.lease.metadata
    }

    /// 最近一次已知的过期时间
    pub fn until(&self) -> DateTime<Utc> {
        self.lease.until
    }

    /// 剩余时间, 锁已过期或已被他人持有时返回零
    pub async fn ttl(&mut self) -> LockResult<Duration> {
        self.storage.ttl(&mut self.lease).await
    }

    /// 续期, 锁已不属于自己时返回 `NotObtained`
    pub async fn refresh(&mut self, ttl: Duration) -> LockResult<()> {
        if ttl.is_zero() {
            return Err(LockError::InvalidArgument("ttl must be positive".to_string()));
        }
        if self.storage.refresh(&mut self.lease, ttl).await? {
            Ok(())
        } else {
            Err(LockError::NotObtained)
        }
    }

    /// 释放锁, 锁已不属于自己时返回 `LockNotHeld`
    pub async fn release(&self) -> LockResult<()> {
        if self.storage.release(&self.lease).await? {
            Ok(())
        } else {
            Err(LockError::LockNotHeld)
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("lease", &self.lease).finish()
    }
}
