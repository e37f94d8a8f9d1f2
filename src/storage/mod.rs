pub mod memory;
pub mod redis;
pub mod sql;

use crate::config::{Config, StorageType};
use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use log::info;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use self::memory::MemoryStorage;
use self::redis::RedisStorage;
use self::sql::SqlStorage;

/// 内存存储的过期清理周期
const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// 一次 obtain 产生的租约, 由锁句柄持有
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub metadata: String,
    pub ttl: Duration,
    pub until: DateTime<Utc>,
}

impl Lease {
    pub fn new(
        key: impl Into<String>,
        token: impl Into<String>,
        metadata: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
            metadata: metadata.into(),
            ttl,
            until: expiry_from_now(ttl),
        }
    }

    /// 续期成功后更新本地记录的过期时间
    pub(crate) fn extend(&mut self, ttl: Duration) {
        self.ttl = ttl;
        self.until = expiry_from_now(ttl);
    }
}

/// 锁记录的只读快照, token 为空表示锁不存在
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockView {
    pub token: String,
    pub metadata: String,
    pub until: String,
    pub remaining: Option<Duration>,
    pub locked_at: String,
    pub locked_by: String,
    pub locked_pid: String,
}

impl LockView {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

impl fmt::Display for LockView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Token: {} Meta: {} Until: {}",
            self.token, self.metadata, self.until
        )?;
        if let Some(remaining) = self.remaining {
            write!(f, " Remaining: {:?}", remaining)?;
        }
        write!(
            f,
            " At: {} By: {} PID: {}}}",
            self.locked_at, self.locked_by, self.locked_pid
        )
    }
}

#[async_trait]
pub trait LockStorage: Send + Sync {
    /// 单次尝试获取锁, 未获取到返回 false
    async fn try_acquire(&self, lease: &Lease) -> LockResult<bool>;

    /// 查看锁信息, 不修改任何状态
    async fn view(&self, key: &str) -> LockResult<LockView>;

    /// 剩余时间, 锁已过期或不属于该 token 时返回零
    async fn ttl(&self, lease: &mut Lease) -> LockResult<Duration>;

    /// 续期, token 不匹配时返回 false
    async fn refresh(&self, lease: &mut Lease, ttl: Duration) -> LockResult<bool>;

    /// 释放锁, token 不匹配时返回 false
    async fn release(&self, lease: &Lease) -> LockResult<bool>;

    /// 关闭底层连接
    async fn close(&self) -> LockResult<()> {
        Ok(())
    }
}

/// 按配置的 URI 创建存储
pub async fn open(config: &Config) -> LockResult<Arc<dyn LockStorage>> {
    match config.storage_type()? {
        StorageType::Memory => {
            info!("Using memory storage");
            let storage = Arc::new(MemoryStorage::new());
            storage.spawn_cleanup(MEMORY_CLEANUP_INTERVAL);
            Ok(storage)
        }
        StorageType::Redis => {
            info!("Using Redis storage");
            let storage = RedisStorage::new(
                &config.uri,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
            )
            .await?;
            storage.ping().await?;
            Ok(Arc::new(storage))
        }
        StorageType::Sql => {
            info!("Using SQL storage, table: {}", config.table);
            let storage = SqlStorage::connect(&config.uri)
                .await?
                .with_table(&config.table)
                .auto_create_table(!config.no_auto_create_table);
            storage.ping().await?;
            Ok(Arc::new(storage))
        }
    }
}

/// 可写入存储的最大过期时间, 超过 9999 年的时间戳无法按字符串排序
pub(crate) fn max_expiry() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_nano_opt(23, 59, 59, 999_999_999))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let max = max_expiry();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .map_or(max, |until| until.min(max))
}

/// 固定 9 位小数的 UTC RFC3339, 保证字符串比较与时间先后一致
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> LockResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LockError::MalformedRecord(format!("parse lock_until {value}: {e}")))
}

/// 距离 until 的剩余时间, 已过期返回零
pub(crate) fn remaining_until(until: DateTime<Utc>) -> Duration {
    (until - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T00:00:05.1Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2024-01-01T00:00:05.12Z")
            .unwrap()
            .with_timezone(&Utc);
        let (a, b) = (format_timestamp(earlier), format_timestamp(later));
        assert_eq!(a, "2024-01-01T00:00:05.100000000Z");
        assert!(a < b);
    }

    #[test]
    fn test_parse_timestamp_accepts_offsets() {
        let ts = parse_timestamp("2024-01-01T08:00:00.5+08:00").unwrap();
        assert_eq!(format_timestamp(ts), "2024-01-01T00:00:00.500000000Z");
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, LockError::MalformedRecord(_)));
    }

    #[test]
    fn test_remaining_until_never_negative() {
        let past = Utc::now() - chrono::Duration::seconds(1);
        assert_eq!(remaining_until(past), Duration::ZERO);
        let future = expiry_from_now(Duration::from_secs(10));
        assert!(remaining_until(future) > Duration::from_secs(9));
    }

    #[test]
    fn test_lease_extend_moves_until_forward() {
        let mut lease = Lease::new("k", "t", "", Duration::from_millis(10));
        let before = lease.until;
        lease.extend(Duration::from_secs(60));
        assert!(lease.until > before);
        assert_eq!(lease.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_huge_ttl_is_clamped_to_max_expiry() {
        let until = expiry_from_now(Duration::from_secs(400_000 * 365 * 24 * 3600));
        assert_eq!(format_timestamp(until), "9999-12-31T23:59:59.999999999Z");
        assert_eq!(expiry_from_now(Duration::MAX), max_expiry());
        assert!(format_timestamp(until) > format_timestamp(Utc::now()));
    }

    #[test]
    fn test_empty_view() {
        assert!(LockView::default().is_empty());
    }
}
