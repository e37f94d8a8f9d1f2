use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug)]
pub enum LockError {
    /// 锁被其他持有者占用, 或重试策略已耗尽
    #[error("dblock: not obtained")]
    NotObtained,

    /// 释放或续期时锁已不属于当前 token
    #[error("dblock: lock not held")]
    LockNotHeld,

    #[error("dblock: no providers registered for {0}")]
    NoProviders(String),

    #[error("dblock: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dblock: obtain cancelled")]
    Cancelled,

    #[error("dblock: deadline exceeded")]
    DeadlineExceeded,

    #[error("dblock: malformed lock record: {0}")]
    MalformedRecord(String),

    #[error("dblock: {op}: {source}")]
    Sql {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("dblock: {op}: {source}")]
    Redis {
        op: &'static str,
        #[source]
        source: redis::RedisError,
    },
}

impl LockError {
    pub(crate) fn sql(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| LockError::Sql { op, source }
    }

    pub(crate) fn redis(op: &'static str) -> impl FnOnce(redis::RedisError) -> Self {
        move |source| LockError::Redis { op, source }
    }

    /// 正常的锁竞争结果, 不是故障
    pub fn is_not_obtained(&self) -> bool {
        matches!(self, LockError::NotObtained)
    }

    pub fn is_not_held(&self) -> bool {
        matches!(self, LockError::LockNotHeld)
    }

    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            LockError::Sql { .. } | LockError::Redis { .. } | LockError::MalformedRecord(_)
        )
    }
}
