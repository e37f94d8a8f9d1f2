//! 获取锁失败后的重试策略.
//!
//! `next_backoff` 返回下一次重试前的等待时间, 返回 `Duration::ZERO` 表示停止重试.

use std::time::Duration;

pub trait RetryStrategy: Send {
    fn next_backoff(&mut self) -> Duration;
}

impl<S: RetryStrategy + ?Sized> RetryStrategy for Box<S> {
    fn next_backoff(&mut self) -> Duration {
        (**self).next_backoff()
    }
}

/// 不重试, 只尝试一次
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_backoff(&mut self) -> Duration {
        Duration::ZERO
    }
}

/// 固定间隔重试, 次数不限 (受 deadline 约束)
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff(pub Duration);

impl RetryStrategy for LinearBackoff {
    fn next_backoff(&mut self) -> Duration {
        self.0
    }
}

/// 限制内层策略的最大重试次数
#[derive(Debug, Clone)]
pub struct LimitRetry<S> {
    inner: S,
    max: usize,
    count: usize,
}

impl<S: RetryStrategy> LimitRetry<S> {
    pub fn new(inner: S, max: usize) -> Self {
        Self {
            inner,
            max,
            count: 0,
        }
    }
}

impl<S: RetryStrategy> RetryStrategy for LimitRetry<S> {
    fn next_backoff(&mut self) -> Duration {
        if self.count >= self.max {
            return Duration::ZERO;
        }
        self.count += 1;
        self.inner.next_backoff()
    }
}

/// 指数退避: 4ms, 8ms, 16ms ... 截断到 [min, max], max 为零表示不设上限
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    count: u32,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, count: 0 }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_backoff(&mut self) -> Duration {
        self.count += 1;
        let ms: u64 = if self.count < 25 {
            2 << self.count
        } else {
            2 << 25
        };
        let backoff = Duration::from_millis(ms);
        if backoff < self.min {
            self.min
        } else if !self.max.is_zero() && backoff > self.max {
            self.max
        } else {
            backoff
        }
    }
}
