use crate::retry::{NoRetry, RetryStrategy};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 单次 obtain 调用的可选参数
#[derive(Default)]
pub struct ObtainOptions {
    pub(crate) token: Option<String>,
    pub(crate) meta: String,
    pub(crate) retry_strategy: Option<Box<dyn RetryStrategy>>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl ObtainOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用自定义 token 代替随机 token, 空字符串等同于未设置
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = meta.into();
        self
    }

    pub fn with_retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.retry_strategy = Some(Box::new(strategy));
        self
    }

    /// 重试的截止时间, 未设置时默认为 now + ttl
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn take_retry_strategy(&mut self) -> Box<dyn RetryStrategy> {
        self.retry_strategy
            .take()
            .unwrap_or_else(|| Box::new(NoRetry))
    }
}
