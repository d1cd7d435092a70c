//! 分发引擎错误类型
//!
//! 区分四类结果：同步拒绝的验证错误、向调用方显式报告的限流信号、
//! 渠道级发送失败（由队列按策略重试）、以及透传的基础设施错误。
//! 偏好导致的静默跳过不是错误，通过 `SendReceipt` 表达。

use pulse_shared::error::NotifyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// 事件格式不合法，同步拒绝，绝不入队
    #[error("事件校验失败: {0}")]
    Validation(String),

    /// 触发限流，发送被跳过且不会自动重试
    #[error("触发限流: 作用域={scope}")]
    RateLimited { scope: String },

    /// 渠道发送失败
    #[error("渠道发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: String, reason: String },

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// 是否为限流信号
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
