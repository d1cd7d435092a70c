//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 除错误码外，还提供可重试性与基础设施故障两个分类维度：
//! 前者供队列重试策略使用，后者供限流器与偏好读取的降级逻辑判断。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 存储错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 序列化错误 ====================
    #[error("序列化错误: {0}")]
    Serialization(String),

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Redis(_) => "REDIS_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 瞬时故障（存储连接、外部服务抖动）可以重试，
    /// 验证类错误重试也不会成功，直接向上传播。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Redis(_)
                | Self::Store(_)
                | Self::ExternalService { .. }
                | Self::ExternalServiceTimeout { .. }
        )
    }

    /// 是否为基础设施故障
    ///
    /// 存储层不可达时，限流器选择放行（fail open）、
    /// 偏好读取回退到默认值，保证投递可用性优先于严格限流。
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Store(_))
    }
}
