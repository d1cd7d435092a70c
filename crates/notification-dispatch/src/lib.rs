//! 多渠道通知分发引擎
//!
//! 接收抽象通知事件，依据用户偏好决定投递渠道，执行限流与静默时段
//! 策略，渲染本地化消息，经优先级队列由工作者池投递到各外部渠道，
//! 并记录投递统计。
//!
//! 投递语义为 at-least-once：任务可能在进程崩溃后重复投递，
//! 幂等由接收渠道保证。

pub mod analytics;
pub mod channels;
pub mod error;
pub mod preferences;
pub mod queue;
pub mod rate_limit;
pub mod service;
pub mod template;

pub use error::{DispatchError, Result};
pub use service::{NotificationService, SendReceipt, SkipReason};
