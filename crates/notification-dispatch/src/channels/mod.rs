//! 通知渠道实现
//!
//! 定义渠道 trait 并提供各渠道的具体实现，按渠道名静态分发。
//!
//! ## 支持的渠道
//!
//! - **Email**: sendgrid / ses / smtp 中继
//! - **SMS**: twilio / aws-sns / messagebird
//! - **Push**: FCM（android/web）与 APNs（ios）
//! - **Webhook**: 通用 HTTPS POST，可选 HMAC-SHA256 签名
//! - **InApp**: 站内信，持久化 + 可选实时推送
//!
//! 所有渠道支持沙箱模式：send 短路为合成成功结果（伪造消息 ID，
//! 不访问外部服务商），非生产环境与测试必须开启。
//!
//! 渠道实现约定：确定性失败（4xx、无效地址）返回带 permanent 标记的
//! `DeliveryResult`，供队列工作者区分"可重试"与"永久失败"；
//! 仅意外的内部错误才返回 Err。

mod email;
mod in_app;
mod push;
mod sms;
mod webhook;

pub use email::EmailChannel;
pub use in_app::{InAppChannel, InAppRecord, RealtimePush};
pub use push::PushChannel;
pub use sms::SmsChannel;
pub use webhook::WebhookChannel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use pulse_shared::config::ChannelsConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};
use pulse_shared::store::Store;

use crate::error::Result;

/// 通知渠道 trait
///
/// 所有渠道实现统一的发送接口；实现应当是无状态的，便于并发调用。
#[async_trait]
pub trait Channel: Send + Sync {
    /// 渠道类型标识
    fn kind(&self) -> ChannelKind;

    /// 渠道名称（用于日志）
    fn name(&self) -> &str;

    /// 发送消息，返回投递结果
    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult>;

    /// 校验渠道地址格式
    ///
    /// 偏好管理在绑定地址时调用；默认仅要求非空。
    async fn verify(&self, address: &str) -> Result<bool> {
        Ok(!address.trim().is_empty())
    }
}

/// 按配置构建渠道分发表
///
/// 渠道名 -> 实现的静态映射，分发服务与队列工作者共用。
pub fn build_channels(
    config: &ChannelsConfig,
    store: Store,
    realtime: Option<Arc<dyn RealtimePush>>,
) -> HashMap<ChannelKind, Arc<dyn Channel>> {
    let mut channels: HashMap<ChannelKind, Arc<dyn Channel>> = HashMap::new();
    channels.insert(
        ChannelKind::Email,
        Arc::new(EmailChannel::new(config.email.clone(), config.sandbox)),
    );
    channels.insert(
        ChannelKind::Sms,
        Arc::new(SmsChannel::new(config.sms.clone(), config.sandbox)),
    );
    channels.insert(
        ChannelKind::Push,
        Arc::new(PushChannel::new(config.push.clone(), config.sandbox)),
    );
    channels.insert(
        ChannelKind::Webhook,
        Arc::new(WebhookChannel::new(config.webhook.clone(), config.sandbox)),
    );
    channels.insert(
        ChannelKind::InApp,
        Arc::new(InAppChannel::new(
            store,
            config.in_app.clone(),
            config.sandbox,
            realtime,
        )),
    );

    info!(
        sandbox = config.sandbox,
        channel_count = channels.len(),
        "渠道分发表已构建"
    );
    channels
}

/// 按 HTTP 响应分类投递结果
///
/// 2xx -> 成功；4xx -> 永久失败（不重试）；其余 -> 可重试失败。
pub(crate) fn result_from_response(
    status: reqwest::StatusCode,
    body: &str,
    message_id: Option<String>,
    provider: &str,
) -> DeliveryResult {
    if status.is_success() {
        let message_id =
            message_id.unwrap_or_else(|| format!("{provider}_{}", Uuid::new_v4().simple()));
        DeliveryResult::success(message_id).with_detail("provider", serde_json::json!(provider))
    } else if status.is_client_error() {
        DeliveryResult::permanent_failure(format!(
            "{provider} rejected ({status}): {}",
            snippet(body)
        ))
        .with_detail("provider", serde_json::json!(provider))
        .with_detail("status", serde_json::json!(status.as_u16()))
    } else {
        DeliveryResult::failure(format!("{provider} error ({status}): {}", snippet(body)))
            .with_detail("provider", serde_json::json!(provider))
            .with_detail("status", serde_json::json!(status.as_u16()))
    }
}

/// 按网络层错误分类投递结果（均可重试）
pub(crate) fn result_from_network_error(err: &reqwest::Error, provider: &str) -> DeliveryResult {
    if err.is_timeout() {
        DeliveryResult::failure(format!("timeout contacting {provider}"))
    } else {
        DeliveryResult::failure(format!("network error contacting {provider}: {err}"))
    }
}

/// 截取响应体片段用于错误信息，避免日志被超长响应撑爆
fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
