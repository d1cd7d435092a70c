//! Webhook 通知渠道
//!
//! 向用户配置的 HTTPS 端点 POST 完整消息 JSON。配置签名密钥时，
//! 对请求体做 HMAC-SHA256 签名并通过请求头传递，接收方可据此验证
//! 来源与完整性。
//!
//! 渠道内部对网络错误与 5xx 响应按指数退避重试；4xx 属于接收方的
//! 确定性拒绝，绝不重试。

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_shared::config::WebhookConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};
use pulse_shared::retry::RetryPolicy;

use super::{Channel, result_from_network_error, result_from_response};
use crate::error::Result;

/// 签名请求头
pub const SIGNATURE_HEADER: &str = "X-Pulse-Signature";

/// Webhook 通知渠道
pub struct WebhookChannel {
    config: WebhookConfig,
    sandbox: bool,
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig, sandbox: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        let policy = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(500),
            Duration::from_secs(10),
        );
        Self {
            config,
            sandbox,
            http,
            policy,
        }
    }

    /// 对请求体计算 HMAC-SHA256 签名（base64 编码）
    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC 可接受任意长度密钥");
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// 发送单次请求
    async fn post_once(&self, url: &str, body: &[u8]) -> DeliveryResult {
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_vec());

        if let Some(secret) = &self.config.secret {
            request = request.header(SIGNATURE_HEADER, Self::sign(secret, body));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let response_body = response.text().await.unwrap_or_default();
                // 接收方可在响应体中回传自己的消息 ID
                let message_id = serde_json::from_str::<serde_json::Value>(&response_body)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|s| s.as_str()).map(|s| s.to_string()))
                    .or_else(|| Some(format!("webhook_{}", Uuid::new_v4().simple())));
                result_from_response(status, &response_body, message_id, "webhook")
            }
            Err(e) => result_from_network_error(&e, "webhook"),
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn name(&self) -> &str {
        "Webhook"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult> {
        if self.sandbox {
            debug!(event_id = %message.event_id, "沙箱模式，Webhook 合成成功");
            return Ok(DeliveryResult::sandbox(ChannelKind::Webhook));
        }

        let Some(url) = message.recipient.as_deref() else {
            return Ok(DeliveryResult::permanent_failure("webhook url missing"));
        };
        if !url.starts_with("http") {
            return Ok(DeliveryResult::permanent_failure(format!(
                "invalid webhook url: {url}"
            )));
        }

        let body = serde_json::to_vec(message)
            .map_err(|e| pulse_shared::error::NotifyError::Serialization(e.to_string()))?;

        // 网络错误与 5xx 按退避重试；4xx 与成功立即返回
        let mut attempt: u32 = 0;
        loop {
            let result = self.post_once(url, &body).await;

            if result.success {
                info!(
                    event_id = %message.event_id,
                    url,
                    attempt,
                    message_id = result.message_id.as_deref(),
                    "Webhook 发送成功"
                );
                return Ok(result);
            }
            if result.is_permanent() || !self.policy.should_retry(attempt) {
                if !result.is_permanent() {
                    warn!(
                        event_id = %message.event_id,
                        url,
                        attempt,
                        "Webhook 重试次数用尽"
                    );
                }
                return Ok(result);
            }

            let delay = self.policy.jittered_delay_for_attempt(attempt);
            debug!(
                event_id = %message.event_id,
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Webhook 发送失败，退避后重试"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn verify(&self, address: &str) -> Result<bool> {
        Ok(address.starts_with("https://") || address.starts_with("http://"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::events::{NotificationEvent, NotificationType, Severity};

    fn make_message(url: Option<&str>) -> NotificationMessage {
        let event = NotificationEvent::new(
            NotificationType::ProposalCreated,
            Severity::Info,
            serde_json::json!({"proposalTitle": "Upgrade treasury"}),
            "test",
        );
        let mut message = NotificationMessage::for_event(&event);
        message.recipient = url.map(|u| u.to_string());
        message.title = "New proposal".to_string();
        message.body = "Proposal created".to_string();
        message
    }

    #[tokio::test]
    async fn test_sandbox_short_circuits() {
        let channel = WebhookChannel::new(WebhookConfig::default(), true);
        let result = channel
            .send(&make_message(Some("https://hooks.example.com/notify")))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.message_id.unwrap().starts_with("sandbox_webhook_"));
    }

    #[tokio::test]
    async fn test_missing_or_invalid_url_is_permanent_failure() {
        let channel = WebhookChannel::new(WebhookConfig::default(), false);

        let result = channel.send(&make_message(None)).await.unwrap();
        assert!(result.is_permanent());

        let result = channel
            .send(&make_message(Some("ftp://example.com")))
            .await
            .unwrap();
        assert!(result.is_permanent());
        assert!(result.error.unwrap().contains("invalid webhook url"));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let body = br#"{"eventId":"evt-1"}"#;
        let sig1 = WebhookChannel::sign("secret-key", body);
        let sig2 = WebhookChannel::sign("secret-key", body);
        assert_eq!(sig1, sig2);

        // 不同密钥或不同内容产生不同签名
        assert_ne!(sig1, WebhookChannel::sign("other-key", body));
        assert_ne!(sig1, WebhookChannel::sign("secret-key", b"tampered"));

        // base64 可解码，长度为 SHA-256 摘要的 32 字节
        let decoded = BASE64.decode(&sig1).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn test_verify_url_scheme() {
        let channel = WebhookChannel::new(WebhookConfig::default(), true);

        assert!(channel.verify("https://hooks.example.com/x").await.unwrap());
        assert!(channel.verify("http://localhost:8080/x").await.unwrap());
        assert!(!channel.verify("wss://example.com").await.unwrap());
    }
}
