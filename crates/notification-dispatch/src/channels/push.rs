//! Push 推送通知渠道
//!
//! android/web 平台走 FCM，ios 平台走 APNs，按消息数据中的 platform
//! 字段整形载荷：FCM 使用 notification + data 结构，APNs 使用 aps
//! 字典（alert / sound / badge）。

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use pulse_shared::config::PushConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};

use super::{Channel, result_from_network_error, result_from_response};
use crate::error::Result;

/// 目标平台，决定载荷形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushPlatform {
    /// FCM：android 与 web
    Fcm,
    /// APNs：ios
    Apns,
}

impl PushPlatform {
    fn for_message(message: &NotificationMessage) -> Self {
        match message.data.get("platform").and_then(|v| v.as_str()) {
            Some("ios") => Self::Apns,
            _ => Self::Fcm,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Fcm => "fcm",
            Self::Apns => "apns",
        }
    }
}

/// Push 推送通知渠道
pub struct PushChannel {
    config: PushConfig,
    sandbox: bool,
    http: reqwest::Client,
}

impl PushChannel {
    pub fn new(config: PushConfig, sandbox: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            sandbox,
            http,
        }
    }

    fn endpoint(&self, platform: PushPlatform) -> String {
        if let Some(endpoint) = &self.config.endpoint {
            return endpoint.clone();
        }
        match platform {
            PushPlatform::Fcm => "https://fcm.googleapis.com/v1/messages:send".to_string(),
            PushPlatform::Apns => "https://api.push.apple.com/3/device".to_string(),
        }
    }

    /// FCM 载荷：notification + data，android 细节带 sound / icon
    fn fcm_payload(&self, message: &NotificationMessage, token: &str) -> serde_json::Value {
        // FCM data 字段要求字符串值
        let data: serde_json::Map<String, serde_json::Value> = message
            .data
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), serde_json::Value::String(s))
            })
            .collect();

        serde_json::json!({
            "message": {
                "token": token,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
                "data": data,
                "android": {
                    "notification": {
                        "sound": self.config.default_sound,
                        "icon": self.config.default_icon,
                    }
                },
            }
        })
    }

    /// APNs 载荷：aps 字典（alert / sound / badge）+ 自定义数据
    fn apns_payload(&self, message: &NotificationMessage, token: &str) -> serde_json::Value {
        let badge = message
            .data
            .get("badge")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);

        serde_json::json!({
            "device_token": token,
            "aps": {
                "alert": {
                    "title": message.title,
                    "body": message.body,
                },
                "sound": self.config.default_sound,
                "badge": badge,
            },
            "data": message.data,
        })
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn name(&self) -> &str {
        "Push"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult> {
        if self.sandbox {
            debug!(event_id = %message.event_id, "沙箱模式，Push 合成成功");
            return Ok(DeliveryResult::sandbox(ChannelKind::Push));
        }

        let Some(token) = message.recipient.as_deref() else {
            return Ok(DeliveryResult::permanent_failure(
                "push device token missing",
            ));
        };
        if token.trim().is_empty() {
            return Ok(DeliveryResult::permanent_failure("push device token empty"));
        }

        let platform = PushPlatform::for_message(message);
        let payload = match platform {
            PushPlatform::Fcm => self.fcm_payload(message, token),
            PushPlatform::Apns => self.apns_payload(message, token),
        };

        debug!(
            event_id = %message.event_id,
            platform = platform.name(),
            "Push 发送中..."
        );

        let mut request = self.http.post(self.endpoint(platform)).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status();
                // APNs 在响应头返回 apns-id
                let message_id = response
                    .headers()
                    .get("apns-id")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let body = response.text().await.unwrap_or_default();
                let message_id = message_id.or_else(|| {
                    serde_json::from_str::<serde_json::Value>(&body)
                        .ok()
                        .and_then(|v| v.get("name").and_then(|s| s.as_str()).map(|s| s.to_string()))
                });
                result_from_response(status, &body, message_id, platform.name())
            }
            Err(e) => result_from_network_error(&e, platform.name()),
        }
        .with_detail("platform", serde_json::json!(platform.name()));

        if result.success {
            info!(
                event_id = %message.event_id,
                platform = platform.name(),
                message_id = result.message_id.as_deref(),
                "Push 发送成功"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::events::{NotificationEvent, NotificationType, Severity};

    fn make_message(platform: Option<&str>) -> NotificationMessage {
        let mut data = serde_json::json!({"txHash": "0xabc", "badge": 3});
        if let Some(p) = platform {
            data["platform"] = serde_json::json!(p);
        }
        let event = NotificationEvent::new(
            NotificationType::TransactionConfirmed,
            Severity::Info,
            data,
            "test",
        )
        .with_user("user-001");
        let mut message = NotificationMessage::for_event(&event);
        message.recipient = Some("device-token-001".to_string());
        message.title = "Transaction confirmed".to_string();
        message.body = "0xabc confirmed".to_string();
        message
    }

    #[tokio::test]
    async fn test_sandbox_short_circuits() {
        let channel = PushChannel::new(PushConfig::default(), true);
        let result = channel.send(&make_message(None)).await.unwrap();

        assert!(result.success);
        assert!(result.message_id.unwrap().starts_with("sandbox_push_"));
    }

    #[tokio::test]
    async fn test_missing_token_is_permanent_failure() {
        let channel = PushChannel::new(PushConfig::default(), false);
        let mut message = make_message(None);
        message.recipient = None;

        let result = channel.send(&message).await.unwrap();
        assert!(!result.success);
        assert!(result.is_permanent());
    }

    #[test]
    fn test_platform_selection() {
        assert_eq!(
            PushPlatform::for_message(&make_message(Some("ios"))),
            PushPlatform::Apns
        );
        assert_eq!(
            PushPlatform::for_message(&make_message(Some("android"))),
            PushPlatform::Fcm
        );
        // 未指定平台默认 FCM
        assert_eq!(
            PushPlatform::for_message(&make_message(None)),
            PushPlatform::Fcm
        );
    }

    #[test]
    fn test_fcm_payload_shape() {
        let channel = PushChannel::new(PushConfig::default(), true);
        let message = make_message(Some("android"));
        let payload = channel.fcm_payload(&message, "tok-1");

        assert_eq!(payload["message"]["token"], "tok-1");
        assert_eq!(payload["message"]["notification"]["title"], "Transaction confirmed");
        // data 值必须是字符串
        assert_eq!(payload["message"]["data"]["badge"], "3");
        assert_eq!(payload["message"]["data"]["txHash"], "0xabc");
        assert_eq!(payload["message"]["android"]["notification"]["sound"], "default");
    }

    #[test]
    fn test_apns_payload_shape() {
        let channel = PushChannel::new(PushConfig::default(), true);
        let message = make_message(Some("ios"));
        let payload = channel.apns_payload(&message, "tok-1");

        assert_eq!(payload["device_token"], "tok-1");
        assert_eq!(payload["aps"]["alert"]["body"], "0xabc confirmed");
        assert_eq!(payload["aps"]["sound"], "default");
        // badge 取自消息数据
        assert_eq!(payload["aps"]["badge"], 3);
    }

    #[test]
    fn test_apns_badge_defaults_to_one() {
        let channel = PushChannel::new(PushConfig::default(), true);
        let mut message = make_message(Some("ios"));
        message.data.remove("badge");

        let payload = channel.apns_payload(&message, "tok-1");
        assert_eq!(payload["aps"]["badge"], 1);
    }
}
