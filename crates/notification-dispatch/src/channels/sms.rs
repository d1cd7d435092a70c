//! SMS 短信通知渠道
//!
//! 按配置选择 twilio / aws-sns / messagebird 三种服务商之一。
//! 发送前校验 E.164 号码格式；正文超过配置长度时截断并追加省略号。

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use pulse_shared::config::SmsConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};

use super::{Channel, result_from_network_error, result_from_response};
use crate::error::Result;

/// E.164 国际号码格式：+ 国家码开头，总计 8-15 位数字
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+[1-9]\d{7,14}$").unwrap());

/// 短信服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmsProvider {
    Twilio,
    AwsSns,
    Messagebird,
}

impl SmsProvider {
    fn parse(name: &str) -> Self {
        match name {
            "aws-sns" => Self::AwsSns,
            "messagebird" => Self::Messagebird,
            _ => Self::Twilio,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Twilio => "twilio",
            Self::AwsSns => "aws-sns",
            Self::Messagebird => "messagebird",
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Twilio => "https://api.twilio.com/2010-04-01/Messages.json",
            Self::AwsSns => "https://sns.us-east-1.amazonaws.com/",
            Self::Messagebird => "https://rest.messagebird.com/messages",
        }
    }
}

/// SMS 短信通知渠道
pub struct SmsChannel {
    config: SmsConfig,
    provider: SmsProvider,
    sandbox: bool,
    http: reqwest::Client,
}

impl SmsChannel {
    pub fn new(config: SmsConfig, sandbox: bool) -> Self {
        let provider = SmsProvider::parse(&config.provider);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            provider,
            sandbox,
            http,
        }
    }

    /// 截断过长的正文并追加省略号
    fn truncate_body(&self, body: &str) -> String {
        let chars: Vec<char> = body.chars().collect();
        if chars.len() <= self.config.max_length {
            body.to_string()
        } else {
            let truncated: String = chars[..self.config.max_length.saturating_sub(3)]
                .iter()
                .collect();
            format!("{truncated}...")
        }
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn name(&self) -> &str {
        "SMS"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult> {
        if self.sandbox {
            debug!(event_id = %message.event_id, "沙箱模式，SMS 合成成功");
            return Ok(DeliveryResult::sandbox(ChannelKind::Sms));
        }

        let Some(to) = message.recipient.as_deref() else {
            return Ok(DeliveryResult::permanent_failure(
                "invalid phone number: recipient missing",
            ));
        };
        if !PHONE_RE.is_match(to) {
            return Ok(DeliveryResult::permanent_failure(format!(
                "invalid phone number: {to}"
            )));
        }

        let body = self.truncate_body(&message.body);
        let endpoint = self
            .config
            .endpoint
            .clone()
            .unwrap_or_else(|| self.provider.default_endpoint().to_string());

        debug!(
            event_id = %message.event_id,
            provider = self.provider.name(),
            content_length = body.chars().count(),
            "SMS 发送中..."
        );

        let mut request = match self.provider {
            // twilio 使用表单编码
            SmsProvider::Twilio => self.http.post(&endpoint).form(&[
                ("To", to),
                ("From", self.config.from_number.as_str()),
                ("Body", body.as_str()),
            ]),
            SmsProvider::AwsSns => self.http.post(&endpoint).json(&serde_json::json!({
                "PhoneNumber": to,
                "Message": body,
            })),
            SmsProvider::Messagebird => self.http.post(&endpoint).json(&serde_json::json!({
                "recipients": [to],
                "originator": self.config.from_number,
                "body": body,
            })),
        };
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                // twilio/messagebird 在响应体返回消息 ID
                let message_id = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| {
                        v.get("sid")
                            .or_else(|| v.get("id"))
                            .and_then(|s| s.as_str())
                            .map(|s| s.to_string())
                    });
                result_from_response(status, &body, message_id, self.provider.name())
            }
            Err(e) => result_from_network_error(&e, self.provider.name()),
        };

        if result.success {
            info!(
                event_id = %message.event_id,
                message_id = result.message_id.as_deref(),
                "SMS 发送成功"
            );
        }
        Ok(result)
    }

    async fn verify(&self, address: &str) -> Result<bool> {
        Ok(PHONE_RE.is_match(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::events::{NotificationEvent, NotificationType, Severity};

    fn make_message(recipient: Option<&str>, body: &str) -> NotificationMessage {
        let event = NotificationEvent::new(
            NotificationType::SecurityAlert,
            Severity::Warning,
            serde_json::json!({"reason": "new login"}),
            "test",
        )
        .with_user("user-001");
        let mut message = NotificationMessage::for_event(&event);
        message.recipient = recipient.map(|r| r.to_string());
        message.body = body.to_string();
        message
    }

    #[tokio::test]
    async fn test_sandbox_short_circuits() {
        let channel = SmsChannel::new(SmsConfig::default(), true);
        let result = channel
            .send(&make_message(Some("+8613800138000"), "hello"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.message_id.unwrap().starts_with("sandbox_sms_"));
    }

    #[tokio::test]
    async fn test_invalid_phone_is_permanent_failure() {
        let channel = SmsChannel::new(SmsConfig::default(), false);

        for bad in ["13800138000", "+0123", "+12ab", ""] {
            let result = channel.send(&make_message(Some(bad), "hi")).await.unwrap();
            assert!(!result.success, "号码 {bad} 应被拒绝");
            assert!(result.is_permanent());
            assert!(result.error.unwrap().contains("invalid phone number"));
        }
    }

    #[tokio::test]
    async fn test_missing_recipient_is_permanent_failure() {
        let channel = SmsChannel::new(SmsConfig::default(), false);
        let result = channel.send(&make_message(None, "hi")).await.unwrap();

        assert!(!result.success);
        assert!(result.is_permanent());
    }

    #[test]
    fn test_truncate_body_at_max_length() {
        let channel = SmsChannel::new(SmsConfig::default(), true);

        // 不超长时原样返回
        let short = "short message";
        assert_eq!(channel.truncate_body(short), short);

        // 超长时截断到 max_length 并以省略号结尾
        let long = "x".repeat(200);
        let truncated = channel.truncate_body(&long);
        assert_eq!(truncated.chars().count(), 160);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        let config = SmsConfig {
            max_length: 10,
            ..Default::default()
        };
        let channel = SmsChannel::new(config, true);

        let truncated = channel.truncate_body(&"安全告警".repeat(10));
        assert_eq!(truncated.chars().count(), 10);
        assert!(truncated.ends_with("..."));
    }

    #[tokio::test]
    async fn test_verify_phone_format() {
        let channel = SmsChannel::new(SmsConfig::default(), true);

        assert!(channel.verify("+8613800138000").await.unwrap());
        assert!(channel.verify("+14155552671").await.unwrap());
        assert!(!channel.verify("13800138000").await.unwrap());
        assert!(!channel.verify("+123").await.unwrap());
        assert!(!channel.verify("+8613800abc000").await.unwrap());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(SmsProvider::parse("twilio"), SmsProvider::Twilio);
        assert_eq!(SmsProvider::parse("aws-sns"), SmsProvider::AwsSns);
        assert_eq!(SmsProvider::parse("messagebird"), SmsProvider::Messagebird);
        assert_eq!(SmsProvider::parse("unknown"), SmsProvider::Twilio);
    }
}
