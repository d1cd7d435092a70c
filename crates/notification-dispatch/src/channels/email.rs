//! Email 邮件通知渠道
//!
//! 按配置选择 sendgrid / ses / smtp 中继三种服务商之一。
//! 配置了服务商模板 ID 时走服务商侧模板替换（传变量不传内容），
//! 否则发送本地渲染好的主题与正文；打开/点击追踪设置按配置透传。

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use pulse_shared::config::EmailConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};

use super::{Channel, result_from_network_error, result_from_response};
use crate::error::Result;

/// 邮件服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmailProvider {
    Sendgrid,
    Ses,
    Smtp,
}

impl EmailProvider {
    fn parse(name: &str) -> Self {
        match name {
            "ses" => Self::Ses,
            "smtp" => Self::Smtp,
            // 未知服务商回落 sendgrid，配置错误在启动日志中可见
            _ => Self::Sendgrid,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Sendgrid => "sendgrid",
            Self::Ses => "ses",
            Self::Smtp => "smtp",
        }
    }
}

/// Email 邮件通知渠道
pub struct EmailChannel {
    config: EmailConfig,
    provider: EmailProvider,
    sandbox: bool,
    http: reqwest::Client,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, sandbox: bool) -> Self {
        let provider = EmailProvider::parse(&config.provider);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            provider,
            sandbox,
            http,
        }
    }

    /// 服务商端点：显式配置优先，否则使用各服务商默认值
    fn endpoint(&self) -> Option<String> {
        if let Some(endpoint) = &self.config.endpoint {
            return Some(endpoint.clone());
        }
        match self.provider {
            EmailProvider::Sendgrid => Some("https://api.sendgrid.com/v3/mail/send".to_string()),
            EmailProvider::Ses => {
                Some("https://email.us-east-1.amazonaws.com/v2/email/outbound-emails".to_string())
            }
            // smtp 中继没有合理默认值，必须显式配置
            EmailProvider::Smtp => None,
        }
    }

    /// 构建 sendgrid 请求体
    fn sendgrid_payload(&self, message: &NotificationMessage, to: &str) -> serde_json::Value {
        let mut personalization = serde_json::json!({
            "to": [{"email": to}],
        });

        let mut payload = serde_json::json!({
            "from": {
                "email": self.config.from_address,
                "name": self.config.from_name,
            },
        });

        if let Some(template_id) = &self.config.template_id {
            // 服务商侧模板：传模板 ID 与变量，不传内容
            payload["template_id"] = serde_json::json!(template_id);
            personalization["dynamic_template_data"] = serde_json::json!(message.data);
        } else {
            payload["subject"] =
                serde_json::json!(message.subject.clone().unwrap_or_else(|| message.title.clone()));
            let mut content = vec![serde_json::json!({
                "type": "text/plain",
                "value": message.body,
            })];
            if let Some(html) = &message.html {
                content.push(serde_json::json!({
                    "type": "text/html",
                    "value": html,
                }));
            }
            payload["content"] = serde_json::json!(content);
        }

        payload["personalizations"] = serde_json::json!([personalization]);

        if self.config.tracking_enabled {
            payload["tracking_settings"] = serde_json::json!({
                "click_tracking": {"enable": true},
                "open_tracking": {"enable": true},
            });
        }

        if !message.attachments.is_empty() {
            let attachments: Vec<serde_json::Value> = message
                .attachments
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "content": a.content,
                        "type": a.content_type,
                        "filename": a.filename,
                    })
                })
                .collect();
            payload["attachments"] = serde_json::json!(attachments);
        }

        payload
    }

    /// 构建 SES v2 请求体
    fn ses_payload(&self, message: &NotificationMessage, to: &str) -> serde_json::Value {
        let content = if let Some(template_id) = &self.config.template_id {
            serde_json::json!({
                "Template": {
                    "TemplateName": template_id,
                    "TemplateData": serde_json::to_string(&message.data).unwrap_or_default(),
                }
            })
        } else {
            serde_json::json!({
                "Simple": {
                    "Subject": {"Data": message.subject.clone().unwrap_or_else(|| message.title.clone())},
                    "Body": {
                        "Text": {"Data": message.body},
                        "Html": {"Data": message.html.clone().unwrap_or_default()},
                    }
                }
            })
        };

        serde_json::json!({
            "FromEmailAddress": format!("{} <{}>", self.config.from_name, self.config.from_address),
            "Destination": {"ToAddresses": [to]},
            "Content": content,
        })
    }

    /// 构建 smtp 中继请求体
    fn smtp_payload(&self, message: &NotificationMessage, to: &str) -> serde_json::Value {
        serde_json::json!({
            "from": format!("{} <{}>", self.config.from_name, self.config.from_address),
            "to": to,
            "subject": message.subject.clone().unwrap_or_else(|| message.title.clone()),
            "text": message.body,
            "html": message.html,
            "attachments": message.attachments,
        })
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn name(&self) -> &str {
        "Email"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult> {
        if self.sandbox {
            debug!(event_id = %message.event_id, "沙箱模式，Email 合成成功");
            return Ok(DeliveryResult::sandbox(ChannelKind::Email));
        }

        let Some(to) = message.recipient.as_deref() else {
            return Ok(DeliveryResult::permanent_failure(
                "invalid email address: recipient missing",
            ));
        };
        if !self.verify(to).await? {
            return Ok(DeliveryResult::permanent_failure(format!(
                "invalid email address: {to}"
            )));
        }

        let Some(endpoint) = self.endpoint() else {
            return Ok(DeliveryResult::permanent_failure(
                "smtp relay endpoint not configured",
            ));
        };

        let payload = match self.provider {
            EmailProvider::Sendgrid => self.sendgrid_payload(message, to),
            EmailProvider::Ses => self.ses_payload(message, to),
            EmailProvider::Smtp => self.smtp_payload(message, to),
        };

        debug!(
            event_id = %message.event_id,
            provider = self.provider.name(),
            to,
            "Email 发送中..."
        );

        let mut request = self.http.post(&endpoint).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let result = match request.send().await {
            Ok(response) => {
                let status = response.status();
                // sendgrid 在响应头返回消息 ID
                let message_id = response
                    .headers()
                    .get("x-message-id")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let body = response.text().await.unwrap_or_default();
                result_from_response(status, &body, message_id, self.provider.name())
            }
            Err(e) => result_from_network_error(&e, self.provider.name()),
        };

        if result.success {
            info!(
                event_id = %message.event_id,
                message_id = result.message_id.as_deref(),
                "Email 发送成功"
            );
        }
        Ok(result)
    }

    async fn verify(&self, address: &str) -> Result<bool> {
        let valid = address.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !address.contains(char::is_whitespace)
        });
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::events::{NotificationEvent, NotificationType, Severity};

    fn make_message(recipient: Option<&str>) -> NotificationMessage {
        let event = NotificationEvent::new(
            NotificationType::TransactionConfirmed,
            Severity::Info,
            serde_json::json!({"txHash": "0xabc"}),
            "test",
        )
        .with_user("user-001");
        let mut message = NotificationMessage::for_event(&event);
        message.recipient = recipient.map(|r| r.to_string());
        message.subject = Some("Transaction confirmed".to_string());
        message.title = "Transaction confirmed".to_string();
        message.body = "Transaction 0xabc confirmed.".to_string();
        message.html = Some("<p>0xabc</p>".to_string());
        message
    }

    fn sandbox_channel() -> EmailChannel {
        EmailChannel::new(EmailConfig::default(), true)
    }

    #[tokio::test]
    async fn test_sandbox_short_circuits() {
        let channel = sandbox_channel();
        let result = channel
            .send(&make_message(Some("alice@example.com")))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.message_id.unwrap().starts_with("sandbox_email_"));
        assert_eq!(result.details.get("sandbox"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_missing_recipient_is_permanent_failure() {
        let channel = EmailChannel::new(EmailConfig::default(), false);
        let result = channel.send(&make_message(None)).await.unwrap();

        assert!(!result.success);
        assert!(result.is_permanent());
        assert!(result.error.unwrap().contains("invalid email address"));
    }

    #[tokio::test]
    async fn test_invalid_address_is_permanent_failure() {
        let channel = EmailChannel::new(EmailConfig::default(), false);
        let result = channel
            .send(&make_message(Some("not-an-email")))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.is_permanent());
    }

    #[tokio::test]
    async fn test_smtp_without_endpoint_fails_permanently() {
        let config = EmailConfig {
            provider: "smtp".to_string(),
            ..Default::default()
        };
        let channel = EmailChannel::new(config, false);
        let result = channel
            .send(&make_message(Some("alice@example.com")))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.is_permanent());
        assert!(result.error.unwrap().contains("smtp relay"));
    }

    #[tokio::test]
    async fn test_verify_address_format() {
        let channel = sandbox_channel();

        assert!(channel.verify("alice@example.com").await.unwrap());
        assert!(!channel.verify("alice").await.unwrap());
        assert!(!channel.verify("@example.com").await.unwrap());
        assert!(!channel.verify("alice@nodot").await.unwrap());
        assert!(!channel.verify("a lice@example.com").await.unwrap());
    }

    #[test]
    fn test_sendgrid_payload_with_content() {
        let channel = sandbox_channel();
        let message = make_message(Some("alice@example.com"));
        let payload = channel.sendgrid_payload(&message, "alice@example.com");

        assert_eq!(payload["subject"], "Transaction confirmed");
        assert_eq!(
            payload["personalizations"][0]["to"][0]["email"],
            "alice@example.com"
        );
        assert_eq!(payload["content"][0]["type"], "text/plain");
        assert_eq!(payload["content"][1]["type"], "text/html");
        // 追踪设置透传
        assert_eq!(
            payload["tracking_settings"]["open_tracking"]["enable"],
            true
        );
    }

    #[test]
    fn test_sendgrid_payload_with_template_id() {
        let config = EmailConfig {
            template_id: Some("d-12345".to_string()),
            ..Default::default()
        };
        let channel = EmailChannel::new(config, true);
        let message = make_message(Some("alice@example.com"));
        let payload = channel.sendgrid_payload(&message, "alice@example.com");

        // 服务商模板模式：传模板 ID 与变量，不传内容
        assert_eq!(payload["template_id"], "d-12345");
        assert!(payload.get("content").is_none());
        assert_eq!(
            payload["personalizations"][0]["dynamic_template_data"]["txHash"],
            "0xabc"
        );
    }

    #[test]
    fn test_sendgrid_payload_with_attachment() {
        let channel = sandbox_channel();
        let mut message = make_message(Some("alice@example.com"));
        message.attachments.push(pulse_shared::events::Attachment {
            filename: "receipt.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            content: "aGVsbG8=".to_string(),
        });

        let payload = channel.sendgrid_payload(&message, "alice@example.com");
        assert_eq!(payload["attachments"][0]["filename"], "receipt.pdf");
    }

    #[test]
    fn test_ses_payload_shape() {
        let config = EmailConfig {
            provider: "ses".to_string(),
            ..Default::default()
        };
        let channel = EmailChannel::new(config, true);
        let message = make_message(Some("alice@example.com"));
        let payload = channel.ses_payload(&message, "alice@example.com");

        assert_eq!(payload["Destination"]["ToAddresses"][0], "alice@example.com");
        assert_eq!(
            payload["Content"]["Simple"]["Subject"]["Data"],
            "Transaction confirmed"
        );
    }

    #[test]
    fn test_provider_parse_falls_back_to_sendgrid() {
        assert_eq!(EmailProvider::parse("ses"), EmailProvider::Ses);
        assert_eq!(EmailProvider::parse("smtp"), EmailProvider::Smtp);
        assert_eq!(EmailProvider::parse("unknown"), EmailProvider::Sendgrid);
    }
}
