//! 通知分发服务
//!
//! 引擎的编排层：校验事件 -> 偏好与静默时段闸门 -> 限流 ->
//! 渠道筛选 -> 按渠道渲染 -> 入队 -> 统计上报。
//!
//! ## 结果语义
//!
//! - 校验失败：同步返回 Validation 错误，绝不入队
//! - 类别关闭 / 静默时段：不是错误，静默跳过（info 日志 + 回执标记）
//! - 触发限流：返回独立的 RateLimited 错误，调用方自行决策，不自动重试
//! - 正常路径：返回已入队的渠道列表与优先级

use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use pulse_shared::events::{
    ChannelKind, NotificationEvent, NotificationMessage, Priority, QueueJob, Severity,
};

use crate::analytics::NotificationAnalytics;
use crate::error::{DispatchError, Result};
use crate::preferences::PreferenceManager;
use crate::queue::{QueueManager, QueueStatus};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::template::TemplateEngine;

/// 静默跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// 事件类别在用户偏好中被关闭
    CategoryDisabled,
    /// 当前处于用户的静默时段
    QuietHours,
}

/// 发送回执
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub event_id: String,
    /// 是否进入了投递队列
    pub accepted: bool,
    /// 已入队的渠道
    pub channels: Vec<ChannelKind>,
    /// 事件的基础优先级（digest 渠道的任务单独进 digest 队列）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl SendReceipt {
    fn queued(event_id: String, channels: Vec<ChannelKind>, priority: Priority) -> Self {
        Self {
            event_id,
            accepted: true,
            channels,
            priority: Some(priority),
            skipped: None,
        }
    }

    fn skipped(event_id: String, reason: SkipReason) -> Self {
        Self {
            event_id,
            accepted: false,
            channels: Vec::new(),
            priority: None,
            skipped: Some(reason),
        }
    }
}

/// 单个已选渠道：渠道、投递地址、是否摘要投递
struct SelectedChannel {
    kind: ChannelKind,
    address: Option<String>,
    digest: bool,
}

/// 通知分发服务
pub struct NotificationService {
    preferences: Arc<PreferenceManager>,
    rate_limiter: Arc<RateLimiter>,
    templates: Arc<TemplateEngine>,
    queues: Arc<QueueManager>,
    analytics: Arc<NotificationAnalytics>,
}

impl NotificationService {
    pub fn new(
        preferences: Arc<PreferenceManager>,
        rate_limiter: Arc<RateLimiter>,
        templates: Arc<TemplateEngine>,
        queues: Arc<QueueManager>,
        analytics: Arc<NotificationAnalytics>,
    ) -> Self {
        Self {
            preferences,
            rate_limiter,
            templates,
            queues,
            analytics,
        }
    }

    /// 接收一个通知事件并分发到各渠道队列
    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            user_id = event.user_id.as_deref()
        )
    )]
    pub async fn send(&self, event: NotificationEvent) -> Result<SendReceipt> {
        // 1. 同步校验，不合法的事件绝不入队
        event
            .validate()
            .map_err(DispatchError::Validation)?;

        let mut language = "en".to_string();
        let selected: Vec<SelectedChannel>;

        if let Some(user_id) = event.user_id.clone() {
            let prefs = self.preferences.get(&user_id).await;
            language = prefs.language.clone();

            // 2. 类别总开关：关闭即静默跳过（策略决定，不是错误）
            if !prefs.category_enabled(event.event_type.category()) {
                info!(category = event.event_type.category(), "事件类别已关闭，静默跳过");
                metrics::counter!("notify_events_skipped_total").increment(1);
                return Ok(SendReceipt::skipped(event.id, SkipReason::CategoryDisabled));
            }

            // 3. 静默时段抑制非 critical 通知（支持跨午夜窗口）
            if event.severity != Severity::Critical
                && prefs.quiet_hours.is_active_at(chrono::Utc::now())
            {
                info!("处于静默时段，静默跳过");
                metrics::counter!("notify_events_skipped_total").increment(1);
                return Ok(SendReceipt::skipped(event.id, SkipReason::QuietHours));
            }

            // 4. 用户级与类型级限流；拒绝时向调用方返回独立信号，不入队
            if let RateDecision::Limited { scope } =
                self.rate_limiter.check(&user_id, event.event_type, &[]).await
            {
                warn!(scope, "触发限流，发送被跳过");
                metrics::counter!("notify_events_rate_limited_total").increment(1);
                return Err(DispatchError::RateLimited { scope });
            }

            // 5. 渠道筛选：enabled && verified && 类型在 instant/digest 且不在 disabled；
            //    配置了渠道级限额的渠道再过一道渠道层限流
            let mut channels = Vec::new();
            for (kind, pref) in &prefs.channels {
                let wants_instant = pref.instant.contains(&event.event_type);
                let wants_digest = pref.digest.contains(&event.event_type);
                let opted_out = pref.disabled.contains(&event.event_type);
                if !pref.enabled || !pref.verified || opted_out || !(wants_instant || wants_digest)
                {
                    continue;
                }
                if let RateDecision::Limited { scope } =
                    self.rate_limiter.check_channel(&user_id, *kind).await
                {
                    debug!(channel = %kind, scope, "渠道级限流，跳过该渠道");
                    continue;
                }
                channels.push(SelectedChannel {
                    kind: *kind,
                    address: pref.address.clone(),
                    digest: wants_digest && !wants_instant,
                });
            }
            selected = channels;
        } else {
            // 无目标用户的广播事件：data.channels 显式指定，否则仅站内信
            selected = Self::broadcast_channels(&event);
        }

        if selected.is_empty() {
            debug!("没有可投递的渠道");
            let priority = Priority::for_event(&event);
            return Ok(SendReceipt::queued(event.id, Vec::new(), priority));
        }

        // 6. 按渠道渲染并入队
        let base_priority = Priority::for_event(&event);
        let mut enqueued = Vec::new();
        let mut last_error = None;

        for channel in &selected {
            let rendered =
                self.templates
                    .render(event.event_type, channel.kind, &event.data, &language);

            let mut message = NotificationMessage::for_event(&event);
            message.recipient = channel.address.clone();
            message.subject = rendered.subject;
            message.title = rendered.title;
            message.body = rendered.body;
            message.html = rendered.html;
            message.metadata.insert("locale".to_string(), language.clone());
            if let Some(correlation_id) = &event.metadata.correlation_id {
                message
                    .metadata
                    .insert("correlationId".to_string(), correlation_id.clone());
            }

            let priority = if channel.digest {
                Priority::Digest
            } else {
                base_priority
            };
            let job = QueueJob::new(event.clone(), channel.kind, message, priority);

            match self.queues.enqueue(&job).await {
                Ok(()) => enqueued.push(channel.kind),
                Err(e) => {
                    // 单渠道入队失败不拖垮其他渠道
                    warn!(channel = %channel.kind, error = %e, "渠道任务入队失败");
                    last_error = Some(e);
                }
            }
        }

        if enqueued.is_empty() {
            if let Some(e) = last_error {
                return Err(DispatchError::Shared(e));
            }
        }

        // 7. 统计上报失败不影响发送结果
        if let Err(e) = self.analytics.track_event(&event, &enqueued).await {
            warn!(error = %e, "统计上报失败");
        }

        info!(
            channels = ?enqueued,
            priority = %base_priority,
            "事件已分发入队"
        );
        Ok(SendReceipt::queued(event.id, enqueued, base_priority))
    }

    /// 批量发送：各事件独立分发，单个失败不影响其他事件
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn send_batch(&self, events: Vec<NotificationEvent>) -> Vec<Result<SendReceipt>> {
        let futures: Vec<_> = events.into_iter().map(|event| self.send(event)).collect();
        join_all(futures).await
    }

    /// 队列状态快照（各优先级的 waiting / active / completed / failed）
    pub async fn queue_status(&self) -> Result<std::collections::HashMap<String, QueueStatus>> {
        Ok(self.queues.status().await?)
    }

    /// 广播事件的渠道列表：data.channels 显式指定，未指定则仅站内信
    fn broadcast_channels(event: &NotificationEvent) -> Vec<SelectedChannel> {
        let explicit = event.data.get("channels").and_then(|v| v.as_array());

        let kinds: Vec<ChannelKind> = match explicit {
            Some(values) => values
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|name| match ChannelKind::from_str(name) {
                    Ok(kind) => Some(kind),
                    Err(e) => {
                        warn!(error = %e, "广播事件指定了未知渠道，忽略");
                        None
                    }
                })
                .collect(),
            None => vec![ChannelKind::InApp],
        };

        kinds
            .into_iter()
            .map(|kind| SelectedChannel {
                kind,
                address: None,
                digest: false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::config::{
        PreferencesConfig, QueueConfig, RateLimitConfig, TemplateConfig,
    };
    use pulse_shared::events::{NotificationType, Severity};
    use pulse_shared::store::{KeyStore, Store, StoreKey};

    fn build_service(store: Store, rate_limit: RateLimitConfig) -> (NotificationService, Arc<QueueManager>) {
        let queues = Arc::new(QueueManager::new(store.clone(), QueueConfig::default()));
        let service = NotificationService::new(
            Arc::new(PreferenceManager::new(
                store.clone(),
                &PreferencesConfig::default(),
            )),
            Arc::new(RateLimiter::new(store.clone(), rate_limit)),
            Arc::new(TemplateEngine::new(&TemplateConfig::default())),
            queues.clone(),
            Arc::new(NotificationAnalytics::new(store)),
        );
        (service, queues)
    }

    fn default_service(store: Store) -> (NotificationService, Arc<QueueManager>) {
        build_service(store, RateLimitConfig::default())
    }

    fn make_event(user_id: Option<&str>) -> NotificationEvent {
        let mut event = NotificationEvent::new(
            NotificationType::TransactionConfirmed,
            Severity::Info,
            serde_json::json!({"txHash": "0xabc"}),
            "chain-listener",
        );
        event.user_id = user_id.map(|u| u.to_string());
        event
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_synchronously() {
        let store = Store::memory();
        let (service, queues) = default_service(store);

        let mut event = make_event(Some("u1"));
        event.id = "".to_string();
        let err = service.send(event).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let mut event = make_event(Some("u1"));
        event.data = serde_json::Value::Null;
        assert!(service.send(event).await.is_err());

        // 被拒绝的事件绝不入队
        for (_, status) in queues.status().await.unwrap() {
            assert_eq!(status.waiting, 0);
        }
    }

    #[tokio::test]
    async fn test_default_user_selects_in_app_only() {
        let store = Store::memory();
        let (service, _) = default_service(store.clone());

        let receipt = service.send(make_event(Some("u1"))).await.unwrap();

        assert!(receipt.accepted);
        assert_eq!(receipt.channels, vec![ChannelKind::InApp]);
        assert_eq!(receipt.priority, Some(Priority::Normal));

        // 入队到 normal 队列
        assert_eq!(store.llen(&StoreKey::queue("normal")).await.unwrap(), 1);

        // 统计已上报
        let by_channel = store.hgetall(&StoreKey::stats_by_channel()).await.unwrap();
        assert_eq!(by_channel.get("inApp"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_selection_excludes_disabled_unverified_and_opted_out() {
        let store = Store::memory();
        let (service, _) = default_service(store.clone());

        // email 启用但未验证；sms 启用已验证但类型在 disabled；push 启用已验证且类型在 instant
        let prefs = PreferenceManager::new(store.clone(), &PreferencesConfig::default());
        prefs
            .set(
                "u1",
                serde_json::json!({
                    "channels": {
                        "email": {"enabled": true, "verified": false, "address": "a@example.com"},
                        "sms": {
                            "enabled": true, "verified": true, "address": "+8613800138000",
                            "instant": [], "disabled": ["TRANSACTION_CONFIRMED"]
                        },
                        "push": {"enabled": true, "verified": true, "address": "tok-1"}
                    }
                }),
            )
            .await
            .unwrap();

        let receipt = service.send(make_event(Some("u1"))).await.unwrap();

        // 选中集不包含 disabled / 未验证 / 类型被关闭的渠道
        assert!(!receipt.channels.contains(&ChannelKind::Email));
        assert!(!receipt.channels.contains(&ChannelKind::Sms));
        assert!(receipt.channels.contains(&ChannelKind::Push));
        assert!(receipt.channels.contains(&ChannelKind::InApp));
    }

    #[tokio::test]
    async fn test_category_disabled_is_silent_skip() {
        let store = Store::memory();
        let (service, queues) = default_service(store.clone());

        let prefs = PreferenceManager::new(store.clone(), &PreferencesConfig::default());
        prefs
            .set("u1", serde_json::json!({"categories": {"marketing": false}}))
            .await
            .unwrap();

        let mut event = make_event(Some("u1"));
        event.event_type = NotificationType::Promotional;

        let receipt = service.send(event).await.unwrap();
        assert!(!receipt.accepted);
        assert_eq!(receipt.skipped, Some(SkipReason::CategoryDisabled));
        assert_eq!(queues.status().await.unwrap()["low"].waiting, 0);
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_non_critical() {
        let store = Store::memory();
        let (service, _) = default_service(store.clone());

        // 全天静默窗口，保证测试时刻命中
        let prefs = PreferenceManager::new(store.clone(), &PreferencesConfig::default());
        prefs
            .set(
                "u1",
                serde_json::json!({
                    "quietHours": {"enabled": true, "start": "00:00", "end": "23:59"}
                }),
            )
            .await
            .unwrap();

        let receipt = service.send(make_event(Some("u1"))).await.unwrap();
        assert!(!receipt.accepted);
        assert_eq!(receipt.skipped, Some(SkipReason::QuietHours));

        // critical 事件穿透静默时段
        let mut critical = make_event(Some("u1"));
        critical.severity = Severity::Critical;
        let receipt = service.send(critical).await.unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.priority, Some(Priority::High));
    }

    #[tokio::test]
    async fn test_rate_limited_send_raises_distinct_error() {
        let store = Store::memory();
        let rate_limit = RateLimitConfig {
            per_user_window_seconds: 60,
            per_user_max: 1,
            per_channel: Default::default(),
        };
        let (service, queues) = build_service(store, rate_limit);

        assert!(service.send(make_event(Some("u1"))).await.is_ok());

        let err = service.send(make_event(Some("u1"))).await.unwrap_err();
        assert!(err.is_rate_limited());

        // 被限流的事件没有入队
        assert_eq!(queues.status().await.unwrap()["normal"].waiting, 1);
    }

    #[tokio::test]
    async fn test_digest_type_routes_to_digest_queue() {
        let store = Store::memory();
        let (service, queues) = default_service(store.clone());

        // 默认偏好中营销类型在站内信的 digest 列表
        let mut event = make_event(Some("u1"));
        event.event_type = NotificationType::Educational;

        let receipt = service.send(event).await.unwrap();
        assert_eq!(receipt.channels, vec![ChannelKind::InApp]);
        // 基础优先级仍是 low，但任务进入 digest 队列
        assert_eq!(receipt.priority, Some(Priority::Low));

        let status = queues.status().await.unwrap();
        assert_eq!(status["digest"].waiting, 1);
        assert_eq!(status["low"].waiting, 0);
    }

    #[tokio::test]
    async fn test_priority_assignment_rules() {
        let store = Store::memory();
        let (service, queues) = default_service(store.clone());

        // 安全告警 -> high 队列
        let mut event = make_event(Some("u1"));
        event.event_type = NotificationType::SecurityAlert;
        let receipt = service.send(event).await.unwrap();
        assert_eq!(receipt.priority, Some(Priority::High));
        assert_eq!(queues.status().await.unwrap()["high"].waiting, 1);
    }

    #[tokio::test]
    async fn test_broadcast_event_uses_explicit_channels() {
        let store = Store::memory();
        let (service, queues) = default_service(store.clone());

        let mut event = make_event(None);
        event.data = serde_json::json!({
            "txHash": "0xabc",
            "channels": ["webhook", "inApp", "pigeon"]
        });

        let receipt = service.send(event).await.unwrap();
        // 未知渠道被忽略
        assert_eq!(receipt.channels.len(), 2);
        assert!(receipt.channels.contains(&ChannelKind::Webhook));
        assert!(receipt.channels.contains(&ChannelKind::InApp));
        assert_eq!(queues.status().await.unwrap()["normal"].waiting, 2);
    }

    #[tokio::test]
    async fn test_broadcast_event_defaults_to_in_app() {
        let store = Store::memory();
        let (service, _) = default_service(store);

        let receipt = service.send(make_event(None)).await.unwrap();
        assert_eq!(receipt.channels, vec![ChannelKind::InApp]);
    }

    #[tokio::test]
    async fn test_rendered_message_carries_recipient_and_locale() {
        let store = Store::memory();
        let (service, queues) = default_service(store.clone());

        let prefs = PreferenceManager::new(store.clone(), &PreferencesConfig::default());
        prefs
            .set(
                "u1",
                serde_json::json!({
                    "language": "zh",
                    "channels": {
                        "email": {"enabled": true, "verified": true, "address": "a@example.com"}
                    }
                }),
            )
            .await
            .unwrap();

        let mut event = make_event(Some("u1"));
        event.event_type = NotificationType::TransactionFailed;
        event.data = serde_json::json!({"txHash": "0xabc", "reason": "nonce too low"});
        service.send(event).await.unwrap();

        // 高优先级队列中应有 email 任务，消息带地址与中文渲染
        let lease = queues.pop(Priority::High).await.unwrap().unwrap();
        let email_job = if lease.job.channel == ChannelKind::Email {
            lease.job
        } else {
            queues.pop(Priority::High).await.unwrap().unwrap().job
        };
        assert_eq!(email_job.message.recipient.as_deref(), Some("a@example.com"));
        assert!(email_job.message.body.contains("nonce too low"));
        assert!(email_job.message.title.contains("交易失败"));
        assert_eq!(
            email_job.message.metadata.get("locale"),
            Some(&"zh".to_string())
        );
    }

    #[tokio::test]
    async fn test_send_batch_isolates_failures() {
        let store = Store::memory();
        let (service, _) = default_service(store);

        let mut bad = make_event(Some("u1"));
        bad.id = String::new();

        let results = service
            .send_batch(vec![make_event(Some("u1")), bad, make_event(Some("u2"))])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
