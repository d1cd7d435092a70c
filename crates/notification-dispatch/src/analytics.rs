//! 通知统计
//!
//! 记录事件量、投递结果与互动漏斗。所有计数器都落在键值存储上
//! （单 key 原子自增），进程重启不丢失；近期活动流是一个有界列表，
//! 超出容量后淘汰最旧条目。
//!
//! 失败投递按固定错误分类法归类（子串匹配），并写入带时间戳的
//! 持久投递日志，供管理端排查与 cleanup 定期清理。

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pulse_shared::error::Result;
use pulse_shared::events::{ChannelKind, NotificationEvent};
use pulse_shared::store::{KeyStore, Store, StoreKey};

/// 近期活动流的容量
const RECENT_ACTIVITY_LIMIT: isize = 100;

/// 互动动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementAction {
    Opened,
    Clicked,
    Unsubscribed,
}

impl EngagementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

/// 近期活动条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub event_id: String,
    pub notification_type: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub channels: Vec<ChannelKind>,
    pub at: DateTime<Utc>,
}

/// 投递日志记录（仅失败投递写入）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogRecord {
    pub event_id: String,
    pub channel: ChannelKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub error_type: String,
    pub at: DateTime<Utc>,
}

/// 统计周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsPeriod {
    Today,
    Last7Days,
    Last30Days,
}

impl MetricsPeriod {
    pub fn days(&self) -> i64 {
        match self {
            Self::Today => 1,
            Self::Last7Days => 7,
            Self::Last30Days => 30,
        }
    }
}

/// 单日计数
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

/// 统计快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total: i64,
    pub delivered: i64,
    pub failed: i64,
    pub by_type: HashMap<String, i64>,
    pub by_channel: HashMap<String, i64>,
    pub by_severity: HashMap<String, i64>,
    pub errors: HashMap<String, i64>,
    pub engagement: HashMap<String, i64>,
    pub daily: Vec<DailyCount>,
}

/// 通知统计
pub struct NotificationAnalytics {
    store: Store,
}

impl NotificationAnalytics {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// 记录一次事件分发（入队成功后调用）
    pub async fn track_event(
        &self,
        event: &NotificationEvent,
        channels: &[ChannelKind],
    ) -> Result<()> {
        let now = Utc::now();
        let date_key = now.format("%Y%m%d").to_string();
        let hour_key = now.format("%Y%m%d%H").to_string();

        self.store.incr(&StoreKey::stats_total(), 1).await?;
        self.store
            .incr(&StoreKey::stats_daily(&date_key), 1)
            .await?;
        self.store
            .incr(&StoreKey::stats_hourly(&hour_key), 1)
            .await?;
        self.store
            .hincr(&StoreKey::stats_by_type(), &event.event_type.to_string(), 1)
            .await?;
        self.store
            .hincr(&StoreKey::stats_by_severity(), &event.severity.to_string(), 1)
            .await?;
        for channel in channels {
            self.store
                .hincr(&StoreKey::stats_by_channel(), channel.as_str(), 1)
                .await?;
        }
        if let Some(user_id) = &event.user_id {
            self.store
                .hincr(&StoreKey::stats_user(user_id), "sent", 1)
                .await?;
        }

        // 有界活动流：新条目插入头部，超过容量的旧条目被裁掉
        let entry = ActivityEntry {
            event_id: event.id.clone(),
            notification_type: event.event_type.to_string(),
            severity: event.severity.to_string(),
            user_id: event.user_id.clone(),
            channels: channels.to_vec(),
            at: now,
        };
        let serialized = serde_json::to_string(&entry)
            .map_err(|e| pulse_shared::error::NotifyError::Serialization(e.to_string()))?;
        self.store.lpush(&StoreKey::stats_recent(), &serialized).await?;
        self.store
            .ltrim(&StoreKey::stats_recent(), 0, RECENT_ACTIVITY_LIMIT - 1)
            .await?;

        metrics::counter!("notify_events_accepted_total").increment(1);
        Ok(())
    }

    /// 记录一次渠道投递结果
    ///
    /// 失败时按错误分类法归类并写入持久投递日志。
    pub async fn track_delivery(
        &self,
        event_id: &str,
        channel: ChannelKind,
        success: bool,
        message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        if success {
            self.store.incr(&StoreKey::stats_delivered_total(), 1).await?;
            self.store
                .hincr(&StoreKey::stats_delivery(channel.as_str()), "delivered", 1)
                .await?;
            debug!(event_id, channel = %channel, message_id, "投递成功已记录");
            return Ok(());
        }

        self.store.incr(&StoreKey::stats_failed_total(), 1).await?;
        self.store
            .hincr(&StoreKey::stats_delivery(channel.as_str()), "failed", 1)
            .await?;

        let error_type = categorize_error(error.unwrap_or(""));
        self.store
            .hincr(&StoreKey::stats_errors(), error_type, 1)
            .await?;

        let record = DeliveryLogRecord {
            event_id: event_id.to_string(),
            channel,
            error: error.map(|e| e.to_string()),
            error_type: error_type.to_string(),
            at: Utc::now(),
        };
        let serialized = serde_json::to_string(&record)
            .map_err(|e| pulse_shared::error::NotifyError::Serialization(e.to_string()))?;
        self.store
            .zadd(
                &StoreKey::delivery_log(),
                &serialized,
                Utc::now().timestamp_millis() as f64,
            )
            .await?;

        warn!(event_id, channel = %channel, error_type, error, "投递失败已记录");
        Ok(())
    }

    /// 记录互动漏斗事件（打开 / 点击 / 退订）
    pub async fn track_engagement(&self, event_id: &str, action: EngagementAction) -> Result<()> {
        self.store
            .hincr(&StoreKey::stats_engagement(), action.as_str(), 1)
            .await?;
        debug!(event_id, action = action.as_str(), "互动事件已记录");
        Ok(())
    }

    /// 近期活动流（最新在前）
    pub async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let raw = self
            .store
            .lrange(&StoreKey::stats_recent(), 0, limit as isize - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }

    /// 聚合统计快照
    pub async fn metrics(&self, period: MetricsPeriod) -> Result<MetricsSnapshot> {
        let total = self.read_counter(&StoreKey::stats_total()).await?;
        let delivered = self.read_counter(&StoreKey::stats_delivered_total()).await?;
        let failed = self.read_counter(&StoreKey::stats_failed_total()).await?;

        let by_type = self.read_hash(&StoreKey::stats_by_type()).await?;
        let by_channel = self.read_hash(&StoreKey::stats_by_channel()).await?;
        let by_severity = self.read_hash(&StoreKey::stats_by_severity()).await?;
        let errors = self.read_hash(&StoreKey::stats_errors()).await?;
        let engagement = self.read_hash(&StoreKey::stats_engagement()).await?;

        let today = Utc::now().date_naive();
        let mut daily = Vec::with_capacity(period.days() as usize);
        for offset in 0..period.days() {
            let date = today - ChronoDuration::days(offset);
            let date_key = date.format("%Y%m%d").to_string();
            let count = self.read_counter(&StoreKey::stats_daily(&date_key)).await?;
            daily.push(DailyCount {
                date: date_key,
                count,
            });
        }

        Ok(MetricsSnapshot {
            total,
            delivered,
            failed,
            by_type,
            by_channel,
            by_severity,
            errors,
            engagement,
            daily,
        })
    }

    /// 指定用户的统计（发送量等）
    pub async fn metrics_for_user(&self, user_id: &str) -> Result<HashMap<String, i64>> {
        self.read_hash(&StoreKey::stats_user(user_id)).await
    }

    /// 清理过期统计数据
    ///
    /// 删除超过保留天数的按日/按小时计数器与投递日志记录，
    /// 返回删除的键数量。
    pub async fn cleanup(&self, days_to_keep: i64) -> Result<u64> {
        let cutoff_date = Utc::now().date_naive() - ChronoDuration::days(days_to_keep);
        let daily_cutoff = cutoff_date.format("%Y%m%d").to_string();
        let hourly_cutoff = format!("{daily_cutoff}00");
        let mut purged = 0;

        for key in self.store.keys("notify:stats:daily:*").await? {
            // yyyymmdd 后缀按字典序比较即时间序
            if key
                .rsplit(':')
                .next()
                .is_some_and(|suffix| suffix < daily_cutoff.as_str())
            {
                self.store.del(&key).await?;
                purged += 1;
            }
        }
        for key in self.store.keys("notify:stats:hourly:*").await? {
            if key
                .rsplit(':')
                .next()
                .is_some_and(|suffix| suffix < hourly_cutoff.as_str())
            {
                self.store.del(&key).await?;
                purged += 1;
            }
        }

        let cutoff_ms = (Utc::now() - ChronoDuration::days(days_to_keep)).timestamp_millis();
        let removed = self
            .store
            .zrem_range_by_score(&StoreKey::delivery_log(), 0.0, cutoff_ms as f64)
            .await?;

        info!(purged_keys = purged, purged_log_records = removed, "统计数据清理完成");
        Ok(purged + removed)
    }

    async fn read_counter(&self, key: &str) -> Result<i64> {
        Ok(self
            .store
            .get_raw(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, i64>> {
        Ok(self
            .store
            .hgetall(key)
            .await?
            .into_iter()
            .filter_map(|(k, v)| v.parse().ok().map(|n| (k, n)))
            .collect())
    }
}

/// 将投递错误信息归类到固定分类法
///
/// 子串匹配，按特异性从高到低；无法归类的进 other。
pub fn categorize_error(error: &str) -> &'static str {
    let lower = error.to_lowercase();

    if lower.contains("rate limit") || lower.contains("rate_limited") || lower.contains("429") {
        "rate_limited"
    } else if lower.contains("invalid email") || lower.contains("email address") {
        "invalid_email"
    } else if lower.contains("invalid phone") || lower.contains("phone number") {
        "invalid_phone"
    } else if lower.contains("bounce") {
        "bounced"
    } else if lower.contains("spam") {
        "spam_blocked"
    } else if lower.contains("unsubscribe") {
        "unsubscribed"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("network") || lower.contains("connection") || lower.contains("dns") {
        "network_error"
    } else if lower.contains("auth")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("forbidden")
    {
        "auth_error"
    } else {
        "other"
    }
}
