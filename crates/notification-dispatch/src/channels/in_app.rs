//! InApp 站内信渠道
//!
//! 将通知记录持久化到键值存储：每用户一个按时间排序的消息流
//! （有序集合存记录 ID）加独立的记录文档与未读集合。接收方在线时
//! 通过注入的实时推送通道（外部协作方，如 WebSocket 网关）即时送达，
//! 离线则留待客户端拉取。
//!
//! 读取/未读数/标记已读/删除操作由展示层直接消费。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_shared::config::InAppConfig;
use pulse_shared::events::{ChannelKind, DeliveryResult, NotificationMessage};
use pulse_shared::store::{KeyStore, Store, StoreKey};

use super::Channel;
use crate::error::Result;

/// 实时推送通道抽象（外部协作方）
///
/// 站内信渠道只关心"接收方是否在线"与"推送一条记录"，
/// 具体传输（WebSocket、SSE 等）由外部实现。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealtimePush: Send + Sync {
    /// 接收方是否在线
    async fn is_connected(&self, user_id: &str) -> bool;

    /// 向在线接收方推送一条站内信记录
    async fn push(&self, user_id: &str, record: &InAppRecord) -> pulse_shared::error::Result<()>;
}

/// 站内信记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InAppRecord {
    pub id: String,
    pub event_id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// InApp 站内信渠道
pub struct InAppChannel {
    store: Store,
    config: InAppConfig,
    sandbox: bool,
    realtime: Option<Arc<dyn RealtimePush>>,
}

impl InAppChannel {
    pub fn new(
        store: Store,
        config: InAppConfig,
        sandbox: bool,
        realtime: Option<Arc<dyn RealtimePush>>,
    ) -> Self {
        Self {
            store,
            config,
            sandbox,
            realtime,
        }
    }

    fn record_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.record_ttl_days * 24 * 3600)
    }

    /// 持久化记录并维护消息流与未读集合
    async fn persist(&self, record: &InAppRecord) -> Result<()> {
        let ts = record.created_at.timestamp_millis() as f64;

        self.store
            .set(
                &StoreKey::inapp_record(&record.id),
                record,
                Some(self.record_ttl()),
            )
            .await?;
        self.store
            .zadd(&StoreKey::inapp_feed(&record.user_id), &record.id, ts)
            .await?;
        self.store
            .zadd(&StoreKey::inapp_unread(&record.user_id), &record.id, ts)
            .await?;

        self.enforce_feed_cap(&record.user_id).await?;
        Ok(())
    }

    /// 消息流超过容量时淘汰最旧的记录
    async fn enforce_feed_cap(&self, user_id: &str) -> Result<()> {
        let feed_key = StoreKey::inapp_feed(user_id);
        let count = self.store.zcard(&feed_key).await?;
        if count <= self.config.max_feed_size as u64 {
            return Ok(());
        }

        let overflow = (count - self.config.max_feed_size as u64) as usize;
        let oldest = self
            .store
            .zrange_by_score(&feed_key, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        for record_id in oldest.iter().take(overflow) {
            self.remove_record(user_id, record_id).await?;
        }

        debug!(user_id, evicted = overflow, "站内信消息流已裁剪");
        Ok(())
    }

    async fn remove_record(&self, user_id: &str, record_id: &str) -> Result<()> {
        self.store
            .zrem(&StoreKey::inapp_feed(user_id), record_id)
            .await?;
        self.store
            .zrem(&StoreKey::inapp_unread(user_id), record_id)
            .await?;
        self.store.del(&StoreKey::inapp_record(record_id)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 展示层消费的读操作
    // -----------------------------------------------------------------------

    /// 分页读取消息流（最新在前）
    pub async fn list(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InAppRecord>> {
        let ids = self
            .store
            .zrevrange(
                &StoreKey::inapp_feed(user_id),
                offset as isize,
                (offset + limit) as isize - 1,
            )
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get::<InAppRecord>(&StoreKey::inapp_record(&id)).await? {
                Some(record) => records.push(record),
                // 记录已过期：顺手清理消息流中的悬挂 ID
                None => {
                    self.remove_record(user_id, &id).await?;
                }
            }
        }
        Ok(records)
    }

    /// 未读数量
    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        Ok(self.store.zcard(&StoreKey::inapp_unread(user_id)).await?)
    }

    /// 标记单条已读
    pub async fn mark_read(&self, user_id: &str, record_id: &str) -> Result<()> {
        self.store
            .zrem(&StoreKey::inapp_unread(user_id), record_id)
            .await?;

        let key = StoreKey::inapp_record(record_id);
        if let Some(mut record) = self.store.get::<InAppRecord>(&key).await? {
            record.read = true;
            self.store.set(&key, &record, Some(self.record_ttl())).await?;
        }
        Ok(())
    }

    /// 全部标记已读
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let unread = self
            .store
            .zrange_by_score(
                &StoreKey::inapp_unread(user_id),
                f64::NEG_INFINITY,
                f64::INFINITY,
            )
            .await?;
        let count = unread.len() as u64;
        for record_id in unread {
            self.mark_read(user_id, &record_id).await?;
        }
        Ok(count)
    }

    /// 删除单条记录
    pub async fn delete(&self, user_id: &str, record_id: &str) -> Result<()> {
        self.remove_record(user_id, record_id).await
    }
}

#[async_trait]
impl Channel for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    fn name(&self) -> &str {
        "InApp"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<DeliveryResult> {
        if self.sandbox {
            debug!(event_id = %message.event_id, "沙箱模式，InApp 合成成功");
            return Ok(DeliveryResult::sandbox(ChannelKind::InApp));
        }

        let Some(user_id) = message.user_id.as_deref() else {
            return Ok(DeliveryResult::permanent_failure(
                "in-app notification requires a user",
            ));
        };

        let record = InAppRecord {
            id: Uuid::now_v7().to_string(),
            event_id: message.event_id.clone(),
            user_id: user_id.to_string(),
            title: message.title.clone(),
            body: message.body.clone(),
            data: serde_json::Value::Object(
                message
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            read: false,
            created_at: Utc::now(),
        };

        self.persist(&record).await?;

        // 在线接收方即时推送；推送失败不影响投递结果（记录已持久化）
        let mut pushed = false;
        if let Some(realtime) = &self.realtime
            && realtime.is_connected(user_id).await
        {
            match realtime.push(user_id, &record).await {
                Ok(()) => pushed = true,
                Err(e) => {
                    warn!(user_id, error = %e, "实时推送失败，留待客户端拉取");
                }
            }
        }

        info!(
            event_id = %message.event_id,
            user_id,
            record_id = %record.id,
            pushed,
            "站内信已投递"
        );

        Ok(DeliveryResult::success(record.id.clone())
            .with_detail("pushed", serde_json::json!(pushed)))
    }
}
