//! 发送频率限制
//!
//! 基于有序集合的滑动窗口计数：每次放行在窗口集合中记录一个带时间戳
//! 的成员，检查时先惰性清除窗口外的旧成员再比较数量。所有修改都是
//! 单 key 的原子操作，并发工作者不会把同一逻辑计数器推过上限。
//!
//! 分层检查：用户级全局窗口 -> 渠道级窗口（如有配置）-> 类型级覆写。
//! 任一层拒绝即拒绝整次发送。存储故障时放行（fail open）——
//! 投递可用性优先于严格限流。

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_shared::config::RateLimitConfig;
use pulse_shared::error::Result;
use pulse_shared::events::{ChannelKind, NotificationType};
use pulse_shared::store::{KeyStore, Store, StoreKey};

/// 限流判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// 被哪一层拒绝（user / channel / type）
    Limited { scope: String },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// 窗口用量快照
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateUsage {
    pub used: u32,
    pub max: u32,
    pub window_seconds: u64,
}

/// 敏感/营销类型的硬编码窗口覆写
///
/// 比渠道级配置更严格的类型级限额：营销内容每天 2 条，
/// 安全告警每小时 10 条（防止告警风暴刷屏），行情提醒每小时 20 条，
/// 其余营销组类型每天 5 条。
fn type_limit(notification_type: NotificationType) -> Option<(u64, u32)> {
    match notification_type {
        NotificationType::Promotional => Some((86_400, 2)),
        NotificationType::SecurityAlert => Some((3_600, 10)),
        NotificationType::PriceAlert => Some((3_600, 20)),
        t if t.is_marketing() => Some((86_400, 5)),
        _ => None,
    }
}

/// 频率限制器
pub struct RateLimiter {
    store: Store,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Store, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// 单窗口检查：清除过期成员 -> 比较数量 -> 记录本次
    ///
    /// 返回 Ok(true) 表示放行并已记录，Ok(false) 表示拒绝。
    /// 存储错误向上传播，由调用方决定是否放行。
    pub async fn check_window(&self, key: &str, window_seconds: u64, max: u32) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - (window_seconds as i64) * 1000;

        // 清除窗口外的旧成员（含边界：恰好满一个窗口的成员一并清除）
        self.store
            .zrem_range_by_score(key, 0.0, window_start as f64)
            .await?;

        let count = self.store.zcard(key).await?;
        if count >= max as u64 {
            debug!(key, count, max, "滑动窗口已满，拒绝");
            return Ok(false);
        }

        // 成员附加随机后缀，同一毫秒内的并发请求互不覆盖
        let member = format!("{now_ms}-{}", Uuid::new_v4().simple());
        self.store.zadd(key, &member, now_ms as f64).await?;
        self.store
            .expire(key, std::time::Duration::from_secs(window_seconds))
            .await?;

        Ok(true)
    }

    /// 分层限流检查
    ///
    /// 对一次发送依次执行用户级、各选中渠道级、类型级检查，
    /// 任一层拒绝返回 Limited。存储故障时放行。
    pub async fn check(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        channels: &[ChannelKind],
    ) -> RateDecision {
        // 1. 用户级全局窗口
        if let Some(decision) = self
            .run_layer(
                "user",
                &StoreKey::rate_window("user", user_id),
                self.config.per_user_window_seconds,
                self.config.per_user_max,
            )
            .await
        {
            return decision;
        }

        // 2. 渠道级窗口（仅对配置了限额的渠道）
        for channel in channels {
            if let Some(limit) = self.config.per_channel.get(channel.as_str())
                && let Some(decision) = self
                    .run_layer(
                        "channel",
                        &StoreKey::rate_window("channel", &format!("{user_id}:{channel}")),
                        limit.window_seconds,
                        limit.max,
                    )
                    .await
            {
                return decision;
            }
        }

        // 3. 类型级覆写
        if let Some((window, max)) = type_limit(notification_type)
            && let Some(decision) = self
                .run_layer(
                    "type",
                    &StoreKey::rate_window("type", &format!("{user_id}:{notification_type}")),
                    window,
                    max,
                )
                .await
        {
            return decision;
        }

        RateDecision::Allowed
    }

    /// 单个渠道的渠道级检查（分发服务在渠道筛选时逐个调用）
    pub async fn check_channel(&self, user_id: &str, channel: ChannelKind) -> RateDecision {
        let Some(limit) = self.config.per_channel.get(channel.as_str()) else {
            return RateDecision::Allowed;
        };
        self.run_layer(
            "channel",
            &StoreKey::rate_window("channel", &format!("{user_id}:{channel}")),
            limit.window_seconds,
            limit.max,
        )
        .await
        .unwrap_or(RateDecision::Allowed)
    }

    /// 执行一层检查；返回 Some(Limited) 表示该层拒绝，None 表示通过
    async fn run_layer(
        &self,
        scope: &str,
        key: &str,
        window_seconds: u64,
        max: u32,
    ) -> Option<RateDecision> {
        match self.check_window(key, window_seconds, max).await {
            Ok(true) => None,
            Ok(false) => Some(RateDecision::Limited {
                scope: scope.to_string(),
            }),
            Err(e) if e.is_infrastructure() => {
                // fail open：存储不可达时放行，投递可用性优先
                warn!(scope, key, error = %e, "限流检查遇到基础设施故障，放行");
                None
            }
            Err(e) => {
                warn!(scope, key, error = %e, "限流检查失败，放行");
                None
            }
        }
    }

    /// 用户级窗口的剩余额度
    pub async fn remaining(&self, user_id: &str) -> Result<u32> {
        let usage = self.usage(user_id).await?;
        Ok(usage.max.saturating_sub(usage.used))
    }

    /// 用户级窗口的用量快照
    pub async fn usage(&self, user_id: &str) -> Result<RateUsage> {
        let key = StoreKey::rate_window("user", user_id);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - (self.config.per_user_window_seconds as i64) * 1000;

        self.store
            .zrem_range_by_score(&key, 0.0, window_start as f64)
            .await?;
        let used = self.store.zcard(&key).await? as u32;

        Ok(RateUsage {
            used,
            max: self.config.per_user_max,
            window_seconds: self.config.per_user_window_seconds,
        })
    }

    /// 管理端重置：清空该用户全部限流窗口（用户级、渠道级、类型级）
    pub async fn reset(&self, user_id: &str) -> Result<()> {
        self.store
            .del(&StoreKey::rate_window("user", user_id))
            .await?;

        for channel in ChannelKind::all() {
            self.store
                .del(&StoreKey::rate_window(
                    "channel",
                    &format!("{user_id}:{channel}"),
                ))
                .await?;
        }
        for notification_type in NotificationType::all() {
            self.store
                .del(&StoreKey::rate_window(
                    "type",
                    &format!("{user_id}:{notification_type}"),
                ))
                .await?;
        }

        warn!(user_id, "限流窗口已被管理端重置");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_shared::config::WindowLimit;

    fn limiter_with(store: Store, per_user_max: u32) -> RateLimiter {
        let mut config = RateLimitConfig {
            per_user_window_seconds: 60,
            per_user_max,
            per_channel: std::collections::HashMap::new(),
        };
        config.per_channel.insert(
            "sms".to_string(),
            WindowLimit {
                window_seconds: 60,
                max: 2,
            },
        );
        RateLimiter::new(store, config)
    }

    #[tokio::test]
    async fn test_window_allows_up_to_max() {
        let limiter = limiter_with(Store::memory(), 3);
        let key = "notify:rate:test:w";

        // 窗口 60 秒、上限 3：前三次放行，第四次拒绝
        for _ in 0..3 {
            assert!(limiter.check_window(key, 60, 3).await.unwrap());
        }
        assert!(!limiter.check_window(key, 60, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_frees_after_expiry() {
        let store = Store::memory();
        let limiter = limiter_with(store.clone(), 3);
        let key = "notify:rate:test:expiry";

        // 手工写入三个已过窗口边界的旧成员
        let old = (Utc::now().timestamp_millis() - 61_000) as f64;
        for i in 0..3 {
            store.zadd(key, &format!("old-{i}"), old).await.unwrap();
        }

        // 旧成员被惰性清除后应放行
        assert!(limiter.check_window(key, 60, 3).await.unwrap());
        assert_eq!(store.zcard(key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_boundary_member_is_purged() {
        let store = Store::memory();
        let limiter = limiter_with(store.clone(), 3);
        let key = "notify:rate:test:boundary";

        // 恰好位于窗口边界（now - window）的成员视为过期
        let boundary = (Utc::now().timestamp_millis() - 60_000) as f64;
        store.zadd(key, "edge", boundary).await.unwrap();

        assert!(limiter.check_window(key, 60, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_layered_check_user_limit() {
        let limiter = limiter_with(Store::memory(), 2);

        let allowed = |d: RateDecision| d.is_allowed();

        assert!(allowed(
            limiter
                .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
                .await
        ));
        assert!(allowed(
            limiter
                .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
                .await
        ));

        // 第三次触发用户级限额
        let decision = limiter
            .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
            .await;
        assert_eq!(
            decision,
            RateDecision::Limited {
                scope: "user".to_string()
            }
        );

        // 其他用户不受影响
        assert!(allowed(
            limiter
                .check("u2", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
                .await
        ));
    }

    #[tokio::test]
    async fn test_layered_check_channel_limit() {
        let limiter = limiter_with(Store::memory(), 100);

        // sms 渠道配置了 2/分钟
        for _ in 0..2 {
            assert!(limiter
                .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::Sms])
                .await
                .is_allowed());
        }
        let decision = limiter
            .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::Sms])
            .await;
        assert_eq!(
            decision,
            RateDecision::Limited {
                scope: "channel".to_string()
            }
        );

        // 未配置限额的渠道不受渠道层影响
        assert!(limiter
            .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_promotional_type_override() {
        let limiter = limiter_with(Store::memory(), 100);

        // 营销类型每天只允许 2 条
        for _ in 0..2 {
            assert!(limiter
                .check("u1", NotificationType::Promotional, &[ChannelKind::InApp])
                .await
                .is_allowed());
        }
        let decision = limiter
            .check("u1", NotificationType::Promotional, &[ChannelKind::InApp])
            .await;
        assert_eq!(
            decision,
            RateDecision::Limited {
                scope: "type".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fail_open_on_store_failure() {
        let limiter = limiter_with(Store::failing(), 1);

        // 存储不可达：所有检查放行
        for _ in 0..5 {
            assert!(limiter
                .check("u1", NotificationType::Promotional, &[ChannelKind::Sms])
                .await
                .is_allowed());
        }
    }

    #[tokio::test]
    async fn test_usage_and_remaining() {
        let limiter = limiter_with(Store::memory(), 5);

        for _ in 0..2 {
            limiter
                .check("u1", NotificationType::TransactionConfirmed, &[ChannelKind::InApp])
                .await;
        }

        let usage = limiter.usage("u1").await.unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.max, 5);
        assert_eq!(limiter.remaining("u1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reset_clears_all_scopes() {
        let limiter = limiter_with(Store::memory(), 2);

        // 打满用户级与类型级窗口
        for _ in 0..2 {
            limiter
                .check("u1", NotificationType::Promotional, &[ChannelKind::InApp])
                .await;
        }
        assert!(!limiter
            .check("u1", NotificationType::Promotional, &[ChannelKind::InApp])
            .await
            .is_allowed());

        limiter.reset("u1").await.unwrap();
        assert!(limiter
            .check("u1", NotificationType::Promotional, &[ChannelKind::InApp])
            .await
            .is_allowed());
        assert_eq!(limiter.remaining("u1").await.unwrap(), 1);
    }

    #[test]
    fn test_type_limit_table() {
        assert_eq!(type_limit(NotificationType::Promotional), Some((86_400, 2)));
        assert_eq!(type_limit(NotificationType::SecurityAlert), Some((3_600, 10)));
        assert_eq!(type_limit(NotificationType::PriceAlert), Some((3_600, 20)));
        assert_eq!(type_limit(NotificationType::Educational), Some((86_400, 5)));
        assert_eq!(type_limit(NotificationType::TransactionConfirmed), None);
    }
}
