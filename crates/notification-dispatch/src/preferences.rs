//! 用户通知偏好管理
//!
//! 偏好文档持久化在键值存储中，读取时与硬编码默认值做深度合并，
//! 保证后续新增的偏好字段对旧文档也有安全默认值。读取经过进程内
//! TTL 缓存；存储故障时回退默认值而不是阻塞发送。
//!
//! ## 三列表不变量
//!
//! 每个渠道按通知类型维护 instant / digest / disabled 三个互斥列表，
//! 任一类型同一时刻至多出现在其中一个列表中。subscribe / unsubscribe
//! 是维护该不变量的唯一入口。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use pulse_shared::config::PreferencesConfig;
use pulse_shared::error::{NotifyError, Result};
use pulse_shared::events::{ChannelKind, NotificationType};
use pulse_shared::store::{Store, StoreKey};

/// 支持的界面语言
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "zh", "es", "ja", "ko"];

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").unwrap());
static TIMEZONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^UTC([+-])(\d{2}):(\d{2})$").unwrap());

// ---------------------------------------------------------------------------
// 数据模型
// ---------------------------------------------------------------------------

/// 静默时段
///
/// 每日固定时间窗口，窗口内抑制非 critical 通知。
/// start > end 表示跨午夜窗口（如 22:00 - 08:00）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuietHours {
    pub enabled: bool,
    /// 24 小时制 "HH:MM"
    pub start: String,
    pub end: String,
    /// 固定偏移时区，"UTC" 或 "UTC±HH:MM"
    pub timezone: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl QuietHours {
    /// 给定时刻是否落在静默窗口内
    ///
    /// 时间按偏好中配置的固定偏移时区换算；时区不可解析时按 UTC 处理。
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            warn!(start = %self.start, end = %self.end, "静默时段时间格式无效，跳过抑制");
            return false;
        };

        let offset = parse_timezone(&self.timezone).unwrap_or_else(|| {
            warn!(timezone = %self.timezone, "静默时段时区无效，按 UTC 处理");
            FixedOffset::east_opt(0).unwrap()
        });
        let local = now.with_timezone(&offset);
        let current = local.hour() * 60 + local.minute();

        if start <= end {
            // 同日窗口：[start, end)
            current >= start && current < end
        } else {
            // 跨午夜窗口：[start, 24:00) ∪ [00:00, end)
            current >= start || current < end
        }
    }
}

/// 将 "HH:MM" 解析为当日分钟数
fn parse_hhmm(value: &str) -> Option<u32> {
    if !TIME_RE.is_match(value) {
        return None;
    }
    let (h, m) = value.split_once(':')?;
    Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?)
}

/// 解析 "UTC" / "UTC±HH:MM" 为固定偏移
fn parse_timezone(value: &str) -> Option<FixedOffset> {
    if value == "UTC" {
        return FixedOffset::east_opt(0);
    }
    let caps = TIMEZONE_RE.captures(value)?;
    let hours: i32 = caps[2].parse().ok()?;
    let minutes: i32 = caps[3].parse().ok()?;
    let total = (hours * 3600 + minutes * 60) * if &caps[1] == "-" { -1 } else { 1 };
    FixedOffset::east_opt(total)
}

/// 单渠道偏好
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelPreference {
    pub enabled: bool,
    /// 渠道投递地址（邮箱 / 手机号 / 设备 token / webhook URL）
    pub address: Option<String>,
    /// 地址是否已通过验证，未验证的渠道不参与投递
    pub verified: bool,
    /// 即时投递的通知类型
    pub instant: Vec<NotificationType>,
    /// 延迟到摘要批次投递的通知类型
    pub digest: Vec<NotificationType>,
    /// 明确关闭的通知类型
    pub disabled: Vec<NotificationType>,
}

/// 用户通知偏好
///
/// 首次读取时以硬编码默认值惰性创建；只通过 PreferenceManager 修改，
/// 只会被覆盖，不会被删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotificationPreferences {
    pub user_id: String,
    pub channels: HashMap<ChannelKind, ChannelPreference>,
    /// 按类别的总开关（transaction / security / governance / system / marketing）
    pub categories: HashMap<String, bool>,
    pub quiet_hours: QuietHours,
    pub language: String,
}

impl UserNotificationPreferences {
    /// 硬编码默认偏好
    ///
    /// 站内信默认开启且视为已验证（无需外部地址）；
    /// 其余渠道默认关闭，等待用户绑定并验证地址。
    pub fn defaults(user_id: &str) -> Self {
        let non_marketing: Vec<NotificationType> = NotificationType::all()
            .iter()
            .copied()
            .filter(|t| !t.is_marketing())
            .collect();
        let marketing: Vec<NotificationType> = NotificationType::all()
            .iter()
            .copied()
            .filter(|t| t.is_marketing())
            .collect();
        let security: Vec<NotificationType> = NotificationType::all()
            .iter()
            .copied()
            .filter(|t| t.is_security())
            .collect();

        let mut channels = HashMap::new();
        channels.insert(
            ChannelKind::InApp,
            ChannelPreference {
                enabled: true,
                address: None,
                verified: true,
                instant: non_marketing.clone(),
                digest: marketing,
                disabled: Vec::new(),
            },
        );
        channels.insert(
            ChannelKind::Email,
            ChannelPreference {
                enabled: false,
                address: None,
                verified: false,
                instant: {
                    let mut types = security.clone();
                    types.push(NotificationType::TransactionFailed);
                    types
                },
                digest: Vec::new(),
                disabled: Vec::new(),
            },
        );
        channels.insert(
            ChannelKind::Sms,
            ChannelPreference {
                enabled: false,
                address: None,
                verified: false,
                instant: vec![NotificationType::SecurityAlert],
                digest: Vec::new(),
                disabled: Vec::new(),
            },
        );
        channels.insert(
            ChannelKind::Push,
            ChannelPreference {
                enabled: false,
                address: None,
                verified: false,
                instant: non_marketing,
                digest: Vec::new(),
                disabled: Vec::new(),
            },
        );
        channels.insert(ChannelKind::Webhook, ChannelPreference::default());

        let categories = ["transaction", "security", "governance", "system", "marketing"]
            .iter()
            .map(|c| (c.to_string(), true))
            .collect();

        Self {
            user_id: user_id.to_string(),
            channels,
            categories,
            quiet_hours: QuietHours::default(),
            language: "en".to_string(),
        }
    }

    /// 指定类别是否启用（未知类别视为启用）
    pub fn category_enabled(&self, category: &str) -> bool {
        self.categories.get(category).copied().unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// PreferenceManager
// ---------------------------------------------------------------------------

struct CachedPreferences {
    prefs: UserNotificationPreferences,
    loaded_at: Instant,
}

/// 偏好管理器
///
/// 持久文档之上的读穿缓存与校验层。
pub struct PreferenceManager {
    store: Store,
    cache: DashMap<String, CachedPreferences>,
    cache_ttl: Duration,
}

impl PreferenceManager {
    pub fn new(store: Store, config: &PreferencesConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
        }
    }

    /// 读取用户偏好
    ///
    /// 顺序：进程内缓存 -> 存储文档与默认值深度合并 -> 默认值。
    /// 存储故障时回退默认值（记录警告，不缓存），保证发送路径不被阻塞。
    pub async fn get(&self, user_id: &str) -> UserNotificationPreferences {
        if let Some(cached) = self.cache.get(user_id)
            && cached.loaded_at.elapsed() < self.cache_ttl
        {
            return cached.prefs.clone();
        }

        let defaults = UserNotificationPreferences::defaults(user_id);
        let key = StoreKey::preferences(user_id);

        let prefs = match self.store.get::<serde_json::Value>(&key).await {
            Ok(Some(doc)) => {
                // 存量文档覆盖默认值，新增字段自动获得默认值
                let mut merged = serde_json::to_value(&defaults).unwrap_or_default();
                deep_merge(&mut merged, &doc);
                match serde_json::from_value::<UserNotificationPreferences>(merged) {
                    Ok(mut prefs) => {
                        prefs.user_id = user_id.to_string();
                        prefs
                    }
                    Err(e) => {
                        warn!(user_id, error = %e, "偏好文档解析失败，回退默认值");
                        defaults
                    }
                }
            }
            Ok(None) => {
                debug!(user_id, "偏好文档不存在，惰性创建默认偏好");
                defaults
            }
            Err(e) => {
                // 基础设施故障：回退默认值且不写缓存，待存储恢复后重新读取
                warn!(user_id, error = %e, "读取偏好失败，回退默认值");
                return defaults;
            }
        };

        self.cache.insert(
            user_id.to_string(),
            CachedPreferences {
                prefs: prefs.clone(),
                loaded_at: Instant::now(),
            },
        );
        prefs
    }

    /// 合并写入部分偏好
    ///
    /// partial 以 JSON 片段表达要修改的字段，深度合并进当前偏好后
    /// 整体校验、持久化并刷新缓存。
    pub async fn set(
        &self,
        user_id: &str,
        partial: serde_json::Value,
    ) -> Result<UserNotificationPreferences> {
        let current = self.get(user_id).await;
        let mut merged = serde_json::to_value(&current)
            .map_err(|e| NotifyError::Serialization(e.to_string()))?;
        deep_merge(&mut merged, &partial);

        let mut prefs: UserNotificationPreferences = serde_json::from_value(merged)
            .map_err(|e| NotifyError::Validation(format!("偏好格式不合法: {e}")))?;
        prefs.user_id = user_id.to_string();

        validate_preferences(&prefs)?;
        self.persist(&prefs).await?;

        info!(user_id, "用户偏好已更新");
        Ok(prefs)
    }

    /// 订阅：将类型从 disabled 移除；若不在 digest 中则加入 instant
    pub async fn subscribe(
        &self,
        user_id: &str,
        channel: ChannelKind,
        notification_type: NotificationType,
    ) -> Result<UserNotificationPreferences> {
        let mut prefs = self.get(user_id).await;
        let entry = prefs.channels.entry(channel).or_default();

        entry.disabled.retain(|t| *t != notification_type);
        if !entry.digest.contains(&notification_type) && !entry.instant.contains(&notification_type)
        {
            entry.instant.push(notification_type);
        }

        self.persist(&prefs).await?;
        Ok(prefs)
    }

    /// 退订：从 instant 与 digest 移除并加入 disabled
    pub async fn unsubscribe(
        &self,
        user_id: &str,
        channel: ChannelKind,
        notification_type: NotificationType,
    ) -> Result<UserNotificationPreferences> {
        let mut prefs = self.get(user_id).await;
        let entry = prefs.channels.entry(channel).or_default();

        entry.instant.retain(|t| *t != notification_type);
        entry.digest.retain(|t| *t != notification_type);
        if !entry.disabled.contains(&notification_type) {
            entry.disabled.push(notification_type);
        }

        self.persist(&prefs).await?;
        Ok(prefs)
    }

    /// 导出偏好（脱敏）
    ///
    /// 渠道地址替换为掩码形式，导出内容可安全展示或备份。
    pub async fn export_preferences(&self, user_id: &str) -> Result<serde_json::Value> {
        let mut prefs = self.get(user_id).await;
        for (kind, channel) in prefs.channels.iter_mut() {
            if let Some(address) = &channel.address {
                channel.address = Some(mask_address(*kind, address));
            }
        }
        serde_json::to_value(&prefs).map_err(|e| NotifyError::Serialization(e.to_string()))
    }

    /// 导入偏好
    ///
    /// 地址与验证状态绝不从导入数据恢复：地址字段被剥离，
    /// 已有地址保持原样，新地址需要重新绑定并验证。
    pub async fn import_preferences(
        &self,
        user_id: &str,
        mut doc: serde_json::Value,
    ) -> Result<UserNotificationPreferences> {
        if let Some(channels) = doc.get_mut("channels").and_then(|c| c.as_object_mut()) {
            for (_, channel) in channels.iter_mut() {
                if let Some(obj) = channel.as_object_mut() {
                    obj.remove("address");
                    obj.remove("verified");
                }
            }
        }
        // user_id 以调用方为准
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("userId");
        }
        self.set(user_id, doc).await
    }

    /// 清除指定用户的进程内缓存
    pub fn invalidate(&self, user_id: &str) {
        self.cache.remove(user_id);
    }

    async fn persist(&self, prefs: &UserNotificationPreferences) -> Result<()> {
        let key = StoreKey::preferences(&prefs.user_id);
        self.store.set(&key, prefs, None).await?;
        self.cache.insert(
            prefs.user_id.clone(),
            CachedPreferences {
                prefs: prefs.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 校验与工具
// ---------------------------------------------------------------------------

/// 整体校验偏好文档
fn validate_preferences(prefs: &UserNotificationPreferences) -> Result<()> {
    if !SUPPORTED_LANGUAGES.contains(&prefs.language.as_str()) {
        return Err(NotifyError::InvalidArgument {
            field: "language".to_string(),
            message: format!("不支持的语言: {}", prefs.language),
        });
    }

    for (name, value) in [
        ("quietHours.start", &prefs.quiet_hours.start),
        ("quietHours.end", &prefs.quiet_hours.end),
    ] {
        if !TIME_RE.is_match(value) {
            return Err(NotifyError::InvalidArgument {
                field: name.to_string(),
                message: format!("时间必须是 24 小时制 HH:MM: {value}"),
            });
        }
    }

    if parse_timezone(&prefs.quiet_hours.timezone).is_none() {
        return Err(NotifyError::InvalidArgument {
            field: "quietHours.timezone".to_string(),
            message: format!("时区必须是 UTC 或 UTC±HH:MM: {}", prefs.quiet_hours.timezone),
        });
    }

    for (kind, channel) in &prefs.channels {
        if let Some(address) = &channel.address {
            validate_address(*kind, address)?;
        }

        // 三列表互斥不变量
        for t in &channel.instant {
            if channel.digest.contains(t) || channel.disabled.contains(t) {
                return Err(NotifyError::Validation(format!(
                    "类型 {t} 在渠道 {kind} 的多个分类列表中出现"
                )));
            }
        }
        for t in &channel.digest {
            if channel.disabled.contains(t) {
                return Err(NotifyError::Validation(format!(
                    "类型 {t} 在渠道 {kind} 的多个分类列表中出现"
                )));
            }
        }
    }

    Ok(())
}

/// 按渠道类型校验地址格式
fn validate_address(kind: ChannelKind, address: &str) -> Result<()> {
    let valid = match kind {
        ChannelKind::Email => address.contains('@'),
        ChannelKind::Sms => address.starts_with('+'),
        ChannelKind::Webhook => address.starts_with("http"),
        // 推送 token 与站内信地址无统一格式
        ChannelKind::Push | ChannelKind::InApp => !address.trim().is_empty(),
    };
    if valid {
        Ok(())
    } else {
        Err(NotifyError::InvalidArgument {
            field: format!("channels.{kind}.address"),
            message: format!("地址格式不合法: {address}"),
        })
    }
}

/// 地址脱敏
fn mask_address(kind: ChannelKind, address: &str) -> String {
    match kind {
        ChannelKind::Email => match address.split_once('@') {
            Some((local, domain)) => {
                let head: String = local.chars().take(1).collect();
                format!("{head}***@{domain}")
            }
            None => "***".to_string(),
        },
        ChannelKind::Sms => {
            let tail: String = address
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("+***{tail}")
        }
        _ => {
            let head: String = address.chars().take(8).collect();
            format!("{head}***")
        }
    }
}

/// JSON 深度合并：对象递归合并，其余类型（含数组）整体覆盖
fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => {
            *slot = value.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PreferenceManager {
        PreferenceManager::new(Store::memory(), &PreferencesConfig::default())
    }

    #[tokio::test]
    async fn test_get_returns_defaults_for_new_user() {
        let manager = manager();
        let prefs = manager.get("user-001").await;

        assert_eq!(prefs.user_id, "user-001");
        assert_eq!(prefs.language, "en");

        // 站内信默认开启且已验证
        let in_app = prefs.channels.get(&ChannelKind::InApp).unwrap();
        assert!(in_app.enabled);
        assert!(in_app.verified);
        assert!(in_app.instant.contains(&NotificationType::TransactionConfirmed));
        assert!(in_app.digest.contains(&NotificationType::Promotional));

        // 邮件默认关闭，等待绑定地址
        let email = prefs.channels.get(&ChannelKind::Email).unwrap();
        assert!(!email.enabled);
        assert!(!email.verified);
    }

    #[tokio::test]
    async fn test_set_merges_partial_document() {
        let manager = manager();

        let prefs = manager
            .set(
                "user-001",
                serde_json::json!({
                    "language": "zh",
                    "channels": {
                        "email": {
                            "enabled": true,
                            "address": "alice@example.com"
                        }
                    }
                }),
            )
            .await
            .unwrap();

        assert_eq!(prefs.language, "zh");
        let email = prefs.channels.get(&ChannelKind::Email).unwrap();
        assert!(email.enabled);
        assert_eq!(email.address.as_deref(), Some("alice@example.com"));
        // 未提及的字段保持默认
        assert!(email.instant.contains(&NotificationType::SecurityAlert));
        assert!(prefs.channels.get(&ChannelKind::InApp).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_stored_document_merged_over_defaults() {
        let store = Store::memory();
        // 模拟旧版本写入的精简文档：只有 language 字段
        store
            .set(
                &StoreKey::preferences("user-old"),
                &serde_json::json!({"language": "ja"}),
                None,
            )
            .await
            .unwrap();

        let manager = PreferenceManager::new(store, &PreferencesConfig::default());
        let prefs = manager.get("user-old").await;

        // 旧文档字段生效，新字段回落默认值
        assert_eq!(prefs.language, "ja");
        assert!(prefs.channels.get(&ChannelKind::InApp).unwrap().enabled);
        assert!(prefs.category_enabled("transaction"));
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_values() {
        let manager = manager();

        // 不支持的语言
        assert!(manager
            .set("u", serde_json::json!({"language": "fr"}))
            .await
            .is_err());

        // 非法时间
        assert!(manager
            .set("u", serde_json::json!({"quietHours": {"start": "25:00"}}))
            .await
            .is_err());
        assert!(manager
            .set("u", serde_json::json!({"quietHours": {"end": "8am"}}))
            .await
            .is_err());

        // 非法时区
        assert!(manager
            .set("u", serde_json::json!({"quietHours": {"timezone": "Mars/Olympus"}}))
            .await
            .is_err());

        // 邮箱缺少 @
        assert!(manager
            .set(
                "u",
                serde_json::json!({"channels": {"email": {"address": "not-an-email"}}})
            )
            .await
            .is_err());

        // 手机号缺少国家码前缀
        assert!(manager
            .set(
                "u",
                serde_json::json!({"channels": {"sms": {"address": "13800138000"}}})
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_invariant() {
        let manager = manager();
        let t = NotificationType::PriceAlert;

        // 任意先后顺序与重复调用后，unsubscribe 的终态都是仅在 disabled 中
        for _ in 0..3 {
            manager.subscribe("u", ChannelKind::Push, t).await.unwrap();
            let prefs = manager.unsubscribe("u", ChannelKind::Push, t).await.unwrap();

            let push = prefs.channels.get(&ChannelKind::Push).unwrap();
            assert!(!push.instant.contains(&t));
            assert!(!push.digest.contains(&t));
            assert_eq!(push.disabled.iter().filter(|x| **x == t).count(), 1);
        }

        // 再次订阅后仅在 instant 中
        let prefs = manager.subscribe("u", ChannelKind::Push, t).await.unwrap();
        let push = prefs.channels.get(&ChannelKind::Push).unwrap();
        assert_eq!(push.instant.iter().filter(|x| **x == t).count(), 1);
        assert!(!push.disabled.contains(&t));
    }

    #[tokio::test]
    async fn test_subscribe_respects_existing_digest() {
        let manager = manager();
        let t = NotificationType::Promotional;

        // 默认偏好中 Promotional 已在站内信的 digest 列表
        let prefs = manager.subscribe("u", ChannelKind::InApp, t).await.unwrap();
        let in_app = prefs.channels.get(&ChannelKind::InApp).unwrap();

        // 已在 digest 中则不挪入 instant
        assert!(in_app.digest.contains(&t));
        assert!(!in_app.instant.contains(&t));
        assert!(!in_app.disabled.contains(&t));
    }

    #[tokio::test]
    async fn test_invalidate_forces_store_reread() {
        let store = Store::memory();
        let manager = PreferenceManager::new(store.clone(), &PreferencesConfig::default());

        // 预热缓存
        let _ = manager.get("u1").await;

        // 绕过 manager 直接改写存储文档，缓存里仍是旧值
        store
            .set(
                &StoreKey::preferences("u1"),
                &serde_json::json!({"language": "ko"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(manager.get("u1").await.language, "en");

        // 失效后重新读到新文档
        manager.invalidate("u1");
        assert_eq!(manager.get("u1").await.language, "ko");
    }

    #[tokio::test]
    async fn test_get_falls_back_to_defaults_on_store_failure() {
        let manager = PreferenceManager::new(Store::failing(), &PreferencesConfig::default());

        let prefs = manager.get("user-001").await;
        assert_eq!(prefs, UserNotificationPreferences::defaults("user-001"));
    }

    #[tokio::test]
    async fn test_export_masks_addresses_and_import_strips_them() {
        let manager = manager();
        manager
            .set(
                "u",
                serde_json::json!({
                    "channels": {
                        "email": {"enabled": true, "address": "alice@example.com", "verified": true},
                        "sms": {"enabled": true, "address": "+8613800138000", "verified": true}
                    }
                }),
            )
            .await
            .unwrap();

        let exported = manager.export_preferences("u").await.unwrap();
        let email_addr = exported["channels"]["email"]["address"].as_str().unwrap();
        assert_eq!(email_addr, "a***@example.com");
        let sms_addr = exported["channels"]["sms"]["address"].as_str().unwrap();
        assert_eq!(sms_addr, "+***8000");

        // 把脱敏导出的文档导入另一个用户：地址与验证状态不得带入
        let imported = manager.import_preferences("u2", exported).await.unwrap();
        let email = imported.channels.get(&ChannelKind::Email).unwrap();
        assert!(email.enabled);
        assert_eq!(email.address, None);
        assert!(!email.verified);
    }

    #[test]
    fn test_quiet_hours_midnight_crossing() {
        let quiet = QuietHours {
            enabled: true,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "UTC".to_string(),
        };

        let at = |hhmm: &str| {
            DateTime::parse_from_rfc3339(&format!("2025-01-15T{hhmm}:00Z"))
                .unwrap()
                .with_timezone(&Utc)
        };

        // 23:00 与 03:00 在窗口内，09:00 在窗口外
        assert!(quiet.is_active_at(at("23:00")));
        assert!(quiet.is_active_at(at("03:00")));
        assert!(!quiet.is_active_at(at("09:00")));

        // 边界：start 含，end 不含
        assert!(quiet.is_active_at(at("22:00")));
        assert!(!quiet.is_active_at(at("08:00")));
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let quiet = QuietHours {
            enabled: true,
            start: "12:00".to_string(),
            end: "14:00".to_string(),
            timezone: "UTC".to_string(),
        };
        let at = |hhmm: &str| {
            DateTime::parse_from_rfc3339(&format!("2025-01-15T{hhmm}:00Z"))
                .unwrap()
                .with_timezone(&Utc)
        };

        assert!(quiet.is_active_at(at("13:00")));
        assert!(!quiet.is_active_at(at("11:59")));
        assert!(!quiet.is_active_at(at("14:00")));
    }

    #[test]
    fn test_quiet_hours_respects_timezone_offset() {
        let quiet = QuietHours {
            enabled: true,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "UTC+08:00".to_string(),
        };

        // UTC 15:00 = UTC+8 23:00，应在窗口内
        let utc_afternoon = DateTime::parse_from_rfc3339("2025-01-15T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(quiet.is_active_at(utc_afternoon));

        // UTC 03:00 = UTC+8 11:00，应在窗口外
        let utc_night = DateTime::parse_from_rfc3339("2025-01-15T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!quiet.is_active_at(utc_night));
    }

    #[test]
    fn test_quiet_hours_disabled() {
        let quiet = QuietHours::default();
        assert!(!quiet.is_active_at(Utc::now()));
    }

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut base = serde_json::json!({
            "a": {"x": 1, "y": 2},
            "b": [1, 2, 3],
            "c": "keep"
        });
        deep_merge(
            &mut base,
            &serde_json::json!({
                "a": {"y": 20, "z": 30},
                "b": [9]
            }),
        );

        assert_eq!(base["a"]["x"], 1);
        assert_eq!(base["a"]["y"], 20);
        assert_eq!(base["a"]["z"], 30);
        // 数组整体覆盖
        assert_eq!(base["b"], serde_json::json!([9]));
        assert_eq!(base["c"], "keep");
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("UTC+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(
            parse_timezone("UTC-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 30 * 60)
        );
        assert!(parse_timezone("Asia/Shanghai").is_none());
        assert!(parse_timezone("UTC+8").is_none());
    }
}
