//! 通知事件模型
//!
//! 定义进入分发引擎的事件信封、通知类型分类、严重级别与优先级、
//! 渲染后的消息载体、投递结果以及队列任务。所有跨组件传递的数据
//! 结构集中在此，保证生产者、分发服务与队列工作者引用同一份定义。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// NotificationType — 通知类型枚举
// ---------------------------------------------------------------------------

/// 通知类型枚举
///
/// 按业务域划分为五大类：交易、安全、治理、系统、营销。
/// 分类信息用于偏好开关（按类别启用/禁用）、限流覆写和优先级判定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    // 交易类通知 — 链上资金流转的状态变化
    TransactionConfirmed,
    TransactionFailed,
    TransactionPending,
    DepositReceived,
    WithdrawalCompleted,

    // 安全类通知 — 账户安全事件，优先级最高
    SecurityAlert,
    LoginNewDevice,
    PasswordChanged,
    TwoFactorChanged,

    // 治理类通知 — 提案与投票生命周期
    ProposalCreated,
    VotingStarted,
    VotingEnded,
    ProposalExecuted,

    // 系统类通知 — 平台维护与账户状态
    SystemMaintenance,
    SystemUpgrade,
    AccountVerification,
    PriceAlert,

    // 营销类通知 — 运营内容，默认走低优先级
    Promotional,
    Educational,
    Community,
}

impl NotificationType {
    /// 交易类通知涉及资金流转，用户对其时效性最敏感
    pub fn is_transaction(&self) -> bool {
        matches!(
            self,
            Self::TransactionConfirmed
                | Self::TransactionFailed
                | Self::TransactionPending
                | Self::DepositReceived
                | Self::WithdrawalCompleted
        )
    }

    /// 安全类通知对应账户风险事件，不受静默时段影响的候选
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::SecurityAlert
                | Self::LoginNewDevice
                | Self::PasswordChanged
                | Self::TwoFactorChanged
        )
    }

    /// 治理类通知跟随提案生命周期产生
    pub fn is_governance(&self) -> bool {
        matches!(
            self,
            Self::ProposalCreated
                | Self::VotingStarted
                | Self::VotingEnded
                | Self::ProposalExecuted
        )
    }

    /// 系统类通知由平台运维与行情监控产生
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::SystemMaintenance
                | Self::SystemUpgrade
                | Self::AccountVerification
                | Self::PriceAlert
        )
    }

    /// 营销类通知受最严格的频率限制约束
    pub fn is_marketing(&self) -> bool {
        matches!(self, Self::Promotional | Self::Educational | Self::Community)
    }

    /// 所属类别名称，与用户偏好中的 categories 键一致
    pub fn category(&self) -> &'static str {
        if self.is_transaction() {
            "transaction"
        } else if self.is_security() {
            "security"
        } else if self.is_governance() {
            "governance"
        } else if self.is_system() {
            "system"
        } else {
            "marketing"
        }
    }

    /// 全部通知类型，用于默认偏好构建与管理接口遍历
    pub fn all() -> &'static [NotificationType] {
        &[
            Self::TransactionConfirmed,
            Self::TransactionFailed,
            Self::TransactionPending,
            Self::DepositReceived,
            Self::WithdrawalCompleted,
            Self::SecurityAlert,
            Self::LoginNewDevice,
            Self::PasswordChanged,
            Self::TwoFactorChanged,
            Self::ProposalCreated,
            Self::VotingStarted,
            Self::VotingEnded,
            Self::ProposalExecuted,
            Self::SystemMaintenance,
            Self::SystemUpgrade,
            Self::AccountVerification,
            Self::PriceAlert,
            Self::Promotional,
            Self::Educational,
            Self::Community,
        ]
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 序列化为 SCREAMING_SNAKE_CASE 保持与 serde 的一致性，
        // 便于在日志、存储键和统计字段中统一引用
        let s = match self {
            Self::TransactionConfirmed => "TRANSACTION_CONFIRMED",
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::TransactionPending => "TRANSACTION_PENDING",
            Self::DepositReceived => "DEPOSIT_RECEIVED",
            Self::WithdrawalCompleted => "WITHDRAWAL_COMPLETED",
            Self::SecurityAlert => "SECURITY_ALERT",
            Self::LoginNewDevice => "LOGIN_NEW_DEVICE",
            Self::PasswordChanged => "PASSWORD_CHANGED",
            Self::TwoFactorChanged => "TWO_FACTOR_CHANGED",
            Self::ProposalCreated => "PROPOSAL_CREATED",
            Self::VotingStarted => "VOTING_STARTED",
            Self::VotingEnded => "VOTING_ENDED",
            Self::ProposalExecuted => "PROPOSAL_EXECUTED",
            Self::SystemMaintenance => "SYSTEM_MAINTENANCE",
            Self::SystemUpgrade => "SYSTEM_UPGRADE",
            Self::AccountVerification => "ACCOUNT_VERIFICATION",
            Self::PriceAlert => "PRICE_ALERT",
            Self::Promotional => "PROMOTIONAL",
            Self::Educational => "EDUCATIONAL",
            Self::Community => "COMMUNITY",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Severity — 严重级别
// ---------------------------------------------------------------------------

/// 事件严重级别
///
/// critical 级别的事件绕过静默时段，并直接进入高优先级队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Priority — 分发优先级
// ---------------------------------------------------------------------------

/// 分发优先级
///
/// 每个优先级对应一条独立的工作队列；weight 决定跨队列的调度偏向
/// （high 先于 normal 先于 low），digest 队列由定时任务批量清空。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
    Digest,
}

impl Priority {
    /// 跨队列调度权重，数值越大越优先
    pub fn weight(&self) -> u8 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
            Self::Digest => 0,
        }
    }

    /// 队列键名后缀
    pub fn queue_key(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Digest => "digest",
        }
    }

    /// 即时分发的三条队列（digest 单独由定时任务驱动）
    pub fn realtime() -> &'static [Priority] {
        &[Self::High, Self::Normal, Self::Low]
    }

    /// 全部四条队列
    pub fn all() -> &'static [Priority] {
        &[Self::High, Self::Normal, Self::Low, Self::Digest]
    }

    /// 根据事件内容判定基础优先级
    ///
    /// critical 级别或安全告警/交易失败 -> high；
    /// 营销类内容 -> low；其余 -> normal。
    /// 某渠道将该类型归入摘要列表时，由分发服务改写为 digest。
    pub fn for_event(event: &NotificationEvent) -> Priority {
        if event.severity == Severity::Critical
            || matches!(
                event.event_type,
                NotificationType::SecurityAlert | NotificationType::TransactionFailed
            )
        {
            Priority::High
        } else if matches!(
            event.event_type,
            NotificationType::Promotional
                | NotificationType::Educational
                | NotificationType::Community
        ) {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.queue_key())
    }
}

// ---------------------------------------------------------------------------
// ChannelKind — 投递渠道
// ---------------------------------------------------------------------------

/// 通知投递渠道
///
/// 各渠道包装不同的外部服务商，消息长度限制和格式要求各不相同
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
    Webhook,
    InApp,
}

impl ChannelKind {
    /// 渠道标识字符串，与 serde 序列化结果和统计字段保持一致
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::Webhook => "webhook",
            Self::InApp => "inApp",
        }
    }

    /// 全部渠道，用于默认偏好构建与管理接口遍历
    pub fn all() -> &'static [ChannelKind] {
        &[Self::Email, Self::Sms, Self::Push, Self::Webhook, Self::InApp]
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            "webhook" => Ok(Self::Webhook),
            "inApp" | "in_app" => Ok(Self::InApp),
            other => Err(format!("未知渠道: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationEvent — 通知事件信封
// ---------------------------------------------------------------------------

/// 事件元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// 事件来源系统（HTTP 路由、链上监听器、管理端广播等）
    pub source: String,
    /// 事件产生时间
    pub timestamp: DateTime<Utc>,
    /// 追踪 ID（用于串联分布式调用链）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// 生产侧重发计数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

/// 通知事件信封
///
/// 所有进入分发引擎的事件都包装在此信封中。事件由外部生产者创建，
/// 进入引擎后不再修改；`data` 以 JSON 对象承载不同类型的业务字段，
/// 避免为每种通知类型定义独立消息结构。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// 事件唯一标识（UUID v7），时间有序便于排查
    pub id: String,
    /// 通知类型
    pub event_type: NotificationType,
    /// 严重级别
    pub severity: Severity,
    /// 目标用户 ID；广播类事件（系统维护等）可以为空
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// 事件业务数据（JSON 对象，不同通知类型携带不同字段）
    pub data: serde_json::Value,
    /// 事件元数据
    pub metadata: EventMetadata,
}

impl NotificationEvent {
    /// 构建新事件，自动生成 UUID v7 并记录当前时间
    pub fn new(
        event_type: NotificationType,
        severity: Severity,
        data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_type,
            severity,
            user_id: None,
            data,
            metadata: EventMetadata {
                source: source.into(),
                timestamp: Utc::now(),
                correlation_id: None,
                retry_count: None,
            },
        }
    }

    /// 指定目标用户
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 指定追踪 ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    /// 校验事件是否满足入队前置条件
    ///
    /// 类型合法性由枚举反序列化保证，这里补充校验 id、data 与来源。
    /// 校验失败的事件同步拒绝，绝不进入队列。
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("事件 id 不能为空".to_string());
        }
        if !self.data.is_object() {
            return Err("事件 data 必须是 JSON 对象".to_string());
        }
        if self.metadata.source.trim().is_empty() {
            return Err("事件元数据缺少 source".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NotificationMessage — 渲染后的消息载体
// ---------------------------------------------------------------------------

/// 邮件附件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// base64 编码的内容
    pub content: String,
}

/// 渲染后的消息载体
///
/// 每个 (事件, 渠道) 组合都会新渲染一份消息，属于临时对象，
/// 只在队列任务中存续，不作为独立记录持久化。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    /// 来源事件 ID
    pub event_id: String,
    /// 目标用户 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// 渠道投递地址（邮箱 / 手机号 / 设备 token / webhook URL）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// 邮件主题（仅邮件渠道使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// 标题
    pub title: String,
    /// 正文
    pub body: String,
    /// HTML 正文（邮件渠道可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// 渲染时携带的业务数据，渠道可按需取用（如 push 的 data 字段）
    pub data: HashMap<String, serde_json::Value>,
    /// 附件列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// 消息级元数据（locale、correlation id 等）
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl NotificationMessage {
    /// 从事件构建空消息骨架，渲染器负责填充标题与正文
    pub fn for_event(event: &NotificationEvent) -> Self {
        let data = match &event.data {
            serde_json::Value::Object(map) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            _ => HashMap::new(),
        };
        Self {
            event_id: event.id.clone(),
            user_id: event.user_id.clone(),
            recipient: None,
            subject: None,
            title: String::new(),
            body: String::new(),
            html: None,
            data,
            attachments: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryResult — 投递结果
// ---------------------------------------------------------------------------

/// 投递结果
///
/// 所有渠道实现的 send 都返回此结构，是五个渠道变体必须统一遵守的
/// 唯一契约。details 中的 `permanent` 标记告诉队列工作者该失败
/// 不应重试（如 4xx 响应、无效地址）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl DeliveryResult {
    /// 创建成功结果
    pub fn success(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            timestamp: Utc::now(),
            error: None,
            details: HashMap::new(),
        }
    }

    /// 创建可重试的失败结果
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            timestamp: Utc::now(),
            error: Some(error.into()),
            details: HashMap::new(),
        }
    }

    /// 创建不可重试的失败结果（4xx、无效地址等确定性失败）
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self::failure(error).with_detail("permanent", serde_json::json!(true))
    }

    /// 沙箱模式的合成成功结果：不访问外部服务，直接伪造消息 ID
    pub fn sandbox(channel: ChannelKind) -> Self {
        Self::success(format!("sandbox_{}_{}", channel.as_str(), Uuid::new_v4()))
            .with_detail("sandbox", serde_json::json!(true))
    }

    /// 附加细节字段
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// 失败是否为确定性失败（不应重试）
    pub fn is_permanent(&self) -> bool {
        self.details
            .get("permanent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// QueueJob — 队列任务
// ---------------------------------------------------------------------------

/// 队列任务
///
/// {事件, 渠道, 消息} 三元组，入队时确定优先级。
/// 生命周期：入队 -> 工作者取出 -> 成功移除，或失败后按退避策略
/// 延迟重试，直至耗尽重试次数被转入终态失败列表。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub event: NotificationEvent,
    pub channel: ChannelKind,
    pub message: NotificationMessage,
    pub priority: Priority,
    /// 已失败的尝试次数
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(
        event: NotificationEvent,
        channel: ChannelKind,
        message: NotificationMessage,
        priority: Priority,
    ) -> Self {
        Self {
            event,
            channel,
            message,
            priority,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
