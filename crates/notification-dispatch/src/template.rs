//! 通知模板引擎
//!
//! 模板以 (通知类型, 渠道) 为键，每个键下按 locale 存放主题/标题/正文，
//! 支持 `{{variable}}` 变量替换与 `{{variable|filter}}` 过滤器语法。
//!
//! ## 回退链
//!
//! 1. 精确命中 (类型, 渠道, locale)
//! 2. locale 缺失时回退到 "en"
//! 3. (类型, 渠道) 完全未注册时回退到内置默认表（仅简单变量替换）
//! 4. 默认表也没有时使用通用透传：标题取类型名，正文为原始数据
//!
//! 未解析的变量保留原样而不报错，避免上游数据不完整导致通知丢失。
//!
//! 模板表整体放在 `ArcSwap` 中，`reload_templates` 重新读取磁盘覆盖
//! 目录后原子替换，配合文件监听实现不重启进程的热加载。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use pulse_shared::config::TemplateConfig;
use pulse_shared::error::{NotifyError, Result};
use pulse_shared::events::{ChannelKind, NotificationType};

/// 单个 locale 下的模板内容
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSet {
    #[serde(default)]
    pub subject: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub html: Option<String>,
}

impl TemplateSet {
    fn new(title: &str, body: &str) -> Self {
        Self {
            subject: None,
            title: title.to_string(),
            body: body.to_string(),
            html: None,
        }
    }

    fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    fn with_html(mut self, html: &str) -> Self {
        self.html = Some(html.to_string());
        self
    }
}

/// 渲染结果
#[derive(Debug, Clone)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub title: String,
    pub body: String,
    pub html: Option<String>,
}

/// 磁盘覆盖文件中的模板条目
#[derive(Debug, Deserialize)]
struct TemplateFileEntry {
    #[serde(rename = "type")]
    notification_type: NotificationType,
    channel: ChannelKind,
    locale: String,
    #[serde(flatten)]
    set: TemplateSet,
}

/// 编译后的模板表
#[derive(Default)]
struct TemplateTable {
    templates: HashMap<(NotificationType, ChannelKind), HashMap<String, TemplateSet>>,
}

impl TemplateTable {
    fn insert(
        &mut self,
        notification_type: NotificationType,
        channel: ChannelKind,
        locale: &str,
        set: TemplateSet,
    ) {
        self.templates
            .entry((notification_type, channel))
            .or_default()
            .insert(locale.to_string(), set);
    }

    /// 注册内置模板
    ///
    /// 覆盖高频的 (类型, 渠道) 组合，en 与 zh 两种 locale。
    /// 其余组合由默认表或通用透传兜底。
    fn builtin() -> Self {
        use ChannelKind::*;
        use NotificationType::*;

        let mut table = Self::default();
        let entries: Vec<(NotificationType, ChannelKind, &str, TemplateSet)> = vec![
            // ---- 交易类 ----
            (
                TransactionConfirmed,
                Email,
                "en",
                TemplateSet::new(
                    "Transaction confirmed",
                    "Your transaction {{txHash|truncate:18}} has been confirmed.",
                )
                .with_subject("Transaction confirmed")
                .with_html("<p>Your transaction <code>{{txHash}}</code> has been confirmed.</p>"),
            ),
            (
                TransactionConfirmed,
                Email,
                "zh",
                TemplateSet::new("交易已确认", "您的交易 {{txHash|truncate:18}} 已确认。")
                    .with_subject("交易已确认")
                    .with_html("<p>您的交易 <code>{{txHash}}</code> 已确认。</p>"),
            ),
            (
                TransactionConfirmed,
                InApp,
                "en",
                TemplateSet::new("Transaction confirmed", "Transaction {{txHash}} confirmed."),
            ),
            (
                TransactionConfirmed,
                InApp,
                "zh",
                TemplateSet::new("交易已确认", "交易 {{txHash}} 已确认。"),
            ),
            (
                TransactionConfirmed,
                Push,
                "en",
                TemplateSet::new("Transaction confirmed", "{{txHash|truncate:12}} confirmed"),
            ),
            (
                TransactionConfirmed,
                Sms,
                "en",
                TemplateSet::new(
                    "Transaction confirmed",
                    "Pulse: transaction {{txHash|truncate:12}} confirmed.",
                ),
            ),
            (
                TransactionFailed,
                Email,
                "en",
                TemplateSet::new(
                    "Transaction failed",
                    "Your transaction {{txHash|truncate:18}} failed: {{reason}}",
                )
                .with_subject("Transaction failed"),
            ),
            (
                TransactionFailed,
                Email,
                "zh",
                TemplateSet::new("交易失败", "您的交易 {{txHash|truncate:18}} 失败：{{reason}}")
                    .with_subject("交易失败"),
            ),
            (
                TransactionFailed,
                InApp,
                "en",
                TemplateSet::new("Transaction failed", "Transaction {{txHash}} failed: {{reason}}"),
            ),
            (
                TransactionFailed,
                Push,
                "en",
                TemplateSet::new("Transaction failed", "{{txHash|truncate:12}} failed"),
            ),
            (
                DepositReceived,
                InApp,
                "en",
                TemplateSet::new(
                    "Deposit received",
                    "Received {{amount|currency}} {{asset|upper}}.",
                ),
            ),
            (
                DepositReceived,
                Push,
                "en",
                TemplateSet::new("Deposit received", "+{{amount|currency}} {{asset|upper}}"),
            ),
            (
                WithdrawalCompleted,
                InApp,
                "en",
                TemplateSet::new(
                    "Withdrawal completed",
                    "Withdrew {{amount|currency}} {{asset|upper}} to {{address|truncate:14}}.",
                ),
            ),
            (
                WithdrawalCompleted,
                Sms,
                "en",
                TemplateSet::new(
                    "Withdrawal completed",
                    "Pulse: withdrawal of {{amount|currency}} {{asset|upper}} completed.",
                ),
            ),
            // ---- 安全类 ----
            (
                SecurityAlert,
                Email,
                "en",
                TemplateSet::new(
                    "Security alert",
                    "Security alert on your account: {{reason}}. If this wasn't you, secure your account immediately.",
                )
                .with_subject("Security alert on your account"),
            ),
            (
                SecurityAlert,
                Email,
                "zh",
                TemplateSet::new(
                    "安全告警",
                    "您的账户出现安全告警：{{reason}}。如非本人操作请立即处理。",
                )
                .with_subject("账户安全告警"),
            ),
            (
                SecurityAlert,
                Sms,
                "en",
                TemplateSet::new("Security alert", "Pulse security alert: {{reason}}"),
            ),
            (
                SecurityAlert,
                Push,
                "en",
                TemplateSet::new("Security alert", "{{reason}}"),
            ),
            (
                SecurityAlert,
                InApp,
                "en",
                TemplateSet::new("Security alert", "{{reason}}"),
            ),
            (
                LoginNewDevice,
                Email,
                "en",
                TemplateSet::new(
                    "New device sign-in",
                    "New sign-in from {{device}} at {{location}} on {{time|date}}.",
                )
                .with_subject("New device sign-in"),
            ),
            (
                LoginNewDevice,
                InApp,
                "en",
                TemplateSet::new("New device sign-in", "New sign-in from {{device}}."),
            ),
            (
                PasswordChanged,
                Email,
                "en",
                TemplateSet::new(
                    "Password changed",
                    "Your account password was changed on {{time|date}}.",
                )
                .with_subject("Password changed"),
            ),
            (
                PasswordChanged,
                InApp,
                "en",
                TemplateSet::new("Password changed", "Your password was changed."),
            ),
            // ---- 治理类 ----
            (
                ProposalCreated,
                InApp,
                "en",
                TemplateSet::new("New proposal", "Proposal \"{{proposalTitle}}\" was created."),
            ),
            (
                ProposalCreated,
                Email,
                "en",
                TemplateSet::new(
                    "New governance proposal",
                    "A new proposal \"{{proposalTitle}}\" is open for discussion.",
                )
                .with_subject("New governance proposal"),
            ),
            (
                VotingStarted,
                InApp,
                "en",
                TemplateSet::new(
                    "Voting started",
                    "Voting on \"{{proposalTitle}}\" is open, {{votes|plural:vote:votes}} cast so far.",
                ),
            ),
            (
                VotingEnded,
                InApp,
                "en",
                TemplateSet::new("Voting ended", "Voting on \"{{proposalTitle}}\" has ended."),
            ),
            // ---- 系统类 ----
            (
                SystemMaintenance,
                InApp,
                "en",
                TemplateSet::new(
                    "Scheduled maintenance",
                    "Maintenance window starts at {{startTime|date}}.",
                ),
            ),
            (
                SystemMaintenance,
                Email,
                "en",
                TemplateSet::new(
                    "Scheduled maintenance",
                    "A maintenance window is scheduled to start at {{startTime|date}}.",
                )
                .with_subject("Scheduled maintenance"),
            ),
            (
                PriceAlert,
                Push,
                "en",
                TemplateSet::new(
                    "Price alert",
                    "{{symbol|upper}} is at {{price|currency}}",
                ),
            ),
            (
                PriceAlert,
                InApp,
                "en",
                TemplateSet::new(
                    "Price alert",
                    "{{symbol|upper}} reached {{price|currency}}.",
                ),
            ),
            // ---- 营销类 ----
            (
                Promotional,
                Email,
                "en",
                TemplateSet::new("{{headline}}", "{{content}}").with_subject("{{headline}}"),
            ),
        ];

        for (notification_type, channel, locale, set) in entries {
            table.insert(notification_type, channel, locale, set);
        }
        table
    }
}

/// 内置默认表
///
/// (类型, 渠道) 未注册时的兜底文案，仅做简单变量替换。
/// 营销类内容没有统一的默认文案，走通用透传。
fn default_entry(notification_type: NotificationType) -> Option<(&'static str, &'static str)> {
    use NotificationType::*;
    let entry = match notification_type {
        TransactionConfirmed => ("Transaction confirmed", "Transaction {{txHash}} confirmed."),
        TransactionFailed => ("Transaction failed", "Transaction {{txHash}} failed."),
        TransactionPending => ("Transaction pending", "Transaction {{txHash}} is pending."),
        DepositReceived => ("Deposit received", "Deposit of {{amount}} {{asset}} received."),
        WithdrawalCompleted => ("Withdrawal completed", "Withdrawal of {{amount}} {{asset}} completed."),
        SecurityAlert => ("Security alert", "Security alert: {{reason}}"),
        LoginNewDevice => ("New device sign-in", "New sign-in from {{device}}."),
        PasswordChanged => ("Password changed", "Your password was changed."),
        TwoFactorChanged => ("Two-factor settings changed", "Your two-factor settings were changed."),
        ProposalCreated => ("New proposal", "Proposal {{proposalTitle}} was created."),
        VotingStarted => ("Voting started", "Voting on {{proposalTitle}} has started."),
        VotingEnded => ("Voting ended", "Voting on {{proposalTitle}} has ended."),
        ProposalExecuted => ("Proposal executed", "Proposal {{proposalTitle}} was executed."),
        SystemMaintenance => ("Scheduled maintenance", "Maintenance starts at {{startTime}}."),
        SystemUpgrade => ("System upgrade", "A system upgrade is scheduled."),
        AccountVerification => ("Account verification", "Your account verification status changed."),
        PriceAlert => ("Price alert", "{{symbol}} reached {{price}}."),
        Promotional | Educational | Community => return None,
    };
    Some(entry)
}

/// 模板引擎
///
/// 线程安全：渲染只读取 `ArcSwap` 快照，热加载原子替换整张表。
pub struct TemplateEngine {
    table: ArcSwap<TemplateTable>,
    /// 磁盘覆盖目录
    dir: Option<PathBuf>,
    default_locale: String,
    variable_regex: Regex,
}

impl TemplateEngine {
    /// 按配置创建引擎：内置模板 + 可选的磁盘覆盖
    pub fn new(config: &TemplateConfig) -> Self {
        let engine = Self {
            table: ArcSwap::from_pointee(TemplateTable::builtin()),
            dir: config.dir.as_ref().map(PathBuf::from),
            default_locale: config.default_locale.clone(),
            // 匹配 {{variable}} 与 {{variable|filter}} / {{variable|filter:arg}}
            variable_regex: Regex::new(r"\{\{\s*([A-Za-z0-9_]+)(?:\|([A-Za-z0-9_]+)(?::([^}]+))?)?\s*\}\}")
                .unwrap(),
        };
        if engine.dir.is_some()
            && let Err(e) = engine.reload_templates()
        {
            warn!(error = %e, "加载模板覆盖目录失败，仅使用内置模板");
        }
        engine
    }

    /// 使用内置模板创建（测试与无覆盖目录的部署）
    pub fn with_defaults() -> Self {
        Self::new(&TemplateConfig::default())
    }

    /// 注册单条模板（运行时覆盖，常用于测试与管理接口）
    pub fn register(
        &self,
        notification_type: NotificationType,
        channel: ChannelKind,
        locale: &str,
        set: TemplateSet,
    ) {
        self.table.rcu(|table| {
            let mut next = TemplateTable::default();
            next.templates = table.templates.clone();
            next.insert(notification_type, channel, locale, set.clone());
            next
        });
    }

    /// 重新读取磁盘覆盖目录并原子替换模板表
    ///
    /// 返回加载的覆盖条目数。目录未配置时只重建内置表。
    pub fn reload_templates(&self) -> Result<usize> {
        let mut table = TemplateTable::builtin();
        let mut loaded = 0;

        if let Some(dir) = &self.dir {
            loaded = load_overlay(dir, &mut table)?;
        }

        self.table.store(Arc::new(table));
        info!(overlay_entries = loaded, "模板表已重新加载");
        Ok(loaded)
    }

    /// 渲染指定 (类型, 渠道) 的模板
    ///
    /// data 为事件携带的业务数据对象；locale 缺失时回退 "en"，
    /// 组合未注册时依次回退默认表与通用透传。
    pub fn render(
        &self,
        notification_type: NotificationType,
        channel: ChannelKind,
        data: &serde_json::Value,
        locale: &str,
    ) -> RenderedTemplate {
        let table = self.table.load();

        if let Some(locales) = table.templates.get(&(notification_type, channel))
            && let Some(set) = locales
                .get(locale)
                .or_else(|| locales.get(self.default_locale.as_str()))
        {
            return RenderedTemplate {
                subject: set.subject.as_ref().map(|s| self.substitute(s, data)),
                title: self.substitute(&set.title, data),
                body: self.substitute(&set.body, data),
                html: set.html.as_ref().map(|h| self.substitute(h, data)),
            };
        }

        // (类型, 渠道) 未注册：回退默认表
        if let Some((title, body)) = default_entry(notification_type) {
            debug!(
                notification_type = %notification_type,
                channel = %channel,
                "模板未注册，使用默认表"
            );
            let title = self.substitute(title, data);
            return RenderedTemplate {
                subject: Some(title.clone()),
                title,
                body: self.substitute(body, data),
                html: None,
            };
        }

        // 默认表也没有：通用透传，正文保留原始数据
        debug!(
            notification_type = %notification_type,
            channel = %channel,
            "模板与默认表均未注册，使用通用透传"
        );
        let title = humanize_type(notification_type);
        RenderedTemplate {
            subject: Some(title.clone()),
            title,
            body: serde_json::to_string(data).unwrap_or_default(),
            html: None,
        }
    }

    /// 变量替换
    ///
    /// 将 `{{variable}}` 替换为 data 中的对应值并应用过滤器。
    /// 未找到的变量保留原样并记录警告日志。
    fn substitute(&self, template: &str, data: &serde_json::Value) -> String {
        self.variable_regex
            .replace_all(template, |caps: &regex::Captures| {
                let var_name = &caps[1];
                match data.get(var_name) {
                    Some(value) => {
                        let raw = value_to_string(value);
                        match caps.get(2) {
                            Some(filter) => apply_filter(
                                filter.as_str(),
                                caps.get(3).map(|m| m.as_str()),
                                raw,
                            ),
                            None => raw,
                        }
                    }
                    None => {
                        warn!(variable = var_name, "模板变量未找到，保留原样");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// 提取模板中的所有变量名
    pub fn extract_variables(&self, template: &str) -> Vec<String> {
        self.variable_regex
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .collect()
    }
}

/// 读取覆盖目录下的所有 JSON 模板文件
fn load_overlay(dir: &Path, table: &mut TemplateTable) -> Result<usize> {
    let mut loaded = 0;
    let entries = std::fs::read_dir(dir)
        .map_err(|e| NotifyError::Internal(format!("读取模板目录失败: {e}")))?;

    for entry in entries {
        let entry = entry.map_err(|e| NotifyError::Internal(format!("读取模板目录失败: {e}")))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| NotifyError::Internal(format!("读取模板文件失败: {e}")))?;
        let file_entries: Vec<TemplateFileEntry> = serde_json::from_str(&content)
            .map_err(|e| NotifyError::Serialization(format!("解析模板文件 {path:?} 失败: {e}")))?;

        for file_entry in file_entries {
            table.insert(
                file_entry.notification_type,
                file_entry.channel,
                &file_entry.locale,
                file_entry.set,
            );
            loaded += 1;
        }
    }
    Ok(loaded)
}

/// 启动模板目录的文件监听，变更时自动热加载
///
/// 返回的 watcher 需由调用方持有，drop 后监听停止。
pub fn spawn_watcher(engine: &Arc<TemplateEngine>) -> Result<notify::RecommendedWatcher> {
    let Some(dir) = engine.dir.clone() else {
        return Err(NotifyError::InvalidArgument {
            field: "templates.dir".to_string(),
            message: "未配置模板目录，无法启动热加载".to_string(),
        });
    };

    let watched = engine.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(_) => match watched.reload_templates() {
                Ok(count) => info!(overlay_entries = count, "模板目录变更，已热加载"),
                Err(e) => warn!(error = %e, "模板热加载失败，沿用旧模板表"),
            },
            Err(e) => warn!(error = %e, "模板目录监听错误"),
        }
    })
    .map_err(|e| NotifyError::Internal(format!("创建文件监听失败: {e}")))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| NotifyError::Internal(format!("监听模板目录失败: {e}")))?;

    info!(dir = %dir.display(), "模板热加载监听已启动");
    Ok(watcher)
}

/// 将 JSON 值转为可渲染的字符串
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// 应用过滤器
///
/// 未知过滤器记录警告并返回原值，保证渲染永不失败。
fn apply_filter(name: &str, arg: Option<&str>, raw: String) -> String {
    match name {
        "date" => format_date(&raw),
        "currency" => match raw.parse::<f64>() {
            Ok(v) => format!("{v:.2}"),
            Err(_) => raw,
        },
        "truncate" => {
            let limit: usize = arg.and_then(|a| a.parse().ok()).unwrap_or(32);
            truncate_chars(&raw, limit)
        }
        "upper" => raw.to_uppercase(),
        "lower" => raw.to_lowercase(),
        "plural" => {
            let (one, many) = arg.and_then(|a| a.split_once(':')).unwrap_or(("", "s"));
            match raw.parse::<f64>() {
                Ok(v) if v == 1.0 => one.to_string(),
                Ok(_) => many.to_string(),
                Err(_) => many.to_string(),
            }
        }
        // 比较选择：{{amount|gt:100:large:small}}
        "gt" => {
            let Some(((threshold, when_true), when_false)) = arg
                .and_then(|a| a.split_once(':'))
                .and_then(|(t, rest)| rest.split_once(':').map(|(y, n)| ((t, y), n)))
            else {
                return raw;
            };
            match (raw.parse::<f64>(), threshold.parse::<f64>()) {
                (Ok(v), Ok(t)) if v > t => when_true.to_string(),
                (Ok(_), Ok(_)) => when_false.to_string(),
                _ => raw,
            }
        }
        other => {
            warn!(filter = other, "未知模板过滤器，忽略");
            raw
        }
    }
}

/// 按字符数截断并追加省略号
fn truncate_chars(s: &str, limit: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= limit {
        s.to_string()
    } else {
        let truncated: String = chars[..limit].iter().collect();
        format!("{truncated}...")
    }
}

/// 时间格式化：支持 unix 秒时间戳与 RFC3339 字符串
fn format_date(raw: &str) -> String {
    if let Ok(secs) = raw.parse::<i64>()
        && let Some(dt) = chrono::DateTime::from_timestamp(secs, 0)
    {
        return dt.format("%Y-%m-%d %H:%M").to_string();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.format("%Y-%m-%d %H:%M").to_string();
    }
    raw.to_string()
}

/// 类型名转为可读标题（TRANSACTION_CONFIRMED -> Transaction Confirmed）
fn humanize_type(notification_type: NotificationType) -> String {
    notification_type
        .to_string()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
