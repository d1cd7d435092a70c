//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use std::collections::HashMap;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// 队列与工作者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 每个任务的最大尝试次数（含首次执行）
    pub max_attempts: u32,
    /// 各优先级的工作者并发数，high > normal > low 形成调度偏向
    pub workers_high: usize,
    pub workers_normal: usize,
    pub workers_low: usize,
    /// 队列为空时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单任务最长处理时间（秒），超时按失败处理
    pub job_timeout_seconds: u64,
    /// 重试退避的初始等待（毫秒）
    pub retry_initial_delay_ms: u64,
    /// 重试退避的等待上限（毫秒）
    pub retry_max_delay_ms: u64,
    /// digest 队列的清空计划（cron 表达式，秒级精度）
    pub digest_schedule: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workers_high: 4,
            workers_normal: 2,
            workers_low: 1,
            poll_interval_ms: 200,
            job_timeout_seconds: 30,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            digest_schedule: "0 0 * * * *".to_string(),
        }
    }
}

/// 单个滑动窗口的限额
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowLimit {
    pub window_seconds: u64,
    pub max: u32,
}

/// 限流配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 用户级全局窗口
    pub per_user_window_seconds: u64,
    pub per_user_max: u32,
    /// 渠道级窗口（键为渠道名，未配置的渠道不做渠道级限制）
    #[serde(default)]
    pub per_channel: HashMap<String, WindowLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut per_channel = HashMap::new();
        // 短信与邮件成本高，默认单独限流；站内信不设渠道级限制
        per_channel.insert(
            "sms".to_string(),
            WindowLimit {
                window_seconds: 3600,
                max: 10,
            },
        );
        per_channel.insert(
            "email".to_string(),
            WindowLimit {
                window_seconds: 3600,
                max: 50,
            },
        );

        Self {
            per_user_window_seconds: 3600,
            per_user_max: 100,
            per_channel,
        }
    }
}

/// 邮件渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// 服务商：sendgrid / ses / smtp
    pub provider: String,
    pub api_key: Option<String>,
    /// 覆盖默认的服务商端点（ses 与 smtp 中继必须配置）
    pub endpoint: Option<String>,
    pub from_address: String,
    pub from_name: String,
    /// 配置后走服务商的模板替换而非本地渲染内容
    pub template_id: Option<String>,
    /// 打开/点击追踪透传
    pub tracking_enabled: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: "sendgrid".to_string(),
            api_key: None,
            endpoint: None,
            from_address: "noreply@pulse.dev".to_string(),
            from_name: "Pulse".to_string(),
            template_id: None,
            tracking_enabled: true,
        }
    }
}

/// 短信渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// 服务商：twilio / aws-sns / messagebird
    pub provider: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub from_number: String,
    /// 短信最大长度（字符数），超长内容截断并追加省略号
    pub max_length: usize,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: "twilio".to_string(),
            api_key: None,
            endpoint: None,
            from_number: "+10000000000".to_string(),
            max_length: 160,
        }
    }
}

/// 推送渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// android/web 走 fcm，ios 走 apns
    pub provider: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub default_sound: String,
    pub default_icon: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            provider: "fcm".to_string(),
            api_key: None,
            endpoint: None,
            default_sound: "default".to_string(),
            default_icon: "notification".to_string(),
        }
    }
}

/// Webhook 渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// 配置后对请求体做 HMAC-SHA256 签名并附加签名头
    pub secret: Option<String>,
    pub timeout_ms: u64,
    /// 渠道内部重试次数（仅网络错误与 5xx，4xx 不重试）
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout_ms: 5000,
            max_retries: 3,
        }
    }
}

/// 站内信渠道配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InAppConfig {
    /// 每个用户保留的最大站内信条数，超出后淘汰最旧的
    pub max_feed_size: usize,
    /// 站内信记录保留天数
    pub record_ttl_days: u64,
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            max_feed_size: 200,
            record_ttl_days: 90,
        }
    }
}

/// 渠道总配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    /// 沙箱模式：所有渠道短路为合成成功，不访问外部服务商。
    /// 非生产环境与测试必须开启。
    pub sandbox: bool,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub push: PushConfig,
    pub webhook: WebhookConfig,
    pub in_app: InAppConfig,
}

/// 模板配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// 模板覆盖目录（JSON 文件），为空时只用内置模板
    pub dir: Option<String>,
    /// 监听目录变化并自动热加载
    pub hot_reload: bool,
    pub default_locale: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            hot_reload: false,
            default_locale: "en".to_string(),
        }
    }
}

/// 偏好配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    /// 进程内偏好缓存的 TTL（秒）
    pub cache_ttl_seconds: u64,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 3600,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub channels: ChannelsConfig,
    pub templates: TemplateConfig,
    pub preferences: PreferencesConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（PULSE_ 前缀，如 PULSE_REDIS_URL -> redis.url）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("PULSE_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            // 加载默认配置文件
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            // 加载环境特定配置
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            // 环境变量覆盖（PULSE_REDIS_URL -> redis.url）
            .add_source(
                Environment::with_prefix("PULSE")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.rate_limit.per_user_max, 100);
        assert_eq!(config.channels.sms.max_length, 160);
        assert_eq!(config.templates.default_locale, "en");
        assert!(!config.is_production());
    }

    #[test]
    fn test_worker_counts_form_priority_bias() {
        // 默认并发数体现 high > normal > low 的调度偏向
        let config = QueueConfig::default();
        assert!(config.workers_high > config.workers_normal);
        assert!(config.workers_normal > config.workers_low);
    }

    #[test]
    fn test_default_channel_rate_limits() {
        let config = RateLimitConfig::default();
        let sms = config.per_channel.get("sms").expect("应有短信渠道限额");
        assert_eq!(sms.max, 10);
        // 站内信不设渠道级限制
        assert!(!config.per_channel.contains_key("inApp"));
    }
}
