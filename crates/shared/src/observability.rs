//! 可观测性初始化
//!
//! 提供 tracing 日志初始化与预定义业务指标的注册。
//! 日志支持 pretty（人类可读）与 json（结构化）两种输出格式，
//! 指标通过 metrics facade 记录，由部署环境决定导出方式。

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ObservabilityConfig;

/// 初始化 tracing 日志
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    // 环境变量优先，其次使用配置中的日志级别
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.log_format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    describe_metrics();

    Ok(())
}

/// 注册预定义业务指标
///
/// 描述信息会出现在指标导出端的 HELP 注释中。
fn describe_metrics() {
    metrics::describe_counter!(
        "notify_events_accepted_total",
        "Total number of accepted notification events"
    );
    metrics::describe_counter!(
        "notify_events_skipped_total",
        "Events skipped by preference or quiet-hours policy"
    );
    metrics::describe_counter!(
        "notify_events_rate_limited_total",
        "Events rejected by the rate limiter"
    );
    metrics::describe_counter!(
        "notify_jobs_processed_total",
        "Queue jobs processed by workers"
    );
    metrics::describe_counter!("notify_jobs_retried_total", "Queue jobs scheduled for retry");
    metrics::describe_counter!(
        "notify_jobs_dead_total",
        "Queue jobs parked after exhausting retries"
    );
    metrics::describe_histogram!(
        "notify_send_duration_seconds",
        "Channel send duration in seconds"
    );
}
