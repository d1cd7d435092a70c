//! 优先级队列与工作者池
//!
//! 四条命名队列（high / normal / low / digest）落在存储的列表上，
//! 每条队列配一个延迟重试有序集合（score 为到期时间戳）。队列内
//! FIFO；跨队列的调度偏向通过各优先级工作者池的并发数体现
//! （high > normal > low）。digest 队列不走热循环，由 cron 计划的
//! 清空任务批量投递。
//!
//! ## 可靠消费与 at-least-once
//!
//! 弹出任务时同步放入 processing 列表，处理完成后确认移除；
//! 进程崩溃后重启时 processing 中的孤儿任务被重新入队。这意味着
//! 任务可能在服务商侧成功但未来得及确认，重启后重复投递——
//! 投递语义是 at-least-once，幂等由接收渠道保证。
//!
//! 单个任务的失败被完全隔离：失败按退避策略延迟重试，耗尽重试次数
//! 后转入终态失败列表并记录统计，绝不影响其他任务或工作者本身。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use pulse_shared::config::QueueConfig;
use pulse_shared::error::{NotifyError, Result};
use pulse_shared::events::{ChannelKind, Priority, QueueJob};
use pulse_shared::retry::RetryPolicy;
use pulse_shared::store::{KeyStore, Store, StoreKey};

use crate::analytics::NotificationAnalytics;
use crate::channels::Channel;

/// 队列状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// 等待中的任务（主队列 + 延迟重试集合）
    pub waiting: u64,
    /// 正在被工作者处理的任务
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// 终态失败任务的归档记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadJob {
    pub job: QueueJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// 已租约的任务：持有原始载荷用于处理完成后的确认
pub struct LeasedJob {
    pub job: QueueJob,
    raw: String,
}

// ---------------------------------------------------------------------------
// QueueManager — 队列操作
// ---------------------------------------------------------------------------

/// 队列管理器
pub struct QueueManager {
    store: Store,
    config: QueueConfig,
    policy: RetryPolicy,
}

impl QueueManager {
    pub fn new(store: Store, config: QueueConfig) -> Self {
        let policy = RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.retry_initial_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        );
        Self {
            store,
            config,
            policy,
        }
    }

    /// 任务入队（LPUSH + RPOP 构成 FIFO）
    pub async fn enqueue(&self, job: &QueueJob) -> Result<()> {
        let serialized =
            serde_json::to_string(job).map_err(|e| NotifyError::Serialization(e.to_string()))?;
        self.store
            .lpush(&StoreKey::queue(job.priority.queue_key()), &serialized)
            .await?;
        debug!(
            event_id = %job.event.id,
            channel = %job.channel,
            priority = %job.priority,
            "任务已入队"
        );
        Ok(())
    }

    /// 弹出一个任务
    ///
    /// 先把延迟重试集合中到期的任务搬回主队列，再从队尾弹出并放入
    /// processing 列表。载荷损坏的任务直接丢弃并告警。
    pub async fn pop(&self, priority: Priority) -> Result<Option<LeasedJob>> {
        self.promote_due(priority).await?;

        let queue_key = StoreKey::queue(priority.queue_key());
        let Some(raw) = self.store.rpop(&queue_key).await? else {
            return Ok(None);
        };
        self.store
            .lpush(&StoreKey::queue_processing(priority.queue_key()), &raw)
            .await?;

        match serde_json::from_str::<QueueJob>(&raw) {
            Ok(job) => Ok(Some(LeasedJob { job, raw })),
            Err(e) => {
                error!(priority = %priority, error = %e, "队列载荷损坏，丢弃");
                self.ack(priority, &raw).await?;
                Ok(None)
            }
        }
    }

    /// 确认任务处理完成，从 processing 列表移除
    pub async fn ack(&self, priority: Priority, raw: &str) -> Result<()> {
        self.store
            .lrem(&StoreKey::queue_processing(priority.queue_key()), raw)
            .await?;
        Ok(())
    }

    /// 按退避策略把失败任务放入延迟重试集合
    pub async fn schedule_retry(&self, job: &QueueJob) -> Result<Duration> {
        // attempts 已含本次失败，退避轮次从 0 开始
        let delay = self
            .policy
            .jittered_delay_for_attempt(job.attempts.saturating_sub(1));
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let serialized =
            serde_json::to_string(job).map_err(|e| NotifyError::Serialization(e.to_string()))?;
        self.store
            .zadd(
                &StoreKey::queue_delayed(job.priority.queue_key()),
                &serialized,
                due as f64,
            )
            .await?;
        Ok(delay)
    }

    /// 耗尽重试次数的任务归档到终态失败列表（保留供排查）
    pub async fn park_dead(&self, job: &QueueJob, error: &str) -> Result<()> {
        let dead = DeadJob {
            job: job.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        let serialized =
            serde_json::to_string(&dead).map_err(|e| NotifyError::Serialization(e.to_string()))?;
        self.store.lpush(&StoreKey::queue_dead(), &serialized).await?;
        Ok(())
    }

    /// 延迟集合中到期的任务搬回主队列
    async fn promote_due(&self, priority: Priority) -> Result<()> {
        let delayed_key = StoreKey::queue_delayed(priority.queue_key());
        let now = Utc::now().timestamp_millis() as f64;

        let due = self
            .store
            .zrange_by_score(&delayed_key, f64::NEG_INFINITY, now)
            .await?;
        for raw in due {
            self.store.zrem(&delayed_key, &raw).await?;
            self.store
                .lpush(&StoreKey::queue(priority.queue_key()), &raw)
                .await?;
        }
        Ok(())
    }

    /// 启动时回收 processing 列表中的孤儿任务
    ///
    /// 上次进程崩溃时未确认的任务重新入队——可能造成重复投递，
    /// 属于 at-least-once 语义的预期行为。
    pub async fn requeue_orphans(&self) -> Result<u64> {
        let mut requeued = 0;
        for priority in Priority::all() {
            let processing_key = StoreKey::queue_processing(priority.queue_key());
            let orphans = self.store.lrange(&processing_key, 0, -1).await?;
            for raw in &orphans {
                self.store
                    .lpush(&StoreKey::queue(priority.queue_key()), raw)
                    .await?;
                requeued += 1;
            }
            self.store.del(&processing_key).await?;
        }
        if requeued > 0 {
            warn!(requeued, "回收了上次运行遗留的处理中任务");
        }
        Ok(requeued)
    }

    /// 计数器操作
    pub async fn bump_counter(&self, priority: Priority, kind: &str, delta: i64) -> Result<i64> {
        self.store
            .incr(&StoreKey::queue_counter(priority.queue_key(), kind), delta)
            .await
    }

    /// 全部队列的状态快照
    pub async fn status(&self) -> Result<HashMap<String, QueueStatus>> {
        let mut statuses = HashMap::new();
        for priority in Priority::all() {
            let key = priority.queue_key();
            let waiting = self.store.llen(&StoreKey::queue(key)).await?
                + self.store.zcard(&StoreKey::queue_delayed(key)).await?;
            let read = |kind: &'static str| async move {
                self.store
                    .get_raw(&StoreKey::queue_counter(key, kind))
                    .await
                    .map(|v| v.and_then(|s| s.parse().ok()).unwrap_or(0))
            };
            statuses.insert(
                key.to_string(),
                QueueStatus {
                    waiting,
                    active: read("active").await?,
                    completed: read("completed").await?,
                    failed: read("failed").await?,
                },
            );
        }
        Ok(statuses)
    }
}

// ---------------------------------------------------------------------------
// QueueWorkers — 工作者池
// ---------------------------------------------------------------------------

/// 队列工作者池
///
/// 每个优先级一个池，池内并发数来自配置（high > normal > low），
/// digest 由 cron 计划驱动。
pub struct QueueWorkers {
    manager: Arc<QueueManager>,
    channels: Arc<HashMap<ChannelKind, Arc<dyn Channel>>>,
    analytics: Arc<NotificationAnalytics>,
    config: QueueConfig,
}

impl QueueWorkers {
    pub fn new(
        manager: Arc<QueueManager>,
        channels: Arc<HashMap<ChannelKind, Arc<dyn Channel>>>,
        analytics: Arc<NotificationAnalytics>,
        config: QueueConfig,
    ) -> Self {
        Self {
            manager,
            channels,
            analytics,
            config,
        }
    }

    /// 启动全部工作者，返回任务句柄
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for &priority in Priority::realtime() {
            let workers = match priority {
                Priority::High => self.config.workers_high,
                Priority::Normal => self.config.workers_normal,
                _ => self.config.workers_low,
            };
            for worker_id in 0..workers {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    pool.worker_loop(priority, worker_id, shutdown).await;
                }));
            }
        }

        let digest = self.clone();
        let digest_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            digest.digest_loop(digest_shutdown).await;
        }));

        info!(
            workers_high = self.config.workers_high,
            workers_normal = self.config.workers_normal,
            workers_low = self.config.workers_low,
            "队列工作者已启动"
        );
        handles
    }

    /// 单个工作者的消费循环
    async fn worker_loop(
        &self,
        priority: Priority,
        worker_id: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(priority = %priority, worker_id, "工作者启动");
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.manager.pop(priority).await {
                Ok(Some(lease)) => {
                    self.process(priority, lease).await;
                }
                Ok(None) => {
                    // 队列为空：等待下一轮或 shutdown 信号
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(priority = %priority, error = %e, "弹出任务失败，稍后重试");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        debug!(priority = %priority, worker_id, "工作者退出");
    }

    /// digest 队列的 cron 清空循环
    async fn digest_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let schedule = match cron::Schedule::from_str(&self.config.digest_schedule) {
            Ok(s) => s,
            Err(e) => {
                error!(
                    schedule = %self.config.digest_schedule,
                    error = %e,
                    "digest 计划表达式无效，回退为每小时"
                );
                cron::Schedule::from_str("0 0 * * * *").expect("内置 cron 表达式必定合法")
            }
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(next) = schedule.upcoming(Utc).next() else {
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "等待下一次 digest 清空");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.flush_digest().await;
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// 清空 digest 队列（定时批量投递）
    pub async fn flush_digest(&self) {
        let mut flushed = 0;
        loop {
            match self.manager.pop(Priority::Digest).await {
                Ok(Some(lease)) => {
                    self.process(Priority::Digest, lease).await;
                    flushed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "digest 清空中断");
                    break;
                }
            }
        }
        if flushed > 0 {
            info!(flushed, "digest 队列清空完成");
        }
    }

    /// 处理单个任务：发送 -> 确认 -> 按结果记账或安排重试
    #[instrument(
        skip(self, lease),
        fields(
            event_id = %lease.job.event.id,
            channel = %lease.job.channel,
            priority = %priority,
            attempts = lease.job.attempts
        )
    )]
    async fn process(&self, priority: Priority, lease: LeasedJob) {
        let mut job = lease.job;
        let _ = self.manager.bump_counter(priority, "active", 1).await;
        let start = std::time::Instant::now();

        // 超过最长处理时间视为失败（没有取消原语，任务要么跑完要么超时）
        let timeout = Duration::from_secs(self.config.job_timeout_seconds);
        let outcome = match self.channels.get(&job.channel) {
            Some(channel) => match tokio::time::timeout(timeout, channel.send(&job.message)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => pulse_shared::events::DeliveryResult::failure(e.to_string()),
                Err(_) => pulse_shared::events::DeliveryResult::failure(format!(
                    "job timed out after {}s",
                    self.config.job_timeout_seconds
                )),
            },
            None => pulse_shared::events::DeliveryResult::permanent_failure(format!(
                "channel not registered: {}",
                job.channel
            )),
        };

        let _ = self.manager.bump_counter(priority, "active", -1).await;
        if let Err(e) = self.manager.ack(priority, &lease.raw).await {
            warn!(error = %e, "确认任务失败，重启后可能重复投递");
        }

        metrics::counter!("notify_jobs_processed_total").increment(1);
        metrics::histogram!("notify_send_duration_seconds").record(start.elapsed().as_secs_f64());

        if outcome.success {
            let _ = self.manager.bump_counter(priority, "completed", 1).await;
            if let Err(e) = self
                .analytics
                .track_delivery(
                    &job.event.id,
                    job.channel,
                    true,
                    outcome.message_id.as_deref(),
                    None,
                )
                .await
            {
                warn!(error = %e, "记录投递成功统计失败");
            }
            return;
        }

        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| "unknown delivery failure".to_string());
        job.attempts += 1;

        if !outcome.is_permanent() && job.attempts < self.config.max_attempts {
            match self.manager.schedule_retry(&job).await {
                Ok(delay) => {
                    metrics::counter!("notify_jobs_retried_total").increment(1);
                    warn!(
                        error = %error,
                        next_attempt = job.attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        "投递失败，已安排延迟重试"
                    );
                    return;
                }
                Err(e) => {
                    error!(error = %e, "安排重试失败，任务转入终态失败");
                }
            }
        }

        // 永久失败或重试耗尽：归档 + 记账
        let _ = self.manager.bump_counter(priority, "failed", 1).await;
        metrics::counter!("notify_jobs_dead_total").increment(1);
        if let Err(e) = self.manager.park_dead(&job, &error).await {
            error!(error = %e, "归档终态失败任务失败");
        }
        if let Err(e) = self
            .analytics
            .track_delivery(&job.event.id, job.channel, false, None, Some(error.as_str()))
            .await
        {
            warn!(error = %e, "记录投递失败统计失败");
        }
        error!(error = %error, attempts = job.attempts, "任务终态失败");
    }
}
