//! 通知分发工作者入口
//!
//! 装配存储、渠道与统计组件，启动各优先级的队列工作者池，
//! 收到 ctrl-c 后广播 shutdown 信号优雅退出。
//!
//! 入队侧（`NotificationService::send`）由上游接入层（HTTP 路由、
//! 链上事件监听器）以库的方式调用，此进程只负责消费与投递。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use notification_dispatch::analytics::NotificationAnalytics;
use notification_dispatch::channels::{self, Channel};
use notification_dispatch::queue::{QueueManager, QueueWorkers};
use pulse_shared::config::AppConfig;
use pulse_shared::events::ChannelKind;
use pulse_shared::observability;
use pulse_shared::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("notification-dispatch")?;
    observability::init_tracing(&config.observability)?;

    info!(
        environment = %config.environment,
        sandbox = config.channels.sandbox,
        "Starting notification-dispatch..."
    );
    if config.is_production() && config.channels.sandbox {
        warn!("生产环境开启了沙箱模式，所有渠道都不会真实投递");
    }

    let store = Store::redis(&config.redis)?;

    // 渠道分发表（实时推送通道由外部网关接入，这里不注入）
    let channel_table: Arc<HashMap<ChannelKind, Arc<dyn Channel>>> =
        Arc::new(channels::build_channels(&config.channels, store.clone(), None));

    let queues = Arc::new(QueueManager::new(store.clone(), config.queue.clone()));
    let analytics = Arc::new(NotificationAnalytics::new(store.clone()));

    // 回收上次运行遗留的处理中任务（at-least-once）
    queues.requeue_orphans().await?;

    // 启动工作者池
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = Arc::new(QueueWorkers::new(
        queues.clone(),
        channel_table,
        analytics,
        config.queue.clone(),
    ));
    let handles = workers.spawn(shutdown_rx);

    info!("notification-dispatch 已就绪");

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，停止工作者...");
    shutdown_tx.send(true)?;

    for handle in handles {
        let _ = handle.await;
    }

    let status = queues.status().await?;
    info!(?status, "notification-dispatch 已停止");
    Ok(())
}
