//! 定时检查：一个后台任务，按计划触发周期，失败时按策略重试

use crate::core::engine::{CycleOutcome, SyncEngine};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 检查计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSchedule {
    Interval(Duration),
    /// 每天的固定时间（本地时间）
    Daily { hour: u32, minute: u32 },
}

impl CheckSchedule {
    /// 距下一次检查的时间
    pub fn next_delay<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match *self {
            CheckSchedule::Interval(interval) => interval,
            CheckSchedule::Daily { hour, minute } => {
                let now = now.naive_local();
                let Some(today) = now.date().and_hms_opt(hour, minute, 0) else {
                    return Duration::from_secs(24 * 3600);
                };
                let next = if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// 失败重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// 第 `attempt` 次重试前的等待；用尽时返回 None
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then_some(self.interval)
    }
}

/// 调度器驱动的检查
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run_check(&self) -> CycleOutcome;
}

#[async_trait]
impl CycleRunner for SyncEngine {
    async fn run_check(&self) -> CycleOutcome {
        self.check_and_sync().await
    }
}

/// 只有周期错误才重试；下载失败和并发拒绝等待下一次计划
pub(crate) async fn run_with_retry(
    runner: &dyn CycleRunner,
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> CycleOutcome {
    let mut attempt = 0;
    loop {
        let outcome = runner.run_check().await;

        let delay = match (&outcome, retry.delay_after(attempt)) {
            (CycleOutcome::Error(_), Some(delay)) => delay,
            _ => return outcome,
        };
        attempt += 1;
        warn!(
            "检查失败，{} 秒后重试 ({}/{})",
            delay.as_secs(),
            attempt,
            retry.max_retries
        );

        tokio::select! {
            _ = cancel.cancelled() => return outcome,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_loop(
    runner: Arc<dyn CycleRunner>,
    schedule: CheckSchedule,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    loop {
        let outcome = run_with_retry(runner.as_ref(), retry, &cancel).await;
        debug!("计划检查完成: {:?}", outcome);
        if cancel.is_cancelled() {
            break;
        }

        let delay = schedule.next_delay(&Local::now());
        info!("下次检查在 {} 秒后", delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("调度任务已退出");
}

/// 调度器，由应用持有，显式启动和停止
pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    schedule: CheckSchedule,
    retry: RetryPolicy,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, schedule: CheckSchedule, retry: RetryPolicy) -> Self {
        Self {
            runner,
            schedule,
            retry,
            task: Mutex::new(None),
        }
    }

    pub fn schedule(&self) -> CheckSchedule {
        self.schedule
    }

    /// 启动后台任务并立即检查一次；已启动时返回 false
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return false;
        }

        info!("启动定时检查: {:?}", self.schedule);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.runner.clone(),
            self.schedule,
            self.retry,
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
        true
    }

    pub fn is_started(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// 停止后台任务；正在进行的周期会先完成
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("调度任务异常退出: {}", e);
            }
            info!("定时检查已停止");
        }
    }
}
