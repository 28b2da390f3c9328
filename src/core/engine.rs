use crate::core::decision::SyncDecision;
use crate::core::integrity::{IntegrityChecker, VerifyMode};
use crate::core::probe::ProcessProbe;
use crate::core::transfer::{Transfer, TransferOptions};
use crate::core::version::VersionResolver;
use crate::credentials::CredentialStore;
use crate::error::{Result, SyncError};
use crate::models::{RemoteEntry, StatusReport, SyncStatus, VersionSnapshot};
use crate::storage::{RemoteConnector, RemoteSession, CHUNK_SIZE, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 通知受管应用有更新的标记文件
pub const UPDATE_MARKER: &str = "_UPDATE_AVAILABLE";

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_update_path: PathBuf,
    pub version_pattern: String,
    /// 受管应用的进程名（如 `siges.exe`）
    pub app_executable: Option<String>,
    pub verify_mode: VerifyMode,
    pub op_timeout: Duration,
    pub io_timeout: Duration,
    pub cycle_timeout: Duration,
    pub chunk_size: u64,
}

impl EngineConfig {
    pub fn new(local_update_path: impl Into<PathBuf>) -> Self {
        Self {
            local_update_path: local_update_path.into(),
            version_pattern: "SIGES *.txt".to_string(),
            app_executable: None,
            verify_mode: VerifyMode::SizeOnly,
            op_timeout: Duration::from_secs(OP_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
            cycle_timeout: Duration::from_secs(3600),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// 一个周期的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 已有周期在运行，本次调用被拒绝
    AlreadyRunning,
    UpToDate,
    Downloaded { files: usize },
    DownloadFailed { succeeded: usize, total: usize },
    Error(String),
}

impl CycleOutcome {
    /// 对应的最终状态；被拒绝的调用没有状态
    pub fn status(&self) -> Option<SyncStatus> {
        match self {
            CycleOutcome::AlreadyRunning => None,
            CycleOutcome::UpToDate => Some(SyncStatus::UpToDate),
            CycleOutcome::Downloaded { .. } => Some(SyncStatus::Downloaded),
            CycleOutcome::DownloadFailed { .. } => Some(SyncStatus::DownloadFailed),
            CycleOutcome::Error(_) => Some(SyncStatus::Error),
        }
    }
}

/// `force_check` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceCheck {
    Scheduled,
    AlreadyRunning,
}

/// 同步引擎
///
/// 同一时间最多一个周期在运行；状态通过 watch 通道发布，读取不阻塞。
pub struct SyncEngine {
    config: EngineConfig,
    decision: Arc<SyncDecision>,
    checker: Arc<IntegrityChecker>,
    connector: Arc<dyn RemoteConnector>,
    credentials: Arc<dyn CredentialStore>,
    probe: Arc<dyn ProcessProbe>,
    /// 已连接的会话，连接类错误后清空
    session: Mutex<Option<Arc<dyn RemoteSession>>>,
    running: AtomicBool,
    status: watch::Sender<StatusReport>,
    shutdown: CancellationToken,
    /// 创建时所在的运行时，`force_check` 从其它线程调用时也在这里执行
    runtime: Handle,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn RemoteConnector>,
        credentials: Arc<dyn CredentialStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        let resolver = VersionResolver::new(&config.version_pattern).map_err(|e| {
            SyncError::Config(format!("无效的版本文件模式 {}: {}", config.version_pattern, e))
        })?;
        let runtime = Handle::try_current().map_err(|_| {
            SyncError::Config("同步引擎必须在 tokio 运行时中创建".to_string())
        })?;
        let (status, _) = watch::channel(StatusReport::default());

        Ok(Self {
            decision: Arc::new(SyncDecision::new(resolver)),
            checker: Arc::new(IntegrityChecker::new(config.verify_mode)),
            config,
            connector,
            credentials,
            probe,
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            status,
            shutdown: CancellationToken::new(),
            runtime,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 最新发布的状态（周期进行中时版本信息可能是上一周期的）
    pub fn get_status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 取消进行中的周期
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 在后台启动一次检查，立即返回
    ///
    /// 可以在运行时之外的线程（如界面线程）调用。返回前已占用运行标志，
    /// 所以 `Scheduled` 表示确实会执行一个周期。
    pub fn force_check(self: &Arc<Self>) -> ForceCheck {
        if !self.try_claim() {
            info!("检查已在进行中，忽略手动检查");
            return ForceCheck::AlreadyRunning;
        }

        // 任务没有执行就被丢弃时也要释放运行标志
        let engine = scopeguard::guard(Arc::clone(self), |engine| engine.release());
        self.runtime.spawn(async move {
            let outcome = engine.run_claimed().await;
            debug!("手动检查完成: {:?}", outcome);
        });
        ForceCheck::Scheduled
    }

    fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// 检查并同步
    ///
    /// 不返回错误：所有失败都体现为 `CycleOutcome` 和发布的状态。
    pub async fn check_and_sync(&self) -> CycleOutcome {
        if !self.try_claim() {
            info!("检查已在进行中");
            return CycleOutcome::AlreadyRunning;
        }
        let _running = scopeguard::guard((), |_| self.release());
        self.run_claimed().await
    }

    /// 调用方已占用运行标志
    async fn run_claimed(&self) -> CycleOutcome {
        self.status.send_modify(|report| {
            report.status = SyncStatus::Checking;
            report.last_check = Some(Utc::now());
        });
        info!("开始检查更新");

        let cancel = self.shutdown.child_token();
        let cycle = AssertUnwindSafe(self.cycle(&cancel)).catch_unwind();

        let result = match tokio::time::timeout(self.config.cycle_timeout, cycle).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "未知错误".to_string());
                Err(SyncError::Unexpected(format!("周期异常中止: {}", message)))
            }
            Err(_) => {
                cancel.cancel();
                Err(SyncError::Timeout(format!(
                    "周期超过 {} 秒",
                    self.config.cycle_timeout.as_secs()
                )))
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_connection() {
                    self.drop_session().await;
                }
                error!("检查更新失败: {}", e);
                self.publish(SyncStatus::Error);
                CycleOutcome::Error(e.to_string())
            }
        }
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let session = self.ensure_session().await?;
        let listing = self
            .with_op_timeout("列出远程目录", session.list(""))
            .await?;
        debug!("远程共有 {} 个条目", listing.len());

        // 本地扫描是阻塞 IO，放到阻塞线程池
        let decider = self.decision.clone();
        let local_dir = self.config.local_update_path.clone();
        let (decision, listing) = run_blocking(move || {
            let decision = decider.decide(&listing, &local_dir);
            (decision, listing)
        })
        .await?;
        self.status
            .send_modify(|report| report.version_info = decision.snapshot.clone());

        if decision.candidates.is_empty() {
            info!("没有需要更新的文件");
            self.publish(SyncStatus::UpToDate);
            return Ok(CycleOutcome::UpToDate);
        }

        self.publish(SyncStatus::Downloading);
        let transfer = Transfer::new(
            session,
            self.checker.clone(),
            TransferOptions {
                chunk_size: self.config.chunk_size,
                io_timeout: self.config.io_timeout,
            },
            cancel.clone(),
        );

        let total = decision.candidates.len();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut lost_connection = false;

        for candidate in &decision.candidates {
            let name = &candidate.remote_entry.name;

            if failed > 0 && self.decision.resolver().is_marker(name) {
                warn!("有文件下载失败，暂不更新版本文件: {}", name);
                failed += 1;
                continue;
            }

            match transfer.run(candidate).await {
                Ok(_) => succeeded += 1,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    lost_connection |= e.is_connection();
                    error!("下载失败 {}: {}", name, e);
                    failed += 1;
                }
            }
        }

        if lost_connection {
            self.drop_session().await;
        }

        if succeeded < total {
            warn!("下载未完成: {}/{} 成功", succeeded, total);
            self.publish(SyncStatus::DownloadFailed);
            return Ok(CycleOutcome::DownloadFailed { succeeded, total });
        }

        let snapshot = self.refresh_snapshot(&listing, &decision.snapshot).await;
        self.status.send_modify(|report| {
            report.status = SyncStatus::Downloaded;
            report.version_info = snapshot;
        });
        info!("状态: {}, 已下载 {} 个文件", SyncStatus::Downloaded, succeeded);

        self.signal_consumer().await;
        Ok(CycleOutcome::Downloaded { files: succeeded })
    }

    async fn ensure_session(&self) -> Result<Arc<dyn RemoteSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let credentials = self.credentials.load_credentials();
        if credentials.is_none() {
            debug!("没有存储的凭据");
        }

        let session = self
            .with_op_timeout("连接共享", self.connector.connect(credentials.as_ref()))
            .await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn drop_session(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("已断开远程会话，下次检查时重新连接");
        }
    }

    async fn with_op_timeout<T>(
        &self,
        what: &str,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.op_timeout, operation)
            .await
            .map_err(|_| {
                SyncError::Timeout(format!(
                    "{} 超过 {} 秒",
                    what,
                    self.config.op_timeout.as_secs()
                ))
            })?
    }

    /// 下载后重新读取本地版本，远程部分沿用本周期的列表
    async fn refresh_snapshot(
        &self,
        listing: &[RemoteEntry],
        previous: &VersionSnapshot,
    ) -> VersionSnapshot {
        let decision = self.decision.clone();
        let local_dir = self.config.local_update_path.clone();
        let local = run_blocking(move || decision.resolver().resolve_local(&local_dir))
            .await
            .and_then(|result| {
                result.map_err(|e| SyncError::io(&self.config.local_update_path, e))
            });

        match local {
            Ok(local) => {
                let remote = self.decision.resolver().resolve_remote(listing);
                VersionSnapshot::new(local.as_ref(), remote.as_ref())
            }
            Err(e) => {
                warn!("无法刷新本地版本: {}", e);
                previous.clone()
            }
        }
    }

    /// 受管应用正在运行时写入更新标记
    async fn signal_consumer(&self) {
        let Some(executable) = self.config.app_executable.clone() else {
            debug!("未配置应用程序路径，跳过更新通知");
            return;
        };

        let probe = self.probe.clone();
        let name = executable.clone();
        let running = tokio::task::spawn_blocking(move || probe.is_running(&name))
            .await
            .unwrap_or(false);

        if !running {
            debug!("{} 未运行，不写入更新标记", executable);
            return;
        }

        match write_update_marker(&self.config.local_update_path).await {
            Ok(path) => info!("{} 正在运行，已写入更新标记: {}", executable, path.display()),
            Err(e) => warn!("写入更新标记失败: {}", e),
        }
    }

    fn publish(&self, status: SyncStatus) {
        self.status.send_modify(|report| report.status = status);
        info!("状态: {}", status);
    }
}

/// 在阻塞线程池中执行同步的文件系统操作
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Unexpected(format!("后台任务失败: {}", e)))
}

/// 原子写入更新标记，内容为当前时间（RFC 3339）
pub async fn write_update_marker(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(UPDATE_MARKER);
    let temp = dir.join(format!(".{}.{}.tmp", UPDATE_MARKER, uuid::Uuid::new_v4()));

    tokio::fs::write(&temp, Utc::now().to_rfc3339())
        .await
        .map_err(|e| SyncError::io(&temp, e))?;
    if let Err(source) = tokio::fs::rename(&temp, &path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(SyncError::Move { path, source });
    }
    Ok(path)
}
