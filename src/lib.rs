use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

pub use config::UpdaterConfig;
pub use crate::core::{CycleOutcome, Scheduler, SyncEngine};
pub use error::SyncError;
pub use models::{StatusReport, SyncStatus};

use crate::core::probe::{ProcessProbe, SystemProcessProbe};
use crate::credentials::{CredentialStore, EncryptedFileStore};
use crate::storage::RemoteConnector;

/// 单实例检测使用的本地端口
pub const INSTANCE_PORT: u16 = 49152;

/// 应用状态，在展示层调用之间共享
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub scheduler: Arc<Scheduler>,
    pub config_dir: PathBuf,
    pub config: UpdaterConfig,
}

impl AppState {
    /// 从数据目录加载配置并创建默认组件
    pub fn new() -> anyhow::Result<Self> {
        let config_dir = resolve_data_dir();
        std::fs::create_dir_all(&config_dir)?;

        let config = UpdaterConfig::load(&config_dir)?;
        config.validate()?;

        let engine_config = config.engine_config();
        let connector = storage::create_connector(
            &config.share_path,
            config.domain.as_deref(),
            engine_config.op_timeout,
            engine_config.io_timeout,
        )?;
        let credentials = Arc::new(EncryptedFileStore::new(&config_dir.join("secure")));

        Self::with_parts(
            config_dir,
            config,
            connector,
            credentials,
            Arc::new(SystemProcessProbe),
        )
    }

    /// 用给定的组件组装
    pub fn with_parts(
        config_dir: PathBuf,
        config: UpdaterConfig,
        connector: Arc<dyn RemoteConnector>,
        credentials: Arc<dyn CredentialStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> anyhow::Result<Self> {
        let engine = Arc::new(SyncEngine::new(
            config.engine_config(),
            connector,
            credentials,
            probe,
        )?);
        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            config.schedule(),
            config.retry_policy(),
        ));

        Ok(Self {
            engine,
            scheduler,
            config_dir,
            config,
        })
    }

    /// 启动定时检查
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// 清理资源（应用关闭时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        // 1. 取消正在进行的周期
        self.engine.shutdown();

        // 2. 停止调度任务
        self.scheduler.stop().await;

        tracing::info!("资源清理完成");
    }
}

/// 数据目录：默认 `<配置目录>/shareupdater`，可由其中 config.json 的 `data_path` 重定向
pub fn resolve_data_dir() -> PathBuf {
    let default_config_dir = dirs::config_dir()
        .map(|p| p.join("shareupdater"))
        .unwrap_or_else(|| PathBuf::from(".shareupdater"));

    let config_file = default_config_dir.join(config::CONFIG_FILE);
    std::fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.exists() && p.is_dir())
        .unwrap_or(default_config_dir)
}

/// 占用本地端口；已有实例运行时返回 None
pub fn acquire_single_instance() -> Option<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, INSTANCE_PORT)).ok()
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
