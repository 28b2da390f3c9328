use shareupdater_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use shareupdater_lib::AppState;
use tracing_subscriber::prelude::*;

/// 初始化日志系统
fn init_logging() {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let subscriber = tracing_subscriber::registry();
        let _ = tracing::subscriber::set_global_default(subscriber);
        return;
    }

    // 创建日志级别过滤器
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());
    for directive in ["opendal=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    // 创建文件日志写入器
    if let Ok(file_writer) = SizeRotatingWriter::new(&log_dir, config.max_size_mb, config.max_files) {
        // 文件日志层 - 始终输出到文件
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);

        // 在 debug 模式下也输出到控制台
        #[cfg(debug_assertions)]
        {
            let console_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);

            let _ = tracing::subscriber::set_global_default(subscriber);
        }

        // 在 release 模式下只输出到文件
        #[cfg(not(debug_assertions))]
        {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer);

            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    } else {
        // 文件日志创建失败，回退到控制台
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() {
    // 初始化日志系统
    init_logging();

    let Some(_instance) = shareupdater_lib::acquire_single_instance() else {
        tracing::warn!("已有实例在运行，退出");
        return;
    };

    tracing::info!("shareupdater {} 启动", env!("CARGO_PKG_VERSION"));

    let state = match AppState::new() {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("初始化失败: {:#}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("数据目录: {}", state.config_dir.display());
    tracing::info!("共享路径: {}", state.config.share_path);
    tracing::info!("本地更新目录: {}", state.config.local_update_path);

    state.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("无法监听退出信号: {}", e);
    }

    state.cleanup().await;
}
