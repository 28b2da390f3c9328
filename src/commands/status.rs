//! 状态相关命令

use crate::core::engine::ForceCheck;
use crate::models::StatusReport;
use crate::AppState;
use tokio::sync::watch;

/// 获取最新状态，不会阻塞
pub fn get_status(state: &AppState) -> StatusReport {
    state.engine.get_status()
}

/// 立即检查一次（后台运行）
pub fn force_check(state: &AppState) -> ForceCheck {
    state.engine.force_check()
}

/// 订阅状态变化
pub fn subscribe_status(state: &AppState) -> watch::Receiver<StatusReport> {
    state.engine.subscribe()
}
