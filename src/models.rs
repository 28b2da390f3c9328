//! 引擎共享的数据模型

use crate::core::version::{ResolvedVersion, VersionTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 同步状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Checking,
    Downloading,
    UpToDate,
    Downloaded,
    DownloadFailed,
    Error,
}

impl SyncStatus {
    /// 是否有周期正在进行
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncStatus::Checking | SyncStatus::Downloading)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Checking => write!(f, "checking"),
            SyncStatus::Downloading => write!(f, "downloading"),
            SyncStatus::UpToDate => write!(f, "up_to_date"),
            SyncStatus::Downloaded => write!(f, "downloaded"),
            SyncStatus::DownloadFailed => write!(f, "download_failed"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// 远程目录条目（列表时的快照）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
    /// 远程提供的可信 BLAKE3 摘要（十六进制），多数共享不提供
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// 本周期选中需要传输的文件
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub remote_entry: RemoteEntry,
    pub local_path: PathBuf,
}

/// 版本快照，每个周期重建
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    #[serde(rename = "local")]
    pub local_version: Option<VersionTag>,
    #[serde(rename = "remote")]
    pub remote_version: Option<VersionTag>,
    pub local_file: Option<String>,
    pub remote_file: Option<String>,
}

impl VersionSnapshot {
    pub fn new(local: Option<&ResolvedVersion>, remote: Option<&ResolvedVersion>) -> Self {
        Self {
            local_version: local.map(|r| r.version.clone()),
            remote_version: remote.map(|r| r.version.clone()),
            local_file: local.map(|r| r.file.clone()),
            remote_file: remote.map(|r| r.file.clone()),
        }
    }
}

/// 对外暴露的状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SyncStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub version_info: VersionSnapshot,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_check: None,
            version_info: VersionSnapshot::default(),
        }
    }
}
