//! 同步引擎错误类型

use std::io;
use std::path::{Path, PathBuf};

/// 同步过程中的错误
///
/// 连接、列表、超时和意外错误会中止整个周期；
/// 校验、摘要和替换错误只影响单个文件，批次继续。
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("无法连接共享: {0}")]
    Connection(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("文件校验失败 {file}: 远程 {expected} 字节，本地 {actual} 字节")]
    Verification {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("文件摘要不匹配 {file}: 远程 {expected}，本地 {actual}")]
    DigestMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("替换文件失败 {}: {}", .path.display(), .source)]
    Move {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("无法确定版本: {0}")]
    ComparisonIndeterminate(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("I/O 错误 {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Unexpected(String),
}

impl SyncError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// 会话可能已失效，下个周期需要重新连接
    pub fn is_connection(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Timeout(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
