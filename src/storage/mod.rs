pub mod share;

use crate::credentials::Credentials;
use crate::error::{Result, SyncError};
use crate::models::RemoteEntry;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use share::{OpendalConnector, OpendalSession};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- connect, list, stat 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 单个数据块读取
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 流式读取的分块大小
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// 已认证的远程会话
///
/// 路径相对于共享根目录，列表不递归。
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// 列出目录的直接子项
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// 获取单个条目，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>>;

    /// 读取文件的一段，越过文件末尾时返回的数据可能更短
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// 会话名称（用于日志）
    fn name(&self) -> &str;
}

/// 建立远程会话
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn RemoteSession>>;
}

/// 共享位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareLocation {
    /// UNC 路径（`\\server\share\path`）或已挂载的目录
    FileSystem {
        root: PathBuf,
        server: Option<String>,
        share: Option<String>,
    },
    /// WebDAV 地址
    WebDav { endpoint: String },
}

impl ShareLocation {
    pub fn parse(share_path: &str) -> Result<Self> {
        let trimmed = share_path.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Config("共享路径不能为空".to_string()));
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(ShareLocation::WebDav {
                endpoint: trimmed.trim_end_matches('/').to_string(),
            });
        }

        // 格式: \\server\share\path
        let (server, share) = if let Some(rest) = trimmed.strip_prefix(r"\\") {
            let mut parts = rest.split('\\').filter(|p| !p.is_empty());
            let server = parts.next().map(str::to_string);
            let share = parts.next().map(str::to_string);
            if server.is_none() || share.is_none() {
                return Err(SyncError::Config(format!(
                    "无效的 UNC 路径（需要 \\\\server\\share）: {}",
                    trimmed
                )));
            }
            (server, share)
        } else {
            (None, None)
        };

        Ok(ShareLocation::FileSystem {
            root: PathBuf::from(trimmed),
            server,
            share,
        })
    }

    /// 是否需要凭据才能连接
    pub fn requires_credentials(&self) -> bool {
        matches!(self, ShareLocation::WebDav { .. })
    }
}

/// 根据配置创建连接器
pub fn create_connector(
    share_path: &str,
    domain: Option<&str>,
    op_timeout: Duration,
    io_timeout: Duration,
) -> Result<Arc<dyn RemoteConnector>> {
    let location = ShareLocation::parse(share_path)?;
    match &location {
        ShareLocation::FileSystem { server, share, .. } => {
            tracing::info!(
                "使用文件系统共享: {} (server={:?}, share={:?})",
                share_path,
                server,
                share
            );
        }
        ShareLocation::WebDav { endpoint } => {
            tracing::info!("使用 WebDAV 共享: {}", endpoint);
        }
    }

    Ok(Arc::new(OpendalConnector::new(
        location,
        domain.map(str::to_string),
        op_timeout,
        io_timeout,
    )) as Arc<dyn RemoteConnector>)
}
