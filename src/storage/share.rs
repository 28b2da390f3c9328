use super::{RemoteConnector, RemoteSession, ShareLocation};
use crate::credentials::Credentials;
use crate::error::{Result, SyncError};
use crate::models::RemoteEntry;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 基于 OpenDAL 的共享连接器（文件系统 / WebDAV）
pub struct OpendalConnector {
    location: ShareLocation,
    domain: Option<String>,
    op_timeout: Duration,
    io_timeout: Duration,
}

impl OpendalConnector {
    pub fn new(
        location: ShareLocation,
        domain: Option<String>,
        op_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            location,
            domain,
            op_timeout,
            io_timeout,
        }
    }

    /// 域账户格式：`DOMAIN\user`（用户名已带域时保持不变）
    fn qualified_username(&self, username: &str) -> String {
        match self.domain.as_deref().map(str::trim) {
            Some(domain) if !domain.is_empty() && !username.contains('\\') => {
                format!("{}\\{}", domain, username)
            }
            _ => username.to_string(),
        }
    }

    fn build_operator(&self, credentials: Option<&Credentials>) -> Result<(Operator, String)> {
        let timeout_layer = TimeoutLayer::default()
            .with_timeout(self.op_timeout)
            .with_io_timeout(self.io_timeout);

        match &self.location {
            ShareLocation::FileSystem { root, .. } => {
                use opendal::services::Fs;

                let root_str = root.to_string_lossy().to_string();
                let builder = Fs::default().root(&root_str);
                let operator = Operator::new(builder)
                    .map_err(|e| SyncError::Connection(format!("文件系统共享配置错误: {}", e)))?
                    .layer(timeout_layer)
                    .finish();

                Ok((operator, format!("fs://{}", root_str)))
            }
            ShareLocation::WebDav { endpoint } => {
                use opendal::services::Webdav;

                let credentials = credentials.ok_or_else(|| {
                    SyncError::Connection("没有可用的凭据".to_string())
                })?;

                let builder = Webdav::default()
                    .endpoint(endpoint)
                    .username(&self.qualified_username(&credentials.username))
                    .password(&credentials.password);

                let operator = Operator::new(builder)
                    .map_err(|e| SyncError::Connection(format!("WebDAV 配置错误: {}", e)))?
                    .layer(timeout_layer)
                    .finish();

                let host = endpoint
                    .trim_start_matches("http://")
                    .trim_start_matches("https://");
                Ok((operator, format!("webdav://{}", host)))
            }
        }
    }
}

#[async_trait]
impl RemoteConnector for OpendalConnector {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn RemoteSession>> {
        let (operator, name) = self.build_operator(credentials)?;

        if let Some(c) = credentials {
            info!("正在连接 {} (用户 {})", name, self.qualified_username(&c.username));
        } else {
            info!("正在连接 {}", name);
        }

        // 列出根目录以确认共享可访问、凭据有效
        operator
            .list("/")
            .await
            .map_err(|e| SyncError::Connection(format!("{}: {}", name, e)))?;

        info!("已连接 {}", name);
        Ok(Arc::new(OpendalSession { operator, name }) as Arc<dyn RemoteSession>)
    }
}

/// OpenDAL 会话
pub struct OpendalSession {
    operator: Operator,
    name: String,
}

impl OpendalSession {
    fn dir_path(path: &str) -> String {
        let path = path.replace('\\', "/");
        let path = path.trim_matches('/');
        if path.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", path)
        }
    }

    fn file_path(path: &str) -> String {
        path.replace('\\', "/").trim_start_matches('/').to_string()
    }

    fn to_entry(name: &str, meta: &Metadata) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.content_length() },
            created_at: None,
            modified_at: meta.last_modified().unwrap_or_default(),
            is_dir: meta.is_dir(),
            digest: None,
        }
    }

    fn map_err(&self, path: &str, e: opendal::Error) -> SyncError {
        match e.kind() {
            opendal::ErrorKind::NotFound => SyncError::NotFound(format!("{}/{}", self.name, path)),
            _ => SyncError::Connection(format!("{}/{}: {}", self.name, path, e)),
        }
    }
}

#[async_trait]
impl RemoteSession for OpendalSession {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = Self::dir_path(path);
        let mut lister = self
            .operator
            .lister_with(&dir)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
            .map_err(|e| self.map_err(&dir, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await.map_err(|e| self.map_err(&dir, e))? {
            // 跳过目录本身和伪条目
            let name = entry.name().trim_end_matches('/');
            if name.is_empty() || name == "." || name == ".." || entry.path() == dir {
                continue;
            }
            entries.push(Self::to_entry(name, entry.metadata()));
        }

        debug!("{} 列出 {} 个条目: {}", self.name, entries.len(), dir);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let path = Self::file_path(path);
        match self.operator.stat(&path).await {
            Ok(meta) => {
                let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(&path);
                Ok(Some(Self::to_entry(name, &meta)))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.map_err(&path, e)),
        }
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let path = Self::file_path(path);
        let data = self
            .operator
            .read_with(&path)
            .range(offset..offset + length)
            .await
            .map_err(|e| self.map_err(&path, e))?;
        Ok(data.to_bytes())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
