use crate::error::{Result, SyncError};
use crate::storage::RemoteSession;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 校验模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// 只比较大小，摘要仅记录日志
    #[default]
    SizeOnly,
    /// 远程提供摘要时同时比较摘要
    Digest,
}

/// 校验通过的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFile {
    pub size: u64,
    /// BLAKE3 十六进制摘要
    pub digest: String,
}

pub struct IntegrityChecker {
    mode: VerifyMode,
}

impl IntegrityChecker {
    pub fn new(mode: VerifyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> VerifyMode {
        self.mode
    }

    /// 重新获取远程条目，与临时文件比较
    pub async fn verify(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        temp_path: &Path,
    ) -> Result<VerifiedFile> {
        let remote = session
            .stat(name)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("校验时远程文件已消失: {}", name)))?;

        let actual = tokio::fs::metadata(temp_path)
            .await
            .map_err(|e| SyncError::io(temp_path, e))?
            .len();

        if actual != remote.size {
            return Err(SyncError::Verification {
                file: name.to_string(),
                expected: remote.size,
                actual,
            });
        }

        let digest = file_digest(temp_path.to_path_buf()).await?;
        debug!("{} 校验通过: {} 字节, blake3={}", name, actual, digest);

        if self.mode == VerifyMode::Digest {
            match remote.digest.as_deref() {
                Some(expected) if !expected.eq_ignore_ascii_case(&digest) => {
                    return Err(SyncError::DigestMismatch {
                        file: name.to_string(),
                        expected: expected.to_string(),
                        actual: digest,
                    });
                }
                Some(_) => {}
                None => warn!("远程未提供 {} 的摘要，仅校验大小", name),
            }
        }

        Ok(VerifiedFile {
            size: actual,
            digest,
        })
    }
}

/// 计算文件的 BLAKE3 摘要（在阻塞线程中读取）
pub async fn file_digest(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = File::open(&path).map_err(|e| SyncError::io(&path, e))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| SyncError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await
    .map_err(|e| SyncError::Unexpected(format!("摘要任务失败: {}", e)))?
}
