//! 单文件传输：写入同目录临时文件，校验后原子替换

use crate::core::integrity::IntegrityChecker;
use crate::error::{Result, SyncError};
use crate::models::UpdateCandidate;
use crate::storage::{RemoteSession, CHUNK_SIZE, IO_TIMEOUT_SECS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 每次读取的字节数
    pub chunk_size: u64,
    /// 单个数据块的读取超时
    pub io_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }
}

/// 传输结果
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub local_path: PathBuf,
    pub size: u64,
    pub digest: String,
}

pub struct Transfer {
    session: Arc<dyn RemoteSession>,
    checker: Arc<IntegrityChecker>,
    options: TransferOptions,
    cancel: CancellationToken,
}

impl Transfer {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        checker: Arc<IntegrityChecker>,
        options: TransferOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            checker,
            options,
            cancel,
        }
    }

    /// 下载一个候选文件
    ///
    /// 任何失败都会删除临时文件，目标文件保持原样。
    pub async fn run(&self, candidate: &UpdateCandidate) -> Result<TransferOutcome> {
        let entry = &candidate.remote_entry;
        let dest = &candidate.local_path;

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let dir = dest
            .parent()
            .ok_or_else(|| SyncError::Unexpected(format!("无效的目标路径: {}", dest.display())))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::io(dir, e))?;

        let temp_path = dir.join(format!(".{}.{}.part", entry.name, uuid::Uuid::new_v4()));

        // 失败路径上删除临时文件；成功替换后解除
        let temp_guard = scopeguard::guard(temp_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("无法删除临时文件 {}: {}", path.display(), e);
                }
            } else {
                debug!("已删除临时文件: {}", path.display());
            }
        });

        debug!("下载: {} -> {} ({} 字节)", entry.name, temp_path.display(), entry.size);
        self.download_to(&entry.name, entry.size, &temp_path).await?;

        let verified = self
            .checker
            .verify(self.session.as_ref(), &entry.name, &temp_path)
            .await?;

        reclaim_write_access(dest).await;

        tokio::fs::rename(&temp_path, dest)
            .await
            .map_err(|source| SyncError::Move {
                path: dest.clone(),
                source,
            })?;
        scopeguard::ScopeGuard::into_inner(temp_guard);

        info!("已更新: {} ({} 字节)", dest.display(), verified.size);
        Ok(TransferOutcome {
            local_path: dest.clone(),
            size: verified.size,
            digest: verified.digest,
        })
    }

    async fn download_to(&self, name: &str, size: u64, temp_path: &Path) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await
            .map_err(|e| SyncError::io(temp_path, e))?;

        let chunk_size = self.options.chunk_size.max(1);
        let mut offset = 0u64;
        while offset < size {
            let length = chunk_size.min(size - offset);

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                read = tokio::time::timeout(
                    self.options.io_timeout,
                    self.session.read_range(name, offset, length),
                ) => match read {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SyncError::Timeout(format!(
                            "读取 {} 偏移 {} 超过 {} 秒",
                            name,
                            offset,
                            self.options.io_timeout.as_secs()
                        )))
                    }
                },
            };

            // 远程文件变短，交给校验处理
            if chunk.is_empty() {
                warn!("{} 在 {} 字节处提前结束", name, offset);
                break;
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(temp_path, e))?;
            offset += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| SyncError::io(temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| SyncError::io(temp_path, e))?;
        Ok(())
    }
}

/// 尽力取得目标文件的写权限，失败只记录日志
///
/// 清除只读属性；Windows 上仍无法写入时再接管所有权并授予当前用户完全控制。
#[allow(clippy::permissions_set_readonly_false)]
async fn reclaim_write_access(dest: &Path) {
    let metadata = match tokio::fs::metadata(dest).await {
        Ok(m) => m,
        Err(_) => return,
    };

    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        match tokio::fs::set_permissions(dest, permissions).await {
            Ok(()) => debug!("已取消只读属性: {}", dest.display()),
            Err(e) => warn!("无法取得写权限 {}: {}", dest.display(), e),
        }
    }

    #[cfg(target_os = "windows")]
    {
        let writable = tokio::fs::OpenOptions::new()
            .write(true)
            .open(dest)
            .await
            .is_ok();
        if !writable {
            take_ownership(dest).await;
        }
    }
}

#[cfg(target_os = "windows")]
async fn take_ownership(dest: &Path) {
    let user = std::env::var("USERNAME").unwrap_or_default();
    for (program, args) in ownership_commands(dest, &user) {
        match tokio::process::Command::new(program).args(&args).output().await {
            Ok(output) if output.status.success() => {
                debug!("{} 完成: {}", program, dest.display())
            }
            Ok(output) => warn!(
                "{} 失败 {}: {}",
                program,
                dest.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("无法执行 {}: {}", program, e),
        }
    }
}

/// 接管所有权（takeown）并授予完全控制（icacls）的命令
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn ownership_commands(dest: &Path, user: &str) -> Vec<(&'static str, Vec<String>)> {
    let path = dest.to_string_lossy().to_string();
    let mut commands = vec![("takeown", vec!["/F".to_string(), path.clone()])];
    if !user.is_empty() {
        commands.push((
            "icacls",
            vec![path, "/grant".to_string(), format!("{}:F", user)],
        ));
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::integrity::VerifyMode;
    use crate::core::testing::{remote_file, MemoryShare};
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn transfer(share: &MemoryShare, cancel: CancellationToken) -> Transfer {
        Transfer::new(
            share.session(),
            Arc::new(IntegrityChecker::new(VerifyMode::SizeOnly)),
            TransferOptions {
                chunk_size: 7,
                io_timeout: Duration::from_secs(5),
            },
            cancel,
        )
    }

    fn candidate(share_name: &str, size: u64, dir: &Path) -> UpdateCandidate {
        UpdateCandidate {
            remote_entry: remote_file(share_name, size, Utc::now()),
            local_path: dir.join(share_name),
        }
    }

    fn leftover_parts(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn test_downloads_and_replaces() {
        let share = MemoryShare::new();
        let content: Vec<u8> = (0..100u8).collect();
        share.put("data.bin", content.clone());

        let dir = TempDir::new().unwrap();
        let dest_dir = dir.path().join("app");
        let outcome = transfer(&share, CancellationToken::new())
            .run(&candidate("data.bin", 100, &dest_dir))
            .await
            .unwrap();

        assert_eq!(outcome.size, 100);
        assert_eq!(fs::read(dest_dir.join("data.bin")).unwrap(), content);
        assert!(leftover_parts(&dest_dir).is_empty());
    }

    #[tokio::test]
    async fn test_failure_before_verification_keeps_destination() {
        let share = MemoryShare::new();
        share.put("data.bin", vec![9u8; 50]);
        share.set_faults(|f| f.fail_stat = true);

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.bin"), b"previous release").unwrap();

        let err = transfer(&share, CancellationToken::new())
            .run(&candidate("data.bin", 50, dir.path()))
            .await
            .unwrap_err();

        assert!(err.is_connection());
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), b"previous release");
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_size_lie_fails_verification() {
        let share = MemoryShare::new();
        share.put("data.bin", vec![1u8; 20]);
        share.set_faults(|f| f.stat_extra_bytes = 3);

        let dir = TempDir::new().unwrap();
        let err = transfer(&share, CancellationToken::new())
            .run(&candidate("data.bin", 20, dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Verification { expected: 23, actual: 20, .. }));
        assert!(!dir.path().join("data.bin").exists());
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_mid_stream() {
        let share = MemoryShare::new();
        share.put("data.bin", vec![1u8; 20]);
        share.set_faults(|f| f.fail_read_for = Some("data.bin".into()));

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.bin"), b"old").unwrap();

        assert!(transfer(&share, CancellationToken::new())
            .run(&candidate("data.bin", 20, dir.path()))
            .await
            .is_err());
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), b"old");
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_transfer() {
        let share = MemoryShare::new();
        share.put("data.bin", vec![1u8; 20]);
        let gate = share.hold_reads();

        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let task = {
            let t = transfer(&share, cancel.clone());
            let c = candidate("data.bin", 20, dir.path());
            tokio::spawn(async move { t.run(&c).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(leftover_parts(dir.path()).is_empty());
        drop(gate);
    }

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let share = MemoryShare::new();
        share.put("data.bin", vec![1u8; 20]);
        let _gate = share.hold_reads();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.bin"), b"old").unwrap();

        let stalled = Transfer::new(
            share.session(),
            Arc::new(IntegrityChecker::new(VerifyMode::SizeOnly)),
            TransferOptions {
                chunk_size: 7,
                io_timeout: Duration::from_millis(50),
            },
            CancellationToken::new(),
        );
        let err = stalled
            .run(&candidate("data.bin", 20, dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(err.is_connection());
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), b"old");
        assert!(leftover_parts(dir.path()).is_empty());
    }

    #[test]
    fn test_ownership_commands() {
        let dest = Path::new(r"C:\SIGES\siges.exe");
        let commands = ownership_commands(dest, "alice");
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].0, "takeown");
        assert_eq!(commands[0].1, vec!["/F".to_string(), dest.to_string_lossy().to_string()]);
        assert_eq!(commands[1].0, "icacls");
        assert_eq!(commands[1].1[1..], ["/grant".to_string(), "alice:F".to_string()]);

        // 取不到用户名时只接管所有权
        assert_eq!(ownership_commands(dest, "").len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaces_read_only_destination() {
        let share = MemoryShare::new();
        share.put("app.cfg", b"new".to_vec());

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("app.cfg");
        fs::write(&dest, b"old").unwrap();
        let mut permissions = fs::metadata(&dest).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&dest, permissions).unwrap();

        transfer(&share, CancellationToken::new())
            .run(&candidate("app.cfg", 3, dir.path()))
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }
}
