//! 测试替身：内存共享和可控的进程探测

use crate::core::probe::ProcessProbe;
use crate::credentials::Credentials;
use crate::error::{Result, SyncError};
use crate::models::RemoteEntry;
use crate::storage::{RemoteConnector, RemoteSession};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub fn remote_file(name: &str, size: u64, modified_at: DateTime<Utc>) -> RemoteEntry {
    RemoteEntry {
        name: name.to_string(),
        size,
        created_at: None,
        modified_at,
        is_dir: false,
        digest: None,
    }
}

/// 可注入的故障
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub refuse_connect: bool,
    pub fail_list: bool,
    pub fail_stat: bool,
    /// stat 报告的大小比实际多出的字节数
    pub stat_extra_bytes: u64,
    /// 读取该文件时连接中断
    pub fail_read_for: Option<String>,
}

struct StoredFile {
    data: Vec<u8>,
    modified_at: DateTime<Utc>,
    digest: Option<String>,
}

#[derive(Default)]
struct ShareState {
    files: BTreeMap<String, StoredFile>,
    dirs: Vec<String>,
    faults: Faults,
}

#[derive(Default)]
struct Inner {
    state: Mutex<ShareState>,
    connects: AtomicUsize,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// 内存中的远程共享
#[derive(Clone, Default)]
pub struct MemoryShare {
    inner: Arc<Inner>,
}

impl MemoryShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入文件，修改时间为一小时前
    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.put_at(name, data, Utc::now() - Duration::hours(1));
    }

    pub fn put_at(&self, name: &str, data: Vec<u8>, modified_at: DateTime<Utc>) {
        self.inner.state.lock().unwrap().files.insert(
            name.to_string(),
            StoredFile {
                data,
                modified_at,
                digest: None,
            },
        );
    }

    pub fn put_dir(&self, name: &str) {
        self.inner.state.lock().unwrap().dirs.push(name.to_string());
    }

    pub fn set_digest(&self, name: &str, digest: &str) {
        if let Some(file) = self.inner.state.lock().unwrap().files.get_mut(name) {
            file.digest = Some(digest.to_string());
        }
    }

    pub fn set_faults(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.inner.state.lock().unwrap().faults);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// 之后的读取会阻塞，直到返回的信号量被添加许可
    pub fn hold_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.inner.read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn session(&self) -> Arc<dyn RemoteSession> {
        Arc::new(MemorySession {
            share: self.clone(),
        })
    }

    fn faults(&self) -> Faults {
        self.inner.state.lock().unwrap().faults.clone()
    }
}

#[async_trait]
impl RemoteConnector for MemoryShare {
    async fn connect(&self, _credentials: Option<&Credentials>) -> Result<Arc<dyn RemoteSession>> {
        if self.faults().refuse_connect {
            return Err(SyncError::Connection("memory://share: 拒绝连接".into()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.session())
    }
}

struct MemorySession {
    share: MemoryShare,
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn list(&self, _path: &str) -> Result<Vec<RemoteEntry>> {
        let state = self.share.inner.state.lock().unwrap();
        if state.faults.fail_list {
            return Err(SyncError::Connection("memory://share: 列表失败".into()));
        }

        let mut entries: Vec<RemoteEntry> = state
            .files
            .iter()
            .map(|(name, file)| RemoteEntry {
                digest: file.digest.clone(),
                ..remote_file(name, file.data.len() as u64, file.modified_at)
            })
            .collect();
        entries.extend(state.dirs.iter().map(|name| RemoteEntry {
            is_dir: true,
            ..remote_file(name, 0, Utc::now())
        }));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let state = self.share.inner.state.lock().unwrap();
        if state.faults.fail_stat {
            return Err(SyncError::Connection("memory://share: stat 失败".into()));
        }

        Ok(state.files.get(path).map(|file| RemoteEntry {
            digest: file.digest.clone(),
            ..remote_file(
                path,
                file.data.len() as u64 + state.faults.stat_extra_bytes,
                file.modified_at,
            )
        }))
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let gate = self.share.inner.read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::Connection("gate closed".into()))?;
        }

        let state = self.share.inner.state.lock().unwrap();
        if state.faults.fail_read_for.as_deref() == Some(path) {
            return Err(SyncError::Connection(format!("memory://share/{}: 连接中断", path)));
        }

        let file = state
            .files
            .get(path)
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;
        let start = (offset as usize).min(file.data.len());
        let end = (offset.saturating_add(length) as usize).min(file.data.len());
        Ok(Bytes::copy_from_slice(&file.data[start..end]))
    }

    fn name(&self) -> &str {
        "memory://share"
    }
}

/// 可控的进程探测
#[derive(Default)]
pub struct FakeProbe {
    running: AtomicBool,
    queries: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn running(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
            queries: Mutex::default(),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn is_running(&self, executable_name: &str) -> bool {
        self.queries
            .lock()
            .unwrap()
            .push(executable_name.to_string());
        self.running.load(Ordering::SeqCst)
    }
}
