//! 日志模块 - 文件日志、按大小轮转

use crate::config::{read_section, write_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// 日志文件名
pub const LOG_FILE: &str = "updater.log";

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件的最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 保留的历史日志数量
    #[serde(default = "default_max_files")]
    pub max_files: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    1
}

fn default_max_files() -> u32 {
    10
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            max_files: default_max_files(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从 config.json 的 `log` 段加载，`LOG_LEVEL` 环境变量优先
    pub fn load(config_dir: &Path) -> Self {
        let mut config: Self = read_section(config_dir, "log").unwrap_or_default();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            let _ = config.set_level(&level);
        }
        config
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "log", self)
    }

    /// 设置日志级别，无效时返回错误且不修改
    pub fn set_level(&mut self, level: &str) -> Result<(), String> {
        let level = level.trim().to_lowercase();
        if VALID_LEVELS.contains(&level.as_str()) {
            self.level = level;
            Ok(())
        } else {
            Err(format!("无效的日志级别: {}", level))
        }
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct RotatingFile {
    file_path: PathBuf,
    max_size: u64,
    max_files: u32,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl RotatingFile {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        // 写日志时 panic 不应让后续日志全部失效
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(file_path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.file_path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// updater.log -> updater.log.1 -> ... -> updater.log.N，最旧的删除
    fn rotate(&self) -> io::Result<()> {
        if self.max_files == 0 {
            return match fs::remove_file(&self.file_path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }

        let oldest = self.backup_path(self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_files).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.file_path, self.backup_path(1))
    }

    fn rotate_locked(&self, guard: &mut Option<BufWriter<File>>) -> io::Result<()> {
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        self.rotate()?;
        *guard = Some(Self::open(&self.file_path)?);
        Ok(())
    }
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    inner: Arc<RotatingFile>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32, max_files: u32) -> io::Result<Self> {
        Self::with_limits(log_dir, max_size_mb.max(1) as u64 * 1024 * 1024, max_files)
    }

    pub fn with_limits(log_dir: &Path, max_size: u64, max_files: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let inner = RotatingFile {
            file_path: log_dir.join(LOG_FILE),
            max_size,
            max_files,
            writer: Mutex::new(None),
        };

        // 启动时已超限则先轮转
        if fs::metadata(&inner.file_path).map(|m| m.len() > max_size).unwrap_or(false) {
            inner.rotate()?;
        }
        *inner.lock() = Some(RotatingFile::open(&inner.file_path)?);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: Arc<RotatingFile>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            // 上次轮转失败，重新打开
            *guard = Some(RotatingFile::open(&self.inner.file_path)?);
        }

        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "日志写入器不可用"));
        };
        let written = writer.write(buf)?;
        writer.flush()?;

        let size = writer.get_ref().metadata().map(|m| m.len()).unwrap_or(0);
        if size > self.inner.max_size {
            let _ = self.inner.rotate_locked(&mut guard);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

/// 获取日志目录路径（跟随数据存储位置）
pub fn get_log_dir() -> PathBuf {
    crate::resolve_data_dir()
}
