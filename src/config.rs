//! 应用配置模块
//!
//! 所有设置保存在数据目录的 `config.json` 中，按段划分（`updater`、`log`）。

use crate::core::engine::EngineConfig;
use crate::core::integrity::VerifyMode;
use crate::core::probe::executable_name;
use crate::core::scheduler::{CheckSchedule, RetryPolicy};
use crate::storage::{ShareLocation, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

/// 最短检查间隔（秒）
pub const MIN_CHECK_INTERVAL: u64 = 30;

/// 读取 config.json 中的一段；文件不存在或没有该段时返回 `Ok(None)`
pub fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> anyhow::Result<Option<T>> {
    let config_file = config_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&config_file)
        .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
    let config: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("配置文件格式错误: {}", config_file.display()))?;

    match config.get(key) {
        Some(section) => Ok(Some(
            serde_json::from_value(section.clone())
                .with_context(|| format!("配置段 {} 格式错误", key))?,
        )),
        None => Ok(None),
    }
}

/// 读取一段，任何错误都视为没有
pub fn read_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    load_section(config_dir, key).ok().flatten()
}

/// 写入一段，保留其它段
pub fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 检查频率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckFrequency {
    #[default]
    Daily,
    Hourly,
    Interval,
}

impl std::str::FromStr for CheckFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(CheckFrequency::Daily),
            "hourly" => Ok(CheckFrequency::Hourly),
            "interval" => Ok(CheckFrequency::Interval),
            other => Err(format!("无效的检查频率: {}", other)),
        }
    }
}

/// 更新器配置（`updater` 段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterConfig {
    /// `\\server\share\path`、挂载目录或 WebDAV 地址
    #[serde(default)]
    pub share_path: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub local_update_path: String,
    #[serde(default)]
    pub app_executable_path: Option<String>,
    #[serde(default = "default_version_file_pattern")]
    pub version_file_pattern: String,
    #[serde(default)]
    pub check_frequency: CheckFrequency,
    /// 每日检查时间，`HH:MM`
    #[serde(default = "default_check_time")]
    pub check_time: String,
    /// 检查间隔（秒）
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// 失败重试间隔（秒）
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default)]
    pub verify_digest: bool,
}

fn default_version_file_pattern() -> String {
    "SIGES *.txt".to_string()
}

fn default_check_time() -> String {
    "08:00".to_string()
}

fn default_check_interval() -> u64 {
    300 // 5 分钟
}

fn default_retry_interval() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_op_timeout_secs() -> u64 {
    OP_TIMEOUT_SECS
}

fn default_io_timeout_secs() -> u64 {
    IO_TIMEOUT_SECS
}

fn default_cycle_timeout_secs() -> u64 {
    3600
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            share_path: String::new(),
            domain: None,
            local_update_path: String::new(),
            app_executable_path: None,
            version_file_pattern: default_version_file_pattern(),
            check_frequency: CheckFrequency::default(),
            check_time: default_check_time(),
            check_interval: default_check_interval(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            op_timeout_secs: default_op_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            verify_digest: false,
        }
    }
}

impl UpdaterConfig {
    /// 从配置文件加载，再应用环境变量
    pub fn load(config_dir: &Path) -> anyhow::Result<Self> {
        let mut config: Self = load_section(config_dir, "updater")?.unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "updater", self)
    }

    /// 用外部变量覆盖配置；无法解析的值记录警告后忽略
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("UPDATE_SHARE_PATH") {
            self.share_path = v;
        }
        if let Some(v) = get("DOMAIN") {
            self.domain = Some(v);
        }
        if let Some(v) = get("LOCAL_UPDATE_PATH") {
            self.local_update_path = v;
        }
        if let Some(v) = get("APP_EXECUTABLE_PATH") {
            self.app_executable_path = Some(v);
        }
        if let Some(v) = get("VERSION_FILE_PATTERN") {
            self.version_file_pattern = v;
        }
        if let Some(v) = get("CHECK_FREQUENCY") {
            match v.parse() {
                Ok(frequency) => self.check_frequency = frequency,
                Err(e) => warn!("忽略 CHECK_FREQUENCY: {}", e),
            }
        }
        if let Some(v) = get("CHECK_TIME") {
            self.check_time = v;
        }

        let parse_number = |key: &str, target: &mut u64| {
            if let Some(v) = get(key) {
                match v.parse::<u64>() {
                    Ok(n) => *target = n,
                    Err(_) => warn!("忽略无效的 {}: {}", key, v),
                }
            }
        };
        parse_number("CHECK_INTERVAL", &mut self.check_interval);
        parse_number("RETRY_INTERVAL", &mut self.retry_interval);

        if let Some(v) = get("MAX_RETRIES") {
            match v.parse::<u32>() {
                Ok(n) => self.max_retries = n,
                Err(_) => warn!("忽略无效的 MAX_RETRIES: {}", v),
            }
        }
        if let Some(v) = get("VERIFY_DIGEST") {
            self.verify_digest = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// 检查必填项
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.share_path.trim().is_empty() {
            bail!("未配置共享路径（sharePath / UPDATE_SHARE_PATH）");
        }
        ShareLocation::parse(&self.share_path)?;
        if self.local_update_path.trim().is_empty() {
            bail!("未配置本地更新目录（localUpdatePath / LOCAL_UPDATE_PATH）");
        }
        if self.version_file_pattern.trim().is_empty() {
            bail!("版本文件模式不能为空");
        }
        Ok(())
    }

    /// 解析 `HH:MM`，无效时使用 08:00
    pub fn check_time_of_day(&self) -> (u32, u32) {
        let parsed = self.check_time.trim().split_once(':').and_then(|(h, m)| {
            let hour = h.trim().parse::<u32>().ok()?;
            let minute = m.trim().parse::<u32>().ok()?;
            (hour < 24 && minute < 60).then_some((hour, minute))
        });

        parsed.unwrap_or_else(|| {
            warn!("无效的检查时间 {}，使用 08:00", self.check_time);
            (8, 0)
        })
    }

    pub fn schedule(&self) -> CheckSchedule {
        match self.check_frequency {
            CheckFrequency::Daily => {
                let (hour, minute) = self.check_time_of_day();
                CheckSchedule::Daily { hour, minute }
            }
            CheckFrequency::Hourly => CheckSchedule::Interval(Duration::from_secs(3600)),
            CheckFrequency::Interval => CheckSchedule::Interval(Duration::from_secs(
                self.check_interval.max(MIN_CHECK_INTERVAL),
            )),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.retry_interval),
            max_retries: self.max_retries,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            local_update_path: PathBuf::from(self.local_update_path.trim()),
            version_pattern: self.version_file_pattern.clone(),
            app_executable: self
                .app_executable_path
                .as_deref()
                .and_then(executable_name),
            verify_mode: if self.verify_digest {
                VerifyMode::Digest
            } else {
                VerifyMode::SizeOnly
            },
            op_timeout: Duration::from_secs(self.op_timeout_secs.max(1)),
            io_timeout: Duration::from_secs(self.io_timeout_secs.max(1)),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs.max(1)),
            ..EngineConfig::new(self.local_update_path.trim())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config: UpdaterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, UpdaterConfig::default());
        assert_eq!(config.version_file_pattern, "SIGES *.txt");
        assert_eq!(config.check_frequency, CheckFrequency::Daily);
        assert_eq!(config.schedule(), CheckSchedule::Daily { hour: 8, minute: 0 });
        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.retry_policy().interval, Duration::from_secs(60));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_section_and_env_overrides() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "log": {"level": "debug"},
                "updater": {
                    "sharePath": "\\\\fileserver\\releases",
                    "localUpdatePath": "C:\\SIGES\\update",
                    "checkFrequency": "interval",
                    "checkInterval": 600
                }
            }"#,
        )
        .unwrap();

        let mut config: UpdaterConfig = load_section(dir.path(), "updater").unwrap().unwrap();
        assert_eq!(config.share_path, r"\\fileserver\releases");
        assert_eq!(config.schedule(), CheckSchedule::Interval(Duration::from_secs(600)));

        let env: HashMap<&str, &str> = [
            ("UPDATE_SHARE_PATH", "/mnt/releases"),
            ("DOMAIN", "CORP"),
            ("CHECK_INTERVAL", "5"),
            ("MAX_RETRIES", "not-a-number"),
            ("VERIFY_DIGEST", "true"),
            ("APP_EXECUTABLE_PATH", r"C:\SIGES\siges.exe"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.share_path, "/mnt/releases");
        assert_eq!(config.domain.as_deref(), Some("CORP"));
        assert_eq!(config.max_retries, 3);
        // 间隔下限 30 秒
        assert_eq!(config.schedule(), CheckSchedule::Interval(Duration::from_secs(30)));
        assert!(config.validate().is_ok());

        let engine = config.engine_config();
        assert_eq!(engine.verify_mode, VerifyMode::Digest);
        assert_eq!(engine.app_executable.as_deref(), Some("siges.exe"));
    }

    #[test]
    fn test_invalid_check_time_falls_back() {
        let mut config = UpdaterConfig {
            check_time: "25:99".into(),
            ..UpdaterConfig::default()
        };
        assert_eq!(config.check_time_of_day(), (8, 0));

        config.check_time = "17:45".into();
        assert_eq!(config.schedule(), CheckSchedule::Daily { hour: 17, minute: 45 });
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(UpdaterConfig::load(dir.path()).is_err());
        assert!(read_section::<UpdaterConfig>(dir.path(), "updater").is_none());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = UpdaterConfig {
            share_path: "https://files.example.org/dav".into(),
            local_update_path: "/opt/siges".into(),
            ..UpdaterConfig::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(read_section::<UpdaterConfig>(dir.path(), "updater"), Some(config));
    }
}
