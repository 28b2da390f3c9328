use std::ffi::OsStr;
use std::path::Path;
use sysinfo::System;
use tracing::debug;

/// 检测受管应用是否正在运行
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, executable_name: &str) -> bool;
}

/// 扫描系统进程表
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_running(&self, executable_name: &str) -> bool {
        if executable_name.is_empty() {
            return false;
        }

        let system = System::new_all();
        let running = system.processes().values().any(|process| {
            let name: &OsStr = process.name().as_ref();
            name.to_string_lossy().eq_ignore_ascii_case(executable_name)
        });

        debug!("进程 {} 运行中: {}", executable_name, running);
        running
    }
}

/// 取可执行文件路径的文件名部分
pub fn executable_name(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Windows 路径在其它平台上也按反斜杠分隔
    let last = trimmed.rsplit(['\\', '/']).next().unwrap_or(trimmed);
    Path::new(last)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_name() {
        assert_eq!(
            executable_name(r"C:\Program Files\SIGES\siges.exe").as_deref(),
            Some("siges.exe")
        );
        assert_eq!(executable_name("/opt/siges/bin/siges").as_deref(), Some("siges"));
        assert_eq!(executable_name("  "), None);
    }

    #[test]
    fn test_empty_name_is_not_running() {
        assert!(!SystemProcessProbe.is_running(""));
    }
}
