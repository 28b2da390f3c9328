//! 版本标记解析与比较
//!
//! 版本号取自版本标记文件名中最长的一段以 `.` 或 `-` 分隔的数字，
//! 例如 `SIGES 20.0.20-24.txt` -> `20.0.20-24` -> (20, 0, 20, 24)。

use crate::core::scanner::{scan_dir, VersionPattern};
use crate::models::RemoteEntry;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:[.-]\d+)*").expect("static version regex"))
}

/// 从文件名中提取版本文本（最长的数字段，长度相同时取第一个）
pub fn extract_version_text(filename: &str) -> Option<&str> {
    version_regex()
        .find_iter(filename)
        .fold(None, |best: Option<regex::Match<'_>>, m| match best {
            Some(b) if b.len() >= m.len() => Some(b),
            _ => Some(m),
        })
        .map(|m| m.as_str())
}

/// 版本号
///
/// 逐段比较；前缀相同时段数多的更新。空版本表示"未知"，从不比其它版本更新。
#[derive(Debug, Clone, Default)]
pub struct VersionTag {
    components: Vec<u64>,
    label: String,
}

impl VersionTag {
    /// 从文件名解析版本
    pub fn parse(filename: &str) -> Self {
        match extract_version_text(filename) {
            Some(text) => Self::from_label(text),
            None => Self::default(),
        }
    }

    /// 从版本文本（如 `1.0.0` 或 `20.0.20-24`）构造
    pub fn from_label(label: &str) -> Self {
        let components = label
            .split(['.', '-'])
            .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
            // 超出 u64 的数字段按最大值处理，仍保持单调
            .map(|part| part.parse::<u64>().unwrap_or(u64::MAX))
            .collect();

        Self {
            components,
            label: label.to_string(),
        }
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_unknown(&self) -> bool {
        self.components.is_empty()
    }

    /// 严格更新；任一方未知时返回 false
    pub fn is_newer_than(&self, other: &VersionTag) -> bool {
        !self.is_unknown() && !other.is_unknown() && self > other
    }
}

impl PartialEq for VersionTag {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for VersionTag {}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec 的字典序：首个不同的段决定大小，严格前缀更小
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl Serialize for VersionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label)
    }
}

impl<'de> Deserialize<'de> for VersionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

/// 已解析的版本标记文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub file: String,
    pub version: VersionTag,
}

impl ResolvedVersion {
    fn from_file(file: &str) -> Self {
        let version = VersionTag::parse(file);
        if version.is_unknown() {
            warn!("无法从文件名提取版本: {}", file);
        }
        Self {
            file: file.to_string(),
            version,
        }
    }
}

/// 版本解析器
#[derive(Debug, Clone)]
pub struct VersionResolver {
    pattern: VersionPattern,
}

impl VersionResolver {
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: VersionPattern::marker(glob)?,
        })
    }

    /// 远程文件名是否为版本标记
    pub fn is_marker(&self, name: &str) -> bool {
        self.pattern.matches(name)
    }

    /// 本地版本：匹配文件中修改时间最新的一个（文件名大小写不敏感）
    ///
    /// 目录不存在或没有匹配文件时返回 `Ok(None)`；读取目录失败时返回错误。
    pub fn resolve_local(&self, directory: &Path) -> io::Result<Option<ResolvedVersion>> {
        let latest = scan_dir(directory)?
            .into_iter()
            .filter(|e| !e.is_dir && self.pattern.matches(&e.name))
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

        match latest {
            Some(entry) => {
                let resolved = ResolvedVersion::from_file(&entry.name);
                debug!("本地版本文件: {}, 版本: {}", resolved.file, resolved.version);
                Ok(Some(resolved))
            }
            None => {
                warn!(
                    "本地没有匹配 {} 的版本文件: {}",
                    self.pattern.as_str(),
                    directory.display()
                );
                Ok(None)
            }
        }
    }

    /// 远程版本：匹配条目中 `modified_at` 最新的一个（文件名大小写不敏感）
    pub fn resolve_remote(&self, listing: &[RemoteEntry]) -> Option<ResolvedVersion> {
        let latest = listing
            .iter()
            .filter(|e| !e.is_dir && self.pattern.matches(&e.name))
            .max_by(|a, b| {
                a.modified_at
                    .cmp(&b.modified_at)
                    .then_with(|| a.name.cmp(&b.name))
            });

        match latest {
            Some(entry) => {
                let resolved = ResolvedVersion::from_file(&entry.name);
                debug!("远程版本文件: {}, 版本: {}", resolved.file, resolved.version);
                Some(resolved)
            }
            None => {
                warn!("远程没有匹配 {} 的版本文件", self.pattern.as_str());
                None
            }
        }
    }
}
