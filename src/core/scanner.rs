use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// 版本标记文件名模式（shell 风格通配符：`*` 任意字符，`?` 单个字符）
#[derive(Debug, Clone)]
pub struct VersionPattern {
    glob: String,
    regex: Regex,
}

impl VersionPattern {
    pub fn new(glob: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let mut pattern = String::with_capacity(glob.len() + 8);
        pattern.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
        }
        pattern.push('$');

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()?;

        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// 版本标记匹配：两侧都大小写不敏感，远程下载的文件名原样落到本地
    pub fn marker(glob: &str) -> Result<Self, regex::Error> {
        Self::new(glob, true)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

/// 本地目录条目
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// 列出目录的直接子项（不递归），按名称排序
///
/// 目录不存在时返回空列表；目录本身无法读取时返回错误，单个条目出错则跳过。
pub fn scan_dir(dir: &Path) -> io::Result<Vec<LocalEntry>> {
    match std::fs::metadata(dir) {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("不是目录: {}", dir.display()),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    }

    let mut entries = Vec::new();
    for item in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "目录遍历失败")));
            }
            Err(e) => {
                debug!("跳过无法读取的条目: {}", e);
                continue;
            }
        };

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            debug!("跳过非 UTF-8 文件名: {:?}", entry.file_name());
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("跳过无法获取元数据的条目 {}: {}", name, e);
                continue;
            }
        };

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();

        entries.push(LocalEntry {
            name,
            path: entry.path().to_path_buf(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            is_dir: metadata.is_dir(),
        });
    }

    Ok(entries)
}
