//! 更新决策：先比较版本标记，再逐个文件挑选需要传输的候选

use crate::core::version::{ResolvedVersion, VersionResolver};
use crate::error::SyncError;
use crate::models::{RemoteEntry, UpdateCandidate, VersionSnapshot};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// 版本比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// 本地没有版本标记，无条件更新
    Bootstrap,
    /// 远程版本更新
    Newer,
    /// 已是最新（相等、更旧或无法比较）
    Current,
    /// 本地有版本但远程没有，无法判断
    RemoteUnknown,
    /// 读取本地版本出错，按需要更新处理
    Indeterminate,
}

impl GateOutcome {
    /// 是否继续逐文件检查
    pub fn proceeds(&self) -> bool {
        matches!(
            self,
            GateOutcome::Bootstrap | GateOutcome::Newer | GateOutcome::Indeterminate
        )
    }
}

/// 一次决策的结果
#[derive(Debug, Clone)]
pub struct Decision {
    pub snapshot: VersionSnapshot,
    pub gate: GateOutcome,
    /// 版本标记排在最后
    pub candidates: Vec<UpdateCandidate>,
}

pub struct SyncDecision {
    resolver: VersionResolver,
}

impl SyncDecision {
    pub fn new(resolver: VersionResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    /// 版本门槛
    pub fn gate(local: Option<&ResolvedVersion>, remote: Option<&ResolvedVersion>) -> GateOutcome {
        match (local, remote) {
            (None, _) => GateOutcome::Bootstrap,
            (Some(_), None) => GateOutcome::RemoteUnknown,
            (Some(l), Some(r)) if r.version.is_newer_than(&l.version) => GateOutcome::Newer,
            (Some(_), Some(_)) => GateOutcome::Current,
        }
    }

    /// 解析两侧版本并决定本周期的候选文件
    pub fn decide(&self, listing: &[RemoteEntry], local_dir: &Path) -> Decision {
        let remote = self.resolver.resolve_remote(listing);

        let (local, gate) = match self.resolver.resolve_local(local_dir) {
            Ok(local) => {
                let gate = Self::gate(local.as_ref(), remote.as_ref());
                (local, gate)
            }
            Err(e) => {
                let err = SyncError::ComparisonIndeterminate(format!(
                    "{}: {}",
                    local_dir.display(),
                    e
                ));
                error!("{}，按需要更新处理", err);
                (None, GateOutcome::Indeterminate)
            }
        };

        let snapshot = VersionSnapshot::new(local.as_ref(), remote.as_ref());

        let candidates = match gate {
            GateOutcome::Bootstrap => {
                warn!("本地没有版本文件，将下载全部远程文件");
                self.order(
                    listing
                        .iter()
                        .filter(|e| is_transferable(e))
                        .map(|e| candidate(e, local_dir))
                        .collect(),
                )
            }
            GateOutcome::Newer | GateOutcome::Indeterminate => {
                if let (Some(l), Some(r)) = (&local, &remote) {
                    info!("发现新版本: {} -> {}", l.version, r.version);
                }
                self.order(Self::select_candidates(listing, local_dir))
            }
            GateOutcome::Current => {
                info!(
                    "已是最新版本: {}",
                    snapshot
                        .local_version
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                );
                Vec::new()
            }
            GateOutcome::RemoteUnknown => {
                warn!("远程没有版本文件，无法判断是否需要更新");
                Vec::new()
            }
        };

        Decision {
            snapshot,
            gate,
            candidates,
        }
    }

    /// 逐文件比较：本地缺失、大小不同或远程修改时间更晚
    pub fn select_candidates(listing: &[RemoteEntry], local_dir: &Path) -> Vec<UpdateCandidate> {
        let mut candidates = Vec::new();

        for entry in listing.iter().filter(|e| is_transferable(e)) {
            let local_path = local_dir.join(&entry.name);
            if needs_update(entry, &local_path) {
                candidates.push(candidate(entry, local_dir));
            }
        }

        info!("需要更新 {} / {} 个文件", candidates.len(), listing.len());
        candidates
    }

    // 版本标记最后写入，中途失败时下个周期仍会重新检查
    fn order(&self, mut candidates: Vec<UpdateCandidate>) -> Vec<UpdateCandidate> {
        candidates.sort_by_key(|c| self.resolver.is_marker(&c.remote_entry.name));
        candidates
    }
}

fn is_transferable(entry: &RemoteEntry) -> bool {
    !entry.is_dir && !entry.name.is_empty() && entry.name != "." && entry.name != ".."
}

fn candidate(entry: &RemoteEntry, local_dir: &Path) -> UpdateCandidate {
    UpdateCandidate {
        remote_entry: entry.clone(),
        local_path: local_dir.join(&entry.name),
    }
}

fn needs_update(entry: &RemoteEntry, local_path: &Path) -> bool {
    let metadata = match fs::metadata(local_path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("本地不存在: {}", entry.name);
            return true;
        }
        Err(e) => {
            warn!("无法读取本地文件 {}: {}，按需要更新处理", entry.name, e);
            return true;
        }
    };

    if metadata.is_dir() || metadata.len() != entry.size {
        debug!(
            "大小不同: {} (remote={}, local={})",
            entry.name,
            entry.size,
            metadata.len()
        );
        return true;
    }

    let local_modified = match metadata.modified() {
        Ok(t) => DateTime::<Utc>::from(t),
        Err(e) => {
            warn!("无法读取修改时间 {}: {}，按需要更新处理", entry.name, e);
            return true;
        }
    };

    if entry.modified_at > local_modified {
        debug!(
            "远程文件更新: {} (remote={}, local={})",
            entry.name, entry.modified_at, local_modified
        );
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::remote_file;
    use chrono::Duration;
    use std::fs;
    use tempfile::TempDir;

    fn decider() -> SyncDecision {
        SyncDecision::new(VersionResolver::new("SIGES *.txt").unwrap())
    }

    fn resolved(file: &str) -> ResolvedVersion {
        ResolvedVersion {
            file: file.to_string(),
            version: crate::core::version::VersionTag::parse(file),
        }
    }

    fn names(candidates: &[UpdateCandidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|c| c.remote_entry.name.as_str())
            .collect()
    }

    #[test]
    fn test_gate_rules() {
        let v1 = resolved("SIGES 1.0.0.txt");
        let v2 = resolved("SIGES 1.0.1.txt");
        let unknown = resolved("SIGES latest.txt");

        assert_eq!(SyncDecision::gate(None, None), GateOutcome::Bootstrap);
        assert_eq!(SyncDecision::gate(None, Some(&v1)), GateOutcome::Bootstrap);
        assert_eq!(SyncDecision::gate(Some(&v1), None), GateOutcome::RemoteUnknown);
        assert_eq!(SyncDecision::gate(Some(&v1), Some(&v2)), GateOutcome::Newer);
        assert_eq!(SyncDecision::gate(Some(&v2), Some(&v1)), GateOutcome::Current);
        assert_eq!(SyncDecision::gate(Some(&v1), Some(&v1)), GateOutcome::Current);
        assert_eq!(SyncDecision::gate(Some(&v1), Some(&unknown)), GateOutcome::Current);
        assert!(!GateOutcome::RemoteUnknown.proceeds());
        assert!(GateOutcome::Indeterminate.proceeds());
    }

    #[test]
    fn test_empty_remote_with_current_local() {
        let local = TempDir::new().unwrap();
        fs::write(local.path().join("SIGES 1.0.0.txt"), b"v").unwrap();

        let decision = decider().decide(&[], local.path());
        assert_eq!(decision.gate, GateOutcome::RemoteUnknown);
        assert!(decision.candidates.is_empty());
        assert_eq!(decision.snapshot.local_file.as_deref(), Some("SIGES 1.0.0.txt"));
    }

    #[test]
    fn test_bootstrap_takes_full_remote_set() {
        let local = TempDir::new().unwrap();
        let now = Utc::now();
        fs::write(local.path().join("data.bin"), vec![0u8; 100]).unwrap();

        let listing = vec![
            remote_file("SIGES 1.0.0.txt", 10, now - Duration::days(1)),
            remote_file("data.bin", 100, now - Duration::days(1)),
            RemoteEntry {
                is_dir: true,
                ..remote_file("archive", 0, now)
            },
        ];

        let decision = decider().decide(&listing, local.path());
        assert_eq!(decision.gate, GateOutcome::Bootstrap);
        assert_eq!(names(&decision.candidates), vec!["data.bin", "SIGES 1.0.0.txt"]);

        // 远程没有版本文件时同样下载全部
        let decision = decider().decide(&listing[1..], local.path());
        assert_eq!(names(&decision.candidates), vec!["data.bin"]);
    }

    #[test]
    fn test_newer_version_selects_changed_files() {
        let local = TempDir::new().unwrap();
        let past = Utc::now() - Duration::days(30);
        let future = Utc::now() + Duration::days(1);

        fs::write(local.path().join("SIGES 1.0.0.txt"), b"v").unwrap();
        fs::write(local.path().join("same.bin"), vec![1u8; 8]).unwrap();
        fs::write(local.path().join("resized.bin"), vec![1u8; 8]).unwrap();
        fs::write(local.path().join("touched.bin"), vec![1u8; 8]).unwrap();

        let listing = vec![
            remote_file("SIGES 1.0.1.txt", 1, past),
            remote_file("same.bin", 8, past),
            remote_file("resized.bin", 9, past),
            remote_file("touched.bin", 8, future),
            remote_file("new.bin", 4, past),
            remote_file(".", 0, past),
        ];

        let decision = decider().decide(&listing, local.path());
        assert_eq!(decision.gate, GateOutcome::Newer);
        assert_eq!(
            names(&decision.candidates),
            vec!["resized.bin", "touched.bin", "new.bin", "SIGES 1.0.1.txt"]
        );
        assert_eq!(
            decision.candidates[0].local_path,
            local.path().join("resized.bin")
        );
        assert_eq!(decision.snapshot.remote_file.as_deref(), Some("SIGES 1.0.1.txt"));
    }

    #[test]
    fn test_same_version_skips_file_scan() {
        let local = TempDir::new().unwrap();
        fs::write(local.path().join("SIGES 1.0.0.txt"), b"v").unwrap();

        let listing = vec![
            remote_file("SIGES 1.0.0.txt", 1, Utc::now()),
            remote_file("missing.bin", 4, Utc::now()),
        ];

        let decision = decider().decide(&listing, local.path());
        assert_eq!(decision.gate, GateOutcome::Current);
        assert!(decision.candidates.is_empty());
    }

    #[test]
    fn test_equal_size_and_older_remote_is_skipped() {
        let local = TempDir::new().unwrap();
        fs::write(local.path().join("a.bin"), vec![0u8; 3]).unwrap();

        let listing = vec![remote_file("a.bin", 3, Utc::now() - Duration::hours(1))];
        assert!(SyncDecision::select_candidates(&listing, local.path()).is_empty());
    }

    #[test]
    fn test_unreadable_local_dir_is_indeterminate() {
        let local = TempDir::new().unwrap();
        // 用文件代替目录，读取目录时出错
        let not_a_dir = local.path().join("file");
        fs::write(&not_a_dir, b"x").unwrap();

        let listing = vec![remote_file("a.bin", 3, Utc::now())];
        let decision = decider().decide(&listing, &not_a_dir);
        assert_eq!(decision.gate, GateOutcome::Indeterminate);
        assert_eq!(names(&decision.candidates), vec!["a.bin"]);
    }
}
