//! 데이터/체크포인트 디렉토리 백업.
//!
//! `{backup_dir}/backup_YYYYMMDD_HHMMSS/` 아래에 디렉토리를 통째로 복사하고,
//! 최신 `keep`개만 남깁니다.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::{CollectorError, Result};

const BACKUP_PREFIX: &str = "backup_";

/// 백업 결과.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub path: PathBuf,
    pub files_copied: usize,
    pub pruned: Vec<PathBuf>,
}

/// 현재 시각으로 백업합니다.
pub async fn create_backup(
    sources: &[PathBuf],
    backup_dir: &Path,
    keep: usize,
) -> Result<BackupReport> {
    create_backup_at(sources, backup_dir, keep, Local::now()).await
}

/// 주어진 시각으로 백업합니다.
pub async fn create_backup_at(
    sources: &[PathBuf],
    backup_dir: &Path,
    keep: usize,
    now: DateTime<Local>,
) -> Result<BackupReport> {
    let target = backup_dir.join(format!("{}{}", BACKUP_PREFIX, now.format("%Y%m%d_%H%M%S")));
    let sources = sources.to_vec();
    let target_clone = target.clone();

    let files_copied = tokio::task::spawn_blocking(move || -> Result<usize> {
        std::fs::create_dir_all(&target_clone)?;
        let mut copied = 0;
        for source in &sources {
            if !source.exists() {
                tracing::debug!(path = %source.display(), "백업 대상 없음, 건너뜀");
                continue;
            }
            let name = source
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "root".into());
            copied += copy_dir_recursive(source, &target_clone.join(name), &target_clone)?;
        }
        Ok(copied)
    })
    .await
    .map_err(|e| CollectorError::Config(format!("backup task failed: {}", e)))??;

    let pruned = prune_backups(backup_dir, keep).await?;
    tracing::info!(
        path = %target.display(),
        files = files_copied,
        pruned = pruned.len(),
        "백업 완료"
    );

    Ok(BackupReport {
        path: target,
        files_copied,
        pruned,
    })
}

/// `backup_` 디렉토리 중 오래된 것부터 삭제해 `keep`개만 남깁니다.
pub async fn prune_backups(backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut backups = list_backups(backup_dir).await?;
    if backups.len() <= keep {
        return Ok(Vec::new());
    }
    // 이름의 타임스탬프가 정렬 순서
    backups.sort();
    let excess = backups.len() - keep;
    let pruned: Vec<PathBuf> = backups.drain(..excess).collect();
    for path in &pruned {
        tokio::fs::remove_dir_all(path).await?;
        tracing::debug!(path = %path.display(), "오래된 백업 삭제");
    }
    Ok(pruned)
}

/// 백업 디렉토리 목록 (정렬 안 됨).
pub async fn list_backups(backup_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(backup_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_backup = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(BACKUP_PREFIX));
        if is_backup && entry.file_type().await?.is_dir() {
            backups.push(entry.path());
        }
    }
    Ok(backups)
}

/// 재귀 복사. `skip` 경로(백업 대상 자신)는 건너뜁니다.
fn copy_dir_recursive(from: &Path, to: &Path, skip: &Path) -> Result<usize> {
    if from == skip {
        return Ok(0);
    }
    if from.is_file() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        return Ok(1);
    }

    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        if path == skip {
            continue;
        }
        copied += copy_dir_recursive(&path, &to.join(entry.file_name()), skip)?;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("stockpile-backup-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_backup_copies_tree_and_prunes() {
        let root = temp_dir();
        let data = root.join("data");
        std::fs::create_dir_all(data.join("us/2025-06-02")).unwrap();
        std::fs::write(data.join("us/2025-06-02/prices.json"), "[]").unwrap();
        std::fs::write(data.join("us/company_ids.json"), "{}").unwrap();
        let checkpoints = root.join("checkpoints");
        std::fs::create_dir_all(&checkpoints).unwrap();
        std::fs::write(checkpoints.join("us_checkpoint.json"), "{}").unwrap();

        let backups = root.join("backups");
        let sources = vec![data.clone(), checkpoints.clone(), root.join("missing")];

        let mut reports = Vec::new();
        for hour in 1..=3 {
            let at = Local.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap();
            reports.push(create_backup_at(&sources, &backups, 2, at).await.unwrap());
        }

        let first = &reports[0];
        assert_eq!(first.files_copied, 3);
        assert!(first.path.ends_with("backup_20250602_010000"));

        let mut remaining = list_backups(&backups).await.unwrap();
        remaining.sort();
        assert_eq!(remaining.len(), 2);
        assert!(remaining[0].ends_with("backup_20250602_020000"));
        assert!(remaining[1]
            .join("data/us/2025-06-02/prices.json")
            .exists());
        assert_eq!(reports[2].pruned.len(), 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_list_backups_missing_dir() {
        assert!(list_backups(&temp_dir()).await.unwrap().is_empty());
    }
}
