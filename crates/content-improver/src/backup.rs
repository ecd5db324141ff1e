/// Point-in-time byte copies of content files, taken before an apply.
///
/// Layout under the data dir: `backups/{slug}/{timestamp_ms}-{n}.bak` with a sidecar
/// `{timestamp_ms}-{n}.meta.json`. Files are created with `create_new`, so an existing backup is
/// never overwritten; a name collision bumps `n`. Nothing is pruned.
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use improver_common::ids::{now_millis, sha256_hex};

use crate::content::{normalize_rel, ContentStore};
use crate::error::AppError;
use crate::model::BackupRecord;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));
static ID_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("valid regex"));

pub struct BackupManager {
    dir: PathBuf,
    content: ContentStore,
}

impl BackupManager {
    pub fn new(data_dir: &Path, content: ContentStore) -> Self {
        Self {
            dir: data_dir.join("backups"),
            content,
        }
    }

    /// Copy the current bytes of `rel` into a new backup.
    pub async fn snapshot(&self, rel: &str) -> Result<BackupRecord, AppError> {
        let rel = normalize_rel(rel)?;
        let bytes = self.content.read_bytes(&rel).await?;
        let slug = slugify(&rel);
        let dir = self.dir.join(&slug);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::io(&dir, e))?;

        let created_at_ms = now_millis();
        let mut n = 0u32;
        let (name, mut file) = loop {
            let name = format!("{created_at_ms}-{n}");
            let path = dir.join(format!("{name}.bak"));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (name, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(AppError::io(path, e)),
            }
        };

        let bak_path = dir.join(format!("{name}.bak"));
        file.write_all(&bytes)
            .await
            .map_err(|e| AppError::io(&bak_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::io(&bak_path, e))?;

        let record = BackupRecord {
            id: format!("{slug}/{name}"),
            path: rel,
            created_at_ms,
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        };
        let meta_path = dir.join(format!("{name}.meta.json"));
        let meta = serde_json::to_vec_pretty(&record).map_err(|e| AppError::json(&meta_path, e))?;
        let mut meta_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&meta_path)
            .await
            .map_err(|e| AppError::io(&meta_path, e))?;
        meta_file
            .write_all(&meta)
            .await
            .map_err(|e| AppError::io(&meta_path, e))?;

        info!(backup_id = %record.id, path = %record.path, bytes = record.bytes, "backup taken");
        Ok(record)
    }

    /// Overwrite the live content file with the backup's bytes after verifying its checksum.
    pub async fn restore(&self, backup_id: &str) -> Result<BackupRecord, AppError> {
        let (slug, name) = split_id(backup_id)?;
        let dir = self.dir.join(slug);
        let record = read_meta(&dir.join(format!("{name}.meta.json")))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup {backup_id}")))?;

        let bak_path = dir.join(format!("{name}.bak"));
        let bytes = tokio::fs::read(&bak_path)
            .await
            .map_err(|e| AppError::io(&bak_path, e))?;
        if sha256_hex(&bytes) != record.sha256 {
            return Err(AppError::BackupCorrupt {
                id: backup_id.to_string(),
            });
        }

        self.content.write_bytes(&record.path, &bytes).await?;
        info!(backup_id, path = %record.path, "backup restored");
        Ok(record)
    }

    /// Backups newest first, optionally only those of one content file.
    pub async fn list(&self, rel: Option<&str>) -> Result<Vec<BackupRecord>, AppError> {
        let rel = rel.map(normalize_rel).transpose()?;
        let dirs = match &rel {
            Some(rel) => vec![self.dir.join(slugify(rel))],
            None => subdirs(&self.dir).await?,
        };

        let mut records = Vec::new();
        for dir in dirs {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AppError::io(&dir, e))?
            {
                let path = entry.path();
                if !path.to_string_lossy().ends_with(".meta.json") {
                    continue;
                }
                match read_meta(&path).await {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping unreadable backup metadata"),
                }
            }
        }

        if let Some(rel) = &rel {
            records.retain(|r| &r.path == rel);
        }
        records.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }
}

fn slugify(rel: &str) -> String {
    UNSAFE_CHARS.replace_all(rel, "_").into_owned()
}

fn split_id(backup_id: &str) -> Result<(&str, &str), AppError> {
    backup_id
        .split_once('/')
        .filter(|(slug, name)| ID_PART.is_match(slug) && ID_PART.is_match(name))
        .ok_or_else(|| AppError::NotFound(format!("backup {backup_id}")))
}

async fn read_meta(path: &Path) -> Result<Option<BackupRecord>, AppError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AppError::json(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::io(path, e)),
    }
}

async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::io(dir, e)),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::io(dir, e))?
    {
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(body: &str) -> (tempfile::TempDir, ContentStore, BackupManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("content");
        std::fs::create_dir_all(root.join("pages")).unwrap();
        std::fs::write(root.join("pages/home.json"), body).unwrap();
        let content = ContentStore::new(&root, None, None);
        let backups = BackupManager::new(&dir.path().join("data"), content.clone());
        (dir, content, backups)
    }

    #[tokio::test]
    async fn snapshot_then_restore_reproduces_original_bytes() {
        let original = "{\"headline\":   \"Old\"}\n";
        let (_dir, content, backups) = setup(original);

        let record = backups.snapshot("pages/home.json").await.unwrap();
        assert_eq!(record.path, "pages/home.json");
        assert!(record.id.starts_with("pages_home.json/"));

        content
            .write_bytes("pages/home.json", b"{\"headline\":\"New\"}")
            .await
            .unwrap();
        backups.restore(&record.id).await.unwrap();
        assert_eq!(content.read_bytes("pages/home.json").await.unwrap(), original.as_bytes());
    }

    #[tokio::test]
    async fn repeated_snapshots_never_overwrite() {
        let (_dir, content, backups) = setup("{\"v\":1}");
        let first = backups.snapshot("pages/home.json").await.unwrap();
        content.write_bytes("pages/home.json", b"{\"v\":2}").await.unwrap();
        let second = backups.snapshot("pages/home.json").await.unwrap();
        assert_ne!(first.id, second.id);

        let listed = backups.list(Some("pages/home.json")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|r| r.sha256 == first.sha256));
        assert!(listed.iter().any(|r| r.sha256 == second.sha256));
        assert_eq!(backups.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tampered_backup_is_refused() {
        let (dir, content, backups) = setup("{\"v\":1}");
        let record = backups.snapshot("pages/home.json").await.unwrap();
        let bak = dir.path().join("data/backups").join(format!("{}.bak", record.id));
        std::fs::write(bak, "{\"v\":666}").unwrap();

        let err = backups.restore(&record.id).await.unwrap_err();
        assert!(matches!(err, AppError::BackupCorrupt { .. }));
        assert_eq!(content.read_bytes("pages/home.json").await.unwrap(), b"{\"v\":1}");
    }

    #[tokio::test]
    async fn malformed_ids_are_not_found() {
        let (_dir, _content, backups) = setup("{}");
        for id in ["../../etc/passwd", "no-slash", "a/../b", "pages_home.json/missing"] {
            let err = backups.restore(id).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)), "{id}");
        }
    }
}
