/// Content store: the JSON documents that hold the site's copy.
///
/// Documents are addressed by paths relative to the content root. Edits are spliced into the
/// source text at the edited value's byte range, so every other byte of the file is written
/// back unchanged. Writes go through a temporary sibling file and a rename.
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use improver_common::ids::{new_short_id, sha256_hex};

use crate::error::AppError;
use crate::field_path::FieldPath;
use crate::model::ContentFileInfo;

/// A parsed content document together with its source text.
#[derive(Debug, Clone)]
pub struct ContentFile {
    pub path: String,
    pub document: Value,
    text: String,
}

impl ContentFile {
    /// Replace the value at `field` and return the previous one. Only the bytes of the old
    /// value change in the source text; the new value is written as compact JSON.
    pub fn replace(&mut self, field: &FieldPath, value: Value) -> Result<Value, AppError> {
        let span = field
            .locate(&self.text)
            .ok_or_else(|| AppError::NotFound(format!("field {field}")))?;
        let encoded = serde_json::to_string(&value).map_err(|e| AppError::json(&self.path, e))?;
        let previous = field.replace(&mut self.document, value)?;
        self.text.replace_range(span, &encoded);
        Ok(previous)
    }
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    configured: Option<Vec<String>>,
    exclude: Option<PathBuf>,
}

impl ContentStore {
    /// `files` pins the tracked set; `None` discovers `*.json` under `root`. Discovery skips
    /// hidden entries and anything under `exclude`.
    pub fn new(
        root: impl Into<PathBuf>,
        files: Option<Vec<String>>,
        exclude: Option<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            configured: files,
            exclude,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a relative content path and join it onto the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, AppError> {
        Ok(self.root.join(normalize_rel(rel)?))
    }

    /// The tracked content files, sorted.
    pub fn tracked(&self) -> Result<Vec<String>, AppError> {
        if !self.root.is_dir() {
            return Err(AppError::NotAvailable(format!(
                "content root {} does not exist",
                self.root.display()
            )));
        }

        let mut files = match &self.configured {
            Some(list) => list
                .iter()
                .map(|rel| normalize_rel(rel))
                .collect::<Result<Vec<_>, _>>()?,
            None => self.discover(),
        };
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn discover(&self) -> Vec<String> {
        let exclude = self.exclude.as_ref().and_then(|p| p.canonicalize().ok());
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let hidden = entry.depth() > 0
                    && entry.file_name().to_string_lossy().starts_with('.');
                let excluded = exclude.as_ref().is_some_and(|ex| {
                    entry
                        .path()
                        .canonicalize()
                        .is_ok_and(|p| p.starts_with(ex))
                });
                !hidden && !excluded
            })
            .filter_map(|entry| {
                entry
                    .inspect_err(|e| warn!(error = %e, "skipping unreadable content entry"))
                    .ok()
            })
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "json")
            })
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&self.root).ok()?;
                Some(to_slash(rel))
            })
            .collect()
    }

    /// Fail with `NotAvailable` unless the root exists, the tracked set is non-empty and every
    /// configured file exists. Returns the tracked files.
    pub fn ensure_available(&self) -> Result<Vec<String>, AppError> {
        let files = self.tracked()?;
        if files.is_empty() {
            return Err(AppError::NotAvailable(format!(
                "no content files found under {}",
                self.root.display()
            )));
        }
        let missing: Vec<&str> = files
            .iter()
            .filter(|rel| !self.root.join(rel.as_str()).is_file())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::NotAvailable(format!(
                "missing content files: {}",
                missing.join(", ")
            )));
        }
        Ok(files)
    }

    pub async fn read_bytes(&self, rel: &str) -> Result<Vec<u8>, AppError> {
        let path = self.resolve(rel)?;
        tokio::fs::read(&path).await.map_err(|e| AppError::io(path, e))
    }

    pub async fn read(&self, rel: &str) -> Result<ContentFile, AppError> {
        let bytes = self.read_bytes(rel).await?;
        let document =
            serde_json::from_slice::<Value>(&bytes).map_err(|e| AppError::json(rel, e))?;
        let text = String::from_utf8(bytes).map_err(|e| {
            AppError::io(rel, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(ContentFile {
            path: normalize_rel(rel)?,
            document,
            text,
        })
    }

    pub async fn write(&self, file: &ContentFile) -> Result<(), AppError> {
        self.write_bytes(&file.path, file.text.as_bytes()).await
    }

    /// Replace the file's bytes via a temporary sibling and rename.
    pub async fn write_bytes(&self, rel: &str, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.resolve(rel)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::InvalidPath(rel.to_string()))?;
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", new_short_id()));

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| AppError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::io(path, e));
        }
        debug!(path = %rel, bytes = bytes.len(), "content file written");
        Ok(())
    }

    pub async fn describe(&self, rel: &str) -> ContentFileInfo {
        let mut info = ContentFileInfo {
            path: rel.to_string(),
            exists: false,
            bytes: None,
            modified_unix_secs: None,
            sha256: None,
            top_level_keys: Vec::new(),
        };
        let Ok(path) = self.resolve(rel) else {
            return info;
        };
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return info;
        };
        info.exists = meta.is_file();
        info.bytes = Some(meta.len());
        info.modified_unix_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        if let Ok(bytes) = tokio::fs::read(&path).await {
            info.sha256 = Some(sha256_hex(&bytes));
            if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&bytes) {
                info.top_level_keys = map.keys().cloned().collect();
            }
        }
        info
    }
}

/// Normalize a content path to forward slashes, rejecting absolute paths and `..`.
pub fn normalize_rel(rel: &str) -> Result<String, AppError> {
    let mut parts = Vec::new();
    for component in Path::new(rel.trim()).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::InvalidPath(rel.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(AppError::InvalidPath(rel.to_string()));
    }
    Ok(parts.join("/"))
}

fn to_slash(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, body) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        let store = ContentStore::new(dir.path(), None, None);
        (dir, store)
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(normalize_rel("../secrets.json").is_err());
        assert!(normalize_rel("/etc/passwd").is_err());
        assert!(normalize_rel("").is_err());
        assert_eq!(normalize_rel("./pages/home.json").unwrap(), "pages/home.json");
    }

    #[test]
    fn discovers_json_files_and_skips_hidden_entries() {
        let (_dir, store) = store_with(&[
            ("home.json", "{}"),
            ("pages/pricing.json", "{}"),
            ("notes.txt", "x"),
            (".content-improver/improvements/b.json", "{}"),
        ]);
        assert_eq!(
            store.tracked().unwrap(),
            vec!["home.json".to_string(), "pages/pricing.json".to_string()]
        );
    }

    #[test]
    fn missing_root_or_configured_file_is_not_available() {
        let store = ContentStore::new("/definitely/not/here", None, None);
        assert!(matches!(store.tracked(), Err(AppError::NotAvailable(_))));

        let (dir, _) = store_with(&[("home.json", "{}")]);
        let pinned = ContentStore::new(
            dir.path(),
            Some(vec!["home.json".into(), "about.json".into()]),
            None,
        );
        let err = pinned.ensure_available().unwrap_err();
        assert!(matches!(err, AppError::NotAvailable(ref m) if m.contains("about.json")));
    }

    #[tokio::test]
    async fn write_changes_only_the_edited_value() {
        let source = r#"{"headline":"Old","price":1.50,"note":"caf\u00e9","tags":[1, 2]}"#;
        let (_dir, store) = store_with(&[("home.json", source)]);
        let mut file = store.read("home.json").await.unwrap();
        let previous = file
            .replace(&FieldPath::parse("headline").unwrap(), json!("New"))
            .unwrap();
        assert_eq!(previous, json!("Old"));
        assert_eq!(file.document["headline"], json!("New"));
        store.write(&file).await.unwrap();

        let text = String::from_utf8(store.read_bytes("home.json").await.unwrap()).unwrap();
        assert_eq!(text, source.replace("\"Old\"", "\"New\""));
    }

    #[tokio::test]
    async fn write_keeps_indentation_and_trailing_newline() {
        let source = concat!(
            "{\n",
            "    \"zeta\": \"z\",\n",
            "    \"hero\": {\"title\": \"Old\"},\n",
            "    \"alpha\": [1, 2]\n",
            "}\n"
        );
        let (_dir, store) = store_with(&[("home.json", source)]);
        let mut file = store.read("home.json").await.unwrap();
        file.replace(&FieldPath::parse("hero.title").unwrap(), json!("Say \"hi\""))
            .unwrap();
        store.write(&file).await.unwrap();

        let text = String::from_utf8(store.read_bytes("home.json").await.unwrap()).unwrap();
        assert_eq!(text, source.replace("\"Old\"", r#""Say \"hi\"""#));
        let reread = store.read("home.json").await.unwrap();
        assert_eq!(reread.document["hero"]["title"], json!("Say \"hi\""));
    }

    #[tokio::test]
    async fn replacing_a_missing_field_leaves_the_text_alone() {
        let (_dir, store) = store_with(&[("home.json", r#"{"hero": {}}"#)]);
        let mut file = store.read("home.json").await.unwrap();
        let err = file
            .replace(&FieldPath::parse("hero.title").unwrap(), json!("x"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(file.text, r#"{"hero": {}}"#);
    }

    #[tokio::test]
    async fn describe_reports_keys_and_checksum() {
        let (_dir, store) = store_with(&[("home.json", r#"{"b":1,"a":2}"#)]);
        let info = store.describe("home.json").await;
        assert!(info.exists);
        assert_eq!(info.bytes, Some(13));
        assert_eq!(info.top_level_keys, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(info.sha256.as_deref().map(str::len), Some(64));

        let missing = store.describe("gone.json").await;
        assert!(!missing.exists);
    }
}
