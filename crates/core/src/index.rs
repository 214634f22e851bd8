//! File index and incremental diff (spec §4.2).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IndexError, IndexResult};
use crate::glob::ExcludeSet;

/// A validated repository-relative path: forward-slash separated, no
/// leading slash, no `..` segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Build a `RelativePath` from an OS path, normalizing separators.
    pub fn new(raw: impl AsRef<str>) -> IndexResult<Self> {
        let normalized = raw.as_ref().replace('\\', "/");
        Self::validate(&normalized)?;
        Ok(Self(normalized))
    }

    fn validate(path: &str) -> IndexResult<()> {
        if path.starts_with('/') {
            return Err(IndexError::InvalidPath(format!(
                "{path}: leading slash not allowed"
            )));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(IndexError::InvalidPath(format!(
                "{path}: '..' segment not allowed"
            )));
        }
        if path.is_empty() {
            return Err(IndexError::InvalidPath("empty path".to_string()));
        }
        Ok(())
    }

    /// Case-insensitive identity key used for index lookups.
    pub fn identity_key(&self) -> String {
        self.0.to_lowercase()
    }

    /// Borrow the normalized `/`-separated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<RelativePath> for String {
    fn from(value: RelativePath) -> Self {
        value.0
    }
}

/// A single entry in a `FileIndex` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub relative_path: RelativePath,
    pub size_bytes: u64,
    pub last_modified_utc: chrono::DateTime<chrono::Utc>,
    /// Lowercase hex SHA-256; empty only during an in-progress scan.
    pub sha256: String,
}

/// Ordered, case-insensitive, duplicate-free set of `FileEntry` values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileIndex {
    entries: BTreeMap<String, FileEntry>,
}

impl FileIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keyed case-insensitively.
    pub fn upsert(&mut self, entry: FileEntry) {
        let key = entry.relative_path.identity_key();
        self.entries.insert(key, entry);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    fn get(&self, key: &str) -> Option<&FileEntry> {
        self.entries.get(key)
    }

    /// Load an index from disk; an absent file yields an empty index.
    pub fn load(path: &Path) -> IndexResult<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the index atomically: write to a sibling temp file, then rename.
    pub fn save(&self, path: &Path) -> IndexResult<()> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Result of diffing two indexes (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub changed: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
}

/// Compare `current` against `previous`.
///
/// A current entry is changed if absent from `previous`, has a
/// different size, or — when both hashes are populated — a different
/// sha256. Timestamps alone never mark a file changed.
pub fn diff(previous: &FileIndex, current: &FileIndex) -> DiffResult {
    let mut result = DiffResult::default();

    for entry in current.iter() {
        let key = entry.relative_path.identity_key();
        match previous.get(&key) {
            None => result.changed.push(entry.clone()),
            Some(prev) => {
                let size_differs = prev.size_bytes != entry.size_bytes;
                let hash_differs = !prev.sha256.is_empty()
                    && !entry.sha256.is_empty()
                    && prev.sha256 != entry.sha256;
                if size_differs || hash_differs {
                    result.changed.push(entry.clone());
                }
            }
        }
    }

    for entry in previous.iter() {
        let key = entry.relative_path.identity_key();
        if current.get(&key).is_none() {
            result.deleted.push(entry.clone());
        }
    }

    result
}

/// Scan `roots`, skipping anything matched by `excludes`.
///
/// Duplicates never appear. A metadata error on an individual file
/// degrades to a warning and a skip; a permission error on a directory
/// skips the whole subtree.
pub fn scan(roots: &[PathBuf], excludes: &ExcludeSet) -> Vec<FileEntry> {
    let mut entries = BTreeMap::new();

    for root in roots {
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let read_dir = match fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            for item in read_dir {
                let item = match item {
                    Ok(i) => i,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable directory entry");
                        continue;
                    }
                };
                let path = item.path();
                let file_type = match item.file_type() {
                    Ok(ft) => ft,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping entry with unreadable file type");
                        continue;
                    }
                };

                let file_name = item.file_name();
                let file_name = file_name.to_string_lossy();
                let relative = match path.strip_prefix(root) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };

                if excludes.matches(&file_name, &relative) {
                    continue;
                }

                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let metadata = match fs::metadata(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping file with unreadable metadata");
                        continue;
                    }
                };

                let relative_path = match RelativePath::new(&relative) {
                    Ok(rp) => rp,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping file with invalid relative path");
                        continue;
                    }
                };

                let modified = metadata
                    .modified()
                    .map(chrono::DateTime::<chrono::Utc>::from)
                    .unwrap_or_else(|_| chrono::Utc::now());

                let key = relative_path.identity_key();
                entries.insert(
                    key,
                    FileEntry {
                        relative_path,
                        size_bytes: metadata.len(),
                        last_modified_utc: modified,
                        sha256: String::new(),
                    },
                );
            }
        }
    }

    entries.into_values().collect()
}

/// Compute the lowercase hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> IndexResult<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64, sha256: &str) -> FileEntry {
        FileEntry {
            relative_path: RelativePath::new(path).unwrap(),
            size_bytes: size,
            last_modified_utc: chrono::Utc::now(),
            sha256: sha256.to_string(),
        }
    }

    #[test]
    fn rejects_leading_slash_and_dotdot() {
        assert!(RelativePath::new("/etc/passwd").is_err());
        assert!(RelativePath::new("a/../b").is_err());
        assert!(RelativePath::new("a/b").is_ok());
    }

    #[test]
    fn s1_new_file_appears() {
        let previous = FileIndex::new();
        let mut current = FileIndex::new();
        current.upsert(entry("a.txt", 100, "h1"));

        let result = diff(&previous, &current);
        assert_eq!(result.changed.len(), 1);
        assert!(result.deleted.is_empty());
    }

    #[test]
    fn s2_file_modified_by_size() {
        let mut previous = FileIndex::new();
        previous.upsert(entry("a.txt", 100, "h1"));
        let mut current = FileIndex::new();
        current.upsert(entry("a.txt", 200, "h1-new"));

        let result = diff(&previous, &current);
        assert_eq!(result.changed.len(), 1);
    }

    #[test]
    fn s3_case_insensitive_identity() {
        let mut previous = FileIndex::new();
        previous.upsert(entry("Docs/A.txt", 100, "h1"));
        let mut current = FileIndex::new();
        current.upsert(entry("docs/a.txt", 100, "H1"));

        let result = diff(&previous, &current);
        assert!(result.changed.is_empty());
        assert!(result.deleted.is_empty());
    }

    #[test]
    fn timestamps_alone_never_mark_changed() {
        let mut previous = FileIndex::new();
        let mut e = entry("a.txt", 100, "h1");
        e.last_modified_utc = chrono::Utc::now() - chrono::Duration::days(1);
        previous.upsert(e);

        let mut current = FileIndex::new();
        current.upsert(entry("a.txt", 100, "h1"));

        let result = diff(&previous, &current);
        assert!(result.changed.is_empty());
    }

    #[test]
    fn idempotent_diff_after_save() {
        let mut current = FileIndex::new();
        current.upsert(entry("a.txt", 100, "h1"));
        current.upsert(entry("b/c.txt", 5, "h2"));

        let result = diff(&current.clone(), &current);
        assert!(result.changed.is_empty());
        assert!(result.deleted.is_empty());
    }

    #[test]
    fn deleted_file_detected() {
        let mut previous = FileIndex::new();
        previous.upsert(entry("a.txt", 100, "h1"));
        let current = FileIndex::new();

        let result = diff(&previous, &current);
        assert_eq!(result.deleted.len(), 1);
        assert!(result.changed.is_empty());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = FileIndex::new();
        index.upsert(entry("a.txt", 100, "h1"));
        index.save(&path).unwrap();

        let loaded = FileIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded = FileIndex::load(&path).unwrap();
        assert!(loaded.is_empty());
    }
}
