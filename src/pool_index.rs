//! Persistent pool index (`index.json`) and per-entry metadata files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const INDEX_FILE: &str = "index.json";
pub const ENTRY_META_FILE: &str = ".buffer-meta.json";

/// One pre-started pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedMeta {
    pub id: String,
    pub dir: PathBuf,
    pub pid: u32,
    pub port: u16,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

impl BufferedMeta {
    pub fn write_entry_file(&self) -> Result<()> {
        let path = self.dir.join(ENTRY_META_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn read_entry_file(dir: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(dir.join(ENTRY_META_FILE)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// The ordered (oldest first) list of unclaimed entries.
///
/// Callers are expected to serialize load-modify-save cycles; this type only guarantees
/// that a reader never observes a half-written file.
#[derive(Debug, Clone)]
pub struct PoolIndex {
    path: PathBuf,
}

impl PoolIndex {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(INDEX_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing index reads as empty; a corrupt one is logged and treated as empty.
    pub fn load(&self) -> Vec<BufferedMeta> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "pool index unreadable; starting empty");
                Vec::new()
            }
        }
    }

    pub fn save(&self, entries: &[BufferedMeta]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("pool index has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let tmp = parent.join(format!(".{}.{}.tmp", INDEX_FILE, std::process::id()));
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, dir: &Path) -> BufferedMeta {
        BufferedMeta {
            id: id.to_string(),
            dir: dir.join(format!("inst-{}", id)),
            pid: 35074,
            port: 5179,
            created_at: 1757701056999,
        }
    }

    #[test]
    fn missing_and_corrupt_index_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = PoolIndex::new(dir.path());
        assert!(index.load().is_empty());
        std::fs::write(index.path(), "{not json").unwrap();
        assert!(index.load().is_empty());
    }

    #[test]
    fn save_preserves_order_and_wire_names() {
        let dir = tempfile::tempdir().unwrap();
        let index = PoolIndex::new(&dir.path().join("pool"));
        let entries = vec![meta("1", dir.path()), meta("2", dir.path())];
        index.save(&entries).unwrap();
        assert_eq!(index.load(), entries);

        let raw = std::fs::read_to_string(index.path()).unwrap();
        assert!(raw.contains("\"createdAt\": 1757701056999"));
        let leftovers = std::fs::read_dir(dir.path().join("pool"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn entry_file_round_trips_next_to_entry() {
        let dir = tempfile::tempdir().unwrap();
        let entry = meta("7", dir.path());
        std::fs::create_dir_all(&entry.dir).unwrap();
        entry.write_entry_file().unwrap();
        assert_eq!(BufferedMeta::read_entry_file(&entry.dir), Some(entry));
    }
}
