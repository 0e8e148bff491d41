//! File-backed record store: one `<table>.json` per table in a directory.
//!
//! Intended for shared filesystems and local testing. Writers take an
//! exclusive lock on `<table>.lock`, re-read the file, apply pending fields
//! and atomically replace it, so concurrent writers touching different fields
//! of a row do not clobber each other. Readers never lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::core::record::{Fields, Table};
use crate::error::StoreError;
use crate::io::store::{RecordStore, StoredTable};

const EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

/// On-disk table layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
struct TableFile {
    columns: Vec<String>,
    rows: Vec<Fields>,
}

#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a table wholesale, replacing any existing file.
    pub fn put(&self, name: &str, columns: &[&str], rows: Vec<Fields>) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let stored = StoredTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        let _lock = self.lock(name)?;
        self.write(&path, &stored)
    }

    fn path_for(&self, table: &str) -> Result<PathBuf, StoreError> {
        validate_table_name(table)?;
        Ok(self.root.join(format!("{table}.{EXTENSION}")))
    }

    /// Block until this process holds the write lock of `table`. The lock is
    /// released when the returned file is dropped.
    fn lock(&self, table: &str) -> Result<File, StoreError> {
        validate_table_name(table)?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create directory {}", self.root.display()))?;
        let path = self.root.join(format!("{table}.{LOCK_EXTENSION}"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(file)
    }

    fn read(&self, path: &Path) -> Result<Option<StoredTable>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let file: TableFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(StoredTable {
            columns: file.columns,
            rows: file.rows,
        }))
    }

    fn write(&self, path: &Path, stored: &StoredTable) -> Result<(), StoreError> {
        let file = TableFile {
            columns: stored.columns.clone(),
            rows: stored.rows.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize table json")?;
        buf.push('\n');
        write_atomic(path, &buf)?;
        Ok(())
    }
}

impl RecordStore for JsonDirStore {
    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let dir = fs::read_dir(&self.root)
            .with_context(|| format!("read store directory {}", self.root.display()))?;
        let mut names = Vec::new();
        for item in dir {
            let path = item
                .with_context(|| format!("list {}", self.root.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    fn fetch(&self, table: &str) -> Result<Option<Table>, StoreError> {
        let path = self.path_for(table)?;
        let stored = self.read(&path)?;
        debug!(found = stored.is_some(), "fetched table");
        Ok(stored.map(|stored| stored.to_table(table)))
    }

    #[instrument(skip_all, fields(table = table.name()))]
    fn save(&self, table: &mut Table) -> Result<(), StoreError> {
        if !table.is_dirty() {
            return Ok(());
        }
        let path = self.path_for(table.name())?;
        let _lock = self.lock(table.name())?;
        let mut stored = self
            .read(&path)?
            .ok_or_else(|| StoreError::TableNotFound(table.name().to_string()))?;
        stored.apply_pending(table)?;
        self.write(&path, &stored)?;
        table.mark_clean();
        debug!("saved table");
        Ok(())
    }

    fn create_table(&self, table: &str, columns: &[String]) -> Result<Table, StoreError> {
        let path = self.path_for(table)?;
        let _lock = self.lock(table)?;
        if path.exists() {
            return Err(StoreError::Backend(anyhow!(
                "table '{table}' already exists at {}",
                path.display()
            )));
        }
        let stored = StoredTable {
            columns: columns.to_vec(),
            rows: Vec::new(),
        };
        self.write(&path, &stored)?;
        Ok(stored.to_table(table))
    }
}

/// Table names double as file names; keep them to one path component.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    if table.is_empty() || table.starts_with('.') || table.contains(['/', '\\']) {
        return Err(StoreError::Backend(anyhow!(
            "invalid table name '{table}'"
        )));
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("table path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp table in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp table {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace table {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn create_fetch_and_save_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonDirStore::new(temp.path());
        store
            .create_table("jobs", &["id".to_string(), "ready".to_string()])
            .expect("create");

        let path = temp.path().join("jobs.json");
        let mut file: TableFile =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert!(file.rows.is_empty());
        file.rows.push(row(&[("id", "7"), ("ready", "1")]));
        fs::write(&path, serde_json::to_string(&file).expect("json")).expect("write");

        let mut table = store.fetch("jobs").expect("fetch").expect("table");
        table.entries_mut()[0].set("build", "1");
        store.save(&mut table).expect("save");

        let reloaded = store.fetch("jobs").expect("fetch").expect("table");
        assert_eq!(reloaded.entries()[0].get("build"), Some("1"));
        assert_eq!(reloaded.columns(), ["id", "ready", "build"]);
        assert_eq!(store.table_names().expect("names"), vec!["jobs"]);
    }

    #[test]
    fn missing_table_fetches_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonDirStore::new(temp.path());
        assert!(store.fetch("absent").expect("fetch").is_none());
    }

    #[test]
    fn rejects_path_like_table_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonDirStore::new(temp.path());
        assert!(store.fetch("../etc").is_err());
        assert!(store.fetch(".hidden").is_err());
    }

    #[test]
    fn ignores_non_json_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("notes.txt"), "x").expect("write");
        fs::write(temp.path().join("b.json"), "{}").expect("write");
        fs::write(temp.path().join("a.json"), "{}").expect("write");
        let store = JsonDirStore::new(temp.path());
        assert_eq!(store.table_names().expect("names"), vec!["a", "b"]);
    }

    #[test]
    fn concurrent_saves_keep_every_field() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonDirStore::new(temp.path());
        for round in 0..50 {
            store
                .put("jobs", &["id"], vec![row(&[("id", "7")])])
                .expect("put");
            let barrier = Barrier::new(2);
            thread::scope(|scope| {
                for field in ["a", "b"] {
                    let (store, barrier) = (&store, &barrier);
                    scope.spawn(move || {
                        let mut table = store.fetch("jobs").expect("fetch").expect("table");
                        table.entries_mut()[0].set(field, round.to_string());
                        barrier.wait();
                        store.save(&mut table).expect("save");
                    });
                }
            });

            let merged = store.fetch("jobs").expect("fetch").expect("table");
            let round = round.to_string();
            assert_eq!(merged.entries()[0].get("a"), Some(round.as_str()));
            assert_eq!(merged.entries()[0].get("b"), Some(round.as_str()));
        }
        assert_eq!(store.table_names().expect("names"), vec!["jobs"]);
    }

    #[test]
    fn saves_from_stale_copies_merge_per_field() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonDirStore::new(temp.path());
        store
            .put("jobs", &["id", "build"], vec![row(&[("id", "7"), ("build", "")])])
            .expect("put");

        let mut first = store.fetch("jobs").expect("fetch").expect("table");
        let mut second = store.fetch("jobs").expect("fetch").expect("table");
        first.entries_mut()[0].set("build", "r:web-1");
        second.entries_mut()[0].set("notes", "flaky");
        store.save(&mut first).expect("save first");
        store.save(&mut second).expect("save second");

        let merged = store.fetch("jobs").expect("fetch").expect("table");
        assert_eq!(merged.entries()[0].get("build"), Some("r:web-1"));
        assert_eq!(merged.entries()[0].get("notes"), Some("flaky"));
    }
}
