//! Record store abstraction.
//!
//! The [`RecordStore`] trait is the only channel through which agents and the
//! runner see shared state. The real connector (spreadsheet, database, file
//! share) lives behind it; [`MemoryStore`] is an in-process implementation
//! with the same last-write-wins-per-field semantics.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::core::keys::describe_keys;
use crate::core::record::{Fields, Table};
use crate::error::StoreError;

/// Shared tabular store of named tables.
pub trait RecordStore {
    /// Table names in the store's enumeration order.
    fn table_names(&self) -> Result<Vec<String>, StoreError>;

    /// Fetch the authoritative state of a table, or `None` if it does not exist.
    fn fetch(&self, table: &str) -> Result<Option<Table>, StoreError>;

    /// Persist every pending field update of `table` and mark it clean.
    fn save(&self, table: &mut Table) -> Result<(), StoreError>;

    fn create_table(&self, table: &str, columns: &[String]) -> Result<Table, StoreError>;

    /// Replace `table` with a fresh copy from the store. Unsaved updates are lost.
    fn refresh(&self, table: &mut Table) -> Result<(), StoreError> {
        let name = table.name().to_string();
        *table = self
            .fetch(&name)?
            .ok_or(StoreError::TableNotFound(name))?;
        Ok(())
    }
}

/// Raw table contents as kept by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTable {
    pub columns: Vec<String>,
    pub rows: Vec<Fields>,
}

impl StoredTable {
    pub fn to_table(&self, name: &str) -> Table {
        Table::new(name, self.columns.clone(), self.rows.clone())
    }

    /// Apply the pending updates of `table` field by field.
    ///
    /// Rows are addressed by position. A pending row that no longer exists, or
    /// whose stored values no longer match the entry's pinned identity, is a
    /// write conflict and nothing is applied.
    pub fn apply_pending(&mut self, table: &Table) -> Result<(), StoreError> {
        let dirty: Vec<_> = table.entries().iter().filter(|e| e.is_dirty()).collect();
        for entry in &dirty {
            let row = self.rows.get(entry.row()).ok_or_else(|| {
                StoreError::conflict(
                    table.name(),
                    format!("row {} no longer exists", entry.row()),
                )
            })?;
            let moved = entry
                .identity()
                .iter()
                .any(|(name, value)| row.get(name) != Some(value));
            if moved {
                return Err(StoreError::conflict(
                    table.name(),
                    format!(
                        "row {} no longer holds {}",
                        entry.row(),
                        describe_keys(entry.identity())
                    ),
                ));
            }
        }

        for column in table.columns_with_pending() {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        for entry in dirty {
            self.rows[entry.row()].extend(entry.pending());
        }
        Ok(())
    }
}

/// In-process store; table names enumerate in lexicographic order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, StoredTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a table wholesale.
    pub fn put(&self, name: &str, columns: &[&str], rows: Vec<Fields>) -> Result<(), StoreError> {
        let stored = StoredTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        self.lock()?.insert(name.to_string(), stored);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StoredTable>>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("memory store lock poisoned")))
    }
}

impl RecordStore for MemoryStore {
    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn fetch(&self, table: &str) -> Result<Option<Table>, StoreError> {
        Ok(self.lock()?.get(table).map(|stored| stored.to_table(table)))
    }

    fn save(&self, table: &mut Table) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let stored = tables
            .get_mut(table.name())
            .ok_or_else(|| StoreError::TableNotFound(table.name().to_string()))?;
        stored.apply_pending(table)?;
        table.mark_clean();
        Ok(())
    }

    fn create_table(&self, table: &str, columns: &[String]) -> Result<Table, StoreError> {
        let mut tables = self.lock()?;
        if tables.contains_key(table) {
            return Err(StoreError::Backend(anyhow!("table '{table}' already exists")));
        }
        let stored = StoredTable {
            columns: columns.to_vec(),
            rows: Vec::new(),
        };
        let created = stored.to_table(table);
        tables.insert(table.to_string(), stored);
        Ok(created)
    }
}
