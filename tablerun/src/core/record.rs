//! In-memory view of tables and entries as handed out by a record store.
//!
//! Every value is an untyped string. Mutations are recorded per field so a
//! store can persist only what changed (last write wins per field).

use std::collections::{BTreeMap, BTreeSet};

/// Field name to value mapping for one entry.
pub type Fields = BTreeMap<String, String>;

/// One record of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Store-assigned row position within its table.
    row: usize,
    fields: Fields,
    dirty: BTreeSet<String>,
    /// Values the stored row must still hold when this entry is saved.
    identity: Fields,
}

impl Entry {
    pub fn new(row: usize, fields: Fields) -> Self {
        Self {
            row,
            fields,
            dirty: BTreeSet::new(),
            identity: Fields::new(),
        }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    /// Tie this entry to the stored row holding `identity`. A save is
    /// rejected as a conflict once the row at [`Entry::row`] holds other values.
    pub fn pin(&mut self, identity: Fields) {
        self.identity = identity;
    }

    pub fn identity(&self) -> &Fields {
        &self.identity
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Field value; empty cells read as `Some("")`, absent columns as `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Update a field in memory and mark it pending for the next save.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.fields.insert(name.clone(), value.into());
        self.dirty.insert(name);
    }

    pub fn merge(&mut self, updates: &Fields) {
        for (name, value) in updates {
            self.set(name.clone(), value.clone());
        }
    }

    /// Fields changed since the entry was loaded or last saved.
    pub fn pending(&self) -> Fields {
        self.dirty
            .iter()
            .filter_map(|name| {
                self.fields
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    /// True when every `(name, value)` in `keys` equals this entry's value.
    pub fn matches(&self, keys: &Fields) -> bool {
        keys.iter()
            .all(|(name, value)| self.get(name) == Some(value.as_str()))
    }
}

/// A named, ordered collection of entries sharing one column schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    entries: Vec<Entry>,
}

impl Table {
    /// Build a table from raw rows; row positions follow `rows` order.
    pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Fields>) -> Self {
        let entries = rows
            .into_iter()
            .enumerate()
            .map(|(row, fields)| Entry::new(row, fields))
            .collect();
        Self {
            name: name.into(),
            columns,
            entries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [Entry] {
        &mut self.entries
    }

    /// Indices of entries matching every `(name, value)` in `keys`.
    pub fn positions_matching(&self, keys: &Fields) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.matches(keys))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn entry_at_row(&self, row: usize) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.row == row)
    }

    pub fn entry_at_row_mut(&mut self, row: usize) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.row == row)
    }

    pub fn is_dirty(&self) -> bool {
        self.entries.iter().any(Entry::is_dirty)
    }

    pub fn mark_clean(&mut self) {
        for entry in &mut self.entries {
            entry.mark_clean();
        }
    }

    /// Column names in schema order, plus any field set since load that the
    /// schema does not know yet.
    pub fn columns_with_pending(&self) -> Vec<String> {
        let mut columns = self.columns.clone();
        for entry in &self.entries {
            for name in &entry.dirty {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }
        columns
    }
}
