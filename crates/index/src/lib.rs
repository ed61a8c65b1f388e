//! Primary-key and optional secondary indexes over a table's live base RIDs.
//!
//! The primary slot (`key` column) is always populated: an exact map from
//! key value to base RID, plus a sorted vector of keys for range scans.
//! Secondary slots are optional value -> RID-set maps, built on demand by
//! scanning the table's latest versions.


use ahash::RandomState;
use hashbrown::{HashMap, HashSet};

type Map<K, V> = HashMap<K, V, RandomState>;

/// Result of a `locate` call: zero, one, or many matching base RIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// Primary-column lookup result.
    Single(Option<i64>),
    /// Secondary-column lookup result (empty if the value is unknown, or
    /// the column has no active secondary index).
    Many(Vec<i64>),
}

pub struct Index {
    num_columns: usize,
    key: usize,
    primary: Map<i64, i64>,
    sorted_keys: Vec<i64>,
    /// One slot per user column; `None` means the secondary index is
    /// disabled (or it's the primary-key slot, which lives in `primary`).
    secondary: Vec<Option<Map<i64, HashSet<i64>>>>,
}

impl Index {
    pub fn new(num_columns: usize, key: usize) -> Self {
        Self {
            num_columns,
            key,
            primary: Map::default(),
            sorted_keys: Vec::new(),
            secondary: (0..num_columns).map(|_| None).collect(),
        }
    }

    fn in_range(&self, column: usize) -> bool {
        column < self.num_columns
    }

    /// Insert a new primary-key mapping; fails if the key is already present.
    pub fn insert_key(&mut self, key_value: i64, rid: i64) -> bool {
        if self.primary.contains_key(&key_value) {
            return false;
        }
        self.primary.insert(key_value, rid);
        let pos = self.sorted_keys.partition_point(|k| *k < key_value);
        self.sorted_keys.insert(pos, key_value);
        true
    }

    fn insert_secondary(&mut self, column: usize, value: i64, rid: i64) {
        if let Some(Some(bucket)) = self.secondary.get_mut(column) {
            bucket.entry(value).or_default().insert(rid);
        }
    }

    fn remove_secondary(&mut self, column: usize, value: i64, rid: i64) {
        if let Some(Some(bucket)) = self.secondary.get_mut(column) {
            if let Some(set) = bucket.get_mut(&value) {
                set.remove(&rid);
                if set.is_empty() {
                    bucket.remove(&value);
                }
            }
        }
    }

    /// Add a base record's user columns to every active secondary index.
    /// `columns[i]` is the value of user column `i`; `None` (null) is skipped.
    pub fn add_record(&mut self, rid: i64, columns: &[Option<i64>]) {
        for col in 0..self.num_columns {
            if col == self.key {
                continue;
            }
            if let Some(value) = columns.get(col).copied().flatten() {
                self.insert_secondary(col, value, rid);
            }
        }
    }

    /// Remove a base record's user columns from every active secondary index.
    pub fn remove_record(&mut self, rid: i64, columns: &[Option<i64>]) {
        for col in 0..self.num_columns {
            if col == self.key {
                continue;
            }
            if let Some(value) = columns.get(col).copied().flatten() {
                self.remove_secondary(col, value, rid);
            }
        }
    }

    /// Move a record between old/new values in every active secondary index.
    pub fn update_record(&mut self, rid: i64, old: &[Option<i64>], new: &[Option<i64>]) {
        for col in 0..self.num_columns {
            if col == self.key {
                continue;
            }
            let old_val = old.get(col).copied().flatten();
            let new_val = new.get(col).copied().flatten();
            if old_val == new_val {
                continue;
            }
            if let Some(v) = old_val {
                self.remove_secondary(col, v, rid);
            }
            if let Some(v) = new_val {
                self.insert_secondary(col, v, rid);
            }
        }
    }

    /// Primary column returns the base RID (or `None`); secondary columns
    /// return the matching RID set (empty if unknown). An out-of-range or
    /// disabled secondary column returns `Located::Many(vec![])`… except
    /// the contract distinguishes "disabled" from "empty": both read as no
    /// matches to the caller, matching the source's `locate`.
    pub fn locate(&self, column: usize, value: i64) -> Option<Located> {
        if !self.in_range(column) {
            return None;
        }
        if column == self.key {
            return Some(Located::Single(self.primary.get(&value).copied()));
        }
        match self.secondary.get(column) {
            Some(Some(bucket)) => Some(Located::Many(
                bucket.get(&value).map(|s| s.iter().copied().collect()).unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// Defined only for the primary column: RIDs of keys in `[lo, hi]`.
    pub fn locate_range(&self, lo: i64, hi: i64, column: usize) -> Vec<i64> {
        if column != self.key {
            return Vec::new();
        }
        let left = self.sorted_keys.partition_point(|k| *k < lo);
        let right = self.sorted_keys.partition_point(|k| *k <= hi);
        self.sorted_keys[left..right]
            .iter()
            .filter_map(|k| self.primary.get(k).copied())
            .collect()
    }

    /// Remove a primary-key entry by its key value (used on delete).
    pub fn delete_key(&mut self, key_value: i64) -> bool {
        if self.primary.remove(&key_value).is_none() {
            return false;
        }
        if let Ok(pos) = self.sorted_keys.binary_search(&key_value) {
            self.sorted_keys.remove(pos);
        }
        true
    }

    /// Build a secondary index over `column` by scanning the latest version
    /// of every live base RID via the supplied reader. No-op (returns
    /// `true`) if the column is the primary key or already indexed.
    pub fn create_index(
        &mut self,
        column: usize,
        live_rids: impl Iterator<Item = i64>,
        mut read_latest_user_columns: impl FnMut(i64) -> Option<Vec<Option<i64>>>,
    ) -> bool {
        if !self.in_range(column) {
            return false;
        }
        if column == self.key {
            return true;
        }
        if self.secondary[column].is_some() {
            return true;
        }
        self.secondary[column] = Some(Map::default());
        for rid in live_rids {
            let Some(cols) = read_latest_user_columns(rid) else {
                continue;
            };
            if let Some(value) = cols.get(column).copied().flatten() {
                self.insert_secondary(column, value, rid);
            }
        }
        true
    }

    /// Disable and free a secondary index. The primary index is non-droppable.
    pub fn drop_index(&mut self, column: usize) -> bool {
        if !self.in_range(column) || column == self.key {
            return false;
        }
        self.secondary[column] = None;
        true
    }
}
