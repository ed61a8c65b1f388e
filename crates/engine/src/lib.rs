//! The table orchestrator: page directory, RID space, version chains, and
//! the background merge worker. This is the core of the storage engine —
//! everything else (disk I/O, buffer management, indexing) is a leaf it
//! composes.

mod directory;
#[cfg(test)]
mod tests;

pub use directory::{
    CellLoc, Directory, Mark, INDIRECTION_COLUMN, METADATA_COLUMNS, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN,
};
pub use index::Located;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};

use buffer::{BufferPool, PageKey};
use common::{DbError, DbResult, EngineConfig};
use index::Index;

type Map<K, V> = HashMap<K, V, RandomState>;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// One snapshotted base row going into a merge build: its RID, current
/// directory entry, the indirection-resolved tail RID at snapshot time,
/// and that tail RID's directory entry (if it was a tail row).
type MergeEntry = (i64, Directory, Option<i64>, Option<Directory>);

/// One completed merge build: the merged user-column locations for every
/// row that materialized cleanly, keyed by base RID, plus the old base
/// pages superseded (freed only once every entry in the job applies).
struct MergeJob {
    range: u64,
    entries: Vec<MergeEntry>,
    merged_locations: Map<i64, Vec<(usize, CellLoc)>>,
    old_pages_by_col: Map<usize, HashSet<u64>>,
}

struct TableState {
    page_directory: Map<i64, Directory>,
    index: Index,
    next_base_rid: i64,
    next_tail_rid: i64,
    base_rids: HashSet<i64>,
    sorted_base_rids_cache: Option<Vec<i64>>,
    tps: Map<i64, Option<i64>>,
    star_tail_record: HashSet<i64>,
    /// range -> per-column list of tail page indices used by that range.
    tail_range_pages: Map<u64, Vec<Vec<u64>>>,
    /// Per-column cursor: the base page the foreground insert path is
    /// currently filling. Distinct from `next_base_page_index`, which the
    /// merge build phase also draws from.
    current_base_page_index: Vec<u64>,
    next_tail_page_index: Vec<u64>,
    tail_pages_created_since_merge: u64,
    pending_merge_jobs: Vec<MergeJob>,
}

struct Shared {
    name: String,
    num_columns: usize,
    key: usize,
    total_columns: usize,
    config: EngineConfig,
    bufferpool: Arc<Mutex<BufferPool>>,
    /// Next never-used base page index per column, shared between the
    /// foreground insert path and the background merge build phase so
    /// the two can never allocate the same physical page.
    next_base_page_index: Vec<AtomicU64>,
    state: Mutex<TableState>,
    merge_flag: Mutex<bool>,
    merge_signal: Condvar,
    merge_stop: AtomicBool,
    merge_thread: Mutex<Option<JoinHandle<()>>>,
    /// Set by the worker thread's wrapper just before it exits; `shutdown`
    /// waits on this (bounded) instead of joining unconditionally, since a
    /// merge build phase already in flight can run arbitrarily long.
    merge_finished: Mutex<bool>,
    merge_finished_signal: Condvar,
}

/// A single table: the storage engine's orchestrator. Cheap to clone — it
/// is a handle onto shared, latched state.
#[derive(Clone)]
pub struct Table {
    shared: Arc<Shared>,
}

impl Table {
    /// A brand-new table: `next_base_rid = 1`, `next_tail_rid = -1`.
    pub fn new(
        name: impl Into<String>,
        num_columns: usize,
        key: usize,
        config: EngineConfig,
        bufferpool: Arc<Mutex<BufferPool>>,
    ) -> Self {
        Self::from_metadata(name, num_columns, key, 1, -1, config, bufferpool)
    }

    /// Reconstruct a table's RID counters from persisted metadata; the
    /// caller (the `db` crate) follows up with [`Table::bootstrap`] and
    /// [`Table::rebuild_primary_index`] to restore its directory and index.
    pub fn from_metadata(
        name: impl Into<String>,
        num_columns: usize,
        key: usize,
        next_base_rid: i64,
        next_tail_rid: i64,
        config: EngineConfig,
        bufferpool: Arc<Mutex<BufferPool>>,
    ) -> Self {
        let total_columns = METADATA_COLUMNS + num_columns;
        let state = TableState {
            page_directory: Map::default(),
            index: Index::new(num_columns, key),
            next_base_rid,
            next_tail_rid,
            base_rids: HashSet::new(),
            sorted_base_rids_cache: None,
            tps: Map::default(),
            star_tail_record: HashSet::new(),
            // Range 0 starts with page 0 pre-registered for every column, so
            // the very first tail page a fresh table allocates is reused
            // rather than counted as newly created toward the merge
            // threshold.
            tail_range_pages: Map::from_iter([(0, vec![vec![0]; total_columns])]),
            current_base_page_index: vec![0; total_columns],
            next_tail_page_index: vec![1; total_columns],
            tail_pages_created_since_merge: 0,
            pending_merge_jobs: Vec::new(),
        };
        let shared = Arc::new(Shared {
            name: name.into(),
            num_columns,
            key,
            total_columns,
            config,
            bufferpool,
            next_base_page_index: (0..total_columns).map(|_| AtomicU64::new(1)).collect(),
            state: Mutex::new(state),
            merge_flag: Mutex::new(false),
            merge_signal: Condvar::new(),
            merge_stop: AtomicBool::new(false),
            merge_thread: Mutex::new(None),
            merge_finished: Mutex::new(true),
            merge_finished_signal: Condvar::new(),
        });
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn num_columns(&self) -> usize {
        self.shared.num_columns
    }

    pub fn key(&self) -> usize {
        self.shared.key
    }

    pub fn next_base_rid(&self) -> i64 {
        self.shared.state.lock().unwrap().next_base_rid
    }

    pub fn next_tail_rid(&self) -> i64 {
        self.shared.state.lock().unwrap().next_tail_rid
    }

    // ---- cell-level helpers, all pin-then-unpin around a single access ----

    fn page_key(&self, is_tail: bool, column: usize, page_index: u64) -> PageKey {
        PageKey::new(self.shared.name.clone(), is_tail, column, page_index)
    }

    fn append_cell(
        &self,
        is_tail: bool,
        column: usize,
        page_index: u64,
        value: Option<i64>,
    ) -> DbResult<Option<u16>> {
        let key = self.page_key(is_tail, column, page_index);
        let mut bp = self.shared.bufferpool.lock().unwrap();
        let offset = {
            let Some(frame) = bp.fetch_page(&key, true)? else {
                return Err(DbError::Capacity(format!(
                    "buffer pool exhausted fetching {key:?}"
                )));
            };
            frame.page.append(value)
        };
        if offset.is_some() {
            bp.mark_dirty(&key);
        }
        bp.unpin(&key);
        Ok(offset)
    }

    fn read_cell(
        &self,
        is_tail: bool,
        column: usize,
        page_index: u64,
        offset: u16,
    ) -> DbResult<Option<i64>> {
        let key = self.page_key(is_tail, column, page_index);
        let mut bp = self.shared.bufferpool.lock().unwrap();
        let value = {
            let Some(frame) = bp.fetch_page(&key, true)? else {
                return Ok(None);
            };
            frame.page.read(offset)
        };
        bp.unpin(&key);
        Ok(value)
    }

    fn update_cell(
        &self,
        is_tail: bool,
        column: usize,
        page_index: u64,
        offset: u16,
        value: Option<i64>,
    ) -> DbResult<bool> {
        let key = self.page_key(is_tail, column, page_index);
        let mut bp = self.shared.bufferpool.lock().unwrap();
        let ok = {
            let Some(frame) = bp.fetch_page(&key, true)? else {
                return Ok(false);
            };
            frame.page.update(offset, value)
        };
        if ok {
            bp.mark_dirty(&key);
        }
        bp.unpin(&key);
        Ok(ok)
    }

    fn page_has_capacity(&self, is_tail: bool, column: usize, page_index: u64) -> DbResult<bool> {
        let key = self.page_key(is_tail, column, page_index);
        let mut bp = self.shared.bufferpool.lock().unwrap();
        let has_capacity = match bp.fetch_page(&key, false)? {
            Some(frame) => frame.page.has_capacity(),
            None => false,
        };
        Ok(has_capacity)
    }

    fn read_dir_row(&self, dir: &Directory, is_tail: bool) -> DbResult<Vec<Option<i64>>> {
        let mut row = Vec::with_capacity(dir.len());
        for loc in dir {
            let value = match (loc.mark, loc.offset) {
                (Mark::Null, _) | (_, None) => None,
                (_, Some(offset)) => self.read_cell(is_tail, loc.column, loc.page, offset)?,
            };
            row.push(value);
        }
        Ok(row)
    }

    // ---- page ranges ----

    fn base_range_from_page_index(&self, page_index: u64) -> u64 {
        page_index / self.shared.config.base_pages_per_range
    }

    fn base_range_from_rid(&self, base_rid: i64) -> u64 {
        if base_rid <= 0 {
            return 0;
        }
        (base_rid - 1) as u64 / self.shared.config.records_per_range()
    }

    fn base_range_for_rid(&self, state: &TableState, base_rid: i64) -> u64 {
        match state.page_directory.get(&base_rid) {
            Some(dir) => dir[RID_COLUMN].range,
            None => self.base_range_from_rid(base_rid),
        }
    }

    // ---- page allocation ----

    fn ensure_base_page(&self, state: &mut TableState, column: usize) -> DbResult<u64> {
        let page_index = state.current_base_page_index[column];
        if self.page_has_capacity(false, column, page_index)? {
            return Ok(page_index);
        }
        let new_page = self.shared.next_base_page_index[column].fetch_add(1, Ordering::SeqCst);
        state.current_base_page_index[column] = new_page;
        Ok(new_page)
    }

    fn allocate_base_page_for_merge(&self, column: usize) -> u64 {
        self.shared.next_base_page_index[column].fetch_add(1, Ordering::SeqCst)
    }

    fn request_merge(&self) {
        let mut thread_guard = self.shared.merge_thread.lock().unwrap();
        if thread_guard.is_none() {
            self.shared.merge_stop.store(false, Ordering::SeqCst);
            *self.shared.merge_finished.lock().unwrap() = false;
            let worker = self.clone();
            *thread_guard = Some(thread::spawn(move || {
                worker.merge_worker_loop();
                *worker.shared.merge_finished.lock().unwrap() = true;
                worker.shared.merge_finished_signal.notify_all();
            }));
        }
        drop(thread_guard);
        *self.shared.merge_flag.lock().unwrap() = true;
        self.shared.merge_signal.notify_one();
    }

    fn get_or_allocate_tail_page(
        &self,
        state: &mut TableState,
        range: u64,
        column: usize,
    ) -> DbResult<u64> {
        state
            .tail_range_pages
            .entry(range)
            .or_insert_with(|| vec![Vec::new(); self.shared.total_columns]);
        let last = state.tail_range_pages[&range][column].last().copied();
        if let Some(page_index) = last
            && self.page_has_capacity(true, column, page_index)?
        {
            return Ok(page_index);
        }
        let page_index = state.next_tail_page_index[column];
        state.next_tail_page_index[column] += 1;
        state.tail_range_pages.get_mut(&range).unwrap()[column].push(page_index);
        if column == RID_COLUMN {
            state.tail_pages_created_since_merge += 1;
            if state.tail_pages_created_since_merge >= self.shared.config.merge_tail_page_threshold
            {
                self.request_merge();
            }
        }
        Ok(page_index)
    }

    // ---- reads ----

    fn read_record_locked(
        &self,
        state: &TableState,
        rid: i64,
    ) -> DbResult<Option<Vec<Option<i64>>>> {
        let Some(dir) = state.page_directory.get(&rid) else {
            return Ok(None);
        };
        self.read_dir_row(dir, rid < 0).map(Some)
    }

    pub fn read_record(&self, rid: i64) -> DbResult<Option<Vec<Option<i64>>>> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;
        self.read_record_locked(&state, rid)
    }

    fn read_latest_locked(
        &self,
        state: &TableState,
        base_rid: i64,
    ) -> DbResult<Option<Vec<Option<i64>>>> {
        let Some(record) = self.read_record_locked(state, base_rid)? else {
            return Ok(None);
        };
        let mut latest = record.clone();
        if let Some(t) = record[INDIRECTION_COLUMN] {
            let cutoff = state.tps.get(&base_rid).copied().flatten();
            let need_tail_lookup = cutoff.is_none_or(|tps| t < tps);
            if need_tail_lookup
                && let Some(tail) = self.read_record_locked(state, t)?
            {
                latest = tail;
            }
        }
        for i in 0..latest.len() {
            if latest[i].is_none() {
                latest[i] = record[i];
            }
        }
        Ok(Some(latest))
    }

    /// Latest version of a base record, folding in its newest tail update
    /// unless a completed merge already folded it into the base page.
    pub fn read_latest_record(&self, base_rid: i64) -> DbResult<Option<Vec<Option<i64>>>> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;
        self.read_latest_locked(&state, base_rid)
    }

    /// Time-travel read: `relative_version = 0` is the latest; negative
    /// values walk the version chain backward that many update-steps,
    /// bottoming out at the star snapshot.
    pub fn read_latest_record_modified(
        &self,
        base_rid: i64,
        relative_version: i64,
    ) -> DbResult<Option<Vec<Option<i64>>>> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;

        let Some(record) = self.read_record_locked(&state, base_rid)? else {
            return Ok(None);
        };
        let Some(latest_rid) = record[INDIRECTION_COLUMN].filter(|&r| r != 0) else {
            return Ok(Some(record));
        };

        if relative_version >= 0
            && let Some(tps) = state.tps.get(&base_rid).copied().flatten()
            && latest_rid < 0
            && latest_rid >= tps
        {
            return Ok(Some(record));
        }

        let Some(latest_record) = self.read_record_locked(&state, latest_rid)? else {
            return Ok(Some(record));
        };
        if relative_version >= 0 {
            let mut merged = latest_record;
            for i in 0..merged.len() {
                if merged[i].is_none() {
                    merged[i] = record[i];
                }
            }
            return Ok(Some(merged));
        }

        let mut steps = -relative_version;
        let mut cur_rid = latest_rid;
        let mut cur_record = latest_record;
        while steps > 0 {
            let Some(prev_rid) = cur_record[INDIRECTION_COLUMN].filter(|&r| r != 0) else {
                break;
            };
            if state.star_tail_record.contains(&cur_rid) && prev_rid >= 0 {
                break;
            }
            let Some(prev_record) = self.read_record_locked(&state, prev_rid)? else {
                break;
            };
            cur_rid = prev_rid;
            cur_record = prev_record;
            steps -= 1;
        }
        for i in 0..cur_record.len() {
            if cur_record[i].is_none() {
                cur_record[i] = record[i];
            }
        }
        Ok(Some(cur_record))
    }

    // ---- writes ----

    pub fn insert_base_record(&self, columns: &[Option<i64>]) -> DbResult<i64> {
        if columns.len() != self.shared.num_columns {
            return Err(DbError::Constraint(format!(
                "expected {} columns, got {}",
                self.shared.num_columns,
                columns.len()
            )));
        }
        if columns.iter().any(Option::is_none) {
            return Err(DbError::Constraint(
                "base record columns must be non-null".into(),
            ));
        }

        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;

        let key_value = columns[self.shared.key].unwrap();
        if matches!(
            state.index.locate(self.shared.key, key_value),
            Some(Located::Single(Some(_)))
        ) {
            return Err(DbError::Constraint(format!(
                "duplicate primary key {key_value}"
            )));
        }

        let base_rid = state.next_base_rid;
        state.next_base_rid += 1;
        let now = now_millis();
        let metadata: [Option<i64>; METADATA_COLUMNS] = [None, Some(base_rid), Some(now), Some(0)];

        let mut dir = Vec::with_capacity(self.shared.total_columns);
        for col in 0..self.shared.total_columns {
            let value = if col < METADATA_COLUMNS {
                metadata[col]
            } else {
                columns[col - METADATA_COLUMNS]
            };
            let page_index = self.ensure_base_page(&mut state, col)?;
            let offset = self
                .append_cell(false, col, page_index, value)?
                .ok_or_else(|| {
                    DbError::Capacity(format!("base page {col}/{page_index} unexpectedly full"))
                })?;
            let range = self.base_range_from_page_index(page_index);
            let mark = if col == INDIRECTION_COLUMN {
                Mark::Null
            } else {
                Mark::Base
            };
            dir.push(CellLoc::new(mark, col, range, page_index, Some(offset)));
        }

        state.page_directory.insert(base_rid, dir);
        state.base_rids.insert(base_rid);
        state.sorted_base_rids_cache = None;
        state.index.insert_key(key_value, base_rid);
        state.index.add_record(base_rid, columns);
        Ok(base_rid)
    }

    fn append_star_snapshot(
        &self,
        state: &mut TableState,
        base_rid: i64,
        previous_rid: i64,
        range: u64,
    ) -> DbResult<i64> {
        let tail_rid = state.next_tail_rid;
        state.next_tail_rid -= 1;
        let now = now_millis();
        let schema_encoding = (1i64 << self.shared.num_columns) - 1;
        let base_row = self
            .read_record_locked(state, base_rid)?
            .ok_or_else(|| DbError::NotFound(format!("base rid {base_rid} not found")))?;

        let metadata: [Option<i64>; METADATA_COLUMNS] =
            [Some(previous_rid), Some(tail_rid), Some(now), Some(schema_encoding)];
        let mut dir = Vec::with_capacity(self.shared.total_columns);
        for col in 0..self.shared.total_columns {
            let value = if col < METADATA_COLUMNS {
                metadata[col]
            } else {
                base_row[col]
            };
            let page_index = self.get_or_allocate_tail_page(state, range, col)?;
            let offset = self
                .append_cell(true, col, page_index, value)?
                .ok_or_else(|| {
                    DbError::Capacity(format!("tail page {col}/{page_index} unexpectedly full"))
                })?;
            dir.push(CellLoc::new(Mark::Tail, col, range, page_index, Some(offset)));
        }
        state.page_directory.insert(tail_rid, dir);
        state.star_tail_record.insert(tail_rid);
        Ok(tail_rid)
    }

    fn set_base_indirection(
        &self,
        state: &mut TableState,
        base_rid: i64,
        new_tail_rid: i64,
    ) -> DbResult<()> {
        let Some(loc) = state.page_directory.get(&base_rid).map(|d| d[INDIRECTION_COLUMN]) else {
            return Ok(());
        };
        let Some(offset) = loc.offset else { return Ok(()) };
        self.update_cell(false, INDIRECTION_COLUMN, loc.page, offset, Some(new_tail_rid))?;
        state.page_directory.get_mut(&base_rid).unwrap()[INDIRECTION_COLUMN].mark = Mark::Base;
        Ok(())
    }

    fn set_base_schema_encoding(
        &self,
        state: &TableState,
        rid: i64,
        schema_encoding: i64,
    ) -> DbResult<()> {
        let Some(loc) = state
            .page_directory
            .get(&rid)
            .map(|d| d[SCHEMA_ENCODING_COLUMN])
        else {
            return Ok(());
        };
        let Some(offset) = loc.offset else { return Ok(()) };
        self.update_cell(
            false,
            SCHEMA_ENCODING_COLUMN,
            loc.page,
            offset,
            Some(schema_encoding),
        )?;
        Ok(())
    }

    /// Cumulative update: every tail row carries the newest value for
    /// every column, with schema encoding OR-ed over the version chain.
    pub fn append_tail_record(&self, columns: &[Option<i64>], base_rid: i64) -> DbResult<i64> {
        if columns.len() != self.shared.num_columns {
            return Err(DbError::Constraint(format!(
                "expected {} columns, got {}",
                self.shared.num_columns,
                columns.len()
            )));
        }

        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;

        let Some(base_record) = self.read_record_locked(&state, base_rid)? else {
            return Err(DbError::NotFound(format!("base rid {base_rid} not found")));
        };

        let mut previous_rid = base_rid;
        if let Some(t) = base_record[INDIRECTION_COLUMN]
            && let Some(latest) = self.read_record_locked(&state, t)?
        {
            previous_rid = latest[RID_COLUMN].unwrap_or(base_rid);
        }

        let Some(previous_record) = self.read_record_locked(&state, previous_rid)? else {
            return Err(DbError::NotFound(format!(
                "previous version {previous_rid} not found"
            )));
        };
        let previous_schema_encoding = previous_record[SCHEMA_ENCODING_COLUMN].unwrap_or(0);

        let num_columns = self.shared.num_columns;
        let first_time = previous_rid == base_rid;
        let mut full_columns = vec![None; num_columns];
        let mut schema_encoding = 0i64;
        for j in 0..num_columns {
            if let Some(v) = columns[j] {
                full_columns[j] = Some(v);
                schema_encoding |= 1 << (num_columns - 1 - j);
            } else {
                full_columns[j] = previous_record[METADATA_COLUMNS + j];
            }
        }

        let range = self.base_range_for_rid(&state, base_rid);
        let previous_rid = if first_time {
            self.append_star_snapshot(&mut state, base_rid, previous_rid, range)?
        } else {
            previous_rid
        };

        let tail_rid = state.next_tail_rid;
        state.next_tail_rid -= 1;
        let now = now_millis();
        schema_encoding |= previous_schema_encoding;

        let metadata: [Option<i64>; METADATA_COLUMNS] =
            [Some(previous_rid), Some(tail_rid), Some(now), Some(schema_encoding)];
        let mut dir = Vec::with_capacity(self.shared.total_columns);
        for col in 0..self.shared.total_columns {
            let value = if col < METADATA_COLUMNS {
                metadata[col]
            } else {
                full_columns[col - METADATA_COLUMNS]
            };
            let page_index = self.get_or_allocate_tail_page(&mut state, range, col)?;
            let offset = self
                .append_cell(true, col, page_index, value)?
                .ok_or_else(|| {
                    DbError::Capacity(format!("tail page {col}/{page_index} unexpectedly full"))
                })?;
            let mark = if value.is_some() { Mark::Tail } else { Mark::Null };
            dir.push(CellLoc::new(mark, col, range, page_index, Some(offset)));
        }
        state.page_directory.insert(tail_rid, dir);

        self.set_base_indirection(&mut state, base_rid, tail_rid)?;
        self.set_base_schema_encoding(&state, base_rid, schema_encoding)?;

        let old_user_cols = previous_record[METADATA_COLUMNS..].to_vec();
        state.index.update_record(base_rid, &old_user_cols, &full_columns);

        Ok(tail_rid)
    }

    /// Delete by RID: zero the physical RID cell, drop the directory entry
    /// and every index reference. Physical pages are reclaimed only by a
    /// later merge.
    pub fn delete_record(&self, rid: i64) -> DbResult<bool> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;

        let Some(dir) = state.page_directory.get(&rid).cloned() else {
            return Ok(false);
        };

        if rid > 0
            && let Some(latest) = self.read_latest_locked(&state, rid)?
        {
            let user_cols = latest[METADATA_COLUMNS..].to_vec();
            if let Some(key_value) = user_cols.get(self.shared.key).copied().flatten() {
                state.index.delete_key(key_value);
            }
            state.index.remove_record(rid, &user_cols);
        }

        let loc = dir[RID_COLUMN];
        let updated = match loc.offset {
            Some(offset) => self.update_cell(rid < 0, RID_COLUMN, loc.page, offset, Some(0))?,
            None => false,
        };
        state.page_directory.remove(&rid);
        if rid > 0 {
            state.base_rids.remove(&rid);
            state.tps.remove(&rid);
            state.sorted_base_rids_cache = None;
        }
        Ok(updated)
    }

    fn get_base_rids_locked(&self, state: &mut TableState) -> Vec<i64> {
        if state.sorted_base_rids_cache.is_none() {
            let mut sorted: Vec<i64> = state.base_rids.iter().copied().collect();
            sorted.sort_unstable();
            state.sorted_base_rids_cache = Some(sorted);
        }
        state.sorted_base_rids_cache.clone().unwrap()
    }

    pub fn get_base_rids(&self) -> Vec<i64> {
        let mut state = self.shared.state.lock().unwrap();
        self.get_base_rids_locked(&mut state)
    }

    // ---- index passthroughs ----

    pub fn locate(&self, column: usize, value: i64) -> Option<Located> {
        let mut state = self.shared.state.lock().unwrap();
        let _ = self.apply_pending_merges_locked(&mut state);
        state.index.locate(column, value)
    }

    pub fn locate_range(&self, lo: i64, hi: i64, column: usize) -> Vec<i64> {
        let mut state = self.shared.state.lock().unwrap();
        let _ = self.apply_pending_merges_locked(&mut state);
        state.index.locate_range(lo, hi, column)
    }

    pub fn create_index(&self, column: usize) -> DbResult<bool> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)?;
        let rids = self.get_base_rids_locked(&mut state);
        let mut rows: Map<i64, Vec<Option<i64>>> = Map::default();
        for &rid in &rids {
            if let Some(row) = self.read_latest_locked(&state, rid)? {
                rows.insert(rid, row[METADATA_COLUMNS..].to_vec());
            }
        }
        Ok(state
            .index
            .create_index(column, rids.into_iter(), |rid| rows.get(&rid).cloned()))
    }

    pub fn drop_index(&self, column: usize) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let _ = self.apply_pending_merges_locked(&mut state);
        state.index.drop_index(column)
    }

    // ---- merge: build (background) + apply (foreground) ----

    fn materialize_latest_from_snapshot(
        &self,
        base_dir: &Directory,
        snapshot_tail_dir: Option<&Directory>,
    ) -> DbResult<Vec<Option<i64>>> {
        let base_record = self.read_dir_row(base_dir, false)?;
        let Some(tail_dir) = snapshot_tail_dir else {
            return Ok(base_record);
        };
        let mut latest = self.read_dir_row(tail_dir, true)?;
        for i in 0..latest.len() {
            if latest[i].is_none() {
                latest[i] = base_record[i];
            }
        }
        Ok(latest)
    }

    fn append_to_base_with_rollover(
        &self,
        current_write_page: &mut Map<usize, Option<u64>>,
        page_col: usize,
        value: Option<i64>,
    ) -> DbResult<(u64, u16)> {
        let page_index = match current_write_page[&page_col] {
            Some(p) if self.page_has_capacity(false, page_col, p)? => p,
            _ => {
                let fresh = self.allocate_base_page_for_merge(page_col);
                current_write_page.insert(page_col, Some(fresh));
                fresh
            }
        };
        if let Some(offset) = self.append_cell(false, page_col, page_index, value)? {
            return Ok((page_index, offset));
        }
        let fresh = self.allocate_base_page_for_merge(page_col);
        current_write_page.insert(page_col, Some(fresh));
        let offset = self
            .append_cell(false, page_col, fresh, value)?
            .ok_or_else(|| {
                DbError::Capacity(format!("fresh merge page {page_col}/{fresh} unexpectedly full"))
            })?;
        Ok((fresh, offset))
    }

    /// Background build phase: snapshot every live base row under the
    /// latch, then rewrite fresh base pages for the whole range without
    /// holding it. The only further latch use is the brief job hand-off.
    fn run_merge_once(&self) -> DbResult<()> {
        let snapshot: Map<u64, Vec<MergeEntry>> = {
            let mut state = self.shared.state.lock().unwrap();
            if state.base_rids.is_empty() {
                state.tail_pages_created_since_merge = 0;
                return Ok(());
            }
            let mut by_range: Map<u64, Vec<MergeEntry>> = Map::default();
            let rids: Vec<i64> = state.base_rids.iter().copied().collect();
            for rid in rids {
                let Some(dir) = state.page_directory.get(&rid).cloned() else {
                    continue;
                };
                let range = dir[RID_COLUMN].range;
                let indirection = dir[INDIRECTION_COLUMN];
                let snapshot_tail_rid = match (indirection.mark, indirection.offset) {
                    (Mark::Null, _) | (_, None) => None,
                    (_, Some(offset)) => {
                        self.read_cell(false, INDIRECTION_COLUMN, indirection.page, offset)?
                    }
                };
                let snapshot_tail_dir = snapshot_tail_rid
                    .filter(|&t| t < 0)
                    .and_then(|t| state.page_directory.get(&t).cloned());
                by_range
                    .entry(range)
                    .or_default()
                    .push((rid, dir, snapshot_tail_rid, snapshot_tail_dir));
            }
            by_range
        };

        for (range, mut entries) in snapshot {
            if entries.is_empty() {
                continue;
            }
            entries.sort_by_key(|(rid, ..)| *rid);

            let num_columns = self.shared.num_columns;
            let mut old_pages_by_col: Map<usize, HashSet<u64>> = (0..num_columns)
                .map(|c| (METADATA_COLUMNS + c, HashSet::new()))
                .collect();
            let mut current_write_page: Map<usize, Option<u64>> = (0..num_columns)
                .map(|c| (METADATA_COLUMNS + c, None))
                .collect();
            let mut merged_locations: Map<i64, Vec<(usize, CellLoc)>> = Map::default();

            for (rid, old_dir, _snapshot_tail_rid, snapshot_tail_dir) in &entries {
                let latest =
                    self.materialize_latest_from_snapshot(old_dir, snapshot_tail_dir.as_ref())?;
                let mut row_locations = Vec::with_capacity(num_columns);
                for c in 0..num_columns {
                    let page_col = METADATA_COLUMNS + c;
                    old_pages_by_col
                        .get_mut(&page_col)
                        .unwrap()
                        .insert(old_dir[page_col].page);
                    let (page_index, offset) = self.append_to_base_with_rollover(
                        &mut current_write_page,
                        page_col,
                        latest[page_col],
                    )?;
                    row_locations.push((
                        page_col,
                        CellLoc::new(Mark::Base, page_col, range, page_index, Some(offset)),
                    ));
                }
                merged_locations.insert(*rid, row_locations);
            }

            let job = MergeJob {
                range,
                entries,
                merged_locations,
                old_pages_by_col,
            };
            self.shared.state.lock().unwrap().pending_merge_jobs.push(job);
        }

        self.shared.state.lock().unwrap().tail_pages_created_since_merge = 0;
        Ok(())
    }

    fn reclaim_old_base_pages(&self, old_pages_by_col: &Map<usize, HashSet<u64>>) -> DbResult<()> {
        let mut bp = self.shared.bufferpool.lock().unwrap();
        for (&col, pages) in old_pages_by_col {
            for &page_index in pages {
                let key = self.page_key(false, col, page_index);
                bp.discard_page(&key, false)?;
                bp.disk_manager()
                    .delete_page(&self.shared.name, false, col, page_index)?;
            }
        }
        Ok(())
    }

    /// Apply phase: fold every pending merge job into the live page
    /// directory. Called at the top of every public operation, as
    /// `query.py` does before dispatching.
    fn apply_pending_merges_locked(&self, state: &mut TableState) -> DbResult<usize> {
        if state.pending_merge_jobs.is_empty() {
            return Ok(0);
        }
        let jobs = std::mem::take(&mut state.pending_merge_jobs);
        let mut applied = 0usize;
        let mut reclaim_batches = Vec::new();

        for job in jobs {
            let mut merged_rids = Vec::new();
            for (rid, _old_dir, snapshot_tail_rid, _snapshot_tail_dir) in &job.entries {
                let Some(merged_cols) = job.merged_locations.get(rid) else {
                    continue;
                };
                let Some(cur_dir) = state.page_directory.get(rid) else {
                    continue;
                };
                if cur_dir[RID_COLUMN].range != job.range {
                    continue;
                }
                let mut new_dir = cur_dir.clone();
                for (col, loc) in merged_cols {
                    new_dir[*col] = *loc;
                }
                state.page_directory.insert(*rid, new_dir);
                state.tps.insert(*rid, snapshot_tail_rid.filter(|&r| r < 0));
                merged_rids.push(*rid);
            }
            if !merged_rids.is_empty() && merged_rids.len() == job.entries.len() {
                reclaim_batches.push(job.old_pages_by_col);
            }
            applied += merged_rids.len();
        }

        for batch in reclaim_batches {
            self.reclaim_old_base_pages(&batch)?;
        }
        Ok(applied)
    }

    /// Fold any jobs the background merge worker finished building. Safe
    /// to call at any time; cheap when nothing is pending.
    pub fn apply_pending_merges_foreground(&self) -> DbResult<usize> {
        let mut state = self.shared.state.lock().unwrap();
        self.apply_pending_merges_locked(&mut state)
    }

    fn merge_worker_loop(&self) {
        loop {
            let flag = self.shared.merge_flag.lock().unwrap();
            let (mut flag, _) = self
                .shared
                .merge_signal
                .wait_timeout(flag, Duration::from_millis(200))
                .unwrap();
            if self.shared.merge_stop.load(Ordering::SeqCst) {
                return;
            }
            if !*flag {
                continue;
            }
            *flag = false;
            drop(flag);
            let _ = self.run_merge_once();
        }
    }

    /// Idempotent: signals the worker to stop and waits up to one second
    /// for it to finish. A merge build phase already in flight can run
    /// arbitrarily long rewriting base pages, so this only joins the
    /// thread once it has actually reported done within the bound —
    /// never an unconditional, unbounded `join()`.
    pub fn shutdown(&self) {
        let mut thread_guard = self.shared.merge_thread.lock().unwrap();
        let Some(handle) = thread_guard.take() else {
            return;
        };
        self.shared.merge_stop.store(true, Ordering::SeqCst);
        *self.shared.merge_flag.lock().unwrap() = true;
        self.shared.merge_signal.notify_all();
        drop(thread_guard);

        let finished = self.shared.merge_finished.lock().unwrap();
        let (finished, timed_out) = self
            .shared
            .merge_finished_signal
            .wait_timeout_while(finished, Duration::from_secs(1), |done| !*done)
            .unwrap();
        drop(finished);
        if !timed_out.timed_out() {
            let _ = handle.join();
        }
    }

    // ---- bootstrap / persistence support for the db crate ----

    /// Install reconstructed directory state (from a warm reload or a cold
    /// rebuild from raw pages). Replaces the corresponding fields wholesale.
    #[allow(clippy::too_many_arguments)]
    pub fn bootstrap(
        &self,
        page_directory: Map<i64, Directory>,
        base_rids: HashSet<i64>,
        tps: Map<i64, Option<i64>>,
        star_tail_record: HashSet<i64>,
        tail_range_pages: Map<u64, Vec<Vec<u64>>>,
        base_page_cursor: Vec<u64>,
        next_base_page_index: Vec<u64>,
        next_tail_page_index: Vec<u64>,
    ) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.page_directory = page_directory;
            state.base_rids = base_rids;
            state.sorted_base_rids_cache = None;
            state.tps = tps;
            state.star_tail_record = star_tail_record;
            state.tail_range_pages = tail_range_pages;
            state.current_base_page_index = base_page_cursor;
            state.next_tail_page_index = next_tail_page_index;
            state.tail_pages_created_since_merge = 0;
        }
        for (col, value) in next_base_page_index.into_iter().enumerate() {
            self.shared.next_base_page_index[col].store(value, Ordering::SeqCst);
        }
    }

    /// Rebuild the primary-key index by reading the latest version of
    /// every live base RID. Used after [`Table::bootstrap`].
    pub fn rebuild_primary_index(&self) -> DbResult<()> {
        let mut state = self.shared.state.lock().unwrap();
        let rids = self.get_base_rids_locked(&mut state);
        for rid in rids {
            let Some(row) = self.read_record_locked(&state, rid)? else {
                continue;
            };
            if let Some(key_value) = row[METADATA_COLUMNS + self.shared.key] {
                state.index.insert_key(key_value, rid);
            }
        }
        Ok(())
    }

    pub fn snapshot_page_directory(&self) -> Vec<(i64, Directory)> {
        let state = self.shared.state.lock().unwrap();
        let mut out: Vec<(i64, Directory)> = state
            .page_directory
            .iter()
            .map(|(&rid, dir)| (rid, dir.clone()))
            .collect();
        out.sort_by_key(|(rid, _)| *rid);
        out
    }

    pub fn snapshot_tps(&self) -> Vec<(i64, Option<i64>)> {
        let state = self.shared.state.lock().unwrap();
        let mut out: Vec<(i64, Option<i64>)> =
            state.tps.iter().map(|(&rid, &value)| (rid, value)).collect();
        out.sort_by_key(|(rid, _)| *rid);
        out
    }

    pub fn snapshot_star_tail(&self) -> Vec<i64> {
        let state = self.shared.state.lock().unwrap();
        let mut out: Vec<i64> = state.star_tail_record.iter().copied().collect();
        out.sort_unstable();
        out
    }
}
