//! Top-level database handle: opens/closes a rooted directory of tables,
//! persisting and reloading each table's page directory across restarts.


use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};

use buffer::BufferPool;
use common::{DbError, DbResult, EngineConfig};
use engine::{
    CellLoc, Directory, Mark, Table, INDIRECTION_COLUMN, METADATA_COLUMNS, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN,
};

type Map<K, V> = HashMap<K, V, RandomState>;

const METADATA_FILE: &str = "metadata.txt";
const PAGE_DIRECTORY_FILE: &str = "page_directory.txt";
const TPS_FILE: &str = "tps.txt";
const STAR_TAIL_FILE: &str = "star_tail.txt";

fn mark_char(mark: Mark) -> char {
    match mark {
        Mark::Base => 'B',
        Mark::Tail => 'T',
        Mark::Null => 'N',
    }
}

fn char_mark(c: char) -> DbResult<Mark> {
    match c {
        'B' => Ok(Mark::Base),
        'T' => Ok(Mark::Tail),
        'N' => Ok(Mark::Null),
        other => Err(DbError::Storage(format!("unknown directory mark {other:?}"))),
    }
}

/// A rooted collection of tables, backed by one shared buffer pool.
///
/// Mirrors a filesystem layout of `<root>/<table>/{metadata,page_directory,
/// tps,star_tail}.txt` plus `<root>/<table>/{base,tail}/<col>/<page>.{bin,cnt}`.
pub struct Database {
    root: PathBuf,
    config: EngineConfig,
    bufferpool: Option<Arc<Mutex<BufferPool>>>,
    tables: Vec<Table>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            root: PathBuf::new(),
            config: EngineConfig::default(),
            bufferpool: None,
            tables: Vec::new(),
        }
    }

    /// Open (or create) a database rooted at `path`. Existing tables are
    /// reloaded: warm via their persisted page directory when present,
    /// cold via a raw-page scan otherwise.
    pub fn open(&mut self, path: impl AsRef<Path>, config: EngineConfig) -> DbResult<()> {
        let path = path.as_ref();
        let already_existed = path.exists();
        self.root = path.to_path_buf();
        self.config = config;
        self.bufferpool = Some(Arc::new(Mutex::new(BufferPool::new(
            path,
            config.buffer_pool_frames,
            config.page_size,
        )?)));
        self.tables.clear();

        if !already_existed {
            return Ok(());
        }

        let mut table_names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(METADATA_FILE).exists() {
                table_names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        table_names.sort();
        for name in table_names {
            self.load_table(&name)?;
        }
        Ok(())
    }

    /// Shut down every table's background merge worker, fold any
    /// outstanding merge jobs, flush all dirty pages, and persist each
    /// table's directory/TPS/star-tail bookkeeping to disk.
    pub fn close(&mut self) -> DbResult<()> {
        for table in &self.tables {
            table.shutdown();
            table.apply_pending_merges_foreground()?;
        }
        if let Some(bp) = &self.bufferpool {
            bp.lock().unwrap().flush_all(None)?;
        }
        for table in &self.tables {
            self.save_table(table)?;
        }
        Ok(())
    }

    pub fn create_table(&mut self, name: impl Into<String>, num_columns: usize, key: usize) -> Table {
        let name = name.into();
        if let Some(existing) = self.get_table(&name) {
            return existing;
        }
        let bufferpool = self.bufferpool.clone().expect("database not open");
        let table = Table::new(name, num_columns, key, self.config, bufferpool);
        self.tables.push(table.clone());
        table
    }

    /// Removes the oldest table registered under `name`, in-memory only
    /// (its persisted files are left on disk, as the reference does).
    pub fn drop_table(&mut self, name: &str) -> bool {
        if let Some(pos) = self.tables.iter().position(|t| t.name() == name) {
            self.tables.remove(pos);
            true
        } else {
            false
        }
    }

    /// Returns the most recently created/loaded table with this name.
    pub fn get_table(&self, name: &str) -> Option<Table> {
        self.tables.iter().rev().find(|t| t.name() == name).cloned()
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    // ---- save ----

    fn save_table(&self, table: &Table) -> DbResult<()> {
        let dir = self.table_dir(table.name());
        fs::create_dir_all(&dir)?;

        fs::write(
            dir.join(METADATA_FILE),
            format!(
                "{}\n{}\n{}\n{}\n",
                table.num_columns(),
                table.key(),
                table.next_base_rid(),
                table.next_tail_rid()
            ),
        )?;

        let mut pd = String::new();
        for (rid, directory) in table.snapshot_page_directory() {
            let parts: Vec<String> = directory
                .iter()
                .map(|loc| {
                    let offset = loc.offset.map(|o| o as i64).unwrap_or(-1);
                    format!(
                        "{},{},{},{},{}",
                        mark_char(loc.mark),
                        loc.column,
                        loc.range,
                        loc.page,
                        offset
                    )
                })
                .collect();
            pd.push_str(&format!("{rid}|{}\n", parts.join(";")));
        }
        fs::write(dir.join(PAGE_DIRECTORY_FILE), pd)?;

        let mut tps = String::new();
        for (rid, value) in table.snapshot_tps() {
            let value_str = value.map(|v| v.to_string()).unwrap_or_else(|| "N".to_string());
            tps.push_str(&format!("{rid}|{value_str}\n"));
        }
        fs::write(dir.join(TPS_FILE), tps)?;

        let mut star = String::new();
        for rid in table.snapshot_star_tail() {
            star.push_str(&format!("{rid}\n"));
        }
        fs::write(dir.join(STAR_TAIL_FILE), star)?;

        Ok(())
    }

    // ---- load ----

    fn load_table(&mut self, name: &str) -> DbResult<()> {
        let dir = self.table_dir(name);
        let meta = fs::read_to_string(dir.join(METADATA_FILE))?;
        let mut lines = meta.lines();
        let parse_line = |lines: &mut std::str::Lines, field: &str| -> DbResult<i64> {
            lines
                .next()
                .ok_or_else(|| DbError::Storage(format!("{name}: metadata missing {field}")))?
                .trim()
                .parse::<i64>()
                .map_err(|e| DbError::Storage(format!("{name}: bad {field}: {e}")))
        };
        let num_columns = parse_line(&mut lines, "num_columns")? as usize;
        let key = parse_line(&mut lines, "key")? as usize;
        let next_base_rid = parse_line(&mut lines, "next_base_rid")?;
        let next_tail_rid = parse_line(&mut lines, "next_tail_rid")?;

        let bufferpool = self.bufferpool.clone().expect("database not open");
        let table = Table::from_metadata(
            name,
            num_columns,
            key,
            next_base_rid,
            next_tail_rid,
            self.config,
            bufferpool.clone(),
        );
        let total_columns = METADATA_COLUMNS + num_columns;

        let base_cursor = self.scan_page_cursor(name, false, total_columns);
        let next_base_counter: Vec<u64> = base_cursor.iter().map(|&c| c + 1).collect();
        let current_base_page_index = base_cursor;
        let next_tail_page_index: Vec<u64> = self
            .scan_page_cursor(name, true, total_columns)
            .into_iter()
            .map(|c| c + 1)
            .collect();

        let pd_path = dir.join(PAGE_DIRECTORY_FILE);
        if pd_path.exists() {
            self.load_table_warm(
                table,
                &pd_path,
                &dir,
                total_columns,
                current_base_page_index,
                next_base_counter,
                next_tail_page_index,
            )
        } else {
            self.load_table_cold(
                table,
                num_columns,
                total_columns,
                next_base_rid,
                current_base_page_index,
                next_base_counter,
                next_tail_page_index,
            )
        }
    }

    /// For each column, the largest existing page index on disk (or `0` if
    /// none exist yet) — mirrors the reference's sparse `while len(...) <=
    /// page_index: append(None)` padding, without materializing the gaps.
    fn scan_page_cursor(&self, table: &str, is_tail: bool, total_columns: usize) -> Vec<u64> {
        let bufferpool = self.bufferpool.as_ref().unwrap().lock().unwrap();
        let disk = bufferpool.disk_manager();
        (0..total_columns)
            .map(|col| {
                disk.list_page_indices(table, is_tail, col)
                    .last()
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn read_raw_cell(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
        offset: u16,
    ) -> DbResult<Option<i64>> {
        let mut bufferpool = self.bufferpool.as_ref().unwrap().lock().unwrap();
        let key = buffer::PageKey::new(table, is_tail, column, page_index);
        let value = match bufferpool.fetch_page(&key, true)? {
            Some(frame) => frame.page.read(offset),
            None => None,
        };
        bufferpool.unpin(&key);
        Ok(value)
    }

    fn read_raw_page_num_records(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
    ) -> DbResult<usize> {
        let mut bufferpool = self.bufferpool.as_ref().unwrap().lock().unwrap();
        let key = buffer::PageKey::new(table, is_tail, column, page_index);
        let n = match bufferpool.fetch_page(&key, true)? {
            Some(frame) => frame.page.num_records(),
            None => 0,
        };
        bufferpool.unpin(&key);
        Ok(n)
    }

    #[allow(clippy::too_many_arguments)]
    fn load_table_warm(
        &mut self,
        table: Table,
        pd_path: &Path,
        dir: &Path,
        total_columns: usize,
        current_base_page_index: Vec<u64>,
        next_base_page_index: Vec<u64>,
        next_tail_page_index: Vec<u64>,
    ) -> DbResult<()> {
        let name = table.name().to_string();
        let contents = fs::read_to_string(pd_path)?;
        let mut page_directory: Map<i64, Directory> = Map::default();
        let mut base_rids: HashSet<i64> = HashSet::new();
        let mut range_to_tail_pages: Map<u64, HashSet<u64>> = Map::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((rid_str, payload)) = line.split_once('|') else {
                continue;
            };
            let rid: i64 = rid_str
                .parse()
                .map_err(|e| DbError::Storage(format!("{name}: bad rid {rid_str}: {e}")))?;

            let mut entries = Vec::with_capacity(total_columns);
            for token in payload.split(';') {
                let fields: Vec<&str> = token.split(',').collect();
                if fields.len() != 5 {
                    continue;
                }
                let mark = char_mark(fields[0].chars().next().unwrap_or('N'))?;
                let column: usize = fields[1]
                    .parse()
                    .map_err(|e| DbError::Storage(format!("{name}: bad column: {e}")))?;
                let range: u64 = fields[2]
                    .parse()
                    .map_err(|e| DbError::Storage(format!("{name}: bad range: {e}")))?;
                let page: u64 = fields[3]
                    .parse()
                    .map_err(|e| DbError::Storage(format!("{name}: bad page: {e}")))?;
                let offset_raw: i64 = fields[4]
                    .parse()
                    .map_err(|e| DbError::Storage(format!("{name}: bad offset: {e}")))?;
                let offset = if offset_raw < 0 { None } else { Some(offset_raw as u16) };
                entries.push(CellLoc::new(mark, column, range, page, offset));
            }
            if entries.len() != total_columns {
                continue;
            }

            if rid > 0 {
                base_rids.insert(rid);
            } else {
                let rid_loc = entries[RID_COLUMN];
                range_to_tail_pages.entry(rid_loc.range).or_default().insert(rid_loc.page);
            }
            page_directory.insert(rid, entries);
        }

        let tps = self.load_tps(dir)?;
        let star_tail_record = self.load_star_tail(dir)?;
        let tail_range_pages = register_existing_tail_pages(range_to_tail_pages, total_columns);

        table.bootstrap(
            page_directory,
            base_rids,
            tps,
            star_tail_record,
            tail_range_pages,
            current_base_page_index,
            next_base_page_index,
            next_tail_page_index,
        );
        table.rebuild_primary_index()?;
        self.tables.push(table);
        Ok(())
    }

    fn load_tps(&self, dir: &Path) -> DbResult<Map<i64, Option<i64>>> {
        let path = dir.join(TPS_FILE);
        if !path.exists() {
            return Ok(Map::default());
        }
        let mut tps = Map::default();
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((rid_str, value_str)) = line.split_once('|') else {
                continue;
            };
            let rid: i64 = rid_str
                .parse()
                .map_err(|e| DbError::Storage(format!("bad tps rid: {e}")))?;
            let value = if value_str == "N" {
                None
            } else {
                Some(
                    value_str
                        .parse::<i64>()
                        .map_err(|e| DbError::Storage(format!("bad tps value: {e}")))?,
                )
            };
            tps.insert(rid, value);
        }
        Ok(tps)
    }

    fn load_star_tail(&self, dir: &Path) -> DbResult<HashSet<i64>> {
        let path = dir.join(STAR_TAIL_FILE);
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let mut set = HashSet::new();
        for line in fs::read_to_string(path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            set.insert(
                line.parse::<i64>()
                    .map_err(|e| DbError::Storage(format!("bad star_tail rid: {e}")))?,
            );
        }
        Ok(set)
    }

    /// No persisted directory: reconstruct base and tail rows by scanning
    /// raw pages directly, the way the original falls back when
    /// `page_directory.txt` is absent.
    #[allow(clippy::too_many_arguments)]
    fn load_table_cold(
        &mut self,
        table: Table,
        num_columns: usize,
        total_columns: usize,
        next_base_rid: i64,
        current_base_page_index: Vec<u64>,
        next_base_page_index: Vec<u64>,
        next_tail_page_index: Vec<u64>,
    ) -> DbResult<()> {
        let name = table.name().to_string();
        let records_per_page = self.config.records_per_page() as u64;
        let base_pages_per_range = self.config.base_pages_per_range;

        let mut page_directory: Map<i64, Directory> = Map::default();
        let mut base_rids: HashSet<i64> = HashSet::new();

        for rid in 1..next_base_rid {
            let offset_in_record = (rid - 1) as u64;
            let page_index = offset_in_record / records_per_page;
            let offset_in_page = (offset_in_record % records_per_page) as u16;

            let rid_value =
                self.read_raw_cell(&name, false, RID_COLUMN, page_index, offset_in_page)?;
            if rid_value.is_none() || rid_value == Some(0) {
                continue;
            }

            let indirection_value =
                self.read_raw_cell(&name, false, INDIRECTION_COLUMN, page_index, offset_in_page)?;
            let range_index = page_index / base_pages_per_range;

            let mut entries = Vec::with_capacity(total_columns);
            for col in 0..total_columns {
                let mark = if col == INDIRECTION_COLUMN {
                    match indirection_value {
                        None | Some(0) => Mark::Null,
                        _ => Mark::Base,
                    }
                } else {
                    Mark::Base
                };
                entries.push(CellLoc::new(mark, col, range_index, page_index, Some(offset_in_page)));
            }
            page_directory.insert(rid, entries);
            base_rids.insert(rid);
        }

        let max_se = (1i64 << num_columns) - 1;
        let mut tail_entries: Vec<(i64, u64, u16, Option<i64>, i64)> = Vec::new();
        for &page_index in &self.scan_existing_tail_pages(&name, RID_COLUMN) {
            let num_records =
                self.read_raw_page_num_records(&name, true, RID_COLUMN, page_index)?;
            for offset_in_page in 0..num_records as u16 {
                let Some(rid) = self.read_raw_cell(&name, true, RID_COLUMN, page_index, offset_in_page)?
                else {
                    continue;
                };
                if rid == 0 {
                    continue;
                }
                let indirection_value =
                    self.read_raw_cell(&name, true, INDIRECTION_COLUMN, page_index, offset_in_page)?;
                let se = self
                    .read_raw_cell(&name, true, SCHEMA_ENCODING_COLUMN, page_index, offset_in_page)?
                    .unwrap_or(0);
                tail_entries.push((rid, page_index, offset_in_page, indirection_value, se));
            }
        }
        tail_entries.sort_by_key(|e| std::cmp::Reverse(e.0));

        let mut tail_range: Map<i64, u64> = Map::default();
        let mut range_to_tail_pages: Map<u64, HashSet<u64>> = Map::default();
        let mut star_tail_record: HashSet<i64> = HashSet::new();

        for (rid, page_index, offset_in_page, indirection_value, se) in tail_entries {
            let range_index = match indirection_value {
                None | Some(0) => 0,
                Some(v) if v > 0 => match page_directory.get(&v) {
                    Some(dir) => dir[RID_COLUMN].range,
                    None => (v - 1) as u64 / (base_pages_per_range * records_per_page),
                },
                Some(v) => tail_range.get(&v).copied().unwrap_or_else(|| {
                    page_directory.get(&v).map(|d| d[RID_COLUMN].range).unwrap_or(0)
                }),
            };
            tail_range.insert(rid, range_index);
            range_to_tail_pages.entry(range_index).or_default().insert(page_index);

            let mut entries = Vec::with_capacity(total_columns);
            let indirection_mark = match indirection_value {
                None | Some(0) => Mark::Null,
                _ => Mark::Tail,
            };
            entries.push(CellLoc::new(
                indirection_mark,
                INDIRECTION_COLUMN,
                range_index,
                page_index,
                Some(offset_in_page),
            ));
            for col in 1..METADATA_COLUMNS {
                entries.push(CellLoc::new(Mark::Tail, col, range_index, page_index, Some(offset_in_page)));
            }
            for j in 0..num_columns {
                let bit = 1i64 << (num_columns - 1 - j);
                let col_index = METADATA_COLUMNS + j;
                let mark = if se & bit == 0 { Mark::Null } else { Mark::Tail };
                entries.push(CellLoc::new(mark, col_index, range_index, page_index, Some(offset_in_page)));
            }

            page_directory.insert(rid, entries);
            if se == max_se && matches!(indirection_value, Some(v) if v > 0) {
                star_tail_record.insert(rid);
            }
        }

        let tail_range_pages = register_existing_tail_pages(range_to_tail_pages, total_columns);

        table.bootstrap(
            page_directory,
            base_rids,
            Map::default(),
            star_tail_record,
            tail_range_pages,
            current_base_page_index,
            next_base_page_index,
            next_tail_page_index,
        );
        table.rebuild_primary_index()?;
        self.tables.push(table);
        Ok(())
    }

    fn scan_existing_tail_pages(&self, table: &str, column: usize) -> Vec<u64> {
        let bufferpool = self.bufferpool.as_ref().unwrap().lock().unwrap();
        bufferpool.disk_manager().list_page_indices(table, true, column)
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

/// Groups discovered tail page indices by range into the per-column
/// structure `Table::bootstrap` expects; every column shares the same
/// page-index list for a range since tail writes proceed in lockstep.
fn register_existing_tail_pages(
    range_to_pages: Map<u64, HashSet<u64>>,
    total_columns: usize,
) -> Map<u64, Vec<Vec<u64>>> {
    if range_to_pages.is_empty() {
        // No tail pages exist on disk for this table yet: pre-register
        // page 0 of range 0 for every column, exactly as a brand-new
        // table does, so the first tail page allocated after reload is
        // reused rather than counted as newly created.
        return Map::from_iter([(0, vec![vec![0]; total_columns])]);
    }
    let mut out: Map<u64, Vec<Vec<u64>>> = Map::default();
    for (range, pages) in range_to_pages {
        let mut sorted: Vec<u64> = pages.into_iter().collect();
        sorted.sort_unstable();
        out.insert(range, vec![sorted; total_columns]);
    }
    out
}
