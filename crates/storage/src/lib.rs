//! Fixed-width page storage and its on-disk layout.
//!
//! A [`Page`] is a flat byte buffer holding up to `page_size / 8` big-endian
//! signed 64-bit cells plus an in-memory record count. [`DiskManager`] maps
//! `(table, area, column, page_index)` onto two files per page: `<n>.bin`
//! (raw page bytes) and `<n>.cnt` (ASCII record count).


use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use common::{CELL_SIZE, DbError, DbResult};

/// Default page size in bytes, matching `EngineConfig::page_size`'s default.
pub const PAGE_SIZE: usize = 4096;

/// A single fixed-width column page: `page_size / 8` 64-bit cells.
///
/// Values are stored big-endian. A null cell is eight zero bytes;
/// nullability for a given offset is tracked out-of-band (page-directory
/// mark, or tail schema encoding) — `Page` itself only refuses to `read`
/// past `num_records`.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    num_records: usize,
}

impl Page {
    /// A fresh, zero-filled page sized for `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size],
            num_records: 0,
        }
    }

    /// Rehydrate a page from disk bytes, padding/clipping to `page_size` and
    /// clamping `num_records` to `[0, capacity]`. Mirrors the buffer pool's
    /// load-from-disk compensation for short reads.
    pub fn from_parts(mut data: Vec<u8>, num_records: usize, page_size: usize) -> Self {
        data.resize(page_size, 0);
        let capacity = page_size / CELL_SIZE;
        Self {
            data,
            num_records: num_records.min(capacity),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn set_num_records(&mut self, n: usize) {
        self.num_records = n.min(self.capacity());
    }

    pub fn capacity(&self) -> usize {
        self.data.len() / CELL_SIZE
    }

    pub fn has_capacity(&self) -> bool {
        self.num_records < self.capacity()
    }

    fn cell_range(offset: usize) -> std::ops::Range<usize> {
        offset * CELL_SIZE..offset * CELL_SIZE + CELL_SIZE
    }

    /// Append a value (or null), returning its offset, or `None` if full.
    pub fn append(&mut self, value: Option<i64>) -> Option<u16> {
        if !self.has_capacity() {
            return None;
        }
        let offset = self.num_records;
        let range = Self::cell_range(offset);
        match value {
            Some(v) => self.data[range].copy_from_slice(&v.to_be_bytes()),
            None => self.data[range].fill(0),
        }
        self.num_records += 1;
        Some(offset as u16)
    }

    /// Read the raw value at `offset`; `None` if `offset` is out of range.
    ///
    /// A null cell is physically eight zero bytes, indistinguishable here
    /// from a stored `0`; callers must consult the page-directory mark or
    /// tail schema encoding before calling `read` to know whether the cell
    /// is logically null.
    pub fn read(&self, offset: u16) -> Option<i64> {
        let offset = offset as usize;
        if offset >= self.num_records {
            return None;
        }
        let range = Self::cell_range(offset);
        let bytes: [u8; CELL_SIZE] = self.data[range].try_into().unwrap();
        Some(i64::from_be_bytes(bytes))
    }

    /// Overwrite the value at `offset`; `false` if out of range.
    pub fn update(&mut self, offset: u16, value: Option<i64>) -> bool {
        let offset_usize = offset as usize;
        if offset_usize >= self.num_records {
            return false;
        }
        let range = Self::cell_range(offset_usize);
        match value {
            Some(v) => self.data[range].copy_from_slice(&v.to_be_bytes()),
            None => self.data[range].fill(0),
        }
        true
    }
}

/// Rooted, file-per-column persistence layer for base and tail pages.
///
/// Physical layout per table `T`: `T/<base|tail>/<col>/<page_index>.bin`
/// for raw page bytes, `.cnt` for the ASCII record count.
#[derive(Debug)]
pub struct DiskManager {
    root: PathBuf,
}

impl DiskManager {
    pub fn new(root: impl Into<PathBuf>) -> DbResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn area_dir(is_tail: bool) -> &'static str {
        if is_tail { "tail" } else { "base" }
    }

    fn col_dir(&self, table: &str, is_tail: bool, column: usize) -> PathBuf {
        self.root
            .join(table)
            .join(Self::area_dir(is_tail))
            .join(column.to_string())
    }

    fn bin_path(&self, table: &str, is_tail: bool, column: usize, page_index: u64) -> PathBuf {
        self.col_dir(table, is_tail, column)
            .join(format!("{page_index}.bin"))
    }

    fn cnt_path(&self, table: &str, is_tail: bool, column: usize, page_index: u64) -> PathBuf {
        self.col_dir(table, is_tail, column)
            .join(format!("{page_index}.cnt"))
    }

    /// Atomically create/truncate both files for a page, padding/clipping
    /// `bytes` to exactly `page_size`.
    pub fn write_page(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
        bytes: &[u8],
        page_size: usize,
        num_records: usize,
    ) -> DbResult<()> {
        let dir = self.col_dir(table, is_tail, column);
        fs::create_dir_all(&dir)?;

        let mut payload = bytes.to_vec();
        payload.resize(page_size, 0);
        let mut bin = File::create(self.bin_path(table, is_tail, column, page_index))?;
        bin.write_all(&payload)?;

        let mut cnt = File::create(self.cnt_path(table, is_tail, column, page_index))?;
        write!(cnt, "{num_records}")?;
        Ok(())
    }

    /// Read raw page bytes, or `None` if the file does not exist.
    pub fn read_page(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
    ) -> DbResult<Option<Vec<u8>>> {
        let path = self.bin_path(table, is_tail, column, page_index);
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Record count for a page; absent or empty file reads as `0`.
    pub fn read_page_count(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
    ) -> DbResult<usize> {
        let path = self.cnt_path(table, is_tail, column, page_index);
        if !path.exists() {
            return Ok(0);
        }
        let s = fs::read_to_string(path)?;
        let s = s.trim();
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<usize>()
            .map_err(|e| DbError::Storage(format!("invalid page count: {e}")))
    }

    /// Remove both files for a page, if present.
    pub fn delete_page(
        &self,
        table: &str,
        is_tail: bool,
        column: usize,
        page_index: u64,
    ) -> DbResult<()> {
        for path in [
            self.bin_path(table, is_tail, column, page_index),
            self.cnt_path(table, is_tail, column, page_index),
        ] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// List the page indices present for a given table/area/column, sorted.
    /// Used by `Database::open` to rebuild page cursors from disk.
    pub fn list_page_indices(&self, table: &str, is_tail: bool, column: usize) -> Vec<u64> {
        let dir = self.col_dir(table, is_tail, column);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut indices: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".bin")?.parse::<u64>().ok()
            })
            .collect();
        indices.sort_unstable();
        indices
    }
}
