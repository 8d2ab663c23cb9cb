//! On-disk page files and the database directory layout.
//!
//! Every page is its own file under the database root:
//!
//! ```text
//! <root>/<table>/pr_<range>/base_<col>_<p>.bin
//! <root>/<table>/pr_<range>/tail_<col>_<p>.bin
//! ```
//!
//! Reads of a file that does not exist yet yield a fresh empty page; writes
//! store the full block and sync it. Table ids are mapped to directory
//! names explicitly so that multiple stores can coexist in one process.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::page::{Page, PageKind};
use crate::{PAGE_BLOCK_SIZE, TableId};

/// Identity of a page: which table, range, column, segment, and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table: TableId,
    pub range: u32,
    pub column: u16,
    pub kind: PageKind,
    pub index: u32,
}

impl PageKey {
    pub fn base(table: TableId, range: u32, column: u16, index: u32) -> Self {
        PageKey {
            table,
            range,
            column,
            kind: PageKind::Base,
            index,
        }
    }

    pub fn tail(table: TableId, range: u32, column: u16, index: u32) -> Self {
        PageKey {
            table,
            range,
            column,
            kind: PageKind::Tail,
            index,
        }
    }
}

/// Maps page identities to files under the database root.
pub struct PageStore {
    root: PathBuf,
    table_dirs: RwLock<HashMap<TableId, String>>,
}

impl PageStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        PageStore {
            root: root.as_ref().to_path_buf(),
            table_dirs: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Associates a table id with its directory name. Must be called before
    /// any page of that table is read or written.
    pub fn register_table(&self, table: TableId, dir_name: &str) {
        self.table_dirs
            .write()
            .insert(table, dir_name.to_string());
    }

    pub fn unregister_table(&self, table: TableId) {
        self.table_dirs.write().remove(&table);
    }

    /// Directory holding one table's ranges and catalog files.
    pub fn table_dir(&self, table: TableId) -> PathBuf {
        let dirs = self.table_dirs.read();
        let name = dirs.get(&table).expect("table not registered");
        self.root.join(name)
    }

    /// Directory holding one page range's files.
    pub fn range_dir(&self, table: TableId, range: u32) -> PathBuf {
        self.table_dir(table).join(format!("pr_{range}"))
    }

    fn page_path(&self, key: &PageKey) -> PathBuf {
        let prefix = match key.kind {
            PageKind::Base => "base",
            PageKind::Tail => "tail",
        };
        self.range_dir(key.table, key.range)
            .join(format!("{prefix}_{}_{}.bin", key.column, key.index))
    }

    /// Reads a page from disk, or returns an empty page if it was never
    /// written.
    pub fn read_page(&self, key: &PageKey) -> Result<Page> {
        let path = self.page_path(key);
        if !path.exists() {
            return Ok(Page::new());
        }
        let mut file = File::open(&path)?;
        let mut block = [0u8; PAGE_BLOCK_SIZE];
        file.read_exact(&mut block)?;
        Page::from_block(&block)
    }

    /// Writes a page block and syncs it to disk.
    pub fn write_page(&self, key: &PageKey, page: &Page) -> Result<()> {
        let path = self.page_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&page.to_block())?;
        file.sync_all()?;
        debug!(?key, "page written");
        Ok(())
    }

    /// Number of tail pages ever written for a range, probed from the
    /// column-0 files. Used to recover tail allocation state on open.
    pub fn count_tail_pages(&self, table: TableId, range: u32) -> u32 {
        let dir = self.range_dir(table, range);
        let mut count = 0;
        while dir.join(format!("tail_0_{count}.bin")).exists() {
            count += 1;
        }
        count
    }
}
