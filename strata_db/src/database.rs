//! Database lifecycle and catalog persistence.
//!
//! A database is a directory. The `metadata` file carries a fixed header
//! (magic, version, table count), a bincode-encoded descriptor list, and a
//! crc32 trailer; each table directory carries its `schema` file, the
//! serialized primary index, and one `indirection.bin` per page range.
//! Durability is only guaranteed after a clean [`Database::close`]; there
//! is no write-ahead log and no crash recovery. Any I/O failure poisons
//! the database: queries start answering false/None and lifecycle calls
//! fail until it is reopened.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use groundwork::buffer_pool::BufferPool;
use groundwork::lock_manager::LockManager;
use groundwork::page_range::PageRange;
use groundwork::page_store::PageStore;
use groundwork::{StorageError, TableId, INDIRECTION_COLUMN, RECORDS_PER_RANGE};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::{DbError, Result};
use crate::table::Table;

const METADATA_MAGIC: &[u8; 4] = b"LSTR";
const METADATA_VERSION: u32 = 1;
const METADATA_HEADER_LEN: usize = 16;

/// Catalog entry persisted in the metadata file. Per-table layout lives in
/// the table's own schema file.
#[derive(Debug, Serialize, Deserialize)]
struct TableDescriptor {
    id: TableId,
    name: String,
}

/// A database instance rooted at one directory.
pub struct Database {
    path: PathBuf,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    next_table_id: AtomicU32,
    txn_ids: Arc<AtomicU64>,
    poisoned: Arc<AtomicBool>,
}

impl Database {
    /// Opens (or creates) a database with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let store = PageStore::new(&path);
        let db = Database {
            pool: Arc::new(BufferPool::new(store, config.buffer_pool_frames)),
            locks: Arc::new(LockManager::new()),
            tables: RwLock::new(HashMap::new()),
            next_table_id: AtomicU32::new(0),
            txn_ids: Arc::new(AtomicU64::new(1)),
            poisoned: Arc::new(AtomicBool::new(false)),
            path,
        };

        if db.path.join("metadata").exists() {
            db.load_catalog()?;
        }
        info!(path = %db.path.display(), tables = db.tables.read().len(), "database open");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(DbError::Poisoned);
        }
        Ok(())
    }

    /// Creates a table of `num_columns` signed 64-bit columns with the
    /// primary key at `key_column`.
    pub fn create_table(
        &self,
        name: &str,
        num_columns: usize,
        key_column: usize,
    ) -> Result<Arc<Table>> {
        self.ensure_usable()?;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(DbError::SchemaMismatch(format!("invalid table name {name:?}")));
        }
        if num_columns == 0 || num_columns > 64 {
            return Err(DbError::SchemaMismatch(format!(
                "{num_columns} columns (1..=64 supported)"
            )));
        }
        if key_column >= num_columns {
            return Err(DbError::SchemaMismatch(format!(
                "key column {key_column} out of range"
            )));
        }

        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }

        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        self.pool.store().register_table(id, name);
        fs::create_dir_all(self.pool.store().table_dir(id))?;

        let table = Arc::new(Table::new(
            name.to_string(),
            id,
            num_columns,
            key_column,
            self.pool.clone(),
            self.locks.clone(),
            self.txn_ids.clone(),
            self.poisoned.clone(),
        ));
        tables.insert(name.to_string(), table.clone());
        debug!(name, id, num_columns, key_column, "table created");
        Ok(table)
    }

    /// Drops a table and its on-disk data. False when it does not exist.
    pub fn drop_table(&self, name: &str) -> bool {
        let Some(table) = self.tables.write().remove(name) else {
            return false;
        };
        let id = table.id();
        let _ = self.pool.flush_table(id);
        let _ = fs::remove_dir_all(self.pool.store().table_dir(id));
        self.pool.store().unregister_table(id);
        debug!(name, id, "table dropped");
        true
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Flushes the buffer pool and persists the catalog. Durability is
    /// guaranteed only after this returns Ok.
    pub fn close(&self) -> Result<()> {
        self.ensure_usable()?;
        let outcome = self.persist();
        if let Err(e) = &outcome {
            if e.is_fatal() {
                self.poisoned.store(true, Ordering::Release);
            }
        }
        outcome
    }

    fn persist(&self) -> Result<()> {
        self.pool.flush_all()?;

        let tables = self.tables.read();
        for table in tables.values() {
            self.save_table(table)?;
        }
        self.write_metadata(&tables)?;

        let stats = self.pool.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            flushes = stats.flushes,
            "database closed"
        );
        Ok(())
    }

    // ---- persistence ----

    fn save_table(&self, table: &Table) -> Result<()> {
        let dir = self.pool.store().table_dir(table.id());

        // schema: fixed sequence of LE u64 values.
        let mut schema: Vec<u64> = vec![
            table.num_columns() as u64,
            table.key_column() as u64,
            table.next_rid_value(),
            table.range_count() as u64,
        ];
        let secondary = table.index().secondary_columns();
        schema.push(secondary.len() as u64);
        schema.extend(secondary.iter().map(|&c| c as u64));
        let mut bytes = Vec::with_capacity(schema.len() * 8);
        for value in schema {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        write_file_sync(&dir.join("schema"), &bytes)?;

        // index.pk: packed (key, rid) pairs.
        let entries = table.index().primary_entries();
        let mut bytes = Vec::with_capacity(8 + entries.len() * 16);
        bytes.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (key, rid) in entries {
            bytes.extend_from_slice(&key.to_le_bytes());
            bytes.extend_from_slice(&rid.to_le_bytes());
        }
        write_file_sync(&dir.join("index.pk"), &bytes)?;

        // indirection.bin per range: packed (rid, head) pairs.
        let snapshot = table.indirection_snapshot();
        for range in 0..table.range_count() as u32 {
            let lo = range as u64 * RECORDS_PER_RANGE as u64;
            let hi = lo + RECORDS_PER_RANGE as u64;
            let slice: Vec<&(u64, u64)> = snapshot
                .iter()
                .filter(|(rid, _)| *rid >= lo && *rid < hi)
                .collect();
            let mut bytes = Vec::with_capacity(8 + slice.len() * 16);
            bytes.extend_from_slice(&(slice.len() as u64).to_le_bytes());
            for (rid, head) in slice {
                bytes.extend_from_slice(&rid.to_le_bytes());
                bytes.extend_from_slice(&head.to_le_bytes());
            }
            let range_dir = self.pool.store().range_dir(table.id(), range);
            fs::create_dir_all(&range_dir)?;
            write_file_sync(&range_dir.join("indirection.bin"), &bytes)?;
        }
        Ok(())
    }

    fn write_metadata(&self, tables: &HashMap<String, Arc<Table>>) -> Result<()> {
        let mut descriptors: Vec<TableDescriptor> = tables
            .values()
            .map(|t| TableDescriptor {
                id: t.id(),
                name: t.name().to_string(),
            })
            .collect();
        descriptors.sort_by_key(|d| d.id);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(METADATA_MAGIC);
        bytes.extend_from_slice(&METADATA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(descriptors.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.next_table_id.load(Ordering::SeqCst).to_le_bytes());
        let payload = bincode::serialize(&descriptors)
            .map_err(|e| StorageError::Corrupted(format!("metadata encode: {e}")))?;
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&crc32fast::hash(&bytes).to_le_bytes());

        write_file_sync(&self.path.join("metadata"), &bytes)?;
        Ok(())
    }

    // ---- loading ----

    fn load_catalog(&self) -> Result<()> {
        let bytes = fs::read(self.path.join("metadata"))?;
        if bytes.len() < METADATA_HEADER_LEN + 4 {
            return Err(StorageError::Corrupted("metadata file truncated".into()).into());
        }
        if &bytes[..4] != METADATA_MAGIC {
            return Err(StorageError::Corrupted("bad metadata magic".into()).into());
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != METADATA_VERSION {
            return Err(
                StorageError::Corrupted(format!("unsupported metadata version {version}")).into(),
            );
        }
        let table_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let next_table_id = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        let body_end = bytes.len() - 4;
        let stored_crc = u32::from_le_bytes(bytes[body_end..].try_into().unwrap());
        if crc32fast::hash(&bytes[..body_end]) != stored_crc {
            return Err(StorageError::Corrupted("metadata checksum mismatch".into()).into());
        }

        let descriptors: Vec<TableDescriptor> =
            bincode::deserialize(&bytes[METADATA_HEADER_LEN..body_end])
                .map_err(|e| StorageError::Corrupted(format!("metadata decode: {e}")))?;
        if descriptors.len() != table_count as usize {
            return Err(StorageError::Corrupted("metadata table count mismatch".into()).into());
        }

        self.next_table_id.store(next_table_id, Ordering::SeqCst);
        for descriptor in descriptors {
            self.load_table(descriptor)?;
        }
        Ok(())
    }

    fn load_table(&self, descriptor: TableDescriptor) -> Result<()> {
        self.pool
            .store()
            .register_table(descriptor.id, &descriptor.name);
        let dir = self.pool.store().table_dir(descriptor.id);

        let schema = read_u64_file(&dir.join("schema"))?;
        if schema.len() < 5 {
            return Err(StorageError::Corrupted(format!(
                "schema file for {} truncated",
                descriptor.name
            ))
            .into());
        }
        let num_columns = schema[0] as usize;
        let key_column = schema[1] as usize;
        let next_rid = schema[2];
        let range_count = schema[3] as u32;
        let secondary_count = schema[4] as usize;
        if schema.len() < 5 + secondary_count {
            return Err(
                StorageError::Corrupted(format!("schema file for {} truncated", descriptor.name))
                    .into(),
            );
        }
        let secondary: Vec<usize> = schema[5..5 + secondary_count]
            .iter()
            .map(|&c| c as usize)
            .collect();

        let table = Table::new(
            descriptor.name.clone(),
            descriptor.id,
            num_columns,
            key_column,
            self.pool.clone(),
            self.locks.clone(),
            self.txn_ids.clone(),
            self.poisoned.clone(),
        );
        table.set_next_rid(next_rid);

        for range in 0..range_count {
            table.install_range(Arc::new(PageRange::recover(
                descriptor.id,
                range,
                num_columns,
                &self.pool,
            )?));
        }

        self.load_indirection(&table, range_count, next_rid)?;
        self.load_primary_index(&table, next_rid)?;
        for column in secondary {
            table.create_index(column)?;
        }

        debug!(name = %descriptor.name, rows = next_rid, ranges = range_count, "table loaded");
        self.tables
            .write()
            .insert(descriptor.name, Arc::new(table));
        Ok(())
    }

    /// Loads the per-range indirection files, falling back to the base
    /// pages' indirection column when a file is missing.
    fn load_indirection(&self, table: &Table, range_count: u32, next_rid: u64) -> Result<()> {
        for range in 0..range_count {
            let path = self
                .pool
                .store()
                .range_dir(table.id(), range)
                .join("indirection.bin");
            if path.exists() {
                let values = read_u64_file(&path)?;
                let count = *values.first().unwrap_or(&0) as usize;
                if values.len() < 1 + count * 2 {
                    return Err(
                        StorageError::Corrupted("indirection file truncated".into()).into()
                    );
                }
                table.load_indirection(
                    (0..count).map(|i| (values[1 + i * 2], values[2 + i * 2])),
                );
            } else {
                let lo = range as u64 * RECORDS_PER_RANGE as u64;
                let hi = (lo + RECORDS_PER_RANGE as u64).min(next_rid);
                let page_range = PageRange::recover(
                    table.id(),
                    range,
                    table.num_columns(),
                    &self.pool,
                )?;
                let mut entries = Vec::new();
                for rid in lo..hi {
                    let head =
                        page_range.read_base_meta(&self.pool, rid, INDIRECTION_COLUMN)?;
                    entries.push((rid, head));
                }
                table.load_indirection(entries);
            }
        }
        Ok(())
    }

    /// Loads the serialized primary index, or rebuilds it by scanning the
    /// base records when the file is missing.
    fn load_primary_index(&self, table: &Table, next_rid: u64) -> Result<()> {
        let path = self.pool.store().table_dir(table.id()).join("index.pk");
        if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.len() < 8 {
                return Err(StorageError::Corrupted("index.pk truncated".into()).into());
            }
            let count = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
            if bytes.len() < 8 + count * 16 {
                return Err(StorageError::Corrupted("index.pk truncated".into()).into());
            }
            for i in 0..count {
                let offset = 8 + i * 16;
                let key = i64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
                let rid = u64::from_le_bytes(bytes[offset + 8..offset + 16].try_into().unwrap());
                table.index().insert_entry(table.key_column(), key, rid);
            }
            return Ok(());
        }

        debug!(table = table.name(), "index.pk missing; rebuilding from base pages");
        for rid in 0..next_rid {
            if let Some(key) = table.read_key(rid)? {
                table.index().insert_entry(table.key_column(), key, rid);
            }
        }
        Ok(())
    }
}

fn write_file_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_u64_file(path: &Path) -> Result<Vec<u64>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(StorageError::Corrupted(format!(
            "{} is not a whole number of u64s",
            path.display()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use tempfile::tempdir;

    #[test]
    fn create_get_drop() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let table = db.create_table("grades", 5, 0).unwrap();
        assert_eq!(table.num_columns(), 5);
        assert!(db.get_table("grades").is_some());
        assert!(db.get_table("missing").is_none());

        assert!(db.drop_table("grades"));
        assert!(!db.drop_table("grades"));
        assert!(db.get_table("grades").is_none());
    }

    #[test]
    fn duplicate_table_name_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.create_table("t", 2, 0).unwrap();
        assert!(matches!(
            db.create_table("t", 2, 0),
            Err(DbError::TableExists(_))
        ));
    }

    #[test]
    fn invalid_schemas_are_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert!(matches!(
            db.create_table("t", 0, 0),
            Err(DbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            db.create_table("t", 2, 5),
            Err(DbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            db.create_table("a/b", 2, 0),
            Err(DbError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn close_then_open_restores_rows_and_indexes() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            let table = db.create_table("t", 3, 0).unwrap();
            let query = Query::new(table);
            assert!(query.insert(&[1, 10, 100]));
            assert!(query.insert(&[2, 20, 200]));
            assert!(query.update(2, &[None, Some(21), None]));
            db.close().unwrap();
        }

        let db = Database::open(dir.path()).unwrap();
        let table = db.get_table("t").unwrap();
        let query = Query::new(table);

        let rows = query.select(2, 0, &[true, true, true]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec![2, 21, 200]);
        assert_eq!(query.sum(1, 2, 1), Some(10 + 21));
    }

    #[test]
    fn reopen_preserves_table_ids_for_new_tables() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.create_table("a", 2, 0).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        let b = db.create_table("b", 2, 0).unwrap();
        let a = db.get_table("a").unwrap();
        assert_ne!(a.id(), b.id());
    }
}
