//! The buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! Frames are handed out pinned behind an RAII guard; dropping the guard
//! unpins the frame and refreshes its LRU stamp. Eviction picks the least
//! recently released unpinned frame and writes it back first when dirty.
//! When every frame is pinned the pool reports exhaustion and the caller
//! yields and retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::page_store::{PageKey, PageStore};
use crate::TableId;

/// A single frame in the buffer pool.
struct Frame {
    page: RwLock<Page>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    /// Stamp of the most recent release; orders LRU eviction.
    last_released: AtomicU64,
}

impl Frame {
    fn new() -> Self {
        Frame {
            page: RwLock::new(Page::new()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            last_released: AtomicU64::new(0),
        }
    }
}

/// Bookkeeping guarded by the pool mutex.
struct PoolState {
    page_table: HashMap<PageKey, usize>,
    frame_keys: Vec<Option<PageKey>>,
    free_list: Vec<usize>,
}

/// Counters exposed for tests and close-time logging.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

/// The buffer pool manager.
pub struct BufferPool {
    store: PageStore,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    stamp: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// An RAII guard over a pinned frame.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    frame_idx: usize,
}

impl<'a> PageGuard<'a> {
    /// Shared access to the page data.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame_idx].page.read()
    }

    /// Exclusive access to the page data; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let frame = &self.pool.frames[self.frame_idx];
        frame.dirty.store(true, Ordering::Release);
        frame.page.write()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        let frame = &self.pool.frames[self.frame_idx];
        frame
            .last_released
            .store(self.pool.next_stamp(), Ordering::Release);
        frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BufferPool {
    pub fn new(store: PageStore, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        let frames = (0..capacity).map(|_| Frame::new()).collect();
        let state = PoolState {
            page_table: HashMap::with_capacity(capacity),
            frame_keys: vec![None; capacity],
            free_list: (0..capacity).rev().collect(),
        };
        BufferPool {
            store,
            frames,
            state: Mutex::new(state),
            stamp: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of pages currently resident. Never exceeds `capacity`.
    pub fn resident_pages(&self) -> usize {
        self.state.lock().page_table.len()
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.stamp.fetch_add(1, Ordering::Relaxed)
    }

    /// Pins the page, loading it from disk on a miss. Fails with
    /// [`StorageError::PoolExhausted`] when no frame can be freed.
    pub fn get(&self, key: PageKey) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(&idx) = state.page_table.get(&key) {
            self.frames[idx].pin_count.fetch_add(1, Ordering::AcqRel);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageGuard {
                pool: self,
                frame_idx: idx,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let idx = match state.free_list.pop() {
            Some(idx) => idx,
            None => self.evict_lru(&mut state)?,
        };

        match self.store.read_page(&key) {
            Ok(page) => {
                let frame = &self.frames[idx];
                *frame.page.write() = page;
                frame.dirty.store(false, Ordering::Release);
                frame.pin_count.store(1, Ordering::Release);
                state.page_table.insert(key, idx);
                state.frame_keys[idx] = Some(key);
                Ok(PageGuard {
                    pool: self,
                    frame_idx: idx,
                })
            }
            Err(e) => {
                state.free_list.push(idx);
                Err(e)
            }
        }
    }

    /// Like [`get`](Self::get), but yields and retries while the pool is
    /// exhausted. Engine-internal callers use this so transient pin
    /// pressure never surfaces.
    pub fn get_blocking(&self, key: PageKey) -> Result<PageGuard<'_>> {
        const MAX_SPINS: usize = 10_000;
        for _ in 0..MAX_SPINS {
            match self.get(key) {
                Err(e) if e.is_retryable() => std::thread::yield_now(),
                other => return other,
            }
        }
        Err(StorageError::PoolExhausted)
    }

    /// Selects the least recently released unpinned frame, writing it back
    /// first when dirty. Caller holds the state lock.
    fn evict_lru(&self, state: &mut PoolState) -> Result<usize> {
        let mut victim: Option<(usize, u64)> = None;
        for (idx, frame) in self.frames.iter().enumerate() {
            if state.frame_keys[idx].is_none() {
                continue;
            }
            if frame.pin_count.load(Ordering::Acquire) != 0 {
                continue;
            }
            let stamp = frame.last_released.load(Ordering::Acquire);
            if victim.map_or(true, |(_, best)| stamp < best) {
                victim = Some((idx, stamp));
            }
        }

        let (idx, _) = victim.ok_or(StorageError::PoolExhausted)?;
        let key = state.frame_keys[idx].expect("victim frame has a key");
        let frame = &self.frames[idx];

        if frame.dirty.swap(false, Ordering::AcqRel) {
            let page = frame.page.read();
            self.store.write_page(&key, &page)?;
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }

        state.page_table.remove(&key);
        state.frame_keys[idx] = None;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(?key, "evicted page");
        Ok(idx)
    }

    /// Writes one page back if it is resident and dirty.
    pub fn flush_page(&self, key: PageKey) -> Result<()> {
        let state = self.state.lock();
        if let Some(&idx) = state.page_table.get(&key) {
            self.flush_frame(idx, &key)?;
        }
        Ok(())
    }

    /// Writes every dirty resident page back to disk.
    pub fn flush_all(&self) -> Result<()> {
        let state = self.state.lock();
        for (key, &idx) in state.page_table.iter() {
            self.flush_frame(idx, key)?;
        }
        debug!(flushes = self.flushes.load(Ordering::Relaxed), "flush_all");
        Ok(())
    }

    /// Writes back and forgets every resident page of one table. Frames
    /// still pinned are left in place.
    pub fn flush_table(&self, table: TableId) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<PageKey> = state
            .page_table
            .keys()
            .filter(|k| k.table == table)
            .copied()
            .collect();
        for key in keys {
            let idx = state.page_table[&key];
            self.flush_frame(idx, &key)?;
            if self.frames[idx].pin_count.load(Ordering::Acquire) == 0 {
                state.page_table.remove(&key);
                state.frame_keys[idx] = None;
                state.free_list.push(idx);
            }
        }
        Ok(())
    }

    fn flush_frame(&self, idx: usize, key: &PageKey) -> Result<()> {
        let frame = &self.frames[idx];
        if frame.dirty.swap(false, Ordering::AcqRel) {
            let page = frame.page.read();
            self.store.write_page(key, &page)?;
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
