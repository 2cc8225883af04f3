//! The shard node's bounded page cache.
//!
//! Main memory is one pool of `frame_max` fixed-size frames of
//! `8 + 2 + value_size` bytes (timestamp, key, value). Each cached record
//! occupies one page bound to one frame; pages are grouped into per-table
//! segments. Unmodified pages sit on an LRU list and may be stolen for new
//! allocations; modified pages only leave memory through a journal, which
//! drains them to the store node and resets the whole cache.
//!
//! A page's `parent` back-pointer is authoritative: when it no longer
//! matches the segment that looked the page up, the page was reassigned
//! between the map lookup and the lock acquisition and the lookup fails.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use stratakv_core::error::{TypedError, TypedResult};
use stratakv_core::reslock::ResLock;
use stratakv_core::table::Record;
use stratakv_core::typed_err;

/// Frame layout: timestamp, key, then the zero-padded value.
const FRAME_HEADER: usize = 8 + 2;

pub struct Page {
    frame: u16,
    meta: Mutex<PageMeta>,
}

struct PageMeta {
    modified: bool,
    parent: Option<Weak<Segment>>,
}

impl Page {
    pub fn frame(&self) -> u16 {
        self.frame
    }

    pub fn is_modified(&self) -> bool {
        self.meta.lock().unwrap().modified
    }
}

/// Per-table container of cached pages.
pub struct Segment {
    table: String,
    pages: Mutex<HashMap<u16, Arc<Page>>>,
    pub reslock: ResLock,
}

impl Segment {
    pub fn table(&self) -> &str {
        &self.table
    }
}

struct CacheState {
    pages_count: u16,
    /// Frame numbers of clean pages, most recently used first.
    lru: VecDeque<u16>,
}

impl CacheState {
    fn lru_remove(&mut self, frame: u16) {
        if let Some(pos) = self.lru.iter().position(|&f| f == frame) {
            self.lru.remove(pos);
        }
    }

    fn lru_touch(&mut self, frame: u16) {
        self.lru_remove(frame);
        self.lru.push_front(frame);
    }
}

pub struct PageCache {
    value_size: usize,
    frame_size: usize,
    frame_max: u16,
    /// Frame payloads; per-frame rwlocks let reads proceed in parallel.
    frames: Vec<RwLock<Box<[u8]>>>,
    pages: Vec<Arc<Page>>,
    state: Mutex<CacheState>,
    tables: Mutex<HashMap<String, Arc<Segment>>>,
    /// Global latch blocked by the journal.
    pub reslock: ResLock,
    /// Task handles parked on `MemoryFull` / `MemoryBlocked`.
    pub blocked: Mutex<VecDeque<u16>>,
    journaling: AtomicBool,
    /// Simulated per-access latency, hot-reloadable.
    delay: Mutex<Option<Duration>>,
}

impl PageCache {
    /// Sizes the cache as `floor(mem_size / frame_size)` frames.
    pub fn new(mem_size: usize, value_size: u16) -> TypedResult<Self> {
        let value_size = value_size as usize;
        let frame_size = FRAME_HEADER + value_size;
        let frame_max = mem_size / frame_size;
        if frame_max == 0 {
            return Err(typed_err!(
                Init,
                "not enough space for a single frame (mem_size={mem_size} frame_size={frame_size})"
            ));
        }
        let frame_max = frame_max.min(u16::MAX as usize - 1) as u16;

        let frames = (0..frame_max)
            .map(|_| RwLock::new(vec![0u8; frame_size].into_boxed_slice()))
            .collect();
        let pages = (0..frame_max)
            .map(|frame| {
                Arc::new(Page {
                    frame,
                    meta: Mutex::new(PageMeta {
                        modified: false,
                        parent: None,
                    }),
                })
            })
            .collect();

        Ok(Self {
            value_size,
            frame_size,
            frame_max,
            frames,
            pages,
            state: Mutex::new(CacheState {
                pages_count: 0,
                lru: VecDeque::new(),
            }),
            tables: Mutex::new(HashMap::new()),
            reslock: ResLock::new(false),
            blocked: Mutex::new(VecDeque::new()),
            journaling: AtomicBool::new(false),
            delay: Mutex::new(None),
        })
    }

    pub fn frame_max(&self) -> u16 {
        self.frame_max
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn pages_count(&self) -> u16 {
        self.state.lock().unwrap().pages_count
    }

    pub fn lru_len(&self) -> usize {
        self.state.lock().unwrap().lru.len()
    }

    pub fn tables_count(&self) -> usize {
        self.tables.lock().unwrap().len()
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    fn apply_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }

    // -- availability -------------------------------------------------------

    /// Admits an operation against the whole cache; fails with
    /// `MemoryBlocked` while a journal is draining.
    pub fn avail_guard_begin(&self) -> TypedResult<()> {
        if !self.reslock.avail_guard_begin() {
            return Err(typed_err!(
                MemoryBlocked,
                "Operation cannot be performed at this time since the memory is blocked. Try again later."
            ));
        }
        Ok(())
    }

    pub fn avail_guard_end(&self) {
        self.reslock.avail_guard_end();
    }

    /// Looks up (or lazily creates) the table's segment and admits an
    /// operation on it.
    pub fn segment_guard_begin(&self, table: &str) -> TypedResult<Arc<Segment>> {
        let mut tables = self.tables.lock().unwrap();
        let segment = tables
            .entry(table.to_owned())
            .or_insert_with(|| {
                Arc::new(Segment {
                    table: table.to_owned(),
                    pages: Mutex::new(HashMap::new()),
                    reslock: ResLock::new(false),
                })
            })
            .clone();
        drop(tables);

        if !segment.reslock.avail_guard_begin() {
            return Err(typed_err!(
                TableBlocked,
                "Operation cannot be performed at this time since table '{table}' is blocked. Try again later."
            ));
        }
        Ok(segment)
    }

    pub fn segment_guard_end(&self, segment: &Segment) {
        segment.reslock.avail_guard_end();
    }

    /// Forgets a table's segment (after a successful DROP). Its pages stay
    /// bound to their frames until stolen; the parent check invalidates
    /// them.
    pub fn segment_remove(&self, table: &str) -> bool {
        self.tables.lock().unwrap().remove(table).is_some()
    }

    // -- frame payload ------------------------------------------------------

    fn frame_write(&self, frame: u16, record: &Record) {
        let mut buf = self.frames[frame as usize].write().unwrap();
        buf[0..8].copy_from_slice(&record.timestamp.to_le_bytes());
        buf[8..10].copy_from_slice(&record.key.to_le_bytes());
        let value = record.value.as_bytes();
        let len = value.len().min(self.value_size);
        buf[FRAME_HEADER..FRAME_HEADER + len].copy_from_slice(&value[..len]);
        for byte in buf[FRAME_HEADER + len..].iter_mut() {
            *byte = 0;
        }
    }

    fn frame_read(&self, frame: u16) -> Record {
        let buf = self.frames[frame as usize].read().unwrap();
        let timestamp = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let key = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let value_bytes = &buf[FRAME_HEADER..];
        let len = value_bytes.iter().position(|&b| b == 0).unwrap_or(value_bytes.len());
        Record {
            key,
            timestamp,
            value: String::from_utf8_lossy(&value_bytes[..len]).into_owned(),
        }
    }

    // -- read / write -------------------------------------------------------

    /// Cache lookup. `Ok(None)` is a miss; the caller fetches from the
    /// store and installs the record with `write(…, false)`.
    pub fn read(&self, segment: &Arc<Segment>, key: u16) -> Option<Record> {
        let pages = segment.pages.lock().unwrap();
        let result = pages.get(&key).and_then(|page| {
            let mut state = self.state.lock().unwrap();
            let meta = page.meta.lock().unwrap();
            let owned = meta
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|parent| Arc::ptr_eq(&parent, segment))
                .unwrap_or(false);
            if !owned {
                // the page was stolen between the map read and the lock
                return None;
            }
            if !meta.modified {
                state.lru_touch(page.frame); // cache hit
            }
            Some(self.frame_read(page.frame))
        });
        drop(pages);

        self.apply_delay();
        result
    }

    /// Timestamp-dominant write. When the incoming timestamp is at least
    /// as recent as the stored one the frame is overwritten; otherwise the
    /// stored (fresher) record is returned, serving the late write as if
    /// it had been applied and then superseded.
    pub fn write(
        &self,
        segment: &Arc<Segment>,
        record: &Record,
        is_modification: bool,
    ) -> TypedResult<Record> {
        let mut pages = segment.pages.lock().unwrap();
        // taking the state lock here pins every page: a concurrent steal
        // needs it, so the ownership check below cannot go stale
        let mut state = self.state.lock().unwrap();
        let existing = pages.get(&record.key).cloned().filter(|page| {
            let meta = page.meta.lock().unwrap();
            meta.parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|parent| Arc::ptr_eq(&parent, segment))
                .unwrap_or(false)
        });

        let result = if let Some(page) = existing {
            let mut meta = page.meta.lock().unwrap();
            let current = self.frame_read(page.frame);

            if record.timestamp >= current.timestamp {
                self.frame_write(page.frame, record);
                if !meta.modified && is_modification {
                    state.lru_remove(page.frame);
                } else if meta.modified && !is_modification {
                    state.lru.push_front(page.frame);
                }
                meta.modified = is_modification;
                Ok(record.clone())
            } else {
                Ok(current)
            }
        } else {
            // allocate a fresh page (possibly stealing the LRU victim)
            let page = self.page_alloc(&mut state, segment, is_modification)?;
            self.frame_write(page.frame, record);
            if !is_modification {
                state.lru.push_front(page.frame);
            }
            pages.insert(record.key, page);
            Ok(record.clone())
        };
        drop(pages);

        self.apply_delay();
        result
    }

    /// Grabs the next never-used frame, or steals the least recently used
    /// clean page. With no clean page left the memory is full.
    fn page_alloc(
        &self,
        state: &mut CacheState,
        parent: &Arc<Segment>,
        is_modification: bool,
    ) -> TypedResult<Arc<Page>> {
        let page = if state.pages_count < self.frame_max {
            let page = Arc::clone(&self.pages[state.pages_count as usize]);
            state.pages_count += 1;
            page
        } else if let Some(frame) = state.lru.pop_back() {
            Arc::clone(&self.pages[frame as usize])
        } else {
            info!("the memory is full");
            return Err(typed_err!(MemoryFull, "the memory is full"));
        };

        let mut meta = page.meta.lock().unwrap();
        meta.modified = is_modification;
        meta.parent = Some(Arc::downgrade(parent));
        drop(meta);
        Ok(page)
    }

    // -- journal ------------------------------------------------------------

    /// Claims the single journal slot. The caller that wins schedules the
    /// journal task; everyone else backs off.
    pub fn journal_claim(&self) -> bool {
        !self.journaling.swap(true, Ordering::SeqCst)
    }

    pub fn journal_release(&self) {
        self.journaling.store(false, Ordering::SeqCst);
    }

    pub fn is_journaling(&self) -> bool {
        self.journaling.load(Ordering::SeqCst)
    }

    /// Blocks the cache, drains every modified page through `sink` in
    /// segment-iteration order, then resets the cache so every frame is
    /// reusable. Parked tasks are returned for re-activation.
    ///
    /// On a sink failure the drain stops but the reset still happens:
    /// records that were not delivered are lost, which is the documented
    /// durability boundary of the cache tier.
    pub fn journal_drain(
        &self,
        mut sink: impl FnMut(&str, &Record) -> TypedResult<()>,
    ) -> (Duration, Vec<u16>, Option<TypedError>) {
        self.reslock.block();
        self.reslock.wait_unused();

        let mut failure = None;

        let tables: Vec<Arc<Segment>> = self.tables.lock().unwrap().values().cloned().collect();
        'drain: for segment in &tables {
            let pages: Vec<Arc<Page>> = segment.pages.lock().unwrap().values().cloned().collect();
            for page in pages {
                let meta = page.meta.lock().unwrap();
                let owned = meta
                    .parent
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .map(|parent| Arc::ptr_eq(&parent, segment))
                    .unwrap_or(false);
                if !owned || !meta.modified {
                    continue;
                }
                let record = self.frame_read(page.frame);
                drop(meta);
                if let Err(e) = sink(segment.table(), &record) {
                    failure = Some(e);
                    break 'drain;
                }
            }
        }

        // destroy the segments and make every frame reusable
        self.tables.lock().unwrap().clear();
        {
            let mut state = self.state.lock().unwrap();
            state.pages_count = 0;
            state.lru.clear();
        }
        for page in &self.pages {
            let mut meta = page.meta.lock().unwrap();
            meta.modified = false;
            meta.parent = None;
        }

        self.reslock.unblock();
        let blocked_time = self.reslock.blocked_time();

        let parked = {
            let mut blocked = self.blocked.lock().unwrap();
            blocked.drain(..).collect()
        };

        self.journal_release();
        (blocked_time, parked, failure)
    }

    /// Parks a task handle until the next unblock.
    pub fn park(&self, handle: u16) {
        self.blocked.lock().unwrap().push_back(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(frames: u16) -> PageCache {
        // value_size 6 → frame_size 16
        PageCache::new(frames as usize * 16, 6).unwrap()
    }

    fn seg(cache: &PageCache, table: &str) -> Arc<Segment> {
        let segment = cache.segment_guard_begin(table).unwrap();
        cache.segment_guard_end(&segment);
        segment
    }

    #[test]
    fn read_after_write() {
        let cache = cache(4);
        let segment = seg(&cache, "T");
        cache.write(&segment, &Record::new(1, "abc", 10), true).unwrap();
        assert_eq!(cache.read(&segment, 1), Some(Record::new(1, "abc", 10)));
        assert_eq!(cache.read(&segment, 2), None);
    }

    #[test]
    fn timestamp_dominance() {
        let cache = cache(4);
        let segment = seg(&cache, "T");
        cache.write(&segment, &Record::new(7, "v1", 10), true).unwrap();
        // newer timestamp wins
        cache.write(&segment, &Record::new(7, "v2", 20), true).unwrap();
        // a late write returns the stored (fresher) record
        let served = cache.write(&segment, &Record::new(7, "v0", 15), true).unwrap();
        assert_eq!(served, Record::new(7, "v2", 20));
        assert_eq!(cache.read(&segment, 7), Some(Record::new(7, "v2", 20)));
    }

    #[test]
    fn lru_invariant_follows_modified_flag() {
        let cache = cache(4);
        let segment = seg(&cache, "T");

        cache.write(&segment, &Record::new(1, "a", 1), false).unwrap();
        cache.write(&segment, &Record::new(2, "b", 1), true).unwrap();
        assert_eq!(cache.pages_count(), 2);
        assert_eq!(cache.lru_len(), 1); // only the clean page

        // clean → modified leaves the LRU
        cache.write(&segment, &Record::new(1, "a2", 2), true).unwrap();
        assert_eq!(cache.lru_len(), 0);

        // modified → clean re-enters it
        cache.write(&segment, &Record::new(2, "b2", 2), false).unwrap();
        assert_eq!(cache.lru_len(), 1);
    }

    #[test]
    fn eviction_steals_least_recently_used_clean_page() {
        let cache = cache(2);
        let segment = seg(&cache, "T");

        cache.write(&segment, &Record::new(1, "a", 1), false).unwrap();
        cache.write(&segment, &Record::new(2, "b", 2), false).unwrap();
        // touch key 1 so key 2 becomes the LRU victim
        assert!(cache.read(&segment, 1).is_some());

        cache.write(&segment, &Record::new(3, "c", 3), false).unwrap();
        assert_eq!(cache.read(&segment, 2), None); // stolen
        assert!(cache.read(&segment, 1).is_some());
        assert!(cache.read(&segment, 3).is_some());
    }

    #[test]
    fn full_memory_with_only_modified_pages_fails() {
        let cache = cache(2);
        let segment = seg(&cache, "T");
        cache.write(&segment, &Record::new(1, "a", 1), true).unwrap();
        cache.write(&segment, &Record::new(2, "b", 2), true).unwrap();

        let err = cache.write(&segment, &Record::new(3, "c", 3), true).unwrap_err();
        assert_eq!(err.err(), stratakv_core::error::SystemError::MemoryFull);
    }

    #[test]
    fn journal_drains_modified_pages_and_resets() {
        let cache = cache(4);
        let t1 = seg(&cache, "T1");
        let t2 = seg(&cache, "T2");
        cache.write(&t1, &Record::new(1, "a", 1), true).unwrap();
        cache.write(&t1, &Record::new(2, "b", 2), false).unwrap();
        cache.write(&t2, &Record::new(3, "c", 3), true).unwrap();

        assert!(cache.journal_claim());
        cache.park(42);
        let mut drained: Vec<(String, Record)> = Vec::new();
        let (_blocked, parked, failure) = cache.journal_drain(|table, record| {
            drained.push((table.to_owned(), record.clone()));
            Ok(())
        });

        assert!(failure.is_none());
        assert_eq!(parked, vec![42]);
        drained.sort_by_key(|(_, r)| r.key);
        // only the modified pages reach the store
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1, Record::new(1, "a", 1));
        assert_eq!(drained[1].1, Record::new(3, "c", 3));

        assert_eq!(cache.pages_count(), 0);
        assert_eq!(cache.tables_count(), 0);
        assert_eq!(cache.lru_len(), 0);
        assert!(!cache.is_journaling());

        // old segments no longer own their pages
        assert_eq!(cache.read(&t1, 1), None);
    }

    #[test]
    fn journal_claim_is_exclusive() {
        let cache = cache(2);
        assert!(cache.journal_claim());
        assert!(!cache.journal_claim());
        cache.journal_release();
        assert!(cache.journal_claim());
    }

    #[test]
    fn guards_fail_while_blocked() {
        let cache = cache(2);
        cache.reslock.block();
        assert!(cache.avail_guard_begin().is_err());
        cache.reslock.unblock();
        assert!(cache.avail_guard_begin().is_ok());
        cache.avail_guard_end();
    }
}
