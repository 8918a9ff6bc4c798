use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    alloc::PAGE_SIZE,
    file_id::FileIdLease,
    ssd::SsdLocation,
    util::{FutureCell, SyncUnsafeCell},
};

/// Pin count sentinel for an entry owned by a single writer.
pub(crate) const EXCLUSIVE: i32 = i32::MIN;

/// Raw lookup key: an interned file number plus a byte offset within the
/// file. File number 0 is never a valid key; a cleared key stores 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCacheKey {
    pub file_num: u64,
    pub offset: u64,
}

impl RawCacheKey {
    pub fn new(file_num: u64, offset: u64) -> Self {
        Self { file_num, offset }
    }
}

/// Recency/frequency record deciding eviction order.
///
/// Lower scores are more valuable. Each use halves the weight of elapsed
/// time, so an entry touched often stays cold for the sweep long after its
/// last use.
#[derive(Debug, Default)]
pub(crate) struct AccessStats {
    last_use: AtomicU32,
    num_uses: AtomicU32,
}

impl AccessStats {
    pub fn touch(&self, now: u32) {
        self.last_use.store(now, Ordering::Relaxed);
        let uses = self.num_uses.load(Ordering::Relaxed);
        self.num_uses.store(uses.saturating_add(1), Ordering::Relaxed);
    }

    pub fn score(&self, now: u32) -> u32 {
        let age = now.saturating_sub(self.last_use.load(Ordering::Relaxed));
        age >> self.num_uses.load(Ordering::Relaxed).min(31)
    }

    /// Zero the stats so the next sweep selects this entry.
    pub fn make_evictable(&self) {
        self.last_use.store(0, Ordering::Relaxed);
        self.num_uses.store(0, Ordering::Relaxed);
    }

    fn reset(&mut self, now: u32) {
        *self.last_use.get_mut() = now;
        *self.num_uses.get_mut() = 0;
    }
}

/// Storage behind an entry. Tiny entries hold their bytes inline; everything
/// else owns a page allocation. The two are structurally exclusive.
#[derive(Debug, Default)]
pub enum EntryData {
    #[default]
    Empty,
    Tiny(Vec<u8>),
    Pages(crate::alloc::Allocation),
}

impl EntryData {
    pub fn is_empty(&self) -> bool {
        matches!(self, EntryData::Empty)
    }

    pub fn num_pages(&self) -> usize {
        match self {
            EntryData::Pages(allocation) => allocation.num_pages(),
            _ => 0,
        }
    }

    /// Bytes of backing storage, which may exceed the entry's logical size.
    pub fn byte_size(&self) -> usize {
        match self {
            EntryData::Empty => 0,
            EntryData::Tiny(bytes) => bytes.len(),
            EntryData::Pages(allocation) => allocation.byte_size(),
        }
    }

    /// Copy `src` into the storage, starting at byte 0.
    pub fn copy_from(&mut self, src: &[u8]) {
        match self {
            EntryData::Empty => assert!(src.is_empty(), "entry has no storage"),
            EntryData::Tiny(bytes) => bytes[..src.len()].copy_from_slice(src),
            EntryData::Pages(allocation) => {
                let mut src = src;
                for run in allocation.runs_mut() {
                    if src.is_empty() {
                        break;
                    }
                    let take = src.len().min(run.len());
                    run[..take].copy_from_slice(&src[..take]);
                    src = &src[take..];
                }
                assert!(src.is_empty(), "source larger than entry storage");
            }
        }
    }

    /// Copy the first `size` bytes of storage out.
    pub fn copy_to_vec(&self, size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        match self {
            EntryData::Empty => assert_eq!(size, 0, "entry has no storage"),
            EntryData::Tiny(bytes) => out.extend_from_slice(&bytes[..size]),
            EntryData::Pages(allocation) => {
                let mut remaining = size;
                for run in allocation.runs() {
                    if remaining == 0 {
                        break;
                    }
                    let take = remaining.min(run.len());
                    out.extend_from_slice(&run[..take]);
                    remaining -= take;
                }
                assert_eq!(remaining, 0, "entry storage smaller than requested size");
            }
        }
        out
    }
}

/// The addressable unit of the cache.
///
/// Lifecycle: created exclusive by the shard, filled by the owning caller,
/// transitioned to shared, then released. An unpinned entry stays in its
/// shard slot until the eviction sweep reclaims it; a superseded entry loses
/// its key first and is reclaimed the same way once its readers drop their
/// pins.
pub(crate) struct Entry {
    file_num: AtomicU64,
    offset: u64,
    size: usize,
    /// Gated on pin mode: shared pin for `&`, exclusive ownership for
    /// `&mut`, or the shard mutex with a zero pin count.
    data: SyncUnsafeCell<EntryData>,
    // Storage sizes mirrored out of `data` so stats never touch the cell.
    tiny_bytes: AtomicUsize,
    paged_bytes: AtomicUsize,
    pins: AtomicI32,
    /// Created and taken only under the shard mutex; fulfilled outside it.
    promise: Mutex<Option<Arc<FutureCell<bool>>>>,
    lease: Mutex<Option<FileIdLease>>,
    access: AccessStats,
    is_prefetch: AtomicBool,
    is_first_use: AtomicBool,
    ssd_saveable: AtomicBool,
    ssd_location: Mutex<Option<SsdLocation>>,
    group_id: AtomicU64,
    tracking_id: AtomicU64,
}

impl Entry {
    pub fn new() -> Self {
        Self {
            file_num: AtomicU64::new(0),
            offset: 0,
            size: 0,
            data: SyncUnsafeCell::new(EntryData::Empty),
            tiny_bytes: AtomicUsize::new(0),
            paged_bytes: AtomicUsize::new(0),
            pins: AtomicI32::new(0),
            promise: Mutex::new(None),
            lease: Mutex::new(None),
            access: AccessStats::default(),
            is_prefetch: AtomicBool::new(false),
            is_first_use: AtomicBool::new(false),
            ssd_saveable: AtomicBool::new(false),
            ssd_location: Mutex::new(None),
            group_id: AtomicU64::new(0),
            tracking_id: AtomicU64::new(0),
        }
    }

    /// Reinitialize a recycled (or fresh) entry for a new key. The caller
    /// must hold the only reference.
    pub fn reset_for(&mut self, key: RawCacheKey, size: usize, now: u32) {
        debug_assert!(self.data.get_mut().is_empty());
        *self.file_num.get_mut() = key.file_num;
        self.offset = key.offset;
        self.size = size;
        *self.tiny_bytes.get_mut() = 0;
        *self.paged_bytes.get_mut() = 0;
        *self.pins.get_mut() = EXCLUSIVE;
        *self.promise.get_mut() = None;
        *self.lease.get_mut() = None;
        self.access.reset(now);
        *self.is_prefetch.get_mut() = false;
        *self.is_first_use.get_mut() = true;
        *self.ssd_saveable.get_mut() = false;
        *self.ssd_location.get_mut() = None;
        *self.group_id.get_mut() = 0;
        *self.tracking_id.get_mut() = 0;
    }

    pub fn key(&self) -> RawCacheKey {
        RawCacheKey {
            file_num: self.file_num.load(Ordering::Acquire),
            offset: self.offset,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pin_count(&self) -> i32 {
        self.pins.load(Ordering::Acquire)
    }

    pub fn is_exclusive(&self) -> bool {
        self.pin_count() == EXCLUSIVE
    }

    pub fn is_shared(&self) -> bool {
        self.pin_count() > 0
    }

    /// Add a shared reference. The entry must not be exclusive.
    pub fn add_shared_pin(&self) {
        let previous = self.pins.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous >= 0, "added a reference to an exclusive entry");
    }

    pub fn release_shared(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous >= 1, "pin count went negative");
    }

    /// Exclusive → shared: the caller's unique pin becomes the one shared
    /// reference.
    pub fn make_shared(&self) {
        debug_assert!(self.is_exclusive());
        self.pins.store(1, Ordering::Release);
    }

    pub fn make_unpinned(&self) {
        self.pins.store(0, Ordering::Release);
    }

    pub fn touch(&self, now: u32) {
        self.access.touch(now);
    }

    pub fn score(&self, now: u32) -> u32 {
        self.access.score(now)
    }

    pub fn make_evictable(&self) {
        self.access.make_evictable();
    }

    pub fn num_pages(&self) -> usize {
        self.paged_bytes.load(Ordering::Relaxed) / PAGE_SIZE
    }

    pub fn tiny_byte_size(&self) -> usize {
        self.tiny_bytes.load(Ordering::Relaxed)
    }

    pub fn paged_byte_size(&self) -> usize {
        self.paged_bytes.load(Ordering::Relaxed)
    }

    /// Drop the key so the entry is no longer findable. Must be called under
    /// the shard mutex.
    pub fn clear_key(&self) {
        self.file_num.store(0, Ordering::Release);
        *self.lease.lock() = None;
    }

    pub fn set_lease(&self, lease: FileIdLease) {
        *self.lease.lock() = Some(lease);
    }

    pub fn is_prefetch(&self) -> bool {
        self.is_prefetch.load(Ordering::Acquire)
    }

    pub fn swap_prefetch(&self, flag: bool) -> bool {
        self.is_prefetch.swap(flag, Ordering::AcqRel)
    }

    pub fn is_first_use(&self) -> bool {
        self.is_first_use.load(Ordering::Acquire)
    }

    pub fn set_first_use(&self, flag: bool) {
        self.is_first_use.store(flag, Ordering::Release);
    }

    pub fn ssd_saveable(&self) -> bool {
        self.ssd_saveable.load(Ordering::Acquire)
    }

    pub fn set_ssd_saveable(&self, flag: bool) {
        self.ssd_saveable.store(flag, Ordering::Release);
    }

    pub fn ssd_location(&self) -> Option<SsdLocation> {
        *self.ssd_location.lock()
    }

    pub fn set_ssd_location(&self, location: Option<SsdLocation>) {
        *self.ssd_location.lock() = location;
    }

    pub fn group_id(&self) -> u64 {
        self.group_id.load(Ordering::Relaxed)
    }

    pub fn set_group_id(&self, group_id: u64) {
        self.group_id.store(group_id, Ordering::Relaxed);
    }

    pub fn tracking_id(&self) -> u64 {
        self.tracking_id.load(Ordering::Relaxed)
    }

    pub fn set_tracking_id(&self, tracking_id: u64) {
        self.tracking_id.store(tracking_id, Ordering::Relaxed);
    }

    /// Lazily create the completion future. Must be called under the shard
    /// mutex so it cannot race the exclusive→shared hand-off.
    pub fn get_or_create_future(&self) -> Arc<FutureCell<bool>> {
        self.promise
            .lock()
            .get_or_insert_with(|| Arc::new(FutureCell::new()))
            .clone()
    }

    /// Take the promise for fulfillment. Must be called under the shard
    /// mutex; fulfill after releasing it.
    pub fn take_promise(&self) -> Option<Arc<FutureCell<bool>>> {
        self.promise.lock().take()
    }

    /// # Safety
    ///
    /// The caller must hold a shared pin, be the exclusive owner, or hold
    /// the shard mutex while the pin count is zero.
    pub unsafe fn data(&self) -> &EntryData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    ///
    /// The caller must be the exclusive owner, or hold the shard mutex while
    /// the pin count is zero.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut EntryData {
        unsafe { &mut *self.data.get() }
    }

    /// Install freshly allocated storage.
    ///
    /// # Safety
    ///
    /// The caller must be the exclusive owner.
    pub unsafe fn install_data(&self, data: EntryData) {
        let (tiny, paged) = match &data {
            EntryData::Empty => (0, 0),
            EntryData::Tiny(bytes) => (bytes.len(), 0),
            EntryData::Pages(allocation) => (0, allocation.byte_size()),
        };
        self.tiny_bytes.store(tiny, Ordering::Relaxed);
        self.paged_bytes.store(paged, Ordering::Relaxed);
        unsafe { *self.data.get() = data };
    }

    /// Move the storage out, leaving the entry empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`data_mut`](Entry::data_mut).
    pub unsafe fn take_data(&self) -> EntryData {
        self.tiny_bytes.store(0, Ordering::Relaxed);
        self.paged_bytes.store(0, Ordering::Relaxed);
        unsafe { std::mem::take(&mut *self.data.get()) }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key();
        write!(
            f,
            "<entry key:{}:{} size {} pins {}>",
            key.file_num,
            key.offset,
            self.size,
            self.pin_count()
        )
    }
}
