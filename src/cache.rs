//! The RAM tier: sharded entry table, pins, coalesced loads and memory
//! arbitration.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cache_padded::CachePadded;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use tracing::{trace, warn};

use crate::{
    alloc::{page_bytes, pages_for_bytes, Allocation, Allocator},
    file_id::FileIds,
    ssd::SsdCache,
    util::{succinct_bytes, FutureCell},
    Result,
};

use self::{
    entry::RawCacheKey,
    pin::{ExclusivePin, SharedPin},
    shard::Shard,
};

pub mod entry;
pub mod load;
pub mod pin;
pub(crate) mod shard;

#[cfg(test)]
mod tests;

/// Completion handle for an entry or load in flight. Resolves to `true` once
/// the producer finishes or gives up; the holder re-checks the cache either
/// way.
#[derive(Debug, Clone)]
pub struct CacheFuture {
    cell: Arc<FutureCell<bool>>,
}

impl CacheFuture {
    pub(crate) fn new(cell: Arc<FutureCell<bool>>) -> Self {
        Self { cell }
    }

    pub fn is_complete(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Block the calling thread until completion.
    pub fn wait(&self) -> bool {
        *self.cell.wait()
    }

    pub async fn wait_async(&self) -> bool {
        *self.cell.wait_async().await
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// The entry is cached and readable.
    Shared(SharedPin),
    /// The entry was created for this caller, who must fill it and call
    /// [`ExclusivePin::into_shared`], or drop the pin to give up.
    Exclusive(ExclusivePin),
    /// Another caller holds the entry exclusively; the future resolves when
    /// it finishes or gives up, after which the lookup should be retried.
    Busy(CacheFuture),
}

/// Hook invoked on every exclusive→shared transition, e.g. for checksumming
/// freshly loaded data.
pub type VerifyHook = Box<dyn Fn(&SharedPin) + Send + Sync>;

pub struct CacheConfig {
    /// Number of shards; must be a power of two.
    pub num_shards: usize,
    /// Entries below this size are stored inline without a page allocation.
    pub tiny_data_size: usize,
    /// Bound on each shard's recycled-entry pool.
    pub max_free_entries: usize,
    /// Eviction sweeps always target at least this many pages, so small
    /// allocations do not thrash the mutex-protected sweep.
    pub min_evict_pages: usize,
    /// Allocations below this many pages escalate their eviction volume on
    /// retry.
    pub small_size_pages: usize,
    pub verify_hook: Option<VerifyHook>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_shards: 16,
            tiny_data_size: 2048,
            max_free_entries: 1000,
            min_evict_pages: 256,
            small_size_pages: 2048,
            verify_hook: None,
        }
    }
}

impl CacheConfig {
    pub fn build(
        self,
        allocator: Arc<dyn Allocator>,
        ssd: Option<Arc<dyn SsdCache>>,
    ) -> DataCache {
        assert!(
            self.num_shards.is_power_of_two(),
            "shard count must be a power of two"
        );
        let shards = (0..self.num_shards)
            .map(|_| Arc::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        DataCache {
            inner: Arc::new(CacheInner {
                shard_mask: (self.num_shards - 1) as u64,
                shards,
                allocator,
                ssd,
                file_ids: FileIds::new(),
                config: self,
                start: Instant::now(),
                cached_pages: CachePadded::new(AtomicUsize::new(0)),
                prefetch_pages: CachePadded::new(AtomicI64::new(0)),
                new_bytes: AtomicU64::new(0),
                next_ssd_score_size: AtomicU64::new(0),
                ssd_saveable_bytes: AtomicU64::new(0),
                num_skipped_saves: AtomicU64::new(0),
                num_threads_in_allocate: CachePadded::new(AtomicI32::new(0)),
                backoff_counter: CachePadded::new(AtomicU64::new(0)),
                shard_counter: AtomicUsize::new(0),
                failure_message: Mutex::new(None),
            }),
        }
    }
}

/// The two-tier data cache. Cheap to clone handles are not provided; share
/// the cache itself behind an `Arc` if needed.
pub struct DataCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    shards: Box<[Arc<Shard>]>,
    shard_mask: u64,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) ssd: Option<Arc<dyn SsdCache>>,
    pub(crate) file_ids: Arc<FileIds>,
    pub(crate) config: CacheConfig,
    start: Instant,
    pub(crate) cached_pages: CachePadded<AtomicUsize>,
    prefetch_pages: CachePadded<AtomicI64>,
    new_bytes: AtomicU64,
    next_ssd_score_size: AtomicU64,
    ssd_saveable_bytes: AtomicU64,
    pub(crate) num_skipped_saves: AtomicU64,
    pub(crate) num_threads_in_allocate: CachePadded<AtomicI32>,
    pub(crate) backoff_counter: CachePadded<AtomicU64>,
    shard_counter: AtomicUsize,
    failure_message: Mutex<Option<String>>,
}

impl DataCache {
    /// Build a cache with the default configuration.
    pub fn new(allocator: Arc<dyn Allocator>, ssd: Option<Arc<dyn SsdCache>>) -> Self {
        CacheConfig::default().build(allocator, ssd)
    }

    /// Find the entry for `key`, creating it when absent.
    ///
    /// On a hit the returned pin covers at least `size` bytes. A `Busy`
    /// result means another caller is loading the key; wait on the future
    /// and retry.
    pub fn find_or_create(&self, key: RawCacheKey, size: usize) -> Result<Lookup> {
        assert_ne!(key.file_num, 0, "file number 0 is not a valid key");
        Shard::find_or_create(self.shard_for(&key), &self.inner, key, size)
    }

    /// Whether `key` is cached. Touches the entry's access stats on a hit.
    pub fn exists(&self, key: RawCacheKey) -> bool {
        self.shard_for(&key).exists(&self.inner, key)
    }

    /// Make room for `num_pages` of new allocation, evicting as needed, and
    /// run `allocate` once enough supply is plausible. `allocate` receives
    /// pages harvested from eviction and should move them into its own
    /// allocation before topping up from the allocator.
    ///
    /// Returns false after bounded retries; a diagnostic is then available
    /// from [`failure_message`](Self::failure_message).
    pub fn make_space<F>(&self, num_pages: usize, mut allocate: F) -> bool
    where
        F: FnMut(&mut Allocation) -> bool,
    {
        // Try to allocate, evicting the desired amount on failure. This is
        // deliberately unsynchronized: another thread may take what we
        // evicted, but it usually settles within a few rounds. Under real
        // contention threads take a rank in arrival order and back off
        // randomly, so the first comer is likelier to get the memory. A
        // mutex is not an option here: memory arbitration must never run
        // inside a global lock.
        let inner = &self.inner;
        let max_attempts = inner.config.num_shards * 4;
        let mut size_multiplier: f32 = 1.2;
        let mut rank: i32 = 0;
        let mut acquired = Allocation::empty();
        let mut guard = ThreadCountGuard {
            counter: &*inner.num_threads_in_allocate,
            counted: false,
        };

        let contenders = inner.num_threads_in_allocate.load(Ordering::Relaxed);
        assert!(
            (0..10_000).contains(&contenders),
            "leak in num_threads_in_allocate: {contenders}"
        );
        if contenders > 0 {
            rank = inner.num_threads_in_allocate.fetch_add(1, Ordering::Relaxed) + 1;
            guard.counted = true;
        }

        for attempt in 0..max_attempts {
            if inner.can_try_allocate(num_pages, &acquired) && allocate(&mut acquired) {
                return true;
            }
            if attempt > 2 {
                if let Some(ssd) = &inner.ssd {
                    if ssd.write_in_progress() {
                        trace!("pausing for SSD cache write to unpin memory");
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
            if attempt > max_attempts / 2 && !guard.counted {
                rank = inner.num_threads_in_allocate.fetch_add(1, Ordering::Relaxed) + 1;
                guard.counted = true;
            }
            if rank > 0 {
                // Free the grabbed pages before sleeping so a contender can
                // make progress.
                acquired.free();
                inner.backoff(attempt as i32 + rank);
                // Some competitors may be done; maybe take a better rank.
                rank = rank.min(inner.num_threads_in_allocate.load(Ordering::Relaxed));
            }
            let shard_index = inner.shard_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let pages_to_acquire = num_pages.saturating_sub(acquired.num_pages());
            let evict_pages =
                (num_pages.max(inner.config.min_evict_pages) as f32 * size_multiplier) as usize;
            // Round-robin over shards; after one full pass without success,
            // go to desperate mode and take every unpinned entry.
            inner.shards[shard_index & inner.shard_mask as usize].evict(
                inner,
                page_bytes(evict_pages) as u64,
                attempt >= inner.config.num_shards,
                pages_to_acquire,
                &mut acquired,
            );
            if num_pages < inner.config.small_size_pages && size_multiplier < 4.0 {
                size_multiplier *= 2.0;
            }
        }
        let message = format!(
            "failed to make space for {num_pages} pages after {max_attempts} attempts: {}",
            self.describe(false)
        );
        warn!("{message}");
        *inner.failure_message.lock() = Some(message);
        false
    }

    /// Evict everything unpinned from every shard.
    pub fn clear(&self) {
        for shard in self.inner.shards.iter() {
            let mut acquired = Allocation::empty();
            shard.evict(&self.inner, u64::MAX, true, 0, &mut acquired);
            debug_assert!(acquired.is_empty());
        }
    }

    /// Drop all entries and recycled objects. The caller guarantees no pins
    /// are outstanding.
    pub fn shutdown(&self) {
        for shard in self.inner.shards.iter() {
            shard.shutdown();
        }
    }

    pub fn refresh_stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in self.inner.shards.iter() {
            shard.update_stats(&mut stats);
        }
        stats
    }

    /// Pages currently held by cache entries.
    pub fn cached_pages(&self) -> usize {
        self.inner.cached_pages.load(Ordering::Relaxed)
    }

    /// Diagnostic from the most recent arbitration failure, if any.
    pub fn failure_message(&self) -> Option<String> {
        self.inner.failure_message.lock().clone()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.inner.allocator
    }

    pub fn ssd_cache(&self) -> Option<&Arc<dyn SsdCache>> {
        self.inner.ssd.as_ref()
    }

    pub fn file_ids(&self) -> &Arc<FileIds> {
        &self.inner.file_ids
    }

    /// Human-readable summary of cache state.
    pub fn describe(&self, details: bool) -> String {
        use fmt::Write as _;

        let stats = self.refresh_stats();
        let mut out = String::new();
        let _ = write!(
            out,
            "DataCache:\n{stats}\nAllocated pages: {} cached pages: {}",
            self.inner.allocator.num_allocated(),
            self.cached_pages(),
        );
        if details {
            for (index, shard) in self.inner.shards.iter().enumerate() {
                let state = shard.state.lock();
                let _ = write!(
                    out,
                    "\nshard {index}: entries {} free {}",
                    state.entries.len(),
                    state.free_entries.len()
                );
            }
        }
        out
    }

    fn shard_for(&self, key: &RawCacheKey) -> &Arc<Shard> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.inner.shards[(hasher.finish() & self.inner.shard_mask) as usize]
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<CacheInner> {
        &self.inner
    }
}

impl fmt::Debug for DataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCache")
            .field("shards", &self.inner.shards.len())
            .field("cached_pages", &self.cached_pages())
            .finish_non_exhaustive()
    }
}

impl CacheInner {
    /// Seconds since this cache was built; the time base for access stats.
    pub fn access_time(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }

    pub fn add_cached_pages(&self, pages: usize) {
        self.cached_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn sub_cached_pages(&self, pages: usize) {
        let previous = self.cached_pages.fetch_sub(pages, Ordering::Relaxed);
        debug_assert!(previous >= pages, "cached page accounting went negative");
    }

    pub fn increment_prefetch_pages(&self, delta: i64) {
        self.prefetch_pages.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn prefetch_pages(&self) -> i64 {
        self.prefetch_pages.load(Ordering::Relaxed)
    }

    /// Account freshly created bytes; periodically retargets the SSD
    /// admission filter, next after about half the cache has turned over.
    pub fn increment_new(&self, size: u64) {
        let total = self.new_bytes.fetch_add(size, Ordering::Relaxed) + size;
        let Some(ssd) = &self.ssd else {
            return;
        };
        if total > self.next_ssd_score_size.load(Ordering::Relaxed) {
            let cached_bytes = page_bytes(self.cached_pages.load(Ordering::Relaxed)) as u64;
            self.next_ssd_score_size
                .store(total + cached_bytes.max(1 << 28), Ordering::Relaxed);
            ssd.update_ssd_filter((ssd.max_bytes() as f64 * 0.9) as u64);
        }
    }

    /// Account bytes that became SSD-saveable; kicks off a save once enough
    /// accumulate and no other save is running.
    pub fn possible_ssd_save(&self, bytes: u64) {
        // Save at least 16MB at a time.
        const MIN_SAVE_PAGES: usize = 4096;

        let Some(ssd) = &self.ssd else {
            return;
        };
        let total = self.ssd_saveable_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let threshold = MIN_SAVE_PAGES.max(self.cached_pages.load(Ordering::Relaxed) / 8);
        if pages_for_bytes(total as usize) > threshold {
            if !ssd.start_write() {
                return;
            }
            self.save_to_ssd();
        }
    }

    /// Collect saveable pins from every shard and hand them to the SSD
    /// tier. The caller must have claimed the write via `start_write`.
    pub fn save_to_ssd(&self) {
        let Some(ssd) = &self.ssd else {
            return;
        };
        debug_assert!(ssd.write_in_progress());
        self.ssd_saveable_bytes.store(0, Ordering::Relaxed);
        let mut pins = Vec::new();
        for shard in self.shards.iter() {
            shard.append_ssd_saveable(&mut pins);
        }
        ssd.write(pins);
    }

    /// Whether an allocation attempt is worth making: either the harvested
    /// pages cover the ask, or the deficit fits in unused capacity.
    fn can_try_allocate(&self, num_pages: usize, acquired: &Allocation) -> bool {
        if num_pages <= acquired.num_pages() {
            return true;
        }
        num_pages - acquired.num_pages()
            <= self
                .allocator
                .capacity_pages()
                .saturating_sub(self.allocator.num_allocated())
    }

    fn backoff(&self, counter: i32) {
        let seed = hash16(self.backoff_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let micros = (seed & 0xfff) * (counter as u64 & 0x1f);
        // A zero sleep is possible; lightly contended threads retry at once.
        if micros > 0 {
            trace!(micros, "backoff in allocation contention");
            thread::sleep(Duration::from_micros(micros));
        }
    }
}

fn hash16(value: u64) -> u64 {
    let mut hasher = FxHasher::default();
    (value as u16).hash(&mut hasher);
    hasher.finish()
}

struct ThreadCountGuard<'a> {
    counter: &'a AtomicI32,
    counted: bool,
}

impl Drop for ThreadCountGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Aggregated counters across all shards.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub num_entries: u64,
    pub num_empty_entries: u64,
    pub num_shared: u64,
    pub num_exclusive: u64,
    pub shared_pinned_bytes: u64,
    pub exclusive_pinned_bytes: u64,
    pub num_prefetch: u64,
    pub prefetch_bytes: u64,
    pub tiny_size: u64,
    pub tiny_padding: u64,
    pub large_size: u64,
    pub large_padding: u64,
    pub num_hit: u64,
    pub hit_bytes: u64,
    pub num_new: u64,
    pub num_evict: u64,
    pub num_evict_checks: u64,
    pub num_wait_exclusive: u64,
    pub sum_evict_score: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Cache size: {} tiny: {} large: {}",
            succinct_bytes(self.tiny_size + self.tiny_padding + self.large_size + self.large_padding),
            succinct_bytes(self.tiny_size + self.tiny_padding),
            succinct_bytes(self.large_size + self.large_padding),
        )?;
        writeln!(
            f,
            "Cache entries: {} read pins: {} write pins: {} pinned shared: {} pinned exclusive: {} num write wait: {} empty entries: {}",
            self.num_entries,
            self.num_shared,
            self.num_exclusive,
            succinct_bytes(self.shared_pinned_bytes),
            succinct_bytes(self.exclusive_pinned_bytes),
            self.num_wait_exclusive,
            self.num_empty_entries,
        )?;
        writeln!(
            f,
            "Cache access miss: {} hit: {} hit bytes: {} eviction: {} eviction checks: {}",
            self.num_new,
            self.num_hit,
            succinct_bytes(self.hit_bytes),
            self.num_evict,
            self.num_evict_checks,
        )?;
        write!(
            f,
            "Prefetch entries: {} bytes: {}",
            self.num_prefetch,
            succinct_bytes(self.prefetch_bytes),
        )
    }
}
