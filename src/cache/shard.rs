use std::sync::{atomic::Ordering, Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use super::{
    entry::{Entry, EntryData, RawCacheKey},
    pin::{ExclusivePin, SharedPin},
    CacheFuture, CacheInner, CacheStats, Lookup,
};
use crate::{
    alloc::{pages_for_bytes, Allocation, PAGE_SIZE},
    util::percentile,
    ErrorKind, Result,
};

/// One partition of the cache: a mutex-guarded entry table plus the CLOCK
/// eviction state for its slots.
///
/// All stateful decisions happen under the mutex; page allocation, promise
/// fulfillment and freeing of evicted buffers happen outside it.
pub(crate) struct Shard {
    pub(crate) state: Mutex<ShardState>,
}

pub(crate) struct ShardState {
    /// key → slot in `entries`. An entry is mapped iff its key is set.
    entry_map: FxHashMap<RawCacheKey, usize>,
    /// Slot arena. Evicted slots become `None` and are recorded in
    /// `empty_slots` for reuse.
    pub(crate) entries: Vec<Option<Arc<Entry>>>,
    empty_slots: Vec<usize>,
    /// Recycled entry objects, bounded by `max_free_entries`.
    pub(crate) free_entries: Vec<Arc<Entry>>,
    clock_hand: usize,
    /// Lookups since the last threshold calibration.
    event_counter: usize,
    /// Score at the 80th percentile of the last sample; entries scoring at
    /// or above it are eviction candidates.
    eviction_threshold: Option<u32>,
    num_hit: u64,
    hit_bytes: u64,
    num_new: u64,
    num_evict: u64,
    num_evict_checks: u64,
    num_wait_exclusive: u64,
    sum_evict_score: u64,
}

impl Shard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShardState {
                entry_map: FxHashMap::default(),
                entries: Vec::new(),
                empty_slots: Vec::new(),
                free_entries: Vec::new(),
                clock_hand: 0,
                event_counter: 0,
                eviction_threshold: None,
                num_hit: 0,
                hit_bytes: 0,
                num_new: 0,
                num_evict: 0,
                num_evict_checks: 0,
                num_wait_exclusive: 0,
                sum_evict_score: 0,
            }),
        }
    }

    pub fn find_or_create(
        shard: &Arc<Shard>,
        cache: &Arc<CacheInner>,
        key: RawCacheKey,
        size: usize,
    ) -> Result<Lookup> {
        let entry_to_init;
        {
            let mut state = shard.state.lock();
            state.event_counter += 1;
            if let Some(&slot) = state.entry_map.get(&key) {
                let found = state.entries[slot]
                    .clone()
                    .expect("mapped slot must be occupied");
                if found.is_exclusive() {
                    state.num_wait_exclusive += 1;
                    // Created under the shard mutex, so the hand-off in
                    // into_shared cannot miss it.
                    return Ok(Lookup::Busy(CacheFuture::new(found.get_or_create_future())));
                }
                if found.size() >= size {
                    found.touch(cache.access_time());
                    if found.swap_prefetch(false) {
                        // First regular use of a prefetched entry counts as
                        // consumption, not a hit.
                        found.set_first_use(true);
                        cache.increment_prefetch_pages(-(found.num_pages() as i64));
                    } else {
                        state.num_hit += 1;
                        state.hit_bytes += found.size() as u64;
                    }
                    found.add_shared_pin();
                    return Ok(Lookup::Shared(SharedPin::from_incremented(found)));
                }
                // This can happen when different load quanta apply to the
                // same file via different scan paths. The old entry is
                // superseded; its readers keep valid pins and the sweep
                // reclaims the slot once they finish.
                warn!(
                    found = found.size(),
                    requested = size,
                    "requested a larger entry than cached"
                );
                state.entry_map.remove(&key);
                found.clear_key();
            }

            let mut entry = state.take_free_entry();
            {
                let now = cache.access_time();
                let entry = Arc::get_mut(&mut entry).expect("free entry still referenced");
                entry.reset_for(key, size, now);
            }
            let slot = match state.empty_slots.pop() {
                Some(slot) => {
                    state.entries[slot] = Some(entry.clone());
                    slot
                }
                None => {
                    state.entries.push(Some(entry.clone()));
                    state.entries.len() - 1
                }
            };
            state.entry_map.insert(key, slot);
            state.num_new += 1;
            entry_to_init = entry;
        }
        Self::init_entry(shard, cache, key, entry_to_init).map(Lookup::Exclusive)
    }

    /// Allocate the new entry's storage. Runs outside the shard mutex; the
    /// entry is already findable in exclusive mode, so concurrent lookups
    /// wait on its future.
    fn init_entry(
        shard: &Arc<Shard>,
        cache: &Arc<CacheInner>,
        key: RawCacheKey,
        entry: Arc<Entry>,
    ) -> Result<ExclusivePin> {
        entry.set_lease(cache.file_ids.lease(key.file_num));
        let size = entry.size();
        if size < cache.config.tiny_data_size {
            // SAFETY: we are the exclusive owner.
            unsafe { entry.install_data(EntryData::Tiny(vec![0; size])) };
        } else {
            let pages = pages_for_bytes(size);
            let mut allocation = Allocation::empty();
            if !allocation.try_allocate(&cache.allocator, pages) {
                // No memory to cover the entry. Remove it and report a
                // retriable failure.
                Self::abandon_exclusive(shard, cache, &entry);
                return Err(ErrorKind::NoCacheSpace { size }.into());
            }
            // SAFETY: we are the exclusive owner.
            unsafe { entry.install_data(EntryData::Pages(allocation)) };
            cache.add_cached_pages(pages);
        }
        cache.increment_new(size as u64);
        Ok(ExclusivePin::new(entry, shard.clone(), cache.clone()))
    }

    pub fn exists(&self, cache: &CacheInner, key: RawCacheKey) -> bool {
        let state = self.state.lock();
        match state.entry_map.get(&key) {
            Some(&slot) => {
                if let Some(entry) = &state.entries[slot] {
                    entry.touch(cache.access_time());
                }
                true
            }
            None => false,
        }
    }

    /// Remove an exclusively-owned entry whose load did not complete, waking
    /// any waiters so they can retry.
    pub(crate) fn abandon_exclusive(shard: &Shard, cache: &CacheInner, entry: &Arc<Entry>) {
        let promise = {
            let mut state = shard.state.lock();
            state.remove_entry_locked(cache, entry);
            entry.take_promise()
        };
        entry.make_unpinned();
        if let Some(promise) = promise {
            let _ = promise.set(true);
        }
    }

    /// Sweep for space. Frees unpinned entries whose score clears the
    /// calibrated threshold until `bytes_to_free` is exceeded; with
    /// `evict_all_unpinned` every unpinned entry goes. When
    /// `pages_to_acquire` is positive, evicted page allocations are moved
    /// into `acquired` for reuse instead of being freed.
    pub fn evict(
        &self,
        cache: &CacheInner,
        bytes_to_free: u64,
        evict_all_unpinned: bool,
        mut pages_to_acquire: usize,
        acquired: &mut Allocation,
    ) {
        let skip_ssd_saveable = cache
            .ssd
            .as_ref()
            .map_or(false, |ssd| ssd.write_in_progress());
        let mut tiny_freed: u64 = 0;
        let mut large_freed: u64 = 0;
        let mut saveable_skipped: u64 = 0;
        let mut to_free: Vec<Allocation> = Vec::new();
        let mut now = cache.access_time();
        {
            let mut state = self.state.lock();
            let len = state.entries.len();
            if len == 0 {
                return;
            }
            let mut counter = 0;
            let mut checked = 0;
            let mut index = state.clock_hand % len;
            while counter < len {
                counter += 1;
                index = (index + 1) % len;
                state.num_evict_checks += 1;
                let candidate = match &state.entries[index] {
                    Some(entry) => entry.clone(),
                    None => continue,
                };
                checked += 1;
                state.clock_hand = state.clock_hand.wrapping_add(1);
                if state.eviction_threshold.is_none()
                    || state.event_counter > len / 4
                    || checked > len / 8
                {
                    now = cache.access_time();
                    state.calibrate_threshold(now);
                    checked = 0;
                    state.event_counter = 0;
                }
                if candidate.pin_count() != 0 {
                    continue;
                }
                let mut score = None;
                let evictable = candidate.key().file_num == 0 || evict_all_unpinned || {
                    let value = candidate.score(now);
                    score = Some(value);
                    value >= state.eviction_threshold.unwrap_or(0)
                };
                if !evictable {
                    continue;
                }
                if skip_ssd_saveable && candidate.ssd_saveable() && !evict_all_unpinned {
                    // Do not drop data an in-flight SSD save still wants.
                    saveable_skipped += 1;
                    continue;
                }
                // SAFETY: shard mutex held and the pin count is zero.
                match unsafe { candidate.take_data() } {
                    EntryData::Pages(mut allocation) => {
                        large_freed += allocation.byte_size() as u64;
                        if pages_to_acquire > 0 {
                            pages_to_acquire =
                                pages_to_acquire.saturating_sub(allocation.num_pages());
                            acquired.append_move(&mut allocation);
                        } else {
                            // Freed outside the mutex.
                            to_free.push(allocation);
                        }
                    }
                    EntryData::Tiny(bytes) => tiny_freed += bytes.len() as u64,
                    EntryData::Empty => {}
                }
                state.remove_entry_locked(cache, &candidate);
                state.entries[index] = None;
                state.empty_slots.push(index);
                state.try_add_free_entry(candidate, cache.config.max_free_entries);
                state.num_evict += 1;
                if let Some(score) = score {
                    state.sum_evict_score += score as u64;
                }
                if large_freed + tiny_freed > bytes_to_free {
                    break;
                }
            }
        }
        drop(to_free);
        cache.sub_cached_pages(large_freed as usize / PAGE_SIZE);

        if saveable_skipped > 0 {
            if let Some(ssd) = &cache.ssd {
                if ssd.start_write() {
                    // Rare; happens when the SSD is unusually slow.
                    let skipped = cache.num_skipped_saves.swap(0, Ordering::Relaxed);
                    info!(skipped, "starting save for old saveable entries");
                    cache.save_to_ssd();
                } else {
                    cache.num_skipped_saves.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Pin SSD-save candidates for a write batch. Never pins more than 70%
    /// of the shard, so a slow SSD save cannot pin everything and starve
    /// readers.
    pub fn append_ssd_saveable(&self, pins: &mut Vec<SharedPin>) {
        let state = self.state.lock();
        let limit = state.entries.len() * 7 / 10;
        let before = pins.len();
        for entry in state.entries.iter().flatten() {
            if entry.ssd_location().is_none() && !entry.is_exclusive() && entry.ssd_saveable() {
                entry.add_shared_pin();
                pins.push(SharedPin::from_incremented(entry.clone()));
                if pins.len() - before >= limit {
                    info!(limit, "limiting SSD save batch");
                    break;
                }
            }
        }
    }

    pub fn update_stats(&self, stats: &mut CacheStats) {
        let state = self.state.lock();
        for slot in &state.entries {
            let entry = match slot {
                Some(entry) if entry.key().file_num != 0 => entry,
                _ => {
                    stats.num_empty_entries += 1;
                    continue;
                }
            };
            let pinned_bytes = (entry.tiny_byte_size() + entry.paged_byte_size()) as u64;
            if entry.is_exclusive() {
                stats.num_exclusive += 1;
                stats.exclusive_pinned_bytes += pinned_bytes;
            } else if entry.is_shared() {
                stats.num_shared += 1;
                stats.shared_pinned_bytes += pinned_bytes;
            }
            if entry.is_prefetch() {
                stats.num_prefetch += 1;
                stats.prefetch_bytes += entry.size() as u64;
            }
            stats.num_entries += 1;
            if entry.tiny_byte_size() > 0 {
                stats.tiny_size += entry.size() as u64;
                stats.tiny_padding += (entry.tiny_byte_size() - entry.size()) as u64;
            } else {
                stats.large_size += entry.size() as u64;
                stats.large_padding += (entry.paged_byte_size() - entry.size()) as u64;
            }
        }
        stats.num_hit += state.num_hit;
        stats.hit_bytes += state.hit_bytes;
        stats.num_new += state.num_new;
        stats.num_evict += state.num_evict;
        stats.num_evict_checks += state.num_evict_checks;
        stats.num_wait_exclusive += state.num_wait_exclusive;
        stats.sum_evict_score += state.sum_evict_score;
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.entry_map.clear();
        state.entries.clear();
        state.empty_slots.clear();
        state.free_entries.clear();
    }
}

impl ShardState {
    fn take_free_entry(&mut self) -> Arc<Entry> {
        self.free_entries
            .pop()
            .unwrap_or_else(|| Arc::new(Entry::new()))
    }

    fn try_add_free_entry(&mut self, entry: Arc<Entry>, max_free_entries: usize) {
        self.free_entries.push(entry);
        // Keep the recycle pool bounded; halve it when it overflows.
        if self.free_entries.len() >= max_free_entries {
            self.free_entries.truncate(max_free_entries / 2);
        }
    }

    /// Unmap the entry and drop its key. Data is normally moved out by the
    /// eviction sweep first; a failed load abandons the entry with its
    /// allocation still attached, which is freed here.
    fn remove_entry_locked(&mut self, cache: &CacheInner, entry: &Arc<Entry>) {
        let key = entry.key();
        if key.file_num == 0 {
            return;
        }
        self.entry_map.remove(&key);
        entry.clear_key();
        entry.set_ssd_location(None);
        if entry.swap_prefetch(false) {
            cache.increment_prefetch_pages(-(entry.num_pages() as i64));
        }
        // SAFETY: shard mutex held; the entry is exclusive (abandoned load)
        // or unpinned (eviction).
        let data = unsafe { entry.take_data() };
        if let EntryData::Pages(allocation) = &data {
            cache.sub_cached_pages(allocation.num_pages());
        }
        drop(data);
    }

    fn calibrate_threshold(&mut self, now: u32) {
        let len = self.entries.len();
        if len == 0 {
            return;
        }
        let num_samples = len.min(10);
        let step = len / num_samples;
        let mut index = self.clock_hand % len;
        let mut scores = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            scores.push(self.entries[index].as_ref().map_or(0, |e| e.score(now)));
            index = (index + step) % len;
        }
        self.eviction_threshold = Some(percentile(&mut scores, 80));
    }
}
