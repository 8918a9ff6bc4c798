use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Barrier,
    },
    thread,
};

use parking_lot::Mutex;

use super::{
    entry::{EntryData, RawCacheKey},
    load::{CoalescedLoad, EntryLoader, LoadState, LoadStatus},
    pin::{ExclusivePin, SharedPin},
    CacheConfig, CacheFuture, DataCache, Lookup,
};
use crate::{
    alloc::{page_bytes, Allocation, HeapAllocator},
    ssd::{SsdCache, SsdLocation},
    util::{assert_send, assert_send_sync},
    Result,
};

fn new_cache(pages: usize) -> DataCache {
    DataCache::new(HeapAllocator::new(pages), None)
}

fn key(file: u64, offset: u64) -> RawCacheKey {
    RawCacheKey::new(file, offset)
}

fn must_exclusive(cache: &DataCache, key: RawCacheKey, size: usize) -> ExclusivePin {
    match cache.find_or_create(key, size).expect("create failed") {
        Lookup::Exclusive(pin) => pin,
        other => panic!("expected exclusive pin, got {other:?}"),
    }
}

fn must_shared(cache: &DataCache, key: RawCacheKey, size: usize) -> SharedPin {
    match cache.find_or_create(key, size).expect("lookup failed") {
        Lookup::Shared(pin) => pin,
        other => panic!("expected shared pin, got {other:?}"),
    }
}

fn load_entry(cache: &DataCache, key: RawCacheKey, size: usize) -> SharedPin {
    let mut pin = must_exclusive(cache, key, size);
    pin.write_all(&vec![0u8; size]);
    pin.into_shared()
}

#[test]
fn send_sync() {
    assert_send_sync::<DataCache>();
    assert_send_sync::<SharedPin>();
    assert_send_sync::<ExclusivePin>();
    assert_send_sync::<CacheFuture>();
    assert_send_sync::<CoalescedLoad>();
    assert_send::<Lookup>();
}

#[test]
fn tiny_and_paged_storage_split_at_threshold() {
    let cache = new_cache(64);
    let tiny = must_exclusive(&cache, key(1, 0), 2047);
    assert!(matches!(tiny.data(), EntryData::Tiny(_)));
    assert_eq!(cache.cached_pages(), 0);

    let paged = must_exclusive(&cache, key(1, 10_000), 2048);
    assert!(matches!(paged.data(), EntryData::Pages(_)));
    assert_eq!(cache.cached_pages(), 1);

    drop(tiny);
    drop(paged);
    assert_eq!(cache.cached_pages(), 0);
    assert_eq!(cache.allocator().num_allocated(), 0);
}

#[test]
fn hit_path_counts_once() {
    let cache = new_cache(64);
    let mut pin = must_exclusive(&cache, key(7, 0), 1024);
    pin.write_all(&[7u8; 1024]);
    drop(pin.into_shared());

    let shared = must_shared(&cache, key(7, 0), 1024);
    assert_eq!(shared.to_vec(), vec![7u8; 1024]);
    // A smaller request is satisfied by the same entry.
    let smaller = must_shared(&cache, key(7, 0), 512);
    assert_eq!(smaller.size(), 1024);

    let stats = cache.refresh_stats();
    assert_eq!(stats.num_new, 1);
    assert_eq!(stats.num_hit, 2);
    assert_eq!(stats.hit_bytes, 2048);
}

#[test]
fn waiters_resume_after_exclusive_to_shared() {
    let cache = Arc::new(new_cache(1024));
    let k = key(9, 4096);
    let size = 1 << 20;
    let mut pin = must_exclusive(&cache, k, size);

    let barrier = Arc::new(Barrier::new(3));
    let mut waiters = Vec::new();
    for _ in 0..2 {
        let cache = cache.clone();
        let barrier = barrier.clone();
        waiters.push(thread::spawn(move || {
            let Lookup::Busy(future) = cache.find_or_create(k, size).unwrap() else {
                panic!("expected busy lookup");
            };
            barrier.wait();
            assert!(future.wait());
            let pin = must_shared(&cache, k, size);
            assert_eq!(pin.size(), size);
        }));
    }

    barrier.wait();
    pin.write_all(&vec![3u8; size]);
    drop(pin.into_shared());
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(cache.refresh_stats().num_wait_exclusive, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_waiter_resumes() {
    let cache = Arc::new(new_cache(64));
    let k = key(4, 0);
    let mut pin = must_exclusive(&cache, k, 4096);
    let Lookup::Busy(future) = cache.find_or_create(k, 4096).unwrap() else {
        panic!("expected busy lookup");
    };
    let producer = tokio::task::spawn_blocking(move || {
        pin.write_all(&[1u8; 4096]);
        drop(pin.into_shared());
    });
    assert!(future.wait_async().await);
    producer.await.unwrap();
    assert!(cache.exists(k));
}

#[test]
fn larger_request_supersedes_entry() {
    let cache = new_cache(64);
    let k = key(3, 0);
    let old = {
        let mut pin = must_exclusive(&cache, k, 512);
        pin.write_all(&[1u8; 512]);
        pin.into_shared()
    };

    let Lookup::Exclusive(mut new_pin) = cache.find_or_create(k, 4096).unwrap() else {
        panic!("larger request must supersede");
    };
    // The superseded entry lost its key but its reader is unaffected.
    assert_eq!(old.key().file_num, 0);
    assert_eq!(old.to_vec(), vec![1u8; 512]);

    new_pin.write_all(&[2u8; 4096]);
    let new_shared = new_pin.into_shared();
    assert!(cache.exists(k));
    let found = must_shared(&cache, k, 4096);
    assert_eq!(found.to_vec(), vec![2u8; 4096]);

    // Once the old reader finishes, a sweep reclaims the orphan slot; the
    // pinned successor stays.
    drop(old);
    cache.clear();
    assert!(cache.exists(k));
    assert_eq!(cache.refresh_stats().num_entries, 1);
    drop(found);
    drop(new_shared);
}

#[test]
fn abandoned_exclusive_wakes_waiters() {
    let cache = Arc::new(new_cache(64));
    let k = key(18, 0);
    let pin = must_exclusive(&cache, k, 1024);
    let Lookup::Busy(future) = cache.find_or_create(k, 1024).unwrap() else {
        panic!("expected busy lookup");
    };
    drop(pin); // load failed
    assert!(future.wait());
    assert!(!cache.exists(k));
    // The next caller becomes the loader.
    let _pin = must_exclusive(&cache, k, 1024);
}

#[test]
fn entry_allocation_failure_is_retriable() {
    let cache = new_cache(4);
    let err = match cache.find_or_create(key(17, 0), page_bytes(8)) {
        Err(err) => err,
        Ok(lookup) => panic!("expected failure, got {lookup:?}"),
    };
    assert!(err.is_retriable());
    assert!(!cache.exists(key(17, 0)));
    // Tiny entries bypass the page budget.
    let _pin = must_exclusive(&cache, key(17, 0), 100);
}

#[test]
fn shared_pins_clone_and_release() {
    let cache = new_cache(64);
    let pin = load_entry(&cache, key(21, 0), 1000);
    let clone = pin.clone();
    drop(pin);
    assert_eq!(clone.to_vec(), vec![0u8; 1000]);

    // Still pinned: the sweep must leave it alone.
    cache.clear();
    assert_eq!(cache.refresh_stats().num_entries, 1);
    drop(clone);
    cache.clear();
    assert_eq!(cache.refresh_stats().num_entries, 0);
}

#[test]
fn make_space_evicts_unpinned_entries() {
    let cache = new_cache(256);
    let mut shared = Vec::new();
    for i in 0..16 {
        let mut pin = must_exclusive(&cache, key(5, i * 100_000), page_bytes(16));
        pin.write_all(&vec![i as u8; page_bytes(16)]);
        shared.push(pin.into_shared());
    }
    assert_eq!(cache.cached_pages(), 256);

    let kept = shared.pop().unwrap();
    shared.clear();

    let allocator = cache.allocator().clone();
    let mut target = Allocation::empty();
    let ok = cache.make_space(64, |acquired| {
        target.append_move(acquired);
        if target.num_pages() >= 64 {
            return true;
        }
        let mut extra = Allocation::empty();
        if extra.try_allocate(&allocator, 64 - target.num_pages()) {
            target.append_move(&mut extra);
            true
        } else {
            false
        }
    });
    assert!(ok);
    assert!(target.num_pages() >= 64);
    // Harvested pages were moved, not freed: the allocator accounts for the
    // surviving entries plus everything handed to the caller.
    assert_eq!(
        cache.allocator().num_allocated(),
        cache.cached_pages() + target.num_pages()
    );
    // No pinned entry was evicted.
    assert!(cache.exists(kept.key()));
}

#[test]
fn concurrent_make_space_settles() {
    let cache = Arc::new(new_cache(512));
    for i in 0..64 {
        drop(load_entry(&cache, key(6, i * 1_000_000), page_bytes(8)));
    }

    let barrier = Arc::new(Barrier::new(16));
    let mut threads = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            barrier.wait();
            let allocator = cache.allocator().clone();
            for _ in 0..2 {
                let mut target = Allocation::empty();
                let ok = cache.make_space(16, |acquired| {
                    target.append_move(acquired);
                    if target.num_pages() >= 16 {
                        return true;
                    }
                    let mut extra = Allocation::empty();
                    if extra.try_allocate(&allocator, 16 - target.num_pages()) {
                        target.append_move(&mut extra);
                        true
                    } else {
                        false
                    }
                });
                assert!(ok);
                target.free();
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(
        cache.inner().num_threads_in_allocate.load(Ordering::Relaxed),
        0
    );
}

#[test]
fn make_space_fails_deterministically_when_over_capacity() {
    let cache = new_cache(32);
    let ok = cache.make_space(64, |_| false);
    assert!(!ok);
    let message = cache.failure_message().expect("diagnostic must be set");
    assert!(message.contains("failed to make space"));
}

#[derive(Default)]
struct TestSsd {
    write_in_progress: AtomicBool,
    admit: AtomicBool,
    writes: Mutex<Vec<usize>>,
    filter_updates: AtomicU64,
}

impl SsdCache for TestSsd {
    fn write_in_progress(&self) -> bool {
        self.write_in_progress.load(Ordering::Relaxed)
    }

    fn start_write(&self) -> bool {
        !self.write_in_progress.swap(true, Ordering::Relaxed)
    }

    fn write(&self, pins: Vec<SharedPin>) {
        for (index, pin) in pins.iter().enumerate() {
            pin.set_ssd_location(SsdLocation {
                file: 1,
                offset: index as u64 * 4096,
            });
        }
        self.writes.lock().push(pins.len());
        self.write_in_progress.store(false, Ordering::Relaxed);
    }

    fn max_bytes(&self) -> u64 {
        1 << 30
    }

    fn should_save_to_ssd(&self, _group_id: u64, _tracking_id: u64) -> bool {
        self.admit.load(Ordering::Relaxed)
    }

    fn update_ssd_filter(&self, _target_bytes: u64) {
        self.filter_updates.fetch_add(1, Ordering::Relaxed);
    }
}

fn ssd_cache(pages: usize, ssd: Arc<TestSsd>) -> DataCache {
    CacheConfig {
        num_shards: 1,
        ..Default::default()
    }
    .build(HeapAllocator::new(pages), Some(ssd))
}

#[test]
fn eviction_skips_saveable_during_ssd_write() {
    let ssd = Arc::new(TestSsd::default());
    ssd.admit.store(true, Ordering::Relaxed);
    let cache = ssd_cache(256, ssd.clone());
    for i in 0..8 {
        drop(load_entry(&cache, key(2, i * 100_000), page_bytes(4)));
    }

    // Claim the write so the sweep sees one in progress.
    assert!(ssd.start_write());
    let inner = cache.inner();
    let mut acquired = Allocation::empty();
    inner.shards[0].evict(inner, u64::MAX, false, 0, &mut acquired);
    assert_eq!(cache.refresh_stats().num_entries, 8);
    assert_eq!(inner.num_skipped_saves.load(Ordering::Relaxed), 1);

    // Desperate mode evicts saveable entries anyway.
    inner.shards[0].evict(inner, u64::MAX, true, 0, &mut acquired);
    assert_eq!(cache.refresh_stats().num_entries, 0);
    assert!(acquired.is_empty());
}

#[test]
fn ssd_save_batches_at_most_seventy_percent() {
    let ssd = Arc::new(TestSsd::default());
    ssd.admit.store(true, Ordering::Relaxed);
    let cache = ssd_cache(256, ssd.clone());
    for i in 0..10 {
        drop(load_entry(&cache, key(24, i * 100_000), 512));
    }

    assert!(ssd.start_write());
    cache.inner().save_to_ssd();
    assert_eq!(*ssd.writes.lock(), vec![7]);

    // Written entries are no longer candidates; the leftovers go next.
    assert!(ssd.start_write());
    cache.inner().save_to_ssd();
    assert_eq!(*ssd.writes.lock(), vec![7, 3]);
}

#[test]
fn enough_saveable_bytes_triggers_a_save() {
    let ssd = Arc::new(TestSsd::default());
    ssd.admit.store(true, Ordering::Relaxed);
    let cache = ssd_cache(8192, ssd.clone());
    let mut pins = Vec::new();
    for i in 0..17 {
        pins.push(load_entry(&cache, key(8, i * 10_000_000), 1 << 20));
    }
    // Crossing the accumulation threshold kicked off exactly one save.
    assert_eq!(ssd.writes.lock().len(), 1);
}

struct BatchLoader {
    cache: Arc<DataCache>,
    keys: Vec<(RawCacheKey, usize)>,
}

impl EntryLoader for BatchLoader {
    fn load(&self, _prefetch: bool) -> Result<Vec<ExclusivePin>> {
        let mut pins = Vec::new();
        for &(key, size) in &self.keys {
            match self.cache.find_or_create(key, size)? {
                Lookup::Exclusive(mut pin) => {
                    pin.write_all(&vec![9u8; size]);
                    pins.push(pin);
                }
                other => panic!("batch entries should be new, got {other:?}"),
            }
        }
        Ok(pins)
    }
}

#[test]
fn coalesced_load_publishes_all_entries() {
    let cache = Arc::new(new_cache(256));
    let keys: Vec<_> = (0..3).map(|i| (key(11, i * 4096), 4096)).collect();
    let load = CoalescedLoad::new(Box::new(BatchLoader {
        cache: cache.clone(),
        keys: keys.clone(),
    }));

    assert_eq!(load.state(), LoadState::Planned);
    assert!(matches!(load.load_or_future(true).unwrap(), LoadStatus::Complete));
    assert_eq!(load.state(), LoadState::Loaded);

    for (key, size) in keys {
        let pin = must_shared(&cache, key, size);
        assert_eq!(pin.to_vec(), vec![9u8; size]);
    }
    // Later calls are no-ops.
    assert!(matches!(load.load_or_future(false).unwrap(), LoadStatus::Complete));
}

struct FailingLoader {
    barrier: Arc<Barrier>,
}

impl EntryLoader for FailingLoader {
    fn load(&self, _prefetch: bool) -> Result<Vec<ExclusivePin>> {
        self.barrier.wait();
        Err(io::Error::new(io::ErrorKind::Other, "storage failed").into())
    }
}

#[test]
fn failed_load_cancels_and_wakes_waiters() {
    let barrier = Arc::new(Barrier::new(2));
    let load = Arc::new(CoalescedLoad::new(Box::new(FailingLoader {
        barrier: barrier.clone(),
    })));

    let producer = {
        let load = load.clone();
        thread::spawn(move || load.load_or_future(true))
    };
    while load.state() != LoadState::Loading {
        thread::yield_now();
    }
    let LoadStatus::Pending(Some(future)) = load.load_or_future(true).unwrap() else {
        panic!("expected a future while loading");
    };
    barrier.wait();
    assert!(future.wait());
    assert!(producer.join().unwrap().is_err());
    assert_eq!(load.state(), LoadState::Cancelled);
    assert!(matches!(load.load_or_future(true).unwrap(), LoadStatus::Complete));
}

#[test]
fn prefetched_entry_counts_once_consumed() {
    let cache = new_cache(64);
    let k = key(12, 0);
    let mut pin = must_exclusive(&cache, k, page_bytes(2));
    pin.set_prefetch(true);
    pin.write_all(&vec![0u8; page_bytes(2)]);
    drop(pin.into_shared());
    assert_eq!(cache.inner().prefetch_pages(), 2);
    assert_eq!(cache.refresh_stats().num_prefetch, 1);

    // The first regular lookup consumes the prefetch instead of counting a
    // hit.
    let pin = must_shared(&cache, k, page_bytes(2));
    assert!(pin.is_first_use());
    assert_eq!(cache.inner().prefetch_pages(), 0);
    assert_eq!(cache.refresh_stats().num_hit, 0);
    drop(pin);

    let _pin = must_shared(&cache, k, page_bytes(2));
    assert_eq!(cache.refresh_stats().num_hit, 1);
}

#[test]
fn clear_is_idempotent_and_empties_the_cache() {
    let cache = new_cache(256);
    for i in 0..10 {
        drop(load_entry(&cache, key(13, i * 50_000), page_bytes(3)));
    }
    assert_eq!(cache.refresh_stats().num_entries, 10);

    cache.clear();
    let stats = cache.refresh_stats();
    assert_eq!(stats.num_entries, 0);
    assert_eq!(cache.cached_pages(), 0);
    assert_eq!(cache.allocator().num_allocated(), 0);

    cache.clear();
    assert_eq!(cache.refresh_stats().num_entries, 0);
    cache.shutdown();
}

#[test]
fn page_accounting_matches_entries() {
    let cache = new_cache(512);
    let mut pins = Vec::new();
    for i in 0..6 {
        pins.push(load_entry(&cache, key(15, i * 1_000_000), page_bytes(5 + i as usize)));
    }
    let total: usize = pins.iter().map(|pin| pin.data().num_pages()).sum();
    assert_eq!(cache.cached_pages(), total);
    assert_eq!(cache.allocator().num_allocated(), total);

    drop(pins);
    cache.clear();
    assert_eq!(cache.cached_pages(), 0);
}

#[test]
fn exists_reports_presence() {
    let cache = new_cache(64);
    let k = key(16, 0);
    assert!(!cache.exists(k));
    let pin = load_entry(&cache, k, 1000);
    assert!(cache.exists(k));
    drop(pin);
    assert!(cache.exists(k));
}

#[test]
fn recycled_entries_are_bounded() {
    let cache = CacheConfig {
        num_shards: 1,
        max_free_entries: 4,
        ..Default::default()
    }
    .build(HeapAllocator::new(256), None);
    for i in 0..12 {
        drop(load_entry(&cache, key(14, i * 10_000), 512));
    }
    cache.clear();
    let inner = cache.inner();
    assert!(inner.shards[0].state.lock().free_entries.len() <= 4);
}

#[test]
fn verify_hook_runs_on_publish() {
    let seen = Arc::new(AtomicU64::new(0));
    let hook_seen = seen.clone();
    let cache = CacheConfig {
        verify_hook: Some(Box::new(move |pin| {
            hook_seen.fetch_add(pin.size() as u64, Ordering::Relaxed);
        })),
        ..Default::default()
    }
    .build(HeapAllocator::new(64), None);
    drop(load_entry(&cache, key(22, 0), 1234));
    assert_eq!(seen.load(Ordering::Relaxed), 1234);
}

#[test]
fn file_leases_follow_entries() {
    let cache = new_cache(64);
    drop(load_entry(&cache, key(23, 0), 100));
    assert!(cache.file_ids().is_live(23));
    cache.clear();
    assert!(!cache.file_ids().is_live(23));
}

#[test]
fn describe_renders_stats() {
    let cache = new_cache(64);
    drop(load_entry(&cache, key(20, 0), 1000));
    let text = cache.describe(true);
    assert!(text.contains("DataCache:"));
    assert!(text.contains("Cache entries: 1"));
    assert!(text.contains("shard 0:"));
}
