use std::{fmt, mem::ManuallyDrop, ptr, sync::Arc};

use super::{
    entry::{Entry, EntryData, RawCacheKey},
    shard::Shard,
    CacheInner,
};
use crate::ssd::SsdLocation;

/// A read reference to a completed cache entry.
///
/// Cloning adds a reference; dropping releases one. While any shared pin is
/// alive the entry's buffer is immutable and the entry cannot be evicted.
pub struct SharedPin {
    pub(crate) entry: Arc<Entry>,
}

impl SharedPin {
    /// Wrap an entry whose pin count already includes this pin.
    pub(crate) fn from_incremented(entry: Arc<Entry>) -> Self {
        debug_assert!(entry.is_shared());
        Self { entry }
    }

    /// The entry's key. A superseded entry reports file number 0.
    pub fn key(&self) -> RawCacheKey {
        self.entry.key()
    }

    pub fn size(&self) -> usize {
        self.entry.size()
    }

    pub fn data(&self) -> &EntryData {
        // SAFETY: this pin keeps the entry shared, so the buffer is immutable.
        unsafe { self.entry.data() }
    }

    /// Copy the entry's logical bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().copy_to_vec(self.size())
    }

    /// True on the first shared access after the load completed.
    pub fn is_first_use(&self) -> bool {
        self.entry.is_first_use()
    }

    pub fn clear_first_use(&self) {
        self.entry.set_first_use(false);
    }

    /// Zero the access stats so the next eviction sweep selects this entry.
    pub fn make_evictable(&self) {
        self.entry.make_evictable();
    }

    pub fn ssd_location(&self) -> Option<SsdLocation> {
        self.entry.ssd_location()
    }

    /// Record where the SSD tier persisted this entry. Clears the saveable
    /// flag; the entry is no longer a save candidate.
    pub fn set_ssd_location(&self, location: SsdLocation) {
        self.entry.set_ssd_location(Some(location));
        self.entry.set_ssd_saveable(false);
    }
}

impl Clone for SharedPin {
    fn clone(&self) -> Self {
        self.entry.add_shared_pin();
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl Drop for SharedPin {
    fn drop(&mut self) {
        self.entry.release_shared();
    }
}

impl fmt::Debug for SharedPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedPin").field(&self.entry).finish()
    }
}

/// The unique write handle on an entry being loaded.
///
/// The owner fills the buffer and calls [`into_shared`](Self::into_shared)
/// to publish it. Dropping the pin without sharing means the load failed:
/// the entry is removed from its shard and any waiters are woken to retry.
pub struct ExclusivePin {
    entry: Arc<Entry>,
    shard: Arc<Shard>,
    cache: Arc<CacheInner>,
}

impl ExclusivePin {
    pub(crate) fn new(entry: Arc<Entry>, shard: Arc<Shard>, cache: Arc<CacheInner>) -> Self {
        debug_assert!(entry.is_exclusive());
        Self { entry, shard, cache }
    }

    pub fn key(&self) -> RawCacheKey {
        self.entry.key()
    }

    pub fn size(&self) -> usize {
        self.entry.size()
    }

    pub fn data(&self) -> &EntryData {
        // SAFETY: this pin is the unique owner.
        unsafe { self.entry.data() }
    }

    pub fn data_mut(&mut self) -> &mut EntryData {
        // SAFETY: this pin is the unique owner.
        unsafe { self.entry.data_mut() }
    }

    /// Fill the entry with exactly its logical size of bytes.
    pub fn write_all(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.size(), "fill must cover the entry");
        self.data_mut().copy_from(src);
    }

    /// Mark the entry as created by prefetch (or consume the mark), keeping
    /// the cache-wide prefetch page counter in step.
    pub fn set_prefetch(&self, flag: bool) {
        if self.entry.swap_prefetch(flag) != flag {
            let pages = self.entry.num_pages() as i64;
            self.cache
                .increment_prefetch_pages(if flag { pages } else { -pages });
        }
    }

    /// Tag the entry for the SSD admission filter.
    pub fn set_group_id(&self, group_id: u64) {
        self.entry.set_group_id(group_id);
    }

    pub fn set_tracking_id(&self, tracking_id: u64) {
        self.entry.set_tracking_id(tracking_id);
    }

    /// Publish the filled entry: waiters are woken, the verify hook runs,
    /// and the SSD admission filter is consulted.
    pub fn into_shared(self) -> SharedPin {
        let this = ManuallyDrop::new(self);
        // SAFETY: each field is read exactly once and the normal Drop (which
        // would treat this as a failed load) is suppressed.
        let (entry, shard, cache) = unsafe {
            (
                ptr::read(&this.entry),
                ptr::read(&this.shard),
                ptr::read(&this.cache),
            )
        };

        assert!(
            entry.key().file_num != 0,
            "cannot share an entry whose key was cleared"
        );
        entry.make_shared();
        // Move the promise out under the shard mutex so no waiter can
        // register during the hand-off; fulfill it after releasing.
        let promise = {
            let _state = shard.state.lock();
            entry.take_promise()
        };
        if let Some(promise) = promise {
            let _ = promise.set(true);
        }

        let pin = SharedPin::from_incremented(entry);
        if let Some(hook) = &cache.config.verify_hook {
            hook(&pin);
        }

        // The entry now has readers; decide whether it should also go to SSD.
        if pin.entry.ssd_location().is_none() {
            if let Some(ssd) = &cache.ssd {
                if ssd.should_save_to_ssd(pin.entry.group_id(), pin.entry.tracking_id()) {
                    pin.entry.set_ssd_saveable(true);
                    cache.possible_ssd_save(pin.entry.size() as u64);
                }
            }
        }
        pin
    }
}

impl Drop for ExclusivePin {
    fn drop(&mut self) {
        // Dropping without sharing means the content could not be produced,
        // e.g. an error in loading. Remove the entry and wake waiters.
        Shard::abandon_exclusive(&self.shard, &self.cache, &self.entry);
    }
}

impl fmt::Debug for ExclusivePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExclusivePin").field(&self.entry).finish()
    }
}
