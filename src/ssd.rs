//! Contract between the RAM tier and an SSD persistence tier.
//!
//! The RAM cache never talks to storage hardware. It selects save candidates,
//! pins them, and hands the batch to an [`SsdCache`] implementation. The
//! trait is deliberately narrow: a write-ownership claim, a write submission,
//! and the admission filter that decides which entries are worth persisting.

use crate::cache::pin::SharedPin;

/// Where an entry has been persisted on SSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsdLocation {
    pub file: u32,
    pub offset: u64,
}

pub trait SsdCache: Send + Sync {
    /// Whether a write batch is currently being persisted.
    fn write_in_progress(&self) -> bool;

    /// Claim write ownership. Returns true iff the caller now owns the write;
    /// it must then follow up with [`write`](SsdCache::write).
    fn start_write(&self) -> bool;

    /// Persist the pinned entries. The implementation releases the pins when
    /// it is done and is expected to record an [`SsdLocation`] on each entry
    /// it wrote.
    fn write(&self, pins: Vec<SharedPin>);

    /// Capacity of the SSD tier.
    fn max_bytes(&self) -> u64;

    /// Admission filter: whether entries of this file group are worth
    /// persisting, given observed access patterns.
    fn should_save_to_ssd(&self, group_id: u64, tracking_id: u64) -> bool;

    /// Retarget the admission filter at `target_bytes` of SSD usage.
    fn update_ssd_filter(&self, target_bytes: u64);
}
