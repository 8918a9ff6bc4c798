#![forbid(unsafe_op_in_unsafe_fn)]

//! An in-process, two-tier (RAM + optional SSD) cache for immutable byte
//! ranges of named files.
//!
//! The cache maps `(file id, offset)` keys to variable-sized buffers. Entries
//! are populated on demand: the first caller for a key receives an
//! [`ExclusivePin`] and must fill the buffer, everyone else either shares a
//! completed entry through a [`SharedPin`] or waits on a future that resolves
//! when the load finishes. Unpinned entries are reclaimed by a CLOCK sweep
//! tuned to sampled access scores, and a memory-arbitration loop
//! ([`DataCache::make_space`]) resolves contention between concurrent
//! allocators under a fixed page budget.

use std::{io, result, sync::Arc};

use thiserror::Error;

pub mod alloc;
pub mod cache;
pub mod coalesce;
pub mod file_id;
pub mod ssd;
mod util;

pub use crate::{
    alloc::{Allocation, Allocator, HeapAllocator, PAGE_SIZE},
    cache::{
        entry::{EntryData, RawCacheKey},
        load::{CoalescedLoad, EntryLoader, LoadState, LoadStatus},
        pin::{ExclusivePin, SharedPin},
        CacheConfig, CacheFuture, CacheStats, DataCache, Lookup, VerifyHook,
    },
    coalesce::{read_pins, CoalesceIoStats, IoRange},
    file_id::{FileIdLease, FileIds},
    ssd::{SsdCache, SsdLocation},
};

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error {
    // Use `Arc` here because concurrent code may need to share error values.
    // Don't expose this to public code.
    kind: Arc<ErrorKind>,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Page allocation for a new entry failed. The entry has been removed;
    /// retrying after eviction makes progress is expected to succeed.
    #[error("no cache space for {size} bytes")]
    NoCacheSpace { size: usize },
    /// An unexpected I/O error occurred in a loader.
    #[error("unexpected io error occurred: {0:?}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// A retriable error means the operation failed against a transient
    /// resource limit, not an invariant violation.
    pub fn is_retriable(&self) -> bool {
        matches!(*self.kind, ErrorKind::NoCacheSpace { .. })
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    #[inline]
    fn from(error: E) -> Self {
        Error {
            kind: Arc::new(error.into()),
        }
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        io::Error::from(kind).into()
    }
}
