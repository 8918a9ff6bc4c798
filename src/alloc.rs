//! Page-granular memory accounting for cache buffers.
//!
//! The cache does not own the machine's memory policy; it consumes a narrow
//! [`Allocator`] contract that arbitrates a page budget. Buffer memory itself
//! is carried by [`Allocation`]s: sets of independently-allocated page runs
//! that move between entries and the arbitration loop without copying.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Machine page size used for cache accounting.
pub const PAGE_SIZE: usize = 4096;

/// Upper bound on the pages in a single run. Large entries are split into
/// several runs, so a scatter read over an entry may span multiple ranges.
pub const MAX_PAGES_PER_RUN: usize = 64;

/// Number of pages needed to cover `bytes`.
pub fn pages_for_bytes(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Byte size of `pages` pages.
pub fn page_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Arbiter of the page budget backing the cache.
///
/// Implementations only track accounting; the memory for each run comes from
/// the global heap. `reserve` must be atomic with respect to concurrent
/// callers and may not over-commit `capacity_pages`.
pub trait Allocator: Send + Sync {
    /// Reserve `pages` against the budget. Returns false when the budget
    /// cannot cover them.
    fn reserve(&self, pages: usize) -> bool;

    /// Return previously reserved pages to the budget.
    fn release(&self, pages: usize);

    /// Pages currently reserved.
    fn num_allocated(&self) -> usize;

    /// Total page budget.
    fn capacity_pages(&self) -> usize;
}

/// Budget-only allocator over heap memory.
#[derive(Debug)]
pub struct HeapAllocator {
    capacity_pages: usize,
    allocated: AtomicUsize,
}

impl HeapAllocator {
    pub fn new(capacity_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity_pages,
            allocated: AtomicUsize::new(0),
        })
    }
}

impl Allocator for HeapAllocator {
    fn reserve(&self, pages: usize) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current + pages <= self.capacity_pages {
                    Some(current + pages)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self, pages: usize) {
        let previous = self.allocated.fetch_sub(pages, Ordering::AcqRel);
        assert!(previous >= pages, "allocator page accounting went negative");
    }

    fn num_allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }
}

/// One contiguous run of pages.
#[derive(Debug)]
pub struct PageRun {
    data: Box<[u8]>,
}

impl PageRun {
    fn new(pages: usize) -> Self {
        Self {
            data: vec![0u8; page_bytes(pages)].into_boxed_slice(),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.data.len() / PAGE_SIZE
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A non-contiguous page allocation: zero or more runs plus the budget
/// reservation covering them. Dropping an allocation frees its runs and
/// returns the reservation, so it cannot leak on any exit path.
#[derive(Default)]
pub struct Allocation {
    runs: Vec<PageRun>,
    pages: usize,
    owner: Option<Arc<dyn Allocator>>,
}

impl Allocation {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Allocate `pages` pages from `allocator` into this (empty) allocation.
    /// Returns false, leaving the allocation empty, when the budget is
    /// exhausted.
    pub fn try_allocate(&mut self, allocator: &Arc<dyn Allocator>, pages: usize) -> bool {
        assert!(self.is_empty(), "allocation must be empty before allocate");
        if pages == 0 {
            return true;
        }
        if !allocator.reserve(pages) {
            return false;
        }
        let mut remaining = pages;
        while remaining > 0 {
            let run_pages = remaining.min(MAX_PAGES_PER_RUN);
            self.runs.push(PageRun::new(run_pages));
            remaining -= run_pages;
        }
        self.pages = pages;
        self.owner = Some(allocator.clone());
        true
    }

    /// Move the runs and reservation of `other` into this allocation.
    pub fn append_move(&mut self, other: &mut Allocation) {
        if other.is_empty() {
            return;
        }
        match (&self.owner, &other.owner) {
            (Some(a), Some(b)) => assert!(
                Arc::ptr_eq(a, b),
                "cannot merge allocations from different allocators"
            ),
            (None, Some(b)) => self.owner = Some(b.clone()),
            _ => unreachable!("non-empty allocation without an owner"),
        }
        self.pages += other.pages;
        self.runs.append(&mut other.runs);
        other.pages = 0;
        other.owner = None;
    }

    /// Free all runs and return the reservation immediately.
    pub fn free(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(self.pages);
        }
        self.runs.clear();
        self.pages = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn num_pages(&self) -> usize {
        self.pages
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn byte_size(&self) -> usize {
        page_bytes(self.pages)
    }

    pub fn runs(&self) -> impl Iterator<Item = &[u8]> {
        self.runs.iter().map(|run| run.bytes())
    }

    pub fn runs_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.runs.iter_mut().map(|run| run.bytes_mut())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("pages", &self.pages)
            .field("runs", &self.runs.len())
            .finish()
    }
}
