//! Refcounted interning of raw file numbers.
//!
//! Cache keys carry a raw `u64` file number, but every live entry also holds
//! a [`FileIdLease`] so the registry knows which files still have cached
//! data. File number 0 is reserved: a cleared key stores 0 and is never
//! interned.

use std::sync::Arc;

use dashmap::DashMap;

/// Registry of live file numbers.
#[derive(Debug, Default)]
pub struct FileIds {
    // We only hold a map ref for the refcount update itself.
    counts: DashMap<u64, u64>,
}

impl FileIds {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a lease on `file_num`, interning it if needed.
    pub fn lease(self: &Arc<Self>, file_num: u64) -> FileIdLease {
        assert_ne!(file_num, 0, "file number 0 is reserved");
        *self.counts.entry(file_num).or_insert(0) += 1;
        FileIdLease {
            registry: self.clone(),
            file_num,
        }
    }

    /// Whether any lease on `file_num` is outstanding.
    pub fn is_live(&self, file_num: u64) -> bool {
        self.counts.contains_key(&file_num)
    }

    /// Number of distinct live file numbers.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn unlease(&self, file_num: u64) {
        use dashmap::mapref::entry::Entry;

        match self.counts.entry(file_num) {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() -= 1;
                if *occupied.get() == 0 {
                    occupied.remove();
                }
            }
            Entry::Vacant(_) => debug_assert!(false, "unlease of unknown file number"),
        }
    }
}

/// Owning handle on an interned file number. Dropping the last lease retires
/// the number from the registry.
#[derive(Debug)]
pub struct FileIdLease {
    registry: Arc<FileIds>,
    file_num: u64,
}

impl FileIdLease {
    pub fn file_num(&self) -> u64 {
        self.file_num
    }
}

impl Clone for FileIdLease {
    fn clone(&self) -> Self {
        self.registry.lease(self.file_num)
    }
}

impl Drop for FileIdLease {
    fn drop(&mut self) {
        self.registry.unlease(self.file_num);
    }
}

#[cfg(test)]
mod tests {
    use super::FileIds;

    #[test]
    fn lease_refcounts() {
        let ids = FileIds::new();
        let a = ids.lease(7);
        let b = ids.lease(7);
        let c = a.clone();
        assert_eq!(ids.len(), 1);
        assert!(ids.is_live(7));

        drop(a);
        drop(b);
        assert!(ids.is_live(7));
        drop(c);
        assert!(!ids.is_live(7));
        assert!(ids.is_empty());
    }

    #[test]
    fn distinct_numbers_are_independent() {
        let ids = FileIds::new();
        let a = ids.lease(1);
        let _b = ids.lease(2);
        drop(a);
        assert!(!ids.is_live(1));
        assert!(ids.is_live(2));
    }
}
