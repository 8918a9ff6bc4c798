use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use super::{pin::ExclusivePin, CacheFuture};
use crate::{util::FutureCell, Result};

/// Progress of a coalesced load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Not started; the first caller will run it.
    Planned,
    /// A producer is filling the entries.
    Loading,
    Loaded,
    Cancelled,
}

/// Result of [`CoalescedLoad::load_or_future`].
#[derive(Debug)]
pub enum LoadStatus {
    /// The load is over (loaded or cancelled); re-check the cache.
    Complete,
    /// Another caller is loading. Carries a future when one was requested.
    Pending(Option<CacheFuture>),
}

/// Producer half of a coalesced load: fills a batch of entries, returning
/// their freshly loaded exclusive pins.
pub trait EntryLoader: Send + Sync {
    /// Load the batch. `prefetch` is true when nobody is waiting on the
    /// result, so the implementation may deprioritize the read.
    fn load(&self, prefetch: bool) -> Result<Vec<ExclusivePin>>;
}

/// Coordinates a multi-entry load so one producer fills N entries that will
/// be read together, while every other interested caller shares a single
/// completion.
///
/// Dropping a load cancels it, waking any waiters; they re-check the cache
/// and re-plan what is still missing.
pub struct CoalescedLoad {
    state: Mutex<LoadShared>,
    loader: Box<dyn EntryLoader>,
}

struct LoadShared {
    state: LoadState,
    promise: Option<Arc<FutureCell<bool>>>,
}

impl CoalescedLoad {
    pub fn new(loader: Box<dyn EntryLoader>) -> Self {
        Self {
            state: Mutex::new(LoadShared {
                state: LoadState::Planned,
                promise: None,
            }),
            loader,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state.lock().state
    }

    /// Run the load if it is still planned, or report on the one in flight.
    ///
    /// Exactly one caller observes `Planned` and becomes the producer; it
    /// fills the batch, publishes every entry, and returns `Complete`. With
    /// `wait` set, callers that lose the race receive a future resolving
    /// when the producer finishes or gives up. A producer failure cancels
    /// the load, wakes all waiters, and surfaces the original error.
    pub fn load_or_future(&self, wait: bool) -> Result<LoadStatus> {
        {
            let mut shared = self.state.lock();
            match shared.state {
                LoadState::Loaded | LoadState::Cancelled => return Ok(LoadStatus::Complete),
                LoadState::Loading => {
                    let future = if wait {
                        let cell = shared
                            .promise
                            .get_or_insert_with(|| Arc::new(FutureCell::new()))
                            .clone();
                        Some(CacheFuture::new(cell))
                    } else {
                        None
                    };
                    return Ok(LoadStatus::Pending(future));
                }
                LoadState::Planned => shared.state = LoadState::Loading,
            }
        }
        // Outside the lock: only this caller saw Planned.
        let pins = match self.loader.load(!wait) {
            Ok(pins) => pins,
            Err(error) => {
                // Wake waiters; the original failure surfaces to the caller.
                self.set_end_state(LoadState::Cancelled);
                return Err(error);
            }
        };
        for pin in pins {
            assert!(
                pin.key().file_num != 0,
                "loader produced an entry with a cleared key"
            );
            drop(pin.into_shared());
        }
        self.set_end_state(LoadState::Loaded);
        Ok(LoadStatus::Complete)
    }

    fn set_end_state(&self, state: LoadState) {
        let promise = {
            let mut shared = self.state.lock();
            shared.state = state;
            shared.promise.take()
        };
        if let Some(promise) = promise {
            let _ = promise.set(true);
        }
    }
}

impl Drop for CoalescedLoad {
    fn drop(&mut self) {
        // Unblock possibly waiting threads.
        self.set_end_state(LoadState::Cancelled);
    }
}

impl fmt::Debug for CoalescedLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescedLoad")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
