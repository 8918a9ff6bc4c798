use std::{
    fmt::{Debug, Formatter},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use once_cell::sync::OnceCell;
use pin_project_lite::pin_project;
use tokio::sync::{futures::Notified, Notify};

/// A write-once cell that waiters can block or `.await` on.
///
/// This is the broadcast half of a one-shot promise: any number of waiters may
/// park on the cell, and all of them resume once a value is set. The value can
/// never be replaced or cleared, so a resumed waiter always observes it.
pub struct FutureCell<T> {
    cell: OnceCell<T>,
    notify: Notify,
}

impl<T> FutureCell<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Set the value, waking all current waiters. Fails if a value is already
    /// present.
    pub fn set(&self, value: T) -> Result<(), T> {
        self.cell.set(value)?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Block the calling thread until a value is present.
    pub fn wait(&self) -> &T {
        self.cell.wait()
    }

    /// Wait without blocking the thread. The returned future is re-armed on
    /// spurious wakeups, so a `set` racing with waiter registration is never
    /// lost.
    pub fn wait_async(&self) -> WaitAsync<'_, T> {
        WaitAsync {
            cell: self,
            notified: self.notify.notified(),
        }
    }
}

impl<T> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for FutureCell<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureCell")
            .field("value", &self.get())
            .finish()
    }
}

pin_project! {
    pub struct WaitAsync<'a, T> {
        cell: &'a FutureCell<T>,
        #[pin]
        notified: Notified<'a>,
    }
}

impl<'a, T> Future for WaitAsync<'a, T> {
    type Output = &'a T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let mut this = self.as_mut().project();
            let cell: &'a FutureCell<T> = *this.cell;
            if let Some(value) = cell.get() {
                return Poll::Ready(value);
            }
            match this.notified.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    // Consumed a notification; re-arm and re-check the cell.
                    this.notified.set(cell.notify.notified());
                }
                Poll::Pending => {
                    // The waker is registered. Re-check in case a set landed
                    // between the first check and registration.
                    if let Some(value) = cell.get() {
                        return Poll::Ready(value);
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::FutureCell;

    #[test]
    fn set_then_wait() {
        let cell = FutureCell::new();
        cell.set(7u32).unwrap();
        assert_eq!(cell.set(8), Err(8));
        assert_eq!(*cell.wait(), 7);
    }

    #[test]
    fn blocking_waiters_resume() {
        let cell = Arc::new(FutureCell::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cell = cell.clone();
            waiters.push(thread::spawn(move || *cell.wait()));
        }
        thread::sleep(Duration::from_millis(20));
        cell.set(true).unwrap();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[tokio::test]
    async fn async_waiters_resume() {
        let cell = Arc::new(FutureCell::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cell = cell.clone();
            waiters.push(tokio::spawn(async move { *cell.wait_async().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        cell.set(11u64).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 11);
        }
    }
}
