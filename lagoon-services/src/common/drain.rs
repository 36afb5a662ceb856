//! Graceful-shutdown broadcast.
//!
//! A [`DrainController`] fans a one-shot drain signal out to every
//! per-connection [`DrainWatcher`]. Watchers are polled from connection
//! select loops; once triggered they resolve immediately and forever.
//! Everything lives on one worker thread, so plain `Rc<RefCell<…>>`
//! bookkeeping suffices.

use std::{
    cell::RefCell,
    future::poll_fn,
    rc::{Rc, Weak},
    task::{Poll, Waker},
};

struct Shared {
    triggered: bool,
    waiters: Vec<Waker>,
}

/// Owning side; trigger on operator shutdown or worker teardown.
#[derive(Clone)]
pub struct DrainController {
    shared: Rc<RefCell<Shared>>,
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainController {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                triggered: false,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn watcher(&self) -> DrainWatcher {
        DrainWatcher {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn trigger(&self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.triggered {
            shared.triggered = true;
            for waker in shared.waiters.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.shared.borrow().triggered
    }
}

/// Per-connection view of the drain signal.
#[derive(Clone)]
pub struct DrainWatcher {
    shared: Weak<RefCell<Shared>>,
}

impl DrainWatcher {
    /// A watcher that never fires; connections outside any drain scope.
    pub fn disconnected() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.shared
            .upgrade()
            .map(|s| s.borrow().triggered)
            .unwrap_or(false)
    }

    /// Resolves when drain is triggered; pending forever for
    /// [`DrainWatcher::disconnected`] watchers.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            let Some(shared) = self.shared.upgrade() else {
                return Poll::Pending;
            };
            let mut shared = shared.borrow_mut();
            if shared.triggered {
                return Poll::Ready(());
            }
            if !shared.waiters.iter().any(|w| w.will_wake(cx.waker())) {
                shared.waiters.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test]
    async fn test_trigger_wakes_waiters() {
        let controller = DrainController::new();
        let watcher = controller.watcher();
        assert!(!watcher.is_triggered());

        {
            let fut = watcher.wait();
            futures::pin_mut!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
            controller.trigger();
            assert!(futures::poll!(fut.as_mut()).is_ready());
        }
        assert!(watcher.is_triggered());
        // Already-triggered watchers resolve immediately.
        watcher.wait().await;
    }

    #[monoio::test]
    async fn test_disconnected_watcher_never_fires() {
        let watcher = DrainWatcher::disconnected();
        let fut = watcher.wait();
        futures::pin_mut!(fut);
        assert!(futures::poll!(fut.as_mut()).is_pending());
        assert!(!watcher.is_triggered());
    }
}
