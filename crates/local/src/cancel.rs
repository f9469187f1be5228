use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use crate::driver::Event;

/// Cancels runs from another thread.
///
/// Cancelling wakes every coordinator currently waiting on the flag; they
/// stop dispatching, let in-flight tasks finish and return
/// `ExecError::Cancelled`. A cancelled flag stays cancelled.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Sender<Event>)>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, tx) in listeners.iter() {
            let _ = tx.send(Event::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a coordinator's event channel until the guard is dropped.
    pub(crate) fn subscribe(&self, tx: Sender<Event>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { flag: self.clone(), id }
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag").field("cancelled", &self.is_cancelled()).finish()
    }
}

pub(crate) struct Subscription {
    flag: CancelFlag,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.flag
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn cancel_wakes_subscribers_until_dropped() {
        let flag = CancelFlag::new();
        let (tx, rx) = mpsc::channel();
        let sub = flag.subscribe(tx);
        assert!(!flag.is_cancelled());

        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Event::Cancelled)));

        drop(sub);
        assert!(flag.inner.listeners.lock().unwrap().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
