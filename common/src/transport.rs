use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

/// Exclusive-use token for the device's single network transport.
///
/// Each service loop acquires it right before network I/O and drops the
/// guard right after, never across a sleep. The lock is not reentrant: a
/// second `acquire` from a loop that still holds a guard deadlocks.
#[derive(Clone, Default)]
pub struct TransportLock {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    token: Mutex<()>,
    holder: StdMutex<Option<&'static str>>,
}

pub struct TransportGuard<'a> {
    holder: &'a StdMutex<Option<&'static str>>,
    _token: MutexGuard<'a, ()>,
}

impl TransportLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, owner: &'static str) -> TransportGuard<'_> {
        let token = self.inner.token.lock().await;
        *self
            .inner
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(owner);
        TransportGuard {
            holder: &self.inner.holder,
            _token: token,
        }
    }

    pub fn holder(&self) -> Option<&'static str> {
        *self
            .inner
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TransportGuard<'_> {
    fn drop(&mut self) {
        // Cleared before the token field is dropped, so the next owner never
        // sees a stale name.
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
