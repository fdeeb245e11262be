//! Per-session critical sections.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::SessionId;

/// One async mutex per session id, created on first use and removed when
/// the last holder or waiter lets go.
///
/// Operations on different sessions never contend.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

/// Exclusive access to one session. Dropping it releases the lock.
pub struct SessionLockGuard<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Map and `self.lock` are the only references left when nobody waits.
        self.locks.locks.remove_if(&self.session_id, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn lock(&self, session_id: &SessionId) -> SessionLockGuard<'_> {
        let lock = self
            .locks
            .entry(*session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = Arc::clone(&lock).lock_owned().await;
        SessionLockGuard {
            locks: self,
            session_id: *session_id,
            lock,
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn same_session_is_serialized() {
        let locks = SessionLocks::new();
        let session = Uuid::new_v4();

        let guard = locks.lock(&session).await;
        let second = tokio::time::timeout(Duration::from_millis(20), locks.lock(&session)).await;
        assert!(second.is_err());
        drop(guard);

        let _guard = tokio::time::timeout(Duration::from_millis(20), locks.lock(&session))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.lock(&Uuid::new_v4()).await;
        let _b = tokio::time::timeout(Duration::from_millis(20), locks.lock(&Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn released_lock_is_removed() {
        let locks = SessionLocks::new();
        for _ in 0..10 {
            let guard = locks.lock(&Uuid::new_v4()).await;
            assert_eq!(locks.len(), 1);
            drop(guard);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn lock_with_waiter_survives_release() {
        let locks = Arc::new(SessionLocks::new());
        let session = Uuid::new_v4();

        let first = locks.lock(&session).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&session).await;
                locks.len()
            })
        };
        tokio::task::yield_now().await;
        drop(first);

        assert_eq!(waiter.await.unwrap(), 1);
        assert!(locks.is_empty());
    }
}
