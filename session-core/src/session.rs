//! The `Session` runtime wrapper and its validity state machine (spec.md
//! §4.4).
//!
//! Grounded on the teacher's `Session` (an `Arc<Mutex<SessionData>>`-guarded
//! wrapper, using `tokio::sync::Mutex` per the teacher's own comment citing
//! the tokio docs on sync vs async locks) for the locking shape, generalized
//! to add the `VALID/INVALIDATING/INVALID` state machine the spec requires —
//! the teacher's cookie session has no cross-node invalidation race to guard
//! against.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::data::SessionData;
use crate::error::{Error, Result};

/// The three states a `Session` can be in (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state after construction; the session can be accessed and
    /// mutated.
    Valid,
    /// Invalidation in progress. Attribute reads still see every attribute;
    /// no new access may begin.
    Invalidating,
    /// Terminal. No access or mutation may succeed.
    Invalid,
}

/// Thread-safe wrapper around a `SessionData`, owning the validity state
/// machine and a request reference count (spec.md §3, §4.4).
///
/// Exactly one `Session` exists per cached id at a time; ownership of that
/// invariant belongs to `SessionCache`, not to this type.
#[derive(Debug)]
pub struct Session {
    data: Mutex<SessionData>,
    state: Mutex<SessionState>,
    /// Signalled whenever `state` transitions, so a thread racing with an
    /// in-progress invalidation can wait for it to settle instead of
    /// busy-polling.
    state_changed: Notify,
    ref_count: AtomicI64,
}

impl Session {
    pub fn new(data: SessionData) -> Self {
        Self {
            data: Mutex::new(data),
            state: Mutex::new(SessionState::Valid),
            state_changed: Notify::new(),
            ref_count: AtomicI64::new(0),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// `access(now)` from spec.md §4.4: allowed only in `Valid`. Updates
    /// `accessed`/`last_accessed`/`expiry`, bumps the ref count, and returns
    /// whether the session is still valid (not expired) after the update.
    ///
    /// If another thread is mid-invalidation this waits for that transition
    /// to settle rather than racing it, per spec.md §4.4's edge case: an
    /// access concurrent with invalidation must either be serialized before
    /// the invalidation (and succeed) or see `Invalid` (and fail cleanly).
    pub async fn access(&self, now: i64) -> Result<bool> {
        loop {
            // Register for the next notification before inspecting state,
            // per `Notify`'s documented safe-usage pattern: `notify_waiters`
            // only wakes futures that already exist at call time, so a
            // transition that fires between dropping the lock and awaiting
            // would otherwise be missed.
            let notified = self.state_changed.notified();
            {
                let state = self.state.lock().await;
                match *state {
                    SessionState::Valid => break,
                    SessionState::Invalid => return Err(Error::Lifecycle),
                    SessionState::Invalidating => {}
                }
            }
            notified.await;
        }

        self.ref_count.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().await;
        data.touch(now);
        Ok(!data.is_expired_at(now))
    }

    /// `complete()` from spec.md §4.4: request exit. Returns the ref count
    /// after decrementing, so the caller (the cache) can decide whether to
    /// write through and/or evict once it reaches zero.
    pub fn complete(&self) -> i64 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// `invalidate()` from spec.md §4.4: `Valid -> Invalidating -> Invalid`.
    /// Returns `Ok(true)` if this call performed the transition, `Ok(false)`
    /// if another thread already invalidated (or is invalidating) and this
    /// call simply waited for that to finish — the non-owner case the spec
    /// calls out explicitly.
    pub async fn invalidate(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Valid => {
                    *state = SessionState::Invalidating;
                }
                SessionState::Invalidating | SessionState::Invalid => {
                    drop(state);
                    self.wait_for_invalid().await;
                    return false;
                }
            }
        }
        self.state_changed.notify_waiters();

        // Listener callbacks fire here, while still Invalidating, so
        // attribute reads remain visible to them (spec.md §4.4).
        self.finish_invalidation().await;
        true
    }

    async fn finish_invalidation(&self) {
        let mut state = self.state.lock().await;
        *state = SessionState::Invalid;
        drop(state);
        self.state_changed.notify_waiters();
    }

    async fn wait_for_invalid(&self) {
        loop {
            let notified = self.state_changed.notified();
            if *self.state.lock().await == SessionState::Invalid {
                return;
            }
            notified.await;
        }
    }

    /// Read-only snapshot of the underlying data. Errors with
    /// `Error::Lifecycle` if the session is `Invalid`, per spec.md §4.4
    /// ("under INVALID, attribute reads return an error state").
    pub async fn snapshot(&self) -> Result<SessionData> {
        if *self.state.lock().await == SessionState::Invalid {
            return Err(Error::Lifecycle);
        }
        Ok(self.data.lock().await.clone())
    }

    /// Mutate the underlying data under the session's own lock. Rejected if
    /// the session is `Invalid`; no access may mutate an invalid session.
    pub async fn with_data_mut<R>(&self, f: impl FnOnce(&mut SessionData) -> R) -> Result<R> {
        if *self.state.lock().await == SessionState::Invalid {
            return Err(Error::Lifecycle);
        }
        let mut data = self.data.lock().await;
        Ok(f(&mut data))
    }
}

/// A cache typically holds sessions behind `Arc<Session>` so multiple
/// request-handling tasks can share ownership of the same live object.
pub type SharedSession = Arc<Session>;

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> SessionData {
        SessionData::new("s1", "", "host", 0, 60_000)
    }

    #[tokio::test]
    async fn access_updates_timestamps_and_ref_count() {
        let session = Session::new(data());
        let still_valid = session.access(1_000).await.unwrap();
        assert!(still_valid);
        assert_eq!(session.ref_count(), 1);

        let snap = session.snapshot().await.unwrap();
        assert_eq!(snap.accessed, 1_000);
    }

    #[tokio::test]
    async fn access_reports_expiry() {
        let session = Session::new(data());
        let still_valid = session.access(1_000_000).await.unwrap();
        assert!(!still_valid);
    }

    #[tokio::test]
    async fn invalidate_is_terminal() {
        let session = Session::new(data());
        assert!(session.invalidate().await);
        assert_eq!(session.state().await, SessionState::Invalid);

        let err = session.access(0).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle));
    }

    #[tokio::test]
    async fn second_invalidate_is_not_the_owner() {
        let session = Arc::new(Session::new(data()));
        let s2 = session.clone();

        let (a, b) = tokio::join!(
            async { session.invalidate().await },
            async { s2.invalidate().await }
        );

        // Exactly one caller performs the transition.
        assert!(a ^ b);
        assert_eq!(session.state().await, SessionState::Invalid);
    }

    #[tokio::test]
    async fn complete_decrements_ref_count() {
        let session = Session::new(data());
        session.access(0).await.unwrap();
        session.access(0).await.unwrap();
        assert_eq!(session.complete(), 1);
        assert_eq!(session.complete(), 0);
    }
}
