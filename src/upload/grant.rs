//! Bounded-time execution grants.
//!
//! A grant is the host's permission to keep working in the background for a
//! limited time. It expires when its deadline passes or when the host revokes
//! it, and it is released exactly once: `end` consumes it, and dropping an
//! unended grant releases it as abandoned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a grant was given back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantRelease {
    Completed,
    Expired,
    /// Dropped without an explicit `end`
    Abandoned,
}

type ReleaseFn = Box<dyn FnOnce(GrantRelease) + Send + Sync>;

pub struct ExecutionGrant {
    id: u64,
    deadline: Instant,
    token: CancellationToken,
    release: Option<ReleaseFn>,
}

impl ExecutionGrant {
    pub fn new(
        id: u64,
        deadline: Instant,
        token: CancellationToken,
        release: impl FnOnce(GrantRelease) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            deadline,
            token,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves once the grant has been revoked or its deadline has passed
    pub async fn expired(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    pub fn end(mut self, how: GrantRelease) {
        self.release_once(how);
    }

    fn release_once(&mut self, how: GrantRelease) {
        if let Some(release) = self.release.take() {
            release(how);
        }
    }
}

impl Drop for ExecutionGrant {
    fn drop(&mut self) {
        self.release_once(GrantRelease::Abandoned);
    }
}

impl std::fmt::Debug for ExecutionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGrant")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("revoked", &self.token.is_cancelled())
            .finish()
    }
}

/// Source of execution grants, supplied by the host environment
pub trait GrantProvider: Send + Sync {
    fn begin(&self) -> ExecutionGrant;
}

/// Grants with a fixed time budget that the host can also revoke early.
pub struct DeadlineGrants {
    budget: Duration,
    next_id: AtomicU64,
    active: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    released: Arc<AtomicU64>,
}

impl DeadlineGrants {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Revoke every outstanding grant, as a host does when it suspends the
    /// process. Returns how many grants were revoked.
    pub fn expire_all(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }
}

impl GrantProvider for DeadlineGrants {
    fn begin(&self) -> ExecutionGrant {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());

        let active = self.active.clone();
        let released = self.released.clone();
        ExecutionGrant::new(id, Instant::now() + self.budget, token, move |how| {
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            released.fetch_add(1, Ordering::AcqRel);
            tracing::trace!("Released execution grant {} ({:?})", id, how);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_release_exactly_once() {
        let grants = DeadlineGrants::new(Duration::from_secs(30));

        let grant = grants.begin();
        assert_eq!(grants.active_count(), 1);

        grant.end(GrantRelease::Completed);
        assert_eq!(grants.active_count(), 0);
        assert_eq!(grants.released_count(), 1);
    }

    #[test]
    fn test_drop_releases_as_abandoned() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let grant = {
            let seen = seen.clone();
            ExecutionGrant::new(
                7,
                Instant::now() + Duration::from_secs(1),
                CancellationToken::new(),
                move |how| seen.lock().unwrap().push(how),
            )
        };

        drop(grant);
        assert_eq!(*seen.lock().unwrap(), vec![GrantRelease::Abandoned]);
    }

    #[test]
    fn test_end_does_not_release_again_on_drop() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let grant = {
            let seen = seen.clone();
            ExecutionGrant::new(
                1,
                Instant::now() + Duration::from_secs(1),
                CancellationToken::new(),
                move |how| seen.lock().unwrap().push(how),
            )
        };

        grant.end(GrantRelease::Expired);
        assert_eq!(*seen.lock().unwrap(), vec![GrantRelease::Expired]);
    }

    #[test]
    fn test_grant_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExecutionGrant>();
    }

    #[test]
    fn test_revocation_marks_expired() {
        let grants = DeadlineGrants::new(Duration::from_secs(30));
        let grant = grants.begin();
        assert!(!grant.is_expired());

        assert_eq!(grants.expire_all(), 1);
        assert!(grant.is_expired());
        grant.end(GrantRelease::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let grants = DeadlineGrants::new(Duration::from_secs(25));
        let grant = grants.begin();

        let started = Instant::now();
        grant.expired().await;

        assert!(grant.is_expired());
        assert!(Instant::now() - started >= Duration::from_secs(25));
        grant.end(GrantRelease::Expired);
        assert_eq!(grants.released_count(), 1);
    }
}
