//! Repository vault locking
//!
//! All-or-nothing mutual exclusion per repository: any two operations on the
//! same repository are serialized, operations on different repositories run
//! freely in parallel. Locks carry a TTL so a crashed holder never wedges
//! the repository forever; live holders renew their TTL while they work, so
//! expiry only ever displaces a holder that stopped renewing. Both recovery
//! paths are audited: lazy reclamation by the next acquirer and the explicit
//! `force_break` escape hatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditError, AuditLog, AuditRecord};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("repository {0} is locked by another operation")]
    RepositoryBusy(String),

    #[error("lock queue for repository {0} is full")]
    QueueFull(String),

    #[error("lock on repository {0} is not held by this token")]
    NotHeld(String),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Proof of lock ownership, consumed on release.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub repository_id: String,
    pub holder_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What to do when the lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Surface `RepositoryBusy` immediately.
    FailFast,
    /// Join the bounded FIFO queue and wait for a handoff.
    Queue,
}

struct HeldLock {
    holder_id: Uuid,
    expires_at: DateTime<Utc>,
}

struct Waiter {
    holder_id: Uuid,
    ttl: Duration,
    tx: oneshot::Sender<LockToken>,
}

#[derive(Default)]
struct RepoLockState {
    holder: Option<HeldLock>,
    waiters: VecDeque<Waiter>,
}

enum Acquired {
    Granted(LockToken),
    Wait(oneshot::Receiver<LockToken>),
}

/// In-process lock coordinator keyed by repository id.
///
/// Not persisted across restarts: a dead process's locks simply expire.
pub struct LockManager {
    max_waiters: usize,
    inner: Mutex<HashMap<String, RepoLockState>>,
}

impl LockManager {
    pub fn new(max_waiters: usize) -> Self {
        Self {
            max_waiters,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, RepoLockState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the lock for `repository_id`.
    ///
    /// An expired holder is reclaimed on the spot, and the reclamation is
    /// written to the audit log so stale-lock recovery is never silent. With
    /// `AcquireMode::Queue`, release hands the lock to the longest-waiting
    /// acquirer directly, so queued waiters are served strictly in arrival
    /// order.
    pub async fn acquire(
        &self,
        repository_id: &str,
        holder_id: Uuid,
        ttl: Duration,
        mode: AcquireMode,
        audit: &AuditLog,
    ) -> Result<LockToken> {
        let mut reclaimed: Option<Uuid> = None;
        let outcome: Result<Acquired> = {
            let mut map = self.state();
            let state = map.entry(repository_id.to_string()).or_default();
            let now = Utc::now();

            if let Some(held) = &state.holder {
                if held.expires_at <= now {
                    reclaimed = Some(held.holder_id);
                }
            }
            let held = state
                .holder
                .as_ref()
                .is_some_and(|held| held.expires_at > now);

            if !held && state.waiters.is_empty() {
                Ok(Acquired::Granted(grant(
                    state,
                    repository_id,
                    holder_id,
                    ttl,
                    now,
                )))
            } else {
                // Stale holder with a queue behind it: the front live waiter
                // wins, and this acquirer queues like everyone else.
                let handed_over = held || hand_to_next_waiter(state, repository_id, now);

                if !handed_over {
                    // Every queued waiter had given up; the lock is free.
                    Ok(Acquired::Granted(grant(
                        state,
                        repository_id,
                        holder_id,
                        ttl,
                        now,
                    )))
                } else {
                    match mode {
                        AcquireMode::FailFast => {
                            Err(LockError::RepositoryBusy(repository_id.to_string()))
                        }
                        AcquireMode::Queue => {
                            if state.waiters.len() >= self.max_waiters {
                                Err(LockError::QueueFull(repository_id.to_string()))
                            } else {
                                let (tx, rx) = oneshot::channel();
                                state.waiters.push_back(Waiter { holder_id, ttl, tx });
                                debug!(
                                    repository_id,
                                    %holder_id,
                                    queue_depth = state.waiters.len(),
                                    "Waiting for lock"
                                );
                                Ok(Acquired::Wait(rx))
                            }
                        }
                    }
                }
            }
        };

        if let Some(stale_holder) = reclaimed {
            warn!(repository_id, %stale_holder, "Expired lock reclaimed");
            let appended = audit.append(AuditRecord::new(
                Some(repository_id),
                "lock-manager",
                "lock_reclaimed",
                format!("expired holder {stale_holder} displaced"),
            ));
            if let Err(err) = appended {
                // Do not keep a grant whose reclamation could not be audited.
                if let Ok(Acquired::Granted(token)) = &outcome {
                    let _ = self.release(token.clone());
                }
                return Err(err.into());
            }
        }

        match outcome? {
            Acquired::Granted(token) => {
                debug!(repository_id, %holder_id, "Lock acquired");
                Ok(token)
            }
            Acquired::Wait(rx) => rx
                .await
                .map_err(|_| LockError::RepositoryBusy(repository_id.to_string())),
        }
    }

    /// Extend a held lock's TTL. Holders renew while long engine calls are
    /// in flight, so the lock only expires once its holder stops working.
    /// Fails with `NotHeld` if the lock was reclaimed in the meantime.
    pub fn renew(&self, token: &LockToken, ttl: Duration) -> Result<LockToken> {
        let mut map = self.state();
        let state = map
            .get_mut(&token.repository_id)
            .ok_or_else(|| LockError::NotHeld(token.repository_id.clone()))?;

        match &mut state.holder {
            Some(held) if held.holder_id == token.holder_id => {
                let expires_at = Utc::now() + ttl;
                held.expires_at = expires_at;
                Ok(LockToken {
                    expires_at,
                    ..token.clone()
                })
            }
            _ => Err(LockError::NotHeld(token.repository_id.clone())),
        }
    }

    /// Release a held lock and hand it to the next queued waiter, if any.
    pub fn release(&self, token: LockToken) -> Result<()> {
        let mut map = self.state();
        let state = map
            .get_mut(&token.repository_id)
            .ok_or_else(|| LockError::NotHeld(token.repository_id.clone()))?;

        match &state.holder {
            Some(held) if held.holder_id == token.holder_id => {}
            _ => return Err(LockError::NotHeld(token.repository_id.clone())),
        }

        state.holder = None;
        hand_to_next_waiter(state, &token.repository_id, Utc::now());
        debug!(repository_id = %token.repository_id, holder_id = %token.holder_id, "Lock released");
        Ok(())
    }

    /// Break a lock regardless of holder or expiry. Always audit-logged,
    /// never silent. Returns whether a lock was actually held.
    pub fn force_break(&self, repository_id: &str, actor: &str, audit: &AuditLog) -> Result<bool> {
        let was_held = {
            let mut map = self.state();
            let state = map.entry(repository_id.to_string()).or_default();
            let was_held = state.holder.take().is_some();
            hand_to_next_waiter(state, repository_id, Utc::now());
            was_held
        };

        if was_held {
            warn!(repository_id, actor, "Lock force-broken");
        } else {
            info!(repository_id, actor, "Force-break requested but no lock was held");
        }

        audit.append(AuditRecord::new(
            Some(repository_id),
            actor,
            "lock_force_broken",
            if was_held { "broken" } else { "no_lock_held" },
        ))?;

        Ok(was_held)
    }

    /// Whether the repository is currently locked by an unexpired holder.
    pub fn is_locked(&self, repository_id: &str) -> bool {
        let map = self.state();
        map.get(repository_id)
            .and_then(|state| state.holder.as_ref())
            .is_some_and(|held| held.expires_at > Utc::now())
    }
}

fn grant(
    state: &mut RepoLockState,
    repository_id: &str,
    holder_id: Uuid,
    ttl: Duration,
    now: DateTime<Utc>,
) -> LockToken {
    let token = LockToken {
        repository_id: repository_id.to_string(),
        holder_id,
        acquired_at: now,
        expires_at: now + ttl,
    };
    state.holder = Some(HeldLock {
        holder_id,
        expires_at: token.expires_at,
    });
    token
}

/// Give the (free) lock to the front waiter. Returns whether a handoff
/// happened. Waiters whose receiving side went away are skipped.
fn hand_to_next_waiter(state: &mut RepoLockState, repository_id: &str, now: DateTime<Utc>) -> bool {
    while let Some(waiter) = state.waiters.pop_front() {
        let token = grant(state, repository_id, waiter.holder_id, waiter.ttl, now);
        match waiter.tx.send(token) {
            Ok(()) => return true,
            Err(_) => {
                // Waiter gave up; the grant is void, try the next one.
                state.holder = None;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ttl() -> Duration {
        Duration::seconds(60)
    }

    fn test_audit() -> (Arc<AuditLog>, TempDir) {
        let temp = TempDir::new().unwrap();
        let audit = AuditLog::open(temp.path(), 64 * 1024 * 1024).unwrap();
        (Arc::new(audit), temp)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let holder = Uuid::new_v4();

        let token = locks
            .acquire("repo-1", holder, ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();
        assert!(locks.is_locked("repo-1"));
        assert_eq!(token.holder_id, holder);

        locks.release(token).unwrap();
        assert!(!locks.is_locked("repo-1"));
    }

    #[tokio::test]
    async fn test_fail_fast_when_held() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let _token = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();

        let err = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::RepositoryBusy(_)));
    }

    #[tokio::test]
    async fn test_different_repositories_are_independent() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let _a = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();
        let _b = locks
            .acquire("repo-2", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();
        assert!(locks.is_locked("repo-1"));
        assert!(locks.is_locked("repo-2"));
    }

    #[tokio::test]
    async fn test_queue_handoff_is_fifo() {
        let (audit, _temp) = test_audit();
        let locks = Arc::new(LockManager::new(8));
        let first = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();

        let second_holder = Uuid::new_v4();
        let third_holder = Uuid::new_v4();

        let locks2 = locks.clone();
        let audit2 = audit.clone();
        let second = tokio::spawn(async move {
            locks2
                .acquire("repo-1", second_holder, ttl(), AcquireMode::Queue, &audit2)
                .await
                .unwrap()
        });
        // Make sure the second waiter is enqueued before the third.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let locks3 = locks.clone();
        let audit3 = audit.clone();
        let third = tokio::spawn(async move {
            locks3
                .acquire("repo-1", third_holder, ttl(), AcquireMode::Queue, &audit3)
                .await
                .unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        locks.release(first).unwrap();
        let second_token = second.await.unwrap();
        assert_eq!(second_token.holder_id, second_holder);

        locks.release(second_token).unwrap();
        let third_token = third.await.unwrap();
        assert_eq!(third_token.holder_id, third_holder);
    }

    #[tokio::test]
    async fn test_queue_depth_is_bounded() {
        let (audit, _temp) = test_audit();
        let locks = Arc::new(LockManager::new(1));
        let _held = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();

        // First waiter fits, second overflows. Keep the receiver alive via
        // a spawned task so the queue slot stays occupied.
        let waiting = locks.clone();
        let waiting_audit = audit.clone();
        let handle = tokio::spawn(async move {
            waiting
                .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::Queue, &waiting_audit)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::Queue, &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::QueueFull(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed_and_audited() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let stale = locks
            .acquire(
                "repo-1",
                Uuid::new_v4(),
                Duration::milliseconds(-1),
                AcquireMode::FailFast,
                &audit,
            )
            .await
            .unwrap();
        assert!(stale.expires_at <= Utc::now());

        // Already expired, so a new acquirer takes over immediately.
        let fresh = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();
        assert!(locks.is_locked("repo-1"));

        // The displacement left a trace in the ledger.
        let entries = audit.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "lock_reclaimed");
        assert!(entries[0].result.contains(&stale.holder_id.to_string()));

        // The stale token can no longer release.
        assert!(matches!(locks.release(stale), Err(LockError::NotHeld(_))));
        locks.release(fresh).unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_a_held_lock() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let token = locks
            .acquire(
                "repo-1",
                Uuid::new_v4(),
                Duration::milliseconds(40),
                AcquireMode::FailFast,
                &audit,
            )
            .await
            .unwrap();

        // Keep renewing across what would have been several expiries.
        let mut current = token;
        for _ in 0..4 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            current = locks.renew(&current, Duration::milliseconds(40)).unwrap();
        }
        assert!(locks.is_locked("repo-1"));

        // A competing FailFast acquirer still sees the lock as held.
        let err = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::RepositoryBusy(_)));

        locks.release(current).unwrap();
    }

    #[tokio::test]
    async fn test_renew_fails_after_reclamation() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);
        let stale = locks
            .acquire(
                "repo-1",
                Uuid::new_v4(),
                Duration::milliseconds(-1),
                AcquireMode::FailFast,
                &audit,
            )
            .await
            .unwrap();
        let _fresh = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();

        assert!(matches!(
            locks.renew(&stale, ttl()),
            Err(LockError::NotHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_force_break_is_audited() {
        let (audit, _temp) = test_audit();
        let locks = LockManager::new(4);

        let _token = locks
            .acquire("repo-1", Uuid::new_v4(), ttl(), AcquireMode::FailFast, &audit)
            .await
            .unwrap();

        let was_held = locks.force_break("repo-1", "operator", &audit).unwrap();
        assert!(was_held);
        assert!(!locks.is_locked("repo-1"));

        let entries = audit.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "lock_force_broken");
        assert_eq!(entries[0].result, "broken");

        // Breaking an unheld lock is still audited.
        let was_held = locks.force_break("repo-1", "operator", &audit).unwrap();
        assert!(!was_held);
        let entries = audit.read_all().unwrap();
        assert_eq!(entries[1].result, "no_lock_held");
    }
}
