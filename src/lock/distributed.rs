//! Initiator side of the decree protocol.

use super::decree::{Decree, DecreeMessage, DecreeState};
use super::group::{Delivery, GroupChannel};
use super::LockManager;
use crate::config::LockConfig;
use crate::error::{Result, TandemError};
use crate::observability::{self, DecreeRole};
use crate::types::NodeAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds for the randomized pause between contended acquisition attempts.
const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Result of one completed two-phase exchange.
#[derive(Debug, Clone)]
pub struct DecreeOutcome {
    pub id: Uuid,
    pub state: DecreeState,
    /// Members that refused or could not be reached during prepare.
    pub dissenters: Vec<Delivery>,
    /// Members that did not acknowledge the outcome.
    pub unacknowledged: Vec<NodeAddress>,
    /// Members that answered the commit with a refusal because the decree
    /// had already expired there.
    pub rejected: Vec<NodeAddress>,
}

impl DecreeOutcome {
    pub fn committed(&self) -> bool {
        self.state == DecreeState::Committed
    }
}

/// Initiator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecreeStats {
    pub issued: u64,
    pub committed: u64,
    pub aborted: u64,
    pub acquire_timeouts: u64,
}

/// Cluster-wide lock manager driven by two-phase decrees.
pub struct DistributedLockManager {
    channel: Arc<dyn GroupChannel>,
    config: LockConfig,
    stats: Mutex<DecreeStats>,
}

impl DistributedLockManager {
    pub fn new(channel: Arc<dyn GroupChannel>, config: LockConfig) -> Self {
        Self {
            channel,
            config,
            stats: Mutex::new(DecreeStats::default()),
        }
    }

    pub fn local_address(&self) -> &NodeAddress {
        self.channel.local_address()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn stats(&self) -> DecreeStats {
        self.stats.lock().clone()
    }

    /// Run one full prepare/commit-or-abort exchange for `decree`.
    pub async fn execute(&self, decree: Decree) -> DecreeOutcome {
        let id = Uuid::new_v4();
        let mut state = DecreeState::Issued;
        self.stats.lock().issued += 1;
        debug!(decree_id = %id, decree = %decree, state = %state, "Issuing decree");

        let votes = self
            .channel
            .broadcast(
                DecreeMessage::Prepare {
                    id,
                    decree: decree.clone(),
                },
                self.config.decree_timeout,
            )
            .await;

        let dissenters: Vec<Delivery> = votes.into_iter().filter(|d| !d.accepted()).collect();
        let unanimous = dissenters.is_empty();

        let next = if unanimous || !decree.requires_unanimity() {
            DecreeState::Prepared
        } else {
            DecreeState::Aborted
        };
        debug_assert!(state.can_transition_to(next));
        state = next;

        let outcome_message = if state == DecreeState::Prepared {
            for dissenter in &dissenters {
                warn!(
                    decree_id = %id,
                    decree = %decree,
                    member = %dissenter.member,
                    "Member missed prepare, committing without it"
                );
            }
            state = DecreeState::Committed;
            DecreeMessage::Commit {
                id,
                decree: decree.clone(),
            }
        } else {
            DecreeMessage::Abort {
                id,
                decree: decree.clone(),
            }
        };

        let acks = self
            .channel
            .broadcast(outcome_message, self.config.decree_timeout)
            .await;
        let (unacknowledged, rejected) = acks.into_iter().fold(
            (Vec::new(), Vec::new()),
            |(mut unacknowledged, mut rejected), delivery| {
                match delivery.outcome {
                    None => unacknowledged.push(delivery.member),
                    Some(false) => rejected.push(delivery.member),
                    Some(true) => {}
                }
                (unacknowledged, rejected)
            },
        );
        if !rejected.is_empty() {
            warn!(
                decree_id = %id,
                decree = %decree,
                members = ?rejected,
                "Decree expired on members before commit arrived"
            );
        }

        if !unacknowledged.is_empty() {
            warn!(
                decree_id = %id,
                decree = %decree,
                state = %state,
                members = ?unacknowledged,
                "Decree outcome not acknowledged by every member"
            );
        }

        {
            let mut stats = self.stats.lock();
            if state == DecreeState::Committed {
                stats.committed += 1;
            } else {
                stats.aborted += 1;
            }
        }
        let label = if state == DecreeState::Committed {
            "committed"
        } else {
            "aborted"
        };
        observability::record_decree(DecreeRole::Initiator, label);
        debug!(decree_id = %id, decree = %decree, state = %state, "Decree finished");

        DecreeOutcome {
            id,
            state,
            dissenters,
            unacknowledged,
            rejected,
        }
    }

    /// One acquisition attempt, without retrying.
    pub async fn try_acquire(&self, lock_id: &str) -> Result<()> {
        let decree = Decree::AcquireLock {
            lock_id: lock_id.to_string(),
            origin: self.local_address().clone(),
        };
        let outcome = self.execute(decree).await;
        if outcome.committed() && outcome.rejected.is_empty() {
            return Ok(());
        }
        if outcome.committed() {
            // Some members no longer hold the lock; drop it everywhere else
            self.release(lock_id).await?;
            return Err(TandemError::DecreeAborted {
                lock_id: lock_id.to_string(),
                reason: outcome
                    .rejected
                    .iter()
                    .map(|member| format!("{} expired the prepared lock", member))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        let reason = outcome
            .dissenters
            .iter()
            .map(|d| match d.outcome {
                Some(_) => format!("{} refused", d.member),
                None => format!("{} unreachable", d.member),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Err(TandemError::DecreeAborted {
            lock_id: lock_id.to_string(),
            reason,
        })
    }

    fn backoff(remaining: Duration) -> Duration {
        let millis = rand::thread_rng()
            .gen_range(MIN_BACKOFF.as_millis() as u64..=MAX_BACKOFF.as_millis() as u64);
        Duration::from_millis(millis).min(remaining)
    }
}

#[async_trait]
impl LockManager for DistributedLockManager {
    /// Acquire `lock_id` on every member, retrying contended attempts until
    /// the acquire timeout elapses.
    async fn acquire(&self, lock_id: &str) -> Result<()> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_acquire(lock_id).await {
                Ok(()) => {
                    debug!(lock = lock_id, attempts, "Acquired cluster-wide lock");
                    return Ok(());
                }
                Err(TandemError::DecreeAborted { reason, .. }) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.config.acquire_timeout {
                        self.stats.lock().acquire_timeouts += 1;
                        warn!(lock = lock_id, attempts, reason = %reason, "Timed out acquiring cluster-wide lock");
                        return Err(TandemError::LockTimeout(format!(
                            "{} after {} attempts ({})",
                            lock_id, attempts, reason
                        )));
                    }
                    debug!(lock = lock_id, attempt = attempts, reason = %reason, "Lock decree aborted, retrying");
                    tokio::time::sleep(Self::backoff(self.config.acquire_timeout - elapsed)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release(&self, lock_id: &str) -> Result<()> {
        let decree = Decree::ReleaseLock {
            lock_id: lock_id.to_string(),
            origin: self.local_address().clone(),
        };
        let outcome = self.execute(decree).await;
        if !outcome.unacknowledged.is_empty() {
            // The lock stays held on members that never heard the release
            info!(
                lock = lock_id,
                members = ?outcome.unacknowledged,
                "Released cluster-wide lock with unreachable members"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::decree::DecreeExecutor;
    use crate::lock::group::LocalGroup;
    use crate::lock::local::LocalLockManager;

    fn config() -> LockConfig {
        LockConfig {
            decree_timeout: Duration::from_millis(50),
            commit_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_millis(200),
        }
    }

    fn join(group: &Arc<LocalGroup>, addr: &str) -> (Arc<DecreeExecutor>, DistributedLockManager) {
        let executor = DecreeExecutor::new(
            NodeAddress::new(addr),
            Arc::new(LocalLockManager::new()),
            config().commit_timeout,
        );
        let member = group.join(executor.clone());
        (executor, DistributedLockManager::new(member, config()))
    }

    #[tokio::test]
    async fn test_acquire_and_release_everywhere() {
        let group = LocalGroup::new();
        let (exec_a, manager) = join(&group, "a");
        let (exec_b, _) = join(&group, "b");

        manager.acquire("cluster").await.unwrap();
        assert!(exec_a.holds("cluster", &NodeAddress::new("a")));
        assert!(exec_b.holds("cluster", &NodeAddress::new("a")));

        manager.release("cluster").await.unwrap();
        assert!(!exec_a.locks().is_locked("cluster"));
        assert!(!exec_b.locks().is_locked("cluster"));
        assert_eq!(manager.stats().committed, 2);
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let group = LocalGroup::new();
        let (_, first) = join(&group, "a");
        let (exec_b, second) = join(&group, "b");

        first.acquire("cluster").await.unwrap();

        let err = second.acquire("cluster").await.unwrap_err();
        assert!(matches!(err, TandemError::LockTimeout(_)));
        // The loser left nothing behind
        assert!(!exec_b.holds("cluster", &NodeAddress::new("b")));
        assert!(exec_b.holds("cluster", &NodeAddress::new("a")));
        assert_eq!(second.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_member_aborts_acquire() {
        let group = LocalGroup::new();
        let (exec_a, manager) = join(&group, "a");
        join(&group, "b");
        group.isolate(&NodeAddress::new("b"));

        let err = manager.try_acquire("cluster").await.unwrap_err();
        match err {
            TandemError::DecreeAborted { lock_id, reason } => {
                assert_eq!(lock_id, "cluster");
                assert!(reason.contains("b unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The initiator's own provisional lock was rolled back
        assert!(!exec_a.locks().is_locked("cluster"));
    }

    /// Delivers commits to one member only after a delay.
    struct LaggingCommit {
        address: NodeAddress,
        members: Vec<Arc<DecreeExecutor>>,
        lagging: NodeAddress,
        lag: Duration,
    }

    #[async_trait]
    impl GroupChannel for LaggingCommit {
        fn local_address(&self) -> &NodeAddress {
            &self.address
        }

        fn members(&self) -> Vec<NodeAddress> {
            self.members.iter().map(|e| e.address().clone()).collect()
        }

        async fn send(
            &self,
            target: &NodeAddress,
            message: DecreeMessage,
            _timeout: Duration,
        ) -> Result<bool> {
            let executor = self
                .members
                .iter()
                .find(|e| e.address() == target)
                .cloned()
                .ok_or_else(|| TandemError::Group(format!("{} is not a member", target)))?;
            if target == &self.lagging && matches!(message, DecreeMessage::Commit { .. }) {
                tokio::time::sleep(self.lag).await;
            }
            Ok(executor.handle(message).await)
        }
    }

    #[tokio::test]
    async fn test_commit_after_member_expiry_aborts_acquire() {
        let a = DecreeExecutor::new(
            NodeAddress::new("a"),
            Arc::new(LocalLockManager::new()),
            Duration::from_secs(5),
        );
        let b = DecreeExecutor::new(
            NodeAddress::new("b"),
            Arc::new(LocalLockManager::new()),
            Duration::from_millis(20),
        );
        let channel = Arc::new(LaggingCommit {
            address: NodeAddress::new("a"),
            members: vec![a.clone(), b.clone()],
            lagging: NodeAddress::new("b"),
            lag: Duration::from_millis(80),
        });
        let manager = DistributedLockManager::new(
            channel,
            LockConfig {
                decree_timeout: Duration::from_millis(500),
                ..config()
            },
        );

        let err = manager.try_acquire("cluster").await.unwrap_err();
        match err {
            TandemError::DecreeAborted { reason, .. } => {
                assert_eq!(reason, "b expired the prepared lock");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!a.locks().is_locked("cluster"));
        assert!(!b.locks().is_locked("cluster"));
        assert!(!a.holds("cluster", &NodeAddress::new("a")));
    }

    #[tokio::test]
    async fn test_waiting_acquire_succeeds_after_release() {
        let group = LocalGroup::new();
        let (_, first) = join(&group, "a");
        let (_, second) = join(&group, "b");
        let second = Arc::new(second);

        first.acquire("cluster").await.unwrap();
        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire("cluster").await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        first.release("cluster").await.unwrap();

        waiter.await.unwrap().unwrap();
    }
}
