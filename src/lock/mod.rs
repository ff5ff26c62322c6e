//! Cluster-wide locking.
//!
//! Administrative transitions (activation, deactivation, synchronization)
//! are serialized across cooperating nodes with a named lock that every
//! node takes identically or not at all. The lock is taken through a
//! two-phase decree broadcast to the group:
//!
//! 1. The initiator broadcasts `Prepare`; each member tries its local lock.
//! 2. Every member voted yes: the initiator broadcasts `Commit`.
//! 3. Otherwise, or if a vote is missing after the decree timeout, it
//!    broadcasts `Abort` and every member drops what prepare took.
//!
//! A member that prepared but never hears the outcome aborts on its own
//! after the commit timeout. A lock that was committed on a member which is
//! then partitioned away from the release decree stays held there until the
//! member rejoins and the lock is released again.

mod decree;
mod distributed;
mod group;
mod local;

pub use decree::{Decree, DecreeExecutor, DecreeMessage, DecreeState, ExecutorStats, MembershipHandler};
pub use distributed::{DecreeOutcome, DecreeStats, DistributedLockManager};
pub use group::{Delivery, GroupChannel, LocalGroup, LocalMember};
pub use local::{LocalLockGuard, LocalLockManager};

use crate::error::Result;
use async_trait::async_trait;

/// Named mutual exclusion.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block until `lock_id` is held.
    async fn acquire(&self, lock_id: &str) -> Result<()>;

    /// Release a lock previously acquired through this manager.
    async fn release(&self, lock_id: &str) -> Result<()>;
}
