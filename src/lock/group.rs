//! Group communication used to exchange decree messages.
//!
//! [`GroupChannel`] is the only thing the decree protocol needs from a
//! transport. [`LocalGroup`] is an in-process implementation where every
//! member is a [`DecreeExecutor`] in the same runtime; it supports
//! partitioning members from each other to exercise unreachable-node paths.

use super::decree::{DecreeExecutor, DecreeMessage};
use crate::error::{Result, TandemError};
use crate::types::NodeAddress;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of delivering one message to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub member: NodeAddress,
    /// The member's answer, or `None` if it could not be reached in time.
    pub outcome: Option<bool>,
}

impl Delivery {
    pub fn accepted(&self) -> bool {
        self.outcome == Some(true)
    }
}

/// Transport connecting the cooperating nodes.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    /// This node's own address.
    fn local_address(&self) -> &NodeAddress;

    /// Every current member, including this node.
    fn members(&self) -> Vec<NodeAddress>;

    /// Deliver a message to one member and wait for its answer.
    async fn send(
        &self,
        target: &NodeAddress,
        message: DecreeMessage,
        timeout: Duration,
    ) -> Result<bool>;

    /// Deliver a message to every member concurrently.
    async fn broadcast(&self, message: DecreeMessage, timeout: Duration) -> Vec<Delivery> {
        let members = self.members();
        let sends = members.iter().map(|member| {
            let message = message.clone();
            async move {
                let outcome = match self.send(member, message, timeout).await {
                    Ok(answer) => Some(answer),
                    Err(e) => {
                        debug!(member = %member, error = %e, "Decree message not delivered");
                        None
                    }
                };
                Delivery {
                    member: member.clone(),
                    outcome,
                }
            }
        });
        join_all(sends).await
    }
}

/// In-process group of decree executors.
#[derive(Default)]
pub struct LocalGroup {
    members: RwLock<BTreeMap<NodeAddress, Arc<DecreeExecutor>>>,
    /// Unordered pairs of members that cannot reach each other.
    partitions: RwLock<HashSet<(NodeAddress, NodeAddress)>>,
}

impl LocalGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a member and return its endpoint.
    pub fn join(self: &Arc<Self>, executor: Arc<DecreeExecutor>) -> Arc<LocalMember> {
        let address = executor.address().clone();
        self.members.write().insert(address.clone(), executor);
        Arc::new(LocalMember {
            group: Arc::clone(self),
            address,
        })
    }

    /// Remove a member from the group view.
    pub fn leave(&self, address: &NodeAddress) {
        self.members.write().remove(address);
    }

    pub fn members(&self) -> Vec<NodeAddress> {
        self.members.read().keys().cloned().collect()
    }

    /// Make `a` and `b` unreachable from each other.
    pub fn partition(&self, a: &NodeAddress, b: &NodeAddress) {
        self.partitions.write().insert(Self::pair(a, b));
    }

    /// Cut `address` off from every other member.
    pub fn isolate(&self, address: &NodeAddress) {
        let others: Vec<_> = self
            .members()
            .into_iter()
            .filter(|member| member != address)
            .collect();
        let mut partitions = self.partitions.write();
        for other in others {
            partitions.insert(Self::pair(address, &other));
        }
    }

    /// Restore full connectivity.
    pub fn heal(&self) {
        self.partitions.write().clear();
    }

    fn pair(a: &NodeAddress, b: &NodeAddress) -> (NodeAddress, NodeAddress) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn reachable(&self, from: &NodeAddress, to: &NodeAddress) -> bool {
        from == to || !self.partitions.read().contains(&Self::pair(from, to))
    }

    fn executor(&self, address: &NodeAddress) -> Option<Arc<DecreeExecutor>> {
        self.members.read().get(address).cloned()
    }
}

/// One member's endpoint into a [`LocalGroup`].
pub struct LocalMember {
    group: Arc<LocalGroup>,
    address: NodeAddress,
}

impl LocalMember {
    pub fn group(&self) -> &Arc<LocalGroup> {
        &self.group
    }
}

#[async_trait]
impl GroupChannel for LocalMember {
    fn local_address(&self) -> &NodeAddress {
        &self.address
    }

    fn members(&self) -> Vec<NodeAddress> {
        self.group.members()
    }

    async fn send(
        &self,
        target: &NodeAddress,
        message: DecreeMessage,
        timeout: Duration,
    ) -> Result<bool> {
        let executor = self
            .group
            .executor(target)
            .ok_or_else(|| TandemError::Group(format!("{} is not a member", target)))?;

        if !self.group.reachable(&self.address, target) {
            // A partitioned link drops the message; the sender only learns
            // of it by timing out.
            tokio::time::sleep(timeout).await;
            return Err(TandemError::Group(format!(
                "{} unreachable from {}",
                target, self.address
            )));
        }

        // Deliver on the recipient's own task so a slow recipient cannot be
        // cancelled half-way through a phase by the sender's timeout.
        let delivery = tokio::spawn(async move { executor.handle(message).await });
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(TandemError::Group(format!("Delivery to {} failed: {}", target, e))),
            Err(_) => Err(TandemError::Group(format!(
                "{} did not answer within {:?}",
                target, timeout
            ))),
        }
    }
}
