/// State download for the pivot block.
///
/// State is a tree of nodes addressed by hash, and the shape of the tree
/// is only learned by fetching it. The feed therefore works from a
/// frontier: a worklist of node hashes known to be referenced but not yet
/// stored. Every stored node may add its children to the frontier, and the
/// download is complete once the frontier is empty.
///
/// ## Partial responses
///
/// Peers may serve a prefix of the requested hashes. Served nodes are
/// checked positionally against the request; the unserved rest goes back
/// into the frontier as a new task without penalizing the peer.
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use containers::{BlockNumber, Bytes32, StateNode};
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    error::{PeerFault, TransportError, ValidationError},
    feed::{Checked, CommitError, Committed, FeedKind, Plan},
    peer_pool::{AllocationRequest, AllocationStrategy},
};
use crate::types::{ChainStore, DataKind, SyncTransport};

/// State root to complete, and the block it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTarget {
    pub pivot: BlockNumber,
    pub root: Bytes32,
}

pub struct StateNodesKind {
    store: Arc<dyn ChainStore>,
    batch_size: u64,

    /// Hashes already handed out as tasks (prevents duplicate requests for
    /// nodes referenced from more than one parent)
    scheduled: Mutex<HashSet<Bytes32>>,
}

impl StateNodesKind {
    pub fn new(store: Arc<dyn ChainStore>, batch_size: u64) -> Self {
        Self {
            store,
            batch_size,
            scheduled: Mutex::new(HashSet::new()),
        }
    }

    fn chunk(&self, hashes: Vec<Bytes32>) -> Vec<Vec<Bytes32>> {
        hashes
            .chunks(self.batch_size.max(1) as usize)
            .map(<[Bytes32]>::to_vec)
            .collect()
    }
}

/// Walk the stored part of the tree below `root`.
///
/// Returns the number of stored nodes reached and the hashes of referenced
/// nodes that are missing. The state is complete when nothing is missing.
pub fn walk_state(store: &dyn ChainStore, root: Bytes32) -> (u64, Vec<Bytes32>) {
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut stored = 0;
    let mut missing = Vec::new();

    while let Some(hash) = queue.pop_front() {
        let Some(node) = store.state_node(&hash) else {
            missing.push(hash);
            continue;
        };
        stored += 1;
        for child in node.children {
            if seen.insert(child) {
                queue.push_back(child);
            }
        }
    }

    (stored, missing)
}

impl FeedKind for StateNodesKind {
    type Target = StateTarget;
    type Task = Vec<Bytes32>;
    type Request = Vec<Bytes32>;
    type Response = Vec<StateNode>;
    type Valid = Vec<StateNode>;

    const ORDERED: bool = false;

    fn data_kind(&self) -> DataKind {
        DataKind::StateNodes
    }

    fn plan(&self, target: &StateTarget) -> Plan<Vec<Bytes32>> {
        let (stored, missing) = walk_state(self.store.as_ref(), target.root);
        debug!(
            pivot = target.pivot,
            root = %target.root.short(),
            stored,
            missing = missing.len(),
            "Planned state download"
        );

        let mut scheduled = self.scheduled.lock();
        scheduled.clear();
        scheduled.extend(missing.iter().copied());
        drop(scheduled);

        Plan {
            total: stored + missing.len() as u64,
            tasks: self.chunk(missing),
            start: 0,
            done: stored,
        }
    }

    fn task_items(task: &Vec<Bytes32>) -> u64 {
        task.len() as u64
    }

    fn allocation(&self, target: &StateTarget, _task: &Vec<Bytes32>) -> AllocationRequest {
        AllocationRequest::new(AllocationStrategy::LeastRecentlyUsed).with_min_head(target.pivot)
    }

    fn prepare(&self, _target: &StateTarget, task: &Vec<Bytes32>) -> Option<Vec<Bytes32>> {
        Some(task.clone())
    }

    fn fetch(
        transport: Arc<dyn SyncTransport>,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> BoxFuture<'static, Result<Vec<StateNode>, TransportError>> {
        async move { transport.request_state_nodes(peer, hashes).await }.boxed()
    }

    fn validate(
        &self,
        _target: &StateTarget,
        _task: &Vec<Bytes32>,
        hashes: &Vec<Bytes32>,
        nodes: Vec<StateNode>,
    ) -> Result<Checked<Vec<Bytes32>, Vec<StateNode>>, PeerFault> {
        if nodes.is_empty() {
            return Err(PeerFault::Empty);
        }
        if nodes.len() > hashes.len() {
            return Err(PeerFault::WrongCount {
                expected: hashes.len(),
                actual: nodes.len(),
            });
        }
        for (expected, node) in hashes.iter().zip(&nodes) {
            if node.hash() != *expected {
                return Err(ValidationError::NodeHash {
                    expected: *expected,
                }
                .into());
            }
        }

        let leftover = hashes[nodes.len()..].to_vec();
        Ok(Checked {
            data: nodes,
            leftover: (!leftover.is_empty()).then_some(leftover),
        })
    }

    fn commit(
        &self,
        _target: &StateTarget,
        _task: &Vec<Bytes32>,
        nodes: Vec<StateNode>,
    ) -> Result<Committed<Vec<Bytes32>>, CommitError> {
        let done = nodes.len() as u64;
        let children: Vec<Bytes32> = {
            let mut scheduled = self.scheduled.lock();
            nodes
                .iter()
                .flat_map(|node| node.children.iter().copied())
                .filter(|child| !self.store.has_state_node(child))
                .filter(|child| scheduled.insert(*child))
                .collect()
        };
        self.store.insert_state_nodes(nodes);

        Ok(Committed {
            done,
            discovered_items: children.len() as u64,
            discovered: self.chunk(children),
        })
    }
}
