/// Deterministic in-process chain and peer set.
///
/// Used by the `sync_node` binary to drive a sync run without a wire
/// transport, and by the tests. Peers serve a shared generated chain up to
/// their own head, optionally misbehaving.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use containers::{
    Block, BlockBody, BlockHeader, BlockNumber, Bytes32, ChainHead, Receipt, StateNode,
    receipts_root,
};
use libp2p_identity::PeerId;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    sync::error::TransportError,
    types::{DataKind, SyncEvent, SyncTransport},
};

/// Leaves below each state branch.
const LEAVES_PER_BRANCH: u8 = 2;
/// Leaf payloads change every this many blocks, so neighbouring blocks
/// share most of their state.
const STATE_EPOCH: u64 = 16;

/// A generated chain with valid roots and a small state tree per block.
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    headers: Vec<BlockHeader>,
    bodies: Vec<BlockBody>,
    receipts: Vec<Vec<Receipt>>,
    state: HashMap<Bytes32, StateNode>,
    by_hash: HashMap<Bytes32, BlockNumber>,
}

impl SimulatedChain {
    /// Blocks `0..length`, each with a state root over `state_width`
    /// branches.
    pub fn generate(length: u64, state_width: u8) -> Self {
        let mut chain = Self {
            headers: Vec::new(),
            bodies: Vec::new(),
            receipts: Vec::new(),
            state: HashMap::new(),
            by_hash: HashMap::new(),
        };

        for number in 0..length {
            let transactions = (0..=number % 3)
                .map(|index| {
                    let mut tx = number.to_be_bytes().to_vec();
                    tx.push(index as u8);
                    tx
                })
                .collect::<Vec<_>>();
            let receipts = transactions
                .iter()
                .enumerate()
                .map(|(index, tx)| Receipt {
                    success: number % 5 != 0,
                    cumulative_gas_used: 21_000 * (index as u64 + 1),
                    logs: vec![tx.clone()],
                })
                .collect::<Vec<_>>();
            let body = BlockBody::new(transactions);
            let state_root = chain.build_state(number, state_width);

            let header = BlockHeader {
                number,
                parent_hash: chain.headers.last().map_or(Bytes32::ZERO, BlockHeader::hash),
                state_root,
                transactions_root: body.transactions_root(),
                receipts_root: receipts_root(&receipts),
                difficulty: 1,
                timestamp: number * 12,
                extra_data: Vec::new(),
            };

            chain.by_hash.insert(header.hash(), number);
            chain.headers.push(header);
            chain.bodies.push(body);
            chain.receipts.push(receipts);
        }

        chain
    }

    fn build_state(&mut self, number: BlockNumber, width: u8) -> Bytes32 {
        let epoch = (number / STATE_EPOCH).to_be_bytes();
        let mut branches = Vec::with_capacity(usize::from(width));
        for branch in 0..width {
            let leaves = (0..LEAVES_PER_BRANCH)
                .map(|leaf| {
                    let mut data = vec![branch, leaf];
                    data.extend_from_slice(&epoch);
                    self.insert_node(StateNode::leaf(data))
                })
                .collect();
            branches.push(self.insert_node(StateNode::branch(vec![branch], leaves)));
        }
        let root = StateNode::branch(number.to_be_bytes().to_vec(), branches);
        self.insert_node(root)
    }

    fn insert_node(&mut self, node: StateNode) -> Bytes32 {
        let hash = node.hash();
        self.state.insert(hash, node);
        hash
    }

    pub fn len(&self) -> u64 {
        self.headers.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn genesis(&self) -> Option<&BlockHeader> {
        self.headers.first()
    }

    pub fn header(&self, number: BlockNumber) -> Option<&BlockHeader> {
        self.headers.get(usize::try_from(number).ok()?)
    }

    pub fn body(&self, number: BlockNumber) -> Option<&BlockBody> {
        self.bodies.get(usize::try_from(number).ok()?)
    }

    pub fn receipts(&self, number: BlockNumber) -> Option<&Vec<Receipt>> {
        self.receipts.get(usize::try_from(number).ok()?)
    }

    pub fn block(&self, number: BlockNumber) -> Option<Block> {
        Some(Block::new(
            self.header(number)?.clone(),
            self.body(number)?.clone(),
        ))
    }

    pub fn state_node(&self, hash: &Bytes32) -> Option<&StateNode> {
        self.state.get(hash)
    }

    /// Number of distinct state nodes reachable from the root at `number`.
    pub fn state_size(&self, number: BlockNumber) -> Option<u64> {
        let root = self.header(number)?.state_root;
        let mut stack = vec![root];
        let mut seen = HashSet::from([root]);
        while let Some(hash) = stack.pop() {
            for child in &self.state.get(&hash)?.children {
                if seen.insert(*child) {
                    stack.push(*child);
                }
            }
        }
        Some(seen.len() as u64)
    }

    /// Head announcement for block `number`; each block adds one unit of
    /// difficulty.
    pub fn head_at(&self, number: BlockNumber) -> Option<ChainHead> {
        self.header(number)
            .map(|header| ChainHead::from_header(header, u128::from(number) + 1))
    }

    fn number_of(&self, hash: &Bytes32) -> Option<BlockNumber> {
        self.by_hash.get(hash).copied()
    }
}

/// How a simulated peer answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerBehaviour {
    #[default]
    Honest,
    /// Adds a transaction to every body it serves.
    CorruptBodies,
    /// Breaks the hash link inside every multi-header response.
    CorruptHeaders,
    /// Serves headers of a different chain that branches off right after
    /// genesis and is hash-linked throughout.
    ForkedHeaders,
    /// Never answers.
    Silent,
    /// Serves at most this many state nodes per request.
    StateNodeLimit(usize),
}

#[derive(Debug, Clone)]
struct SimPeer {
    behaviour: PeerBehaviour,
    head: BlockNumber,
    latency: Duration,
}

/// One request as seen by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRequest {
    pub peer: PeerId,
    pub kind: DataKind,
    /// First block number requested, when the request is block-addressed.
    pub first: Option<BlockNumber>,
    pub count: usize,
}

pub struct SimulatedNetwork {
    chain: Arc<SimulatedChain>,
    peers: RwLock<HashMap<PeerId, SimPeer>>,
    requests: Mutex<Vec<SimRequest>>,
    disconnected: Mutex<Vec<PeerId>>,
    latency: Duration,
}

impl SimulatedNetwork {
    pub fn new(chain: Arc<SimulatedChain>) -> Self {
        Self {
            chain,
            peers: RwLock::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            latency: Duration::from_millis(20),
        }
    }

    /// Default response delay for peers added afterwards.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.chain
    }

    pub fn add_peer(&self, behaviour: PeerBehaviour, head: BlockNumber) -> PeerId {
        self.add_peer_with_latency(behaviour, head, self.latency)
    }

    pub fn add_peer_with_latency(
        &self,
        behaviour: PeerBehaviour,
        head: BlockNumber,
        latency: Duration,
    ) -> PeerId {
        let peer_id = PeerId::random();
        let head = head.min(self.chain.len().saturating_sub(1));
        self.peers.write().insert(
            peer_id,
            SimPeer {
                behaviour,
                head,
                latency,
            },
        );
        peer_id
    }

    /// Move a peer's head forward, as a block announcement would.
    pub fn set_head(&self, peer: &PeerId, head: BlockNumber) -> Option<SyncEvent> {
        let head = head.min(self.chain.len().saturating_sub(1));
        self.peers.write().get_mut(peer)?.head = head;
        self.handshake(peer)
    }

    /// Head event the transport would emit after the handshake.
    pub fn handshake(&self, peer: &PeerId) -> Option<SyncEvent> {
        let head = self.peers.read().get(peer)?.head;
        Some(SyncEvent::PeerHead(*peer, self.chain.head_at(head)?))
    }

    /// Connection and head events for every peer.
    pub fn connect_all(&self) -> Vec<SyncEvent> {
        let peers: Vec<PeerId> = self.peers.read().keys().copied().collect();
        peers
            .iter()
            .flat_map(|peer| {
                std::iter::once(SyncEvent::PeerConnected(*peer)).chain(self.handshake(peer))
            })
            .collect()
    }

    pub fn requests(&self) -> Vec<SimRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, peer: &PeerId) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.peer == *peer)
            .count()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }

    /// Log the request, wait out the peer's latency and return its state.
    async fn serve(
        &self,
        peer: PeerId,
        kind: DataKind,
        first: Option<BlockNumber>,
        count: usize,
    ) -> Result<SimPeer, TransportError> {
        let state = self
            .peers
            .read()
            .get(&peer)
            .cloned()
            .ok_or(TransportError::Disconnected)?;
        self.requests.lock().push(SimRequest {
            peer,
            kind,
            first,
            count,
        });

        if state.behaviour == PeerBehaviour::Silent {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(state.latency).await;
        Ok(state)
    }

    /// Headers `[from, end)` of a fork sharing only genesis with the chain.
    fn forked_headers(&self, from: BlockNumber, end: BlockNumber) -> Vec<BlockHeader> {
        let Some(genesis) = self.chain.genesis() else {
            return Vec::new();
        };
        let mut parent = genesis.hash();
        let mut headers = Vec::new();
        if from == genesis.number {
            headers.push(genesis.clone());
        }
        for number in genesis.number + 1..end {
            let Some(header) = self.chain.header(number) else {
                break;
            };
            let mut forked = header.clone();
            forked.extra_data = vec![0xf0];
            forked.parent_hash = parent;
            parent = forked.hash();
            if number >= from {
                headers.push(forked);
            }
        }
        headers
    }

    /// Block numbers for `hashes`, stopping at the first the peer cannot
    /// serve.
    fn served_numbers(&self, hashes: &[Bytes32], head: BlockNumber) -> Vec<BlockNumber> {
        hashes
            .iter()
            .map_while(|hash| self.chain.number_of(hash).filter(|number| *number <= head))
            .collect()
    }
}

#[async_trait]
impl SyncTransport for SimulatedNetwork {
    async fn request_headers(
        &self,
        peer: PeerId,
        from: BlockNumber,
        count: u64,
    ) -> Result<Vec<BlockHeader>, TransportError> {
        let count_hint = usize::try_from(count).unwrap_or(usize::MAX);
        let state = self
            .serve(peer, DataKind::Headers, Some(from), count_hint)
            .await?;

        let end = from.saturating_add(count).min(state.head + 1);
        if state.behaviour == PeerBehaviour::ForkedHeaders {
            return Ok(self.forked_headers(from, end));
        }
        let mut headers: Vec<BlockHeader> = (from..end)
            .filter_map(|number| self.chain.header(number).cloned())
            .collect();

        if state.behaviour == PeerBehaviour::CorruptHeaders && headers.len() > 1 {
            let last = headers.len() - 1;
            headers[last].parent_hash = Bytes32::ZERO;
        }
        Ok(headers)
    }

    async fn request_bodies(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<BlockBody>, TransportError> {
        let first = hashes.first().and_then(|hash| self.chain.number_of(hash));
        let state = self
            .serve(peer, DataKind::Bodies, first, hashes.len())
            .await?;

        let mut bodies: Vec<BlockBody> = self
            .served_numbers(&hashes, state.head)
            .into_iter()
            .filter_map(|number| self.chain.body(number).cloned())
            .collect();

        if state.behaviour == PeerBehaviour::CorruptBodies {
            for body in &mut bodies {
                body.transactions.push(vec![0xba, 0xd0]);
            }
        }
        Ok(bodies)
    }

    async fn request_receipts(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<Vec<Receipt>>, TransportError> {
        let first = hashes.first().and_then(|hash| self.chain.number_of(hash));
        let state = self
            .serve(peer, DataKind::Receipts, first, hashes.len())
            .await?;

        Ok(self
            .served_numbers(&hashes, state.head)
            .into_iter()
            .filter_map(|number| self.chain.receipts(number).cloned())
            .collect())
    }

    async fn request_state_nodes(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<StateNode>, TransportError> {
        let state = self
            .serve(peer, DataKind::StateNodes, None, hashes.len())
            .await?;

        let limit = match state.behaviour {
            PeerBehaviour::StateNodeLimit(limit) => limit,
            _ => usize::MAX,
        };
        Ok(hashes
            .iter()
            .take(limit)
            .map_while(|hash| self.chain.state_node(hash).cloned())
            .collect())
    }

    fn disconnect(&self, peer: PeerId) {
        debug!(peer = %peer, "Simulated disconnect");
        self.peers.write().remove(&peer);
        self.disconnected.lock().push(peer);
    }
}
