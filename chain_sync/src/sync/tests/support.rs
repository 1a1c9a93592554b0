use std::{sync::Arc, time::Duration};

use containers::BlockNumber;

use crate::{
    sim::{SimulatedChain, SimulatedNetwork},
    sync::{
        backoff::Backoff,
        config::{FeedConfig, PivotNumber, SyncConfig},
        store::MemoryStore,
        validation::StructuralValidator,
    },
    types::{BlockValidator, ChainStore, SyncTransport},
};

/// Small batches so every test exercises several of them.
pub fn test_config(pivot: BlockNumber) -> SyncConfig {
    SyncConfig {
        pivot_number: PivotNumber::Number(pivot),
        headers_batch_size: 16,
        bodies_batch_size: 16,
        receipts_batch_size: 16,
        state_batch_size: 8,
        full_batch_size: 8,
        max_in_flight: 4,
        max_queued_items: 64,
        request_timeout_ms: 1_000,
        backoff_base_ms: 50,
        backoff_cap_ms: 400,
        report_interval_ms: 1_000,
        ..Default::default()
    }
}

pub fn feed_config() -> FeedConfig {
    FeedConfig {
        max_in_flight: 4,
        max_queued_items: 64,
        request_timeout: Duration::from_secs(1),
        backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(400)),
    }
}

pub fn chain(length: u64) -> Arc<SimulatedChain> {
    Arc::new(SimulatedChain::generate(length, 4))
}

pub fn network(chain: &Arc<SimulatedChain>) -> Arc<SimulatedNetwork> {
    Arc::new(SimulatedNetwork::new(chain.clone()))
}

pub fn genesis_store(chain: &SimulatedChain) -> Arc<MemoryStore> {
    let genesis = chain.genesis().cloned().unwrap();
    Arc::new(MemoryStore::with_genesis(genesis))
}

pub fn validator() -> Arc<dyn BlockValidator> {
    Arc::new(StructuralValidator)
}

pub fn as_store(store: &Arc<MemoryStore>) -> Arc<dyn ChainStore> {
    store.clone()
}

pub fn as_transport(network: &Arc<SimulatedNetwork>) -> Arc<dyn SyncTransport> {
    network.clone()
}
