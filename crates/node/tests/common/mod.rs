#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use raft::LocalRaftHub;
use rangekv::bootstrap::bootstrap_meta_range;
use rangekv::{Config, GossipNetwork, LocalTransport, Store, StoreDeps};
use rk_core::{Digest, FileRecord, RangeDescriptor};
use storage::MemoryEngineFactory;

/// Shared collaborators of an in-process fleet
pub struct TestFleet {
    pub hub: LocalRaftHub,
    pub engines: Arc<MemoryEngineFactory>,
    pub transport: Arc<LocalTransport>,
    pub gossip: GossipNetwork,
    pub config: Config,
}

impl TestFleet {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.node.nhid = "nh".to_string();
        config.node.raft_address = "raft".to_string();
        config.node.rpc_address = "rpc".to_string();
        config.raft.propose_timeout_ms = 2000;
        config.raft.read_timeout_ms = 2000;
        config.raft.config_change_timeout_ms = 2000;
        config.sender.max_attempts = 50;
        config.sender.initial_backoff_ms = 1;
        config.sender.max_backoff_ms = 20;
        config.split.lease_timeout_ms = 5000;
        Self {
            hub: LocalRaftHub::new(),
            engines: Arc::new(MemoryEngineFactory::new()),
            transport: Arc::new(LocalTransport::new()),
            gossip: GossipNetwork::new(),
            config,
        }
    }

    /// Create and start host `i` (1-based)
    pub async fn new_store(&self, i: usize) -> Arc<Store> {
        let config = self.config.for_host(i);
        let deps = StoreDeps {
            consensus: self.hub.host(config.node.nhid.clone()),
            engines: self.engines.clone(),
            transport: self.transport.clone(),
            gossip: self.gossip.clone(),
        };
        let store = Store::new(config, deps);
        store.start().await.unwrap();
        store
    }

    pub async fn start_stores(&self, n: usize) -> Vec<Arc<Store>> {
        let mut stores = Vec::with_capacity(n);
        for i in 1..=n {
            stores.push(self.new_store(i).await);
        }
        stores
    }

    /// Start `n` hosts and the meta range on the first `replicas` of them
    pub async fn bootstrap(&self, n: usize, replicas: usize) -> (Vec<Arc<Store>>, RangeDescriptor) {
        let stores = self.start_stores(n).await;
        let hosts: Vec<_> = stores[..replicas].iter().map(|s| s.node().clone()).collect();
        let rd = bootstrap_meta_range(self.transport.as_ref(), &hosts)
            .await
            .unwrap();
        (stores, rd)
    }
}

pub fn random_record(group: &str) -> (FileRecord, Bytes) {
    let mut rng = rand::rng();
    let len = rng.random_range(16..256);
    let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    (FileRecord::new(group, Digest::compute(&data)), Bytes::from(data))
}

/// Write `n` random records through `store`'s sender
pub async fn write_records(store: &Store, n: usize) -> Vec<(FileRecord, Bytes)> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let (record, data) = random_record("grp");
        store
            .sender()
            .write_record(&record, data.clone())
            .await
            .unwrap();
        out.push((record, data));
    }
    out
}

pub fn record_key(record: &FileRecord) -> Vec<u8> {
    record.metadata_key().unwrap()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
