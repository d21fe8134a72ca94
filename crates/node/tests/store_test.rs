use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rangekv::{ApiClient, Replica, StartClusterRequest, Store};
use rk_core::descriptor::check_partition;
use rk_core::keys;
use rk_core::{
    BatchCmd, BatchResponse, ClusterId, Error, FileRecord, Header, NodeId, RangeDescriptor,
    ReplicaDescriptor, Request,
};

mod common;
use common::{record_key, wait_until, write_records, TestFleet};

const WAIT: Duration = Duration::from_secs(2);

fn persisted_applied(replica: &Replica) -> u64 {
    replica
        .testing_engine()
        .get(keys::LAST_APPLIED_INDEX_KEY)
        .unwrap()
        .map(|buf| keys::decode_u64(&buf).unwrap())
        .unwrap_or(0)
}

/// Store hosting `replica`
fn host_of<'a>(stores: &'a [Arc<Store>], replica: &ReplicaDescriptor) -> &'a Arc<Store> {
    stores
        .iter()
        .find(|s| {
            s.get_replica(replica.cluster_id)
                .map(|r| r.node_id() == replica.node_id)
                .unwrap_or(false)
        })
        .unwrap()
}

async fn assert_readable_everywhere(
    stores: &[Arc<Store>],
    rd: &RangeDescriptor,
    record: &FileRecord,
    data: &Bytes,
) {
    for replica in &rd.replicas {
        let store = host_of(stores, replica);
        let got = store
            .read_record(Header::new(rd, *replica), record.clone(), 0, 0)
            .await
            .unwrap();
        assert_eq!(got, *data);
    }
}

async fn read_meta_entry(store: &Store, right: &[u8]) -> RangeDescriptor {
    let buf = store
        .sender()
        .get(&keys::range_meta_key(right))
        .await
        .unwrap()
        .unwrap();
    RangeDescriptor::decode(&buf).unwrap()
}

async fn meta_entry(store: &Store, right: &[u8]) -> Option<RangeDescriptor> {
    let buf = store
        .sender()
        .get(&keys::range_meta_key(right))
        .await
        .ok()??;
    RangeDescriptor::decode(&buf).ok()
}

/// Forwards to a store but loses the first meta entry write it is asked to propose
struct LoseFirstMetaWrite {
    inner: Arc<Store>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl ApiClient for LoseFirstMetaWrite {
    async fn start_cluster(&self, req: StartClusterRequest) -> rk_core::Result<()> {
        self.inner.start_cluster(req).await
    }

    async fn remove_data(&self, cluster_id: ClusterId, node_id: NodeId) -> rk_core::Result<()> {
        self.inner.remove_data(cluster_id, node_id).await
    }

    async fn sync_propose(&self, header: Header, batch: BatchCmd) -> rk_core::Result<BatchResponse> {
        let writes_meta = batch.requests.iter().any(|r| {
            matches!(r, Request::DirectWrite { key, .. } if keys::is_meta_key(key))
        });
        if writes_meta && self.armed.swap(false, Ordering::SeqCst) {
            return Err(Error::ConsensusApplyFailure("meta write lost".to_string()));
        }
        self.inner.sync_propose(header, batch).await
    }

    async fn sync_read(&self, header: Header, batch: BatchCmd) -> rk_core::Result<BatchResponse> {
        self.inner.sync_read(header, batch).await
    }

    async fn write_record(
        &self,
        header: Header,
        record: FileRecord,
        data: Bytes,
    ) -> rk_core::Result<()> {
        self.inner.write_record(header, record, data).await
    }

    async fn read_record(
        &self,
        header: Header,
        record: FileRecord,
        offset: u64,
        limit: u64,
    ) -> rk_core::Result<Bytes> {
        self.inner.read_record(header, record, offset, limit).await
    }
}

#[tokio::test]
async fn test_add_get_remove_range() {
    let fleet = TestFleet::new();
    let store = fleet.new_store(1).await;
    let rd = RangeDescriptor::new(
        7,
        b"a".to_vec(),
        b"m".to_vec(),
        1,
        vec![ReplicaDescriptor::new(9, 1)],
    );

    store.add_range(rd.clone());
    assert_eq!(store.get_range(9), Some(rd.clone()));
    store.remove_range(&rd);
    assert_eq!(store.get_range(9), None);
}

#[tokio::test]
async fn test_start_cluster_on_three_nodes() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;

    for store in &stores {
        let members = store.get_cluster_membership(1).await.unwrap();
        assert_eq!(members, rd.replicas);
        assert_eq!(store.get_range(1), Some(rd.clone()));
        assert_eq!(store.range_cache().meta_range(), Some(rd.clone()));
    }
    assert_eq!(read_meta_entry(&stores[1], &rd.right).await, rd);
    assert_eq!(
        stores[2].sender().get(keys::LAST_NODE_ID_KEY).await.unwrap(),
        Some(keys::encode_u64(3))
    );
}

#[tokio::test]
async fn test_start_cluster_is_idempotent() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    assert_eq!(fleet.hub.last_index(1).await.unwrap(), 1);

    let members: BTreeMap<u64, String> = stores
        .iter()
        .enumerate()
        .map(|(i, s)| (i as u64 + 1, s.nhid().to_string()))
        .collect();
    stores[2]
        .start_cluster(StartClusterRequest {
            cluster_id: 1,
            node_id: 3,
            initial_members: members,
            join: false,
            batch: Some(rangekv::bootstrap::initial_batch(&rd).unwrap()),
        })
        .await
        .unwrap();
    assert_eq!(fleet.hub.last_index(1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_put_get_through_sender() {
    let fleet = TestFleet::new();
    let (stores, _) = fleet.bootstrap(3, 3).await;

    stores[0].sender().put(b"hello", b"world").await.unwrap();
    assert_eq!(
        stores[2].sender().get(b"hello").await.unwrap(),
        Some(b"world".to_vec())
    );
    stores[1].sender().delete(b"hello").await.unwrap();
    assert_eq!(stores[0].sender().get(b"hello").await.unwrap(), None);

    assert_eq!(stores[0].sender().increment(b"counter", 2).await.unwrap(), 2);
    assert_eq!(stores[1].sender().increment(b"counter", 3).await.unwrap(), 5);
}

#[tokio::test]
async fn test_record_write_and_partial_read() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let records = write_records(&stores[0], 3).await;

    for (record, data) in &records {
        assert_readable_everywhere(&stores, &rd, record, data).await;
        let tail = stores[1].sender().read_record(record, 4, 8).await.unwrap();
        assert_eq!(tail, data.slice(4..12));
    }
    let (missing, _) = common::random_record("grp");
    assert!(matches!(
        stores[0].sender().read_record(&missing, 0, 0).await,
        Err(Error::RecordNotFound(_))
    ));
}

#[tokio::test]
async fn test_add_cluster_node() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(4, 3).await;
    stores[0].sender().put(b"before", b"1").await.unwrap();

    let updated = stores[0]
        .add_cluster_node(&rd, stores[3].node())
        .await
        .unwrap();
    assert_eq!(updated.replicas.len(), 4);
    assert_eq!(updated.generation, rd.generation + 1);
    assert_eq!(updated.replica(4), Some(&ReplicaDescriptor::new(1, 4)));

    for store in &stores {
        assert_eq!(store.get_cluster_membership(1).await.unwrap().len(), 4);
    }
    let joined = stores[3].get_replica(1).unwrap();
    let leader = stores[0].get_replica(1).unwrap();
    assert!(
        wait_until(WAIT, || {
            let (joined, leader) = (joined.clone(), leader.clone());
            async move { persisted_applied(&joined) == persisted_applied(&leader) }
        })
        .await
    );
    assert_eq!(stores[3].get_range(1), Some(updated.clone()));
    assert_eq!(read_meta_entry(&stores[3], &updated.right).await, updated);

    let header = Header::new(&updated, ReplicaDescriptor::new(1, 4));
    assert_eq!(joined.read(&header, b"before").unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_remove_cluster_node() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;

    let updated = stores[0].remove_cluster_node(&rd, 3).await.unwrap();
    assert_eq!(updated.replicas.len(), 2);
    assert_eq!(updated.generation, rd.generation + 1);
    for store in &stores[..2] {
        assert_eq!(store.get_cluster_membership(1).await.unwrap().len(), 2);
        assert_eq!(store.get_range(1), Some(updated.clone()));
    }
    assert!(stores[2].get_replica(1).is_err());
    assert!(storage::EngineFactory::list(fleet.engines.as_ref(), stores[2].nhid()).is_empty());

    // The remaining pair still commits
    stores[1].sender().put(b"after", b"1").await.unwrap();
    assert_eq!(
        stores[0].sender().get(b"after").await.unwrap(),
        Some(b"1".to_vec())
    );

    let err = stores[0]
        .remove_cluster_node(&updated, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_split_meta_range() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let records = write_records(&stores[0], 10).await;

    let (left, right) = stores[0].split_cluster(&rd).await.unwrap();
    assert_eq!(left.left, keys::min_key());
    assert_eq!(right.right, keys::max_key());
    assert_eq!(left.right, right.left);
    assert_eq!(left.generation, rd.generation + 1);
    assert_eq!(right.generation, rd.generation + 1);
    assert_eq!(left.range_id, rd.range_id);
    assert_eq!(right.range_id, 2);
    assert_eq!(right.cluster_id(), Some(2));
    assert_eq!(right.node_ids().collect::<Vec<_>>(), vec![4, 5, 6]);
    assert!(left.is_meta_range());
    check_partition(&[left.clone(), right.clone()]).unwrap();

    let in_left = records
        .iter()
        .filter(|(r, _)| left.contains_key(&record_key(r)))
        .count();
    assert_eq!(in_left, 5);

    for (record, data) in &records {
        let owner = if left.contains_key(&record_key(record)) {
            &left
        } else {
            &right
        };
        assert_readable_everywhere(&stores, owner, record, data).await;
        assert_eq!(
            stores[2].sender().read_record(record, 0, 0).await.unwrap(),
            *data
        );
    }

    // The left group gave up the right half
    let (record, _) = records
        .iter()
        .find(|(r, _)| right.contains_key(&record_key(r)))
        .unwrap();
    let err = stores[0]
        .read_record(Header::new(&left, left.replicas[0]), record.clone(), 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyOutOfRange { .. }));

    assert_eq!(read_meta_entry(&stores[1], &left.right).await, left);
    assert_eq!(read_meta_entry(&stores[1], &right.right).await, right);
}

#[tokio::test]
async fn test_split_non_meta_range_twice() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let mut records = write_records(&stores[0], 50).await;
    let (meta, right) = stores[0].split_cluster(&rd).await.unwrap();

    records.extend(write_records(&stores[1], 50).await);
    let (r1, r2) = stores[0].split_cluster(&right).await.unwrap();
    assert_eq!(r1.range_id, right.range_id);
    assert_eq!(r1.generation, right.generation + 1);
    assert_eq!(r2.range_id, 3);
    assert_eq!(r2.cluster_id(), Some(3));
    check_partition(&[meta.clone(), r1.clone(), r2.clone()]).unwrap();

    for (record, data) in &records {
        let key = record_key(record);
        let owner = [&meta, &r1, &r2]
            .into_iter()
            .find(|rd| rd.contains_key(&key))
            .unwrap();
        assert_readable_everywhere(&stores, owner, record, data).await;
        assert_eq!(
            stores[2].sender().read_record(record, 0, 0).await.unwrap(),
            *data
        );
    }
    assert_eq!(read_meta_entry(&stores[2], &r1.right).await, r1);
    assert_eq!(read_meta_entry(&stores[2], &r2.right).await, r2);
}

#[tokio::test]
async fn test_list_cluster() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    write_records(&stores[0], 10).await;
    let (left, right) = stores[0].split_cluster(&rd).await.unwrap();

    for (i, store) in stores.iter().enumerate() {
        let listed = store.list_cluster();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].range, left);
        assert_eq!(listed[0].replica, ReplicaDescriptor::new(1, i as u64 + 1));
        assert_eq!(listed[1].range, right);
        assert_eq!(listed[1].replica, ReplicaDescriptor::new(2, i as u64 + 4));
    }
}

#[tokio::test]
async fn test_replica_added_after_split_catches_up() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(4, 3).await;
    let records = write_records(&stores[0], 50).await;
    let (left, right) = stores[0].split_cluster(&rd).await.unwrap();

    let updated = stores[0]
        .add_cluster_node(&left, stores[3].node())
        .await
        .unwrap();
    // 3 bootstrap ids, 3 for the right half, then this one
    let new_replica = ReplicaDescriptor::new(1, 7);
    assert_eq!(updated.replica(7), Some(&new_replica));

    let joined = stores[3].get_replica(1).unwrap();
    let leader = stores[0].get_replica(1).unwrap();
    assert!(
        wait_until(WAIT, || {
            let (joined, leader) = (joined.clone(), leader.clone());
            async move { persisted_applied(&joined) == persisted_applied(&leader) }
        })
        .await
    );

    let header = Header::new(&updated, new_replica);
    for (record, data) in &records {
        if left.contains_key(&record_key(record)) {
            let got = stores[3]
                .read_record(header, record.clone(), 0, 0)
                .await
                .unwrap();
            assert_eq!(got, *data);
        }
    }
    // The right half was never copied to the new host
    assert!(stores[3]
        .get_replica(right.cluster_id().unwrap())
        .is_err());
}

#[tokio::test]
async fn test_split_empty_range_rejected() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;

    let err = stores[0].split_cluster(&rd).await.unwrap_err();
    assert_eq!(
        err,
        Error::EmptyRangeSplitRejected {
            range_id: rd.range_id
        }
    );
    assert_eq!(stores[0].get_range(1), Some(rd.clone()));

    // Not frozen, lock released
    stores[0].sender().put(b"k", b"v").await.unwrap();
    stores[0].split_cluster(&rd).await.unwrap();
}

#[tokio::test]
async fn test_stale_split_rejected() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    write_records(&stores[0], 10).await;
    stores[0].split_cluster(&rd).await.unwrap();

    let err = stores[1].split_cluster(&rd).await.unwrap_err();
    assert_eq!(
        err,
        Error::RangeGenerationMismatch {
            range_id: rd.range_id,
            requested: rd.generation,
            current: rd.generation + 1,
        }
    );
}

#[tokio::test]
async fn test_concurrent_proposes_during_split() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    write_records(&stores[0], 20).await;

    let sender = stores[1].sender().clone();
    let writer = tokio::spawn(async move {
        for i in 0..40 {
            let key = format!("key-{:03}", i);
            sender.put(key.as_bytes(), b"v").await.unwrap();
        }
    });
    let (left, right) = stores[0].split_cluster(&rd).await.unwrap();
    writer.await.unwrap();

    for i in 0..40 {
        let key = format!("key-{:03}", i);
        assert_eq!(
            stores[2].sender().get(key.as_bytes()).await.unwrap(),
            Some(b"v".to_vec())
        );
        // Exactly one half owns the key
        assert!(left.contains_key(key.as_bytes()) != right.contains_key(key.as_bytes()));
    }
}

#[tokio::test]
async fn test_restart_rebuilds_range_table() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let records = write_records(&stores[0], 5).await;

    stores[2].stop().await;
    assert_eq!(stores[2].get_range(1), None);
    stores[0].sender().put(b"while-down", b"1").await.unwrap();

    let restarted = fleet.new_store(3).await;
    assert_eq!(restarted.get_range(1), Some(rd.clone()));
    let replica = restarted.get_replica(1).unwrap();
    let leader = stores[0].get_replica(1).unwrap();
    assert_eq!(persisted_applied(&replica), persisted_applied(&leader));

    let header = Header::new(&rd, ReplicaDescriptor::new(1, 3));
    assert_eq!(
        replica.read(&header, b"while-down").unwrap(),
        Some(b"1".to_vec())
    );
    for (record, data) in &records {
        let got = restarted
            .read_record(header, record.clone(), 0, 0)
            .await
            .unwrap();
        assert_eq!(got, *data);
    }
}

#[tokio::test]
async fn test_random_splits_keep_partition() {
    let fleet = TestFleet::new();
    let (stores, _) = fleet.bootstrap(3, 3).await;
    let records = write_records(&stores[0], 40).await;

    for _ in 0..5 {
        let ranges: Vec<RangeDescriptor> = stores[0]
            .list_cluster()
            .into_iter()
            .map(|rr| rr.range)
            .collect();
        let target = ranges[rand::rng().random_range(0..ranges.len())].clone();
        match stores[0].split_cluster(&target).await {
            Ok(_) | Err(Error::EmptyRangeSplitRejected { .. }) => {}
            Err(e) => panic!("split of {} failed: {}", target, e),
        }
        let ranges: Vec<RangeDescriptor> = stores[0]
            .list_cluster()
            .into_iter()
            .map(|rr| rr.range)
            .collect();
        check_partition(&ranges).unwrap();
    }

    for (record, data) in &records {
        assert_eq!(
            stores[1].sender().read_record(record, 0, 0).await.unwrap(),
            *data
        );
    }
}

#[tokio::test]
async fn test_clients_cannot_write_local_keys() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let forged = RangeDescriptor::new(7, keys::min_key(), b"m".to_vec(), 1, rd.replicas.clone());

    let err = stores[0]
        .sender()
        .put(keys::LOCAL_RANGE_KEY, &forged.encode().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = stores[1]
        .sender()
        .delete(keys::SPLIT_FREEZE_KEY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = stores[2]
        .sender()
        .increment(keys::LAST_APPLIED_INDEX_KEY, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    for store in &stores {
        assert_eq!(store.get_range(1), Some(rd.clone()));
    }
    stores[0].sender().put(b"zz-user-key", b"1").await.unwrap();
    assert_eq!(
        stores[1].sender().get(b"zz-user-key").await.unwrap(),
        Some(b"1".to_vec())
    );
}

#[tokio::test]
async fn test_split_survives_failed_meta_write() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(3, 3).await;
    let records = write_records(&stores[0], 30).await;
    let (_, right) = stores[0].split_cluster(&rd).await.unwrap();

    let armed = Arc::new(AtomicBool::new(true));
    let _proxies: Vec<Arc<LoseFirstMetaWrite>> = stores
        .iter()
        .map(|store| {
            let proxy = Arc::new(LoseFirstMetaWrite {
                inner: store.clone(),
                armed: armed.clone(),
            });
            let endpoint: Weak<dyn ApiClient> = Arc::<LoseFirstMetaWrite>::downgrade(&proxy);
            fleet
                .transport
                .register(store.node().rpc_address.clone(), endpoint);
            proxy
        })
        .collect();

    let (r1, r2) = stores[0].split_cluster(&right).await.unwrap();
    assert!(!armed.load(Ordering::SeqCst));

    // The upper half serves before its meta entry lands
    for (record, data) in &records {
        if r2.contains_key(&record_key(record)) {
            assert_eq!(
                stores[1].sender().read_record(record, 0, 0).await.unwrap(),
                *data
            );
        }
    }
    let mut fresh = r2.left.clone();
    fresh.push(b'!');
    stores[2].sender().put(&fresh, b"1").await.unwrap();
    assert_eq!(
        stores[0].sender().get(&fresh).await.unwrap(),
        Some(b"1".to_vec())
    );

    assert!(
        wait_until(WAIT, || {
            let store = stores[2].clone();
            let (r1, r2) = (r1.clone(), r2.clone());
            async move {
                meta_entry(&store, &r1.right).await == Some(r1)
                    && meta_entry(&store, &r2.right).await == Some(r2)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_add_cluster_node_resumes_after_failed_start() {
    let fleet = TestFleet::new();
    let (stores, rd) = fleet.bootstrap(4, 3).await;
    let joining = stores[3].node().clone();

    fleet.transport.unregister(&joining.rpc_address);
    let err = stores[0]
        .add_cluster_node(&rd, &joining)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert_eq!(stores[0].get_cluster_membership(1).await.unwrap().len(), 4);

    let endpoint: Weak<dyn ApiClient> = Arc::<Store>::downgrade(&stores[3]);
    fleet
        .transport
        .register(joining.rpc_address.clone(), endpoint);
    let updated = stores[0].add_cluster_node(&rd, &joining).await.unwrap();
    assert_eq!(updated.replicas.len(), 4);
    assert_eq!(updated.replica(4), Some(&ReplicaDescriptor::new(1, 4)));
    assert_eq!(stores[0].get_cluster_membership(1).await.unwrap().len(), 4);
    assert_eq!(
        stores[0].sender().get(keys::LAST_NODE_ID_KEY).await.unwrap(),
        Some(keys::encode_u64(4))
    );
    assert!(stores[3].get_replica(1).is_ok());
}
