//! First range of a fresh fleet
//!
//! The meta range is created on every host at once. Its first log entry writes the
//! descriptor, seeds the global id counters past the ids it uses, and registers its
//! own meta entry, so the range and its routing entry appear together.

use std::collections::BTreeMap;

use rk_core::keys;
use rk_core::{
    BatchBuilder, BatchCmd, Error, NodeDescriptor, RangeDescriptor, ReplicaDescriptor, Request,
    Result,
};
use tracing::info;

use crate::transport::{StartClusterRequest, Transport};

pub const META_CLUSTER_ID: u64 = 1;
pub const META_RANGE_ID: u64 = 1;

/// `[MIN, MAX)` served by cluster 1, node ids `1..=replicas`
pub fn meta_range_descriptor(replicas: usize) -> RangeDescriptor {
    RangeDescriptor::new(
        META_RANGE_ID,
        keys::min_key(),
        keys::max_key(),
        1,
        (1..=replicas as u64)
            .map(|node_id| ReplicaDescriptor::new(META_CLUSTER_ID, node_id))
            .collect(),
    )
}

/// First entry of the meta range's log
pub fn initial_batch(rd: &RangeDescriptor) -> Result<BatchCmd> {
    let cluster_id = rd
        .cluster_id()
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no replicas", rd)))?;
    let last_node_id = rd.node_ids().max().unwrap_or(0);
    Ok(BatchBuilder::new()
        .add(Request::direct_write(keys::LOCAL_RANGE_KEY, rd.encode()?))
        .add(Request::increment(keys::LAST_CLUSTER_ID_KEY, cluster_id))
        .add(Request::increment(keys::LAST_NODE_ID_KEY, last_node_id))
        .add(Request::increment(keys::LAST_RANGE_ID_KEY, rd.range_id))
        .add(Request::direct_write(
            keys::range_meta_key(&rd.right),
            rd.encode()?,
        ))
        .build())
}

/// Start the meta range on `hosts`, one replica each, in node id order
pub async fn bootstrap_meta_range(
    transport: &dyn Transport,
    hosts: &[NodeDescriptor],
) -> Result<RangeDescriptor> {
    if hosts.is_empty() {
        return Err(Error::InvalidArgument("no hosts to bootstrap".to_string()));
    }
    let rd = meta_range_descriptor(hosts.len());
    let batch = initial_batch(&rd)?;
    let members: BTreeMap<u64, String> = rd
        .replicas
        .iter()
        .zip(hosts)
        .map(|(replica, host)| (replica.node_id, host.nhid.clone()))
        .collect();

    for (replica, host) in rd.replicas.iter().zip(hosts) {
        transport
            .client(&host.rpc_address)?
            .start_cluster(StartClusterRequest {
                cluster_id: replica.cluster_id,
                node_id: replica.node_id,
                initial_members: members.clone(),
                join: false,
                batch: Some(batch.clone()),
            })
            .await?;
    }
    info!("bootstrapped {} on {} hosts", rd, hosts.len());
    Ok(rd)
}
