//! Cluster plumbing: node identity, the message transport contract, and
//! the replicated log built on both.

pub mod log;
pub mod replicated;

/// Identifies one node in the cluster.
pub type NodeId = u32;

/// Outbound half of the cluster message path. The inbound half is the
/// log's `receive`, fed by whatever fabric delivers peer bytes.
pub trait ClusterTransport {
    fn send(&mut self, peer: NodeId, bytes: &[u8]);
}

/// Transport that drops everything, for single-node operation.
pub struct NullTransport;

impl ClusterTransport for NullTransport {
    fn send(&mut self, _peer: NodeId, _bytes: &[u8]) {}
}
