//! Placement engine
//!
//! Scores online cluster nodes against a placement request and returns the
//! winner with up to three runners-up. Feasibility filters out nodes that
//! are offline, unhealthy, forbidden, missing a required tag, or unable to
//! fit the request after overcommit. Scoring is a weighted sum of free
//! capacity (CPU 40%, memory 40%, storage 10%, network 10%), adjusted by
//! affinity, and inverted under the Pack policy so fuller nodes win.
//! Node usage comes from tracked `used_*` fields, maintained as VMs are
//! placed and retired.

use alloc::string::String;
use alloc::vec::Vec;
use heapless::Vec as BoundedVec;

use crate::cluster::NodeId;
use crate::config::CoreConfig;
use crate::uuid::Rng64;
use crate::vcpu::VmId;

/// Health floor below which a node is not schedulable.
pub const MIN_HEALTH: u8 = 50;

/// Placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// Prefer the emptiest node.
    #[default]
    Spread,
    /// Prefer the fullest feasible node.
    Pack,
    /// Uniform choice among feasible nodes.
    Random,
    /// Spread, with affinity adjustments doubled.
    Affinity,
}

/// Advertised and tracked resources of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeResources {
    pub total_vcpus: u32,
    pub used_vcpus: u32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_storage: u64,
    pub used_storage: u64,
    pub net_capacity: u64,
    pub net_used: u64,
}

/// One schedulable node as the placement engine sees it.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: NodeId,
    pub online: bool,
    /// 0..100; nodes under `MIN_HEALTH` are unhealthy.
    pub health: u8,
    pub tags: Vec<String>,
    pub resources: NodeResources,
    /// VMs currently placed on this node.
    pub vms: Vec<VmId>,
}

/// What a caller asks the engine to place.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub vcpus: u32,
    pub memory: u64,
    pub required_tags: Vec<String>,
    pub forbidden: Vec<NodeId>,
    pub affinity: Vec<VmId>,
    pub anti_affinity: Vec<VmId>,
    pub policy: PlacementPolicy,
}

/// A scored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeId,
    pub score: i64,
}

/// The engine's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementDecision {
    pub node: NodeId,
    pub score: i64,
    pub policy: PlacementPolicy,
    pub runners_up: BoundedVec<Candidate, 3>,
}

/// Placement errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementError {
    /// Every node failed the feasibility filter.
    NoFeasibleNode,
}

/// Score-based node selector.
pub struct PlacementEngine {
    rng: Rng64,
}

impl PlacementEngine {
    pub fn new(seed: u64) -> Self {
        PlacementEngine { rng: Rng64::new(seed) }
    }

    /// Choose a node for `request` among `nodes`.
    pub fn schedule(
        &mut self,
        nodes: &[ClusterNode],
        request: &PlacementRequest,
        cfg: &CoreConfig,
    ) -> Result<PlacementDecision, PlacementError> {
        let policy = request.policy;
        let mut candidates: Vec<Candidate> = nodes
            .iter()
            .filter(|node| Self::feasible(node, request, cfg))
            .map(|node| Candidate { node: node.id, score: self.score(node, request, policy) })
            .collect();
        if candidates.is_empty() {
            return Err(PlacementError::NoFeasibleNode);
        }
        candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.node.cmp(&b.node)));
        let winner = candidates[0];
        let mut runners_up = BoundedVec::new();
        for c in candidates.iter().skip(1).take(3) {
            let _ = runners_up.push(*c);
        }
        Ok(PlacementDecision { node: winner.node, score: winner.score, policy, runners_up })
    }

    fn feasible(node: &ClusterNode, request: &PlacementRequest, cfg: &CoreConfig) -> bool {
        if !node.online || node.health < MIN_HEALTH {
            return false;
        }
        if request.forbidden.contains(&node.id) {
            return false;
        }
        if !request.required_tags.iter().all(|t| node.tags.contains(t)) {
            return false;
        }
        let r = &node.resources;
        let cpu_limit = r.total_vcpus as u64 * cfg.cpu_overcommit_ratio as u64 / 100;
        if r.used_vcpus as u64 + request.vcpus as u64 > cpu_limit {
            return false;
        }
        let mem_limit = r.total_memory / 100 * cfg.memory_overcommit_ratio as u64;
        if r.used_memory + request.memory > mem_limit {
            return false;
        }
        true
    }

    fn score(&mut self, node: &ClusterNode, request: &PlacementRequest, policy: PlacementPolicy) -> i64 {
        if policy == PlacementPolicy::Random {
            return (self.rng.next_u64() % 100) as i64;
        }
        let r = &node.resources;
        let base = (40 * pct_free(r.total_vcpus as u64, r.used_vcpus as u64)
            + 40 * pct_free(r.total_memory, r.used_memory)
            + 10 * pct_free(r.total_storage, r.used_storage)
            + 10 * pct_free(r.net_capacity, r.net_used))
            / 100;
        let base = if policy == PlacementPolicy::Pack { 100 - base } else { base };
        let mut adjust: i64 = 0;
        for vm in &node.vms {
            if request.affinity.contains(vm) {
                adjust += 25;
            }
            if request.anti_affinity.contains(vm) {
                adjust -= 50;
            }
        }
        if policy == PlacementPolicy::Affinity {
            adjust *= 2;
        }
        base + adjust
    }
}

/// Free share of a resource in percent; absent resources score zero.
fn pct_free(total: u64, used: u64) -> i64 {
    if total == 0 {
        return 0;
    }
    (total.saturating_sub(used) * 100 / total) as i64
}
