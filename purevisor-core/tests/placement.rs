//! Placement engine scenarios.

extern crate std;

use std::string::String;
use std::vec;
use std::vec::Vec;

use purevisor_core::config::CoreConfig;
use purevisor_core::placement::{
    ClusterNode, NodeResources, PlacementEngine, PlacementPolicy, PlacementRequest,
};

fn healthy_node(id: u32) -> ClusterNode {
    ClusterNode {
        id,
        online: true,
        health: 95,
        tags: vec![String::from("ssd")],
        resources: NodeResources {
            total_vcpus: 32,
            used_vcpus: 4,
            total_memory: 64 << 30,
            used_memory: 8 << 30,
            total_storage: 2 << 40,
            used_storage: 1 << 38,
            net_capacity: 25_000,
            net_used: 1_000,
        },
        vms: Vec::new(),
    }
}

#[test]
fn anti_affinity_pushes_vm_to_the_other_node() {
    // VM 7 lives on node 1; the new VM must not share a node with it.
    let mut n1 = healthy_node(1);
    n1.vms.push(7);
    let n2 = healthy_node(2);

    let mut engine = PlacementEngine::new(0xD1CE);
    let request = PlacementRequest {
        vcpus: 2,
        memory: 2 << 30,
        anti_affinity: vec![7],
        ..Default::default()
    };
    let decision = engine.schedule(&[n1, n2], &request, &CoreConfig::default()).unwrap();
    assert_eq!(decision.node, 2);
    assert_eq!(decision.runners_up.len(), 1);
    let n1_score = decision.runners_up[0].score;
    assert!(n1_score < decision.score, "co-located node must score lower");
}

#[test]
fn affinity_attracts_and_policy_doubles_it() {
    let mut n1 = healthy_node(1);
    n1.vms.push(7);
    // Node 2 is emptier, but the affinity partner sits on node 1.
    let mut n2 = healthy_node(2);
    n2.resources.used_vcpus = 0;
    n2.resources.used_memory = 0;

    let mut engine = PlacementEngine::new(0xD1CE);
    let request = PlacementRequest {
        vcpus: 2,
        memory: 2 << 30,
        affinity: vec![7],
        policy: PlacementPolicy::Affinity,
        ..Default::default()
    };
    let decision = engine.schedule(&[n1, n2], &request, &CoreConfig::default()).unwrap();
    assert_eq!(decision.node, 1);
}

#[test]
fn forbidden_nodes_are_skipped() {
    let n1 = healthy_node(1);
    let n2 = healthy_node(2);
    let mut engine = PlacementEngine::new(1);
    let request = PlacementRequest { vcpus: 1, memory: 1 << 30, forbidden: vec![1], ..Default::default() };
    let decision = engine.schedule(&[n1, n2], &request, &CoreConfig::default()).unwrap();
    assert_eq!(decision.node, 2);
    assert!(decision.runners_up.is_empty());
}

#[test]
fn runners_up_are_capped_at_three() {
    let nodes: Vec<ClusterNode> = (1..=6).map(healthy_node).collect();
    let mut engine = PlacementEngine::new(1);
    let request = PlacementRequest { vcpus: 1, memory: 1 << 30, ..Default::default() };
    let decision = engine.schedule(&nodes, &request, &CoreConfig::default()).unwrap();
    assert_eq!(decision.runners_up.len(), 3);
}

#[test]
fn random_policy_stays_feasible() {
    let mut n1 = healthy_node(1);
    n1.online = false;
    let n2 = healthy_node(2);
    let n3 = healthy_node(3);
    let mut engine = PlacementEngine::new(0xABCD);
    let request =
        PlacementRequest { vcpus: 1, memory: 1 << 30, policy: PlacementPolicy::Random, ..Default::default() };
    for _ in 0..32 {
        let decision = engine
            .schedule(&[n1.clone(), n2.clone(), n3.clone()], &request, &CoreConfig::default())
            .unwrap();
        assert_ne!(decision.node, 1, "offline node must never win");
    }
}
