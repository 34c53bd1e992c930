use std::{
    env,
    net::{Ipv4Addr, TcpListener},
    thread,
};

use comms::LocalGroup;
use orchestra::{
    OrchestraErr,
    seeds::{SeedPlan, setup_seeds},
    topology::{Layout, MAX_PORT_ATTEMPTS, MasterEndpoint, Topology},
};

/// Runs `f` once per rank of `group`, each on its own thread.
fn per_rank<T, F>(group: &LocalGroup, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Topology<comms::LocalConnector>) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = (0..group.size())
        .map(|rank| {
            let topology = Topology::new(group.connector(rank));
            let f = f.clone();
            thread::spawn(move || f(topology))
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn layout_matches_the_node_split() {
    let group = LocalGroup::with_nodes(4, 2);
    let layouts = per_rank(&group, |mut topology| {
        let layout = topology.initialize().unwrap();
        topology.finalize().unwrap();
        layout
    });

    for (rank, layout) in layouts.iter().enumerate() {
        assert_eq!(layout.global_rank, rank);
        assert_eq!(layout.world_size, 4);
        assert_eq!(layout.processes_per_node, 2);
        assert_eq!(layout.num_nodes() * layout.processes_per_node, layout.world_size);
        assert!(layout.local_rank < layout.processes_per_node);
        assert_eq!(layout.local_rank, rank % 2);
    }

    assert!(layouts[0].is_global_leader());
    assert!(layouts[2].is_local_leader());
    assert!(!layouts[2].is_global_leader());
}

#[test]
fn uneven_nodes_fail_to_initialize() {
    let group = LocalGroup::with_node_names(vec!["a".into(), "a".into(), "b".into()]);
    let results = per_rank(&group, |mut topology| {
        matches!(topology.initialize(), Err(OrchestraErr::Topology(_)))
    });

    assert!(results.into_iter().all(|failed| failed));
}

#[test]
fn initialize_is_idempotent_and_finalize_resets() {
    let group = LocalGroup::new(2);
    let results = per_rank(&group, |mut topology| {
        let first = topology.initialize().unwrap();
        let second = topology.initialize().unwrap();
        topology.barrier().unwrap();
        topology.finalize().unwrap();

        let after = topology.local_rank();
        (first == second, matches!(after, Err(OrchestraErr::NotInitialized)))
    });

    assert!(results.into_iter().all(|(same, reset)| same && reset));
}

#[test]
fn finalize_without_initialize_is_a_no_op() {
    let group = LocalGroup::new(1);
    let mut topology = Topology::new(group.connector(0));
    topology.finalize().unwrap();
    assert!(!topology.is_initialized());
    assert!(matches!(topology.layout(), Err(OrchestraErr::NotInitialized)));
}

#[test]
fn every_rank_gets_the_same_seeds() {
    let group = LocalGroup::new(3);
    let plans = per_rank(&group, |mut topology| {
        topology.initialize().unwrap();
        let plan = setup_seeds(topology.comm().unwrap(), Some(1234), 5).unwrap();
        topology.finalize().unwrap();
        plan
    });

    assert!(plans.iter().all(|plan| *plan == plans[0]));
    assert_eq!(plans[0], SeedPlan::expand(1234, 3, 5));
}

#[test]
fn unseeded_runs_still_agree() {
    let group = LocalGroup::new(2);
    let plans = per_rank(&group, |mut topology| {
        topology.initialize().unwrap();
        let plan = setup_seeds(topology.comm().unwrap(), None, 2).unwrap();
        topology.finalize().unwrap();
        plan
    });

    assert_eq!(plans[0], plans[1]);
}

#[test]
fn master_endpoint_is_shared_and_published() {
    let group = LocalGroup::new(2);
    let endpoints = per_rank(&group, |mut topology| {
        let layout: Layout = topology.initialize().unwrap();
        let endpoint = topology
            .negotiate_master_endpoint(23456, Some(".cluster"), MAX_PORT_ATTEMPTS)
            .unwrap();
        topology.finalize().unwrap();
        (layout.global_rank, endpoint)
    });

    let (_, first): &(usize, MasterEndpoint) = &endpoints[0];
    assert!(endpoints.iter().all(|(_, e)| e == first));
    assert!(first.host.ends_with(".cluster"));
    assert_ne!(first.port, 0);

    assert_eq!(env::var("MASTER_ADDR").unwrap(), first.host);
    assert_eq!(env::var("MASTER_PORT").unwrap(), first.port.to_string());
}

#[test]
fn port_exhaustion_fails_every_rank() {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let taken = listener.local_addr().unwrap().port();

    let group = LocalGroup::new(2);
    let results = per_rank(&group, move |mut topology| {
        topology.initialize().unwrap();
        let result = topology.negotiate_master_endpoint(taken, None, 0);
        topology.finalize().unwrap();
        result
    });

    assert!(results.iter().all(|result| matches!(
        result,
        Err(OrchestraErr::PortAllocation { attempts: 0 })
    )));
    drop(listener);
}
