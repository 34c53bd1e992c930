//! The process topology service.
//!
//! A [`Topology`] owns the group membership of the running process. It's
//! created once by the entry point and passed down explicitly, and it isn't
//! `Clone` so there is always exactly one handle to the group.

mod endpoint;

use comms::{Collective, CollectiveExt, Connector};
use log::debug;

use crate::{OrchestraErr, Result};

pub use endpoint::{
    MasterEndpoint, find_free_port, find_free_port_if_taken, is_port_in_use, local_hostname,
    MAX_PORT_ATTEMPTS,
};

/// Where a process sits in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub global_rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub processes_per_node: usize,
}

impl Layout {
    /// Builds a layout, checking it describes a homogeneous set of nodes.
    ///
    /// # Returns
    /// The layout or a `Topology` error describing the inconsistency.
    pub fn new(
        global_rank: usize,
        local_rank: usize,
        world_size: usize,
        processes_per_node: usize,
    ) -> Result<Self> {
        if world_size == 0 || processes_per_node == 0 {
            return Err(OrchestraErr::Topology(
                "world size and processes per node must be at least 1".into(),
            ));
        }

        if world_size % processes_per_node != 0 {
            return Err(OrchestraErr::Topology(format!(
                "{world_size} processes can't be split evenly in nodes of {processes_per_node}"
            )));
        }

        if global_rank >= world_size || local_rank >= processes_per_node {
            return Err(OrchestraErr::Topology(format!(
                "rank {global_rank} (local {local_rank}) is outside of a world of \
                 {world_size} with {processes_per_node} per node"
            )));
        }

        Ok(Self {
            global_rank,
            local_rank,
            world_size,
            processes_per_node,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.world_size / self.processes_per_node
    }

    pub fn is_global_leader(&self) -> bool {
        self.global_rank == 0 && self.local_rank == 0
    }

    pub fn is_local_leader(&self) -> bool {
        self.local_rank == 0
    }
}

struct Active<T> {
    comm: T,
    layout: Layout,
}

/// The process group handle.
pub struct Topology<C: Connector> {
    connector: C,
    active: Option<Active<C::Comm>>,
}

impl<C: Connector> Topology<C> {
    /// Creates an uninitialized topology that joins through `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            active: None,
        }
    }

    /// Joins the group and discovers this process' layout.
    ///
    /// Once initialized, further calls return the same layout without touching
    /// the group.
    ///
    /// # Returns
    /// The layout, or a `Topology` error when the group can't be formed or the
    /// nodes hold different amounts of processes.
    pub fn initialize(&mut self) -> Result<Layout> {
        if let Some(active) = &self.active {
            return Ok(active.layout);
        }

        let mut comm = self.connector.connect().map_err(topology_err)?;
        let split = comm.split_by_shared_memory().map_err(topology_err)?;

        // Every rank sees the same sizes, so every rank takes the same branch.
        let local_sizes: Vec<usize> = comm.all_gather(&split.local_size).map_err(topology_err)?;
        if local_sizes.iter().any(|&s| s != split.local_size) {
            return Err(OrchestraErr::Topology(format!(
                "nodes hold different amounts of processes: {local_sizes:?}"
            )));
        }

        let layout = Layout::new(comm.rank(), split.local_rank, comm.size(), split.local_size)?;
        debug!(
            rank = layout.global_rank,
            local_rank = layout.local_rank,
            nodes = layout.num_nodes();
            "topology initialized"
        );

        self.active = Some(Active { comm, layout });
        Ok(layout)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    pub fn layout(&self) -> Result<Layout> {
        self.active
            .as_ref()
            .map(|active| active.layout)
            .ok_or(OrchestraErr::NotInitialized)
    }

    pub fn rank(&self) -> Result<usize> {
        self.layout().map(|l| l.global_rank)
    }

    pub fn local_rank(&self) -> Result<usize> {
        self.layout().map(|l| l.local_rank)
    }

    pub fn size(&self) -> Result<usize> {
        self.layout().map(|l| l.world_size)
    }

    pub fn num_nodes(&self) -> Result<usize> {
        self.layout().map(|l| l.num_nodes())
    }

    pub fn ppn(&self) -> Result<usize> {
        self.layout().map(|l| l.processes_per_node)
    }

    pub fn is_global_leader(&self) -> Result<bool> {
        self.layout().map(|l| l.is_global_leader())
    }

    /// Blocks until every process of the group reaches the barrier.
    pub fn barrier(&mut self) -> Result<()> {
        Ok(self.comm()?.barrier()?)
    }

    /// The collective handle of the group.
    pub fn comm(&mut self) -> Result<&mut C::Comm> {
        self.active
            .as_mut()
            .map(|active| &mut active.comm)
            .ok_or(OrchestraErr::NotInitialized)
    }

    /// Agrees on the master endpoint and publishes it into the environment.
    ///
    /// The global leader picks the host and port, every rank receives them
    /// and sets `MASTER_ADDR` and `MASTER_PORT`.
    ///
    /// # Arguments
    /// * `preferred_port` - Used when it's free, an OS assigned port otherwise.
    /// * `host_suffix` - Appended to the leader's host name.
    /// * `attempts` - How many OS assigned ports the leader tries when the
    ///   preferred one is taken.
    ///
    /// # Returns
    /// The endpoint, or `PortAllocation` on every rank if the leader ran out
    /// of attempts.
    pub fn negotiate_master_endpoint(
        &mut self,
        preferred_port: u16,
        host_suffix: Option<&str>,
        attempts: usize,
    ) -> Result<MasterEndpoint> {
        let layout = self.layout()?;
        let comm = self.comm()?;
        let endpoint = endpoint::negotiate(comm, &layout, preferred_port, host_suffix, attempts)?;
        endpoint.publish();
        Ok(endpoint)
    }

    /// Leaves the group. A later `initialize` joins again from scratch.
    ///
    /// Does nothing if the topology was never initialized.
    pub fn finalize(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        active.comm.finalize()?;
        debug!(rank = active.layout.global_rank; "topology finalized");
        Ok(())
    }
}

fn topology_err(e: comms::CommsErr) -> OrchestraErr {
    OrchestraErr::Topology(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_counts_nodes() {
        let layout = Layout::new(5, 1, 8, 4).unwrap();
        assert_eq!(layout.num_nodes(), 2);
        assert!(!layout.is_global_leader());
        assert!(!layout.is_local_leader());

        let leader = Layout::new(0, 0, 8, 4).unwrap();
        assert!(leader.is_global_leader());
    }

    #[test]
    fn uneven_nodes_are_rejected() {
        assert!(matches!(Layout::new(0, 0, 6, 4), Err(OrchestraErr::Topology(_))));
        assert!(matches!(Layout::new(0, 4, 8, 4), Err(OrchestraErr::Topology(_))));
        assert!(matches!(Layout::new(0, 0, 0, 1), Err(OrchestraErr::Topology(_))));
    }

    #[test]
    fn accessors_fail_before_initialize() {
        let group = comms::LocalGroup::new(1);
        let mut topology = Topology::new(group.connector(0));

        assert!(matches!(topology.rank(), Err(OrchestraErr::NotInitialized)));
        assert!(matches!(topology.barrier(), Err(OrchestraErr::NotInitialized)));
        topology.finalize().unwrap();
    }

    #[test]
    fn single_process_group() {
        let group = comms::LocalGroup::new(1);
        let mut topology = Topology::new(group.connector(0));

        let layout = topology.initialize().unwrap();
        assert_eq!(layout, Layout::new(0, 0, 1, 1).unwrap());
        assert_eq!(topology.initialize().unwrap(), layout);
        topology.barrier().unwrap();

        topology.finalize().unwrap();
        assert!(matches!(topology.size(), Err(OrchestraErr::NotInitialized)));

        assert_eq!(topology.initialize().unwrap(), layout);
        topology.finalize().unwrap();
    }
}
