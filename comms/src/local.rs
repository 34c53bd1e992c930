use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{Collective, CommsErr, Connector, Result};

/// An in-process group where every rank is a thread.
///
/// Each collective is a rendezvous: members deposit their payload and block
/// until the last member arrives, which publishes the gathered payloads for
/// that round. Cloning the group shares it.
#[derive(Clone)]
pub struct LocalGroup {
    shared: Arc<Shared>,
}

struct Shared {
    size: usize,
    nodes: Vec<String>,
    state: Mutex<Rendezvous>,
    turnstile: Condvar,
}

struct Rendezvous {
    generation: u64,
    arrived: usize,
    slots: Vec<Vec<u8>>,
    published: Arc<Vec<Vec<u8>>>,
    joined: Vec<bool>,
    aborted: bool,
}

impl LocalGroup {
    /// Creates a group of `size` ranks, all on the same node.
    ///
    /// # Arguments
    /// * `size` - The amount of ranks, must be at least one.
    pub fn new(size: usize) -> Self {
        Self::with_nodes(size, size)
    }

    /// Creates a group of `size` ranks spread over nodes of `per_node` ranks.
    ///
    /// Ranks are assigned to nodes in blocks: ranks `0..per_node` live on
    /// `node-0`, the next block on `node-1` and so on.
    ///
    /// # Arguments
    /// * `size` - The amount of ranks, must be at least one.
    /// * `per_node` - The amount of ranks per node, must be at least one.
    pub fn with_nodes(size: usize, per_node: usize) -> Self {
        assert!(size > 0, "a group needs at least one rank");
        assert!(per_node > 0, "a node needs at least one rank");

        let nodes = (0..size).map(|rank| format!("node-{}", rank / per_node)).collect();
        Self::with_node_names(nodes)
    }

    /// Creates a group where rank `i` runs on node `nodes[i]`.
    ///
    /// # Arguments
    /// * `nodes` - One node name per rank.
    pub fn with_node_names(nodes: Vec<String>) -> Self {
        assert!(!nodes.is_empty(), "a group needs at least one rank");

        let size = nodes.len();
        let state = Rendezvous {
            generation: 0,
            arrived: 0,
            slots: vec![Vec::new(); size],
            published: Arc::default(),
            joined: vec![false; size],
            aborted: false,
        };

        Self {
            shared: Arc::new(Shared {
                size,
                nodes,
                state: Mutex::new(state),
                turnstile: Condvar::new(),
            }),
        }
    }

    /// The amount of ranks in the group.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Joins the group as `rank`.
    ///
    /// # Arguments
    /// * `rank` - The rank to take, must be free.
    ///
    /// # Returns
    /// The member handle, or an error if the rank is invalid or taken.
    pub fn join(&self, rank: usize) -> Result<LocalComm> {
        let size = self.shared.size;
        let mut state = self.shared.state.lock();

        if state.aborted {
            return Err(CommsErr::Closed);
        }

        match state.joined.get_mut(rank) {
            Some(joined) if !*joined => *joined = true,
            _ => return Err(CommsErr::InvalidRank { rank, size }),
        }

        debug!(rank = rank, size = size; "joined local group");

        Ok(LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
            finalized: false,
        })
    }

    /// A connector that joins this group as `rank` every time it connects.
    pub fn connector(&self, rank: usize) -> LocalConnector {
        LocalConnector {
            group: self.clone(),
            rank,
        }
    }
}

impl Shared {
    fn exchange(&self, rank: usize, data: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>> {
        let mut state = self.state.lock();

        if state.aborted {
            return Err(CommsErr::Closed);
        }

        let generation = state.generation;
        state.slots[rank] = data;
        state.arrived += 1;

        if state.arrived == self.size {
            let gathered = state.slots.iter_mut().map(std::mem::take).collect();
            state.published = Arc::new(gathered);
            state.arrived = 0;
            state.generation += 1;
            self.turnstile.notify_all();
            return Ok(Arc::clone(&state.published));
        }

        while state.generation == generation && !state.aborted {
            self.turnstile.wait(&mut state);
        }

        // A round can't complete without this member, so a changed generation
        // always refers to the round it deposited into.
        if state.generation == generation {
            return Err(CommsErr::Closed);
        }

        Ok(Arc::clone(&state.published))
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.turnstile.notify_all();
    }

    fn leave(&self, rank: usize) {
        self.state.lock().joined[rank] = false;
    }
}

/// A member handle of a [`LocalGroup`].
///
/// Dropping a handle without finalizing it aborts the group, waking every
/// blocked member with `CommsErr::Closed`.
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
    finalized: bool,
}

impl LocalComm {
    fn exchange(&self, data: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>> {
        if self.finalized {
            return Err(CommsErr::Finalized);
        }

        self.shared.exchange(self.rank, data)
    }
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn node(&self) -> &str {
        &self.shared.nodes[self.rank]
    }

    fn barrier(&mut self) -> Result<()> {
        self.exchange(Vec::new()).map(drop)
    }

    fn broadcast_bytes(&mut self, data: Vec<u8>, root: usize) -> Result<Vec<u8>> {
        let size = self.size();
        if root >= size {
            return Err(CommsErr::InvalidRank { rank: root, size });
        }

        let data = if self.rank == root { data } else { Vec::new() };
        let gathered = self.exchange(data)?;
        Ok(gathered[root].clone())
    }

    fn all_gather_bytes(&mut self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let gathered = self.exchange(data)?;
        Ok(gathered.as_ref().clone())
    }

    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()> {
        let data = bytemuck::cast_slice(values).to_vec();
        let gathered = self.exchange(data)?;

        values.fill(0.0);
        for contribution in gathered.iter() {
            let contribution: Vec<f64> = bytemuck::pod_collect_to_vec(contribution);
            if contribution.len() != values.len() {
                return Err(CommsErr::UnexpectedMessage {
                    expected: "equally sized reductions",
                    got: "a reduction of a different length",
                });
            }

            for (acc, v) in values.iter_mut().zip(contribution) {
                *acc += v;
            }
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        self.exchange(Vec::new())?;
        self.finalized = true;
        self.shared.leave(self.rank);
        Ok(())
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(rank = self.rank; "member left the local group without finalizing, aborting it");
            self.shared.abort();
        }
    }
}

/// Joins a [`LocalGroup`] under a fixed rank.
#[derive(Clone)]
pub struct LocalConnector {
    group: LocalGroup,
    rank: usize,
}

impl Connector for LocalConnector {
    type Comm = LocalComm;

    fn connect(&mut self) -> Result<LocalComm> {
        self.group.join(self.rank)
    }
}
