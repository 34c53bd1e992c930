//! Collective communication for a fixed group of ranks.
//!
//! Two transports are provided: [`LocalGroup`], where every rank is a thread of
//! the same process, and [`TcpComm`], where every rank is its own process and
//! rank 0 relays the traffic over TCP. Both implement [`Collective`], which is
//! all the training driver depends on.

mod error;
mod local;
pub mod msg;
mod receiver;
mod sender;
mod tcp;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{CommsErr, Result};
pub use local::{LocalComm, LocalConnector, LocalGroup};
pub use receiver::MsgReceiver;
pub use sender::MsgSender;
pub use tcp::{TcpComm, TcpConfig};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();
const MAX_FRAME_LEN: usize = 1 << 30;

/// Creates both `MsgReceiver` and `MsgSender` network channel parts.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a receiver and a sender.
pub fn channel<R, W>(rx: R, tx: W) -> (MsgReceiver<R>, MsgSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (MsgReceiver::new(rx), MsgSender::new(tx))
}

/// Position of a rank inside the set of ranks that share its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGroup {
    pub local_rank: usize,
    pub local_size: usize,
}

/// The blocking collective operations a process group offers.
///
/// Every member must issue the same collectives in the same order, a member
/// skipping one leaves the rest of the group blocked.
pub trait Collective: Send {
    /// The rank of this member, in `0..size()`.
    fn rank(&self) -> usize;

    /// The amount of members in the group.
    fn size(&self) -> usize;

    /// The name of the node (host) this member runs on.
    fn node(&self) -> &str;

    /// Blocks until every member has called `barrier`.
    fn barrier(&mut self) -> Result<()>;

    /// Distributes `data` from `root` to every member.
    ///
    /// # Arguments
    /// * `data` - The payload, only read on `root`.
    /// * `root` - The rank that owns the payload.
    ///
    /// # Returns
    /// The root's payload, on every member.
    fn broadcast_bytes(&mut self, data: Vec<u8>, root: usize) -> Result<Vec<u8>>;

    /// Collects one payload from every member.
    ///
    /// # Returns
    /// The payloads ordered by rank, on every member.
    fn all_gather_bytes(&mut self, data: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Sums `values` element-wise across the group, in place.
    ///
    /// The reduction is applied in rank order so every member ends up with the
    /// exact same bits.
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()>;

    /// Leaves the group. Every member must call it, after it any other
    /// operation fails with `CommsErr::Finalized`.
    fn finalize(&mut self) -> Result<()>;

    /// Averages `values` element-wise across the group, in place.
    fn all_reduce_mean(&mut self, values: &mut [f64]) -> Result<()> {
        self.all_reduce_sum(values)?;
        let size = self.size() as f64;
        values.iter_mut().for_each(|v| *v /= size);
        Ok(())
    }

    /// Splits the group by node, the equivalent of a shared-memory split.
    ///
    /// # Returns
    /// This member's rank among the members on the same node, and how many
    /// members that node holds.
    fn split_by_shared_memory(&mut self) -> Result<NodeGroup> {
        let rank = self.rank();
        let node = self.node().as_bytes().to_vec();
        let nodes = self.all_gather_bytes(node)?;
        let own = &nodes[rank];

        let local_rank = nodes[..rank].iter().filter(|n| *n == own).count();
        let local_size = nodes.iter().filter(|n| *n == own).count();

        Ok(NodeGroup {
            local_rank,
            local_size,
        })
    }
}

/// Typed helpers on top of the byte level collectives.
pub trait CollectiveExt: Collective {
    /// Broadcasts a serializable value from `root`.
    ///
    /// # Arguments
    /// * `value` - The value to send, must be `Some` on `root`.
    /// * `root` - The rank that owns the value.
    ///
    /// # Returns
    /// The root's value, on every member.
    fn broadcast<T>(&mut self, value: Option<&T>, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let data = match value {
            Some(value) if self.rank() == root => serde_json::to_vec(value)?,
            _ => Vec::new(),
        };

        let data = self.broadcast_bytes(data, root)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Gathers a serializable value from every member.
    ///
    /// # Returns
    /// The values ordered by rank.
    fn all_gather<T>(&mut self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let data = serde_json::to_vec(value)?;
        self.all_gather_bytes(data)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(CommsErr::from))
            .collect()
    }
}

impl<C: Collective + ?Sized> CollectiveExt for C {}

/// Forms a group membership, the `init` step of a collective backend.
pub trait Connector {
    type Comm: Collective;

    /// Joins the group, blocking until every member is present.
    fn connect(&mut self) -> Result<Self::Comm>;
}

impl<C: Collective + ?Sized> Collective for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn node(&self) -> &str {
        (**self).node()
    }

    fn barrier(&mut self) -> Result<()> {
        (**self).barrier()
    }

    fn broadcast_bytes(&mut self, data: Vec<u8>, root: usize) -> Result<Vec<u8>> {
        (**self).broadcast_bytes(data, root)
    }

    fn all_gather_bytes(&mut self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        (**self).all_gather_bytes(data)
    }

    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()> {
        (**self).all_reduce_sum(values)
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }

    fn split_by_shared_memory(&mut self) -> Result<NodeGroup> {
        (**self).split_by_shared_memory()
    }
}
