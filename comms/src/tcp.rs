//! A process group over TCP where rank 0 acts as a hub.
//!
//! Every spoke holds a single connection to the hub. Collectives are two
//! phase: spokes send their contribution, the hub combines them and sends the
//! result back. That keeps the amount of sockets linear and makes the
//! reduction order fixed.

use std::{env, io, time::Duration};

use futures::future::try_join_all;
use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{self, Runtime},
    time::{self, Instant},
};

use crate::{
    Collective, CommsErr, Connector, MsgReceiver, MsgSender, Result,
    msg::{Command, Msg},
};

const DEFAULT_ADDR: &str = "127.0.0.1:29400";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How a process joins a TCP group.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub rank: usize,
    pub size: usize,
    /// Where rank 0 listens and every other rank connects to.
    pub addr: String,
    /// The name of the node this process runs on.
    pub node: String,
    /// How long to wait for the whole group to show up.
    pub connect_timeout: Duration,
}

impl TcpConfig {
    /// Reads the configuration from the launcher's environment.
    ///
    /// `RANK` and `WORLD_SIZE` are required, `ORCHESTRA_ADDR` defaults to a
    /// loopback address and the node name is taken from `ORCHESTRA_NODE`, then
    /// `HOSTNAME`, falling back to `localhost`.
    ///
    /// # Returns
    /// The configuration or a `Rendezvous` error naming the bad variable.
    pub fn from_env() -> Result<Self> {
        let rank = env_usize("RANK")?;
        let size = env_usize("WORLD_SIZE")?;

        if rank >= size {
            return Err(CommsErr::InvalidRank { rank, size });
        }

        let addr = env::var("ORCHESTRA_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let node = env::var("ORCHESTRA_NODE")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        Ok(Self {
            rank,
            size,
            addr,
            node,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }
}

fn env_usize(key: &str) -> Result<usize> {
    let raw = env::var(key).map_err(|e| CommsErr::Rendezvous(format!("{key}: {e}")))?;
    raw.trim()
        .parse()
        .map_err(|e| CommsErr::Rendezvous(format!("{key}={raw}: {e}")))
}

impl Connector for TcpConfig {
    type Comm = TcpComm;

    fn connect(&mut self) -> Result<TcpComm> {
        TcpComm::connect(self.clone())
    }
}

struct Peer {
    rank: usize,
    rx: MsgReceiver<OwnedReadHalf>,
    tx: MsgSender<OwnedWriteHalf>,
}

impl Peer {
    fn new(rank: usize, stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        let (rx, tx) = crate::channel(rx, tx);
        Self { rank, rx, tx }
    }

    async fn send(&mut self, msg: &Msg) -> Result<()> {
        self.tx.send(msg).await.map_err(closed_on_eof)
    }

    async fn recv(&mut self) -> Result<Msg> {
        match self.rx.recv().await {
            Ok(Msg::Err(detail)) => Err(CommsErr::Remote(detail)),
            Ok(msg) => Ok(msg),
            Err(e) => Err(closed_on_eof(e)),
        }
    }

    async fn recv_blob(&mut self) -> Result<Vec<u8>> {
        match self.recv().await? {
            Msg::Blob(data) => Ok(data),
            other => Err(unexpected("data/blob", &other)),
        }
    }

    async fn recv_values(&mut self) -> Result<Vec<f64>> {
        match self.recv().await? {
            Msg::Values(values) => Ok(values),
            other => Err(unexpected("data/values", &other)),
        }
    }

    async fn recv_control(&mut self, expected: Command) -> Result<()> {
        match self.recv().await? {
            Msg::Control(cmd) if cmd == expected => Ok(()),
            other => Err(unexpected(Msg::Control(expected).kind(), &other)),
        }
    }
}

fn closed_on_eof(e: io::Error) -> CommsErr {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => CommsErr::Closed,
        _ => CommsErr::Io(e),
    }
}

fn unexpected(expected: &'static str, got: &Msg) -> CommsErr {
    CommsErr::UnexpectedMessage {
        expected,
        got: got.kind(),
    }
}

enum Link {
    /// Rank 0, holding the spokes sorted by rank.
    Hub(Vec<Peer>),
    Spoke(Peer),
}

/// A member of a TCP process group.
///
/// The handle owns a single threaded runtime and blocks on it for every
/// collective, so it can be driven from synchronous code.
pub struct TcpComm {
    rank: usize,
    size: usize,
    node: String,
    runtime: Runtime,
    link: Link,
    finalized: bool,
}

impl TcpComm {
    /// Forms the group described by `config`, blocking until every rank joined.
    ///
    /// # Arguments
    /// * `config` - This process' place in the group.
    ///
    /// # Returns
    /// The member handle or the reason the group couldn't be formed.
    pub fn connect(config: TcpConfig) -> Result<Self> {
        let TcpConfig {
            rank,
            size,
            addr,
            node,
            connect_timeout,
        } = config;

        if rank >= size {
            return Err(CommsErr::InvalidRank { rank, size });
        }

        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let link = runtime.block_on(async {
            let rendezvous = async {
                if rank == 0 {
                    accept_spokes(&addr, size).await.map(Link::Hub)
                } else {
                    join_hub(&addr, rank, &node, connect_timeout).await.map(Link::Spoke)
                }
            };

            time::timeout(connect_timeout, rendezvous)
                .await
                .map_err(|_| {
                    CommsErr::Rendezvous(format!(
                        "the group of {size} wasn't complete after {connect_timeout:?}"
                    ))
                })?
        })?;

        info!(rank = rank, size = size; "joined tcp group on node {node}");

        Ok(Self {
            rank,
            size,
            node,
            runtime,
            link,
            finalized: false,
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finalized {
            return Err(CommsErr::Finalized);
        }
        Ok(())
    }

    /// A barrier-like round trip carrying `cmd`.
    fn handshake(&mut self, cmd: Command) -> Result<()> {
        self.ensure_active()?;

        let Self { runtime, link, .. } = self;
        runtime.block_on(async {
            match link {
                Link::Hub(peers) => {
                    try_join_all(peers.iter_mut().map(|p| p.recv_control(cmd.clone()))).await?;
                    let msg = Msg::Control(cmd.clone());
                    for peer in peers.iter_mut() {
                        peer.send(&msg).await?;
                    }
                    Ok(())
                }
                Link::Spoke(hub) => {
                    hub.send(&Msg::Control(cmd.clone())).await?;
                    hub.recv_control(cmd.clone()).await
                }
            }
        })
    }
}

async fn accept_spokes(addr: &str, size: usize) -> Result<Vec<Peer>> {
    let listener = TcpListener::bind(addr).await?;
    debug!("listening at {addr}, waiting for {} spokes", size - 1);

    let mut peers: Vec<Peer> = Vec::with_capacity(size - 1);
    while peers.len() < size - 1 {
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let mut peer = Peer::new(0, stream);

        let (rank, node) = match peer.recv().await? {
            Msg::Control(Command::Hello { rank, node }) => (rank, node),
            other => return Err(unexpected("control/hello", &other)),
        };

        if rank == 0 || rank >= size || peers.iter().any(|p| p.rank == rank) {
            let detail = CommsErr::InvalidRank { rank, size }.to_string();
            let _ = peer.send(&Msg::Err(detail.clone())).await;
            return Err(CommsErr::Rendezvous(detail));
        }

        debug!(rank = rank; "spoke joined from {remote} on node {node}");
        peer.rank = rank;
        peers.push(peer);
    }

    peers.sort_by_key(|p| p.rank);

    let ready = Msg::Control(Command::Ready { size });
    for peer in peers.iter_mut() {
        peer.send(&ready).await?;
    }

    Ok(peers)
}

async fn join_hub(addr: &str, rank: usize, node: &str, timeout: Duration) -> Result<Peer> {
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() < deadline => {
                debug!("hub at {addr} not reachable yet: {e}");
                time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(CommsErr::Rendezvous(format!("couldn't reach {addr}: {e}"))),
        }
    };

    stream.set_nodelay(true)?;
    let mut hub = Peer::new(0, stream);

    let hello = Command::Hello {
        rank,
        node: node.to_string(),
    };
    hub.send(&Msg::Control(hello)).await?;

    match hub.recv().await {
        Ok(Msg::Control(Command::Ready { .. })) => Ok(hub),
        Ok(other) => Err(unexpected("control/ready", &other)),
        Err(CommsErr::Remote(detail)) => Err(CommsErr::Rendezvous(detail)),
        Err(e) => Err(e),
    }
}

impl Collective for TcpComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn node(&self) -> &str {
        &self.node
    }

    fn barrier(&mut self) -> Result<()> {
        self.handshake(Command::Barrier)
    }

    fn broadcast_bytes(&mut self, data: Vec<u8>, root: usize) -> Result<Vec<u8>> {
        self.ensure_active()?;

        let size = self.size;
        if root >= size {
            return Err(CommsErr::InvalidRank { rank: root, size });
        }

        let rank = self.rank;
        let Self { runtime, link, .. } = self;
        runtime.block_on(async {
            match link {
                Link::Hub(peers) => {
                    let data = match root {
                        0 => data,
                        _ => peers[root - 1].recv_blob().await?,
                    };

                    let msg = Msg::Blob(data.clone());
                    for peer in peers.iter_mut() {
                        peer.send(&msg).await?;
                    }

                    Ok(data)
                }
                Link::Spoke(hub) => {
                    if rank == root {
                        hub.send(&Msg::Blob(data)).await?;
                    }
                    hub.recv_blob().await
                }
            }
        })
    }

    fn all_gather_bytes(&mut self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.ensure_active()?;

        let size = self.size;
        let Self { runtime, link, .. } = self;
        runtime.block_on(async {
            match link {
                Link::Hub(peers) => {
                    let rest = try_join_all(peers.iter_mut().map(Peer::recv_blob)).await?;
                    let mut gathered = Vec::with_capacity(size);
                    gathered.push(data);
                    gathered.extend(rest);

                    for peer in peers.iter_mut() {
                        for blob in &gathered {
                            peer.send(&Msg::Blob(blob.clone())).await?;
                        }
                    }

                    Ok(gathered)
                }
                Link::Spoke(hub) => {
                    hub.send(&Msg::Blob(data)).await?;

                    let mut gathered = Vec::with_capacity(size);
                    for _ in 0..size {
                        gathered.push(hub.recv_blob().await?);
                    }

                    Ok(gathered)
                }
            }
        })
    }

    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()> {
        self.ensure_active()?;

        let Self { runtime, link, .. } = self;
        runtime.block_on(async {
            match link {
                Link::Hub(peers) => {
                    let contributions =
                        try_join_all(peers.iter_mut().map(Peer::recv_values)).await?;

                    for contribution in contributions {
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

                    let msg = Msg::Values(values.to_vec());
                    for peer in peers.iter_mut() {
                        peer.send(&msg).await?;
                    }

                    Ok(())
                }
                Link::Spoke(hub) => {
                    hub.send(&Msg::Values(values.to_vec())).await?;
                    let reduced = hub.recv_values().await?;

                    if reduced.len() != values.len() {
                        return Err(CommsErr::UnexpectedMessage {
                            expected: "equally sized reductions",
                            got: "a reduction of a different length",
                        });
                    }

                    values.copy_from_slice(&reduced);
                    Ok(())
                }
            }
        })
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        self.handshake(Command::Disconnect)?;
        self.finalized = true;
        debug!(rank = self.rank; "left tcp group");
        Ok(())
    }
}
