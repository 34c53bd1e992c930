use std::{
    env, fmt, fs, io,
    net::{Ipv4Addr, TcpListener},
};

use comms::{Collective, CollectiveExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::Layout;
use crate::{OrchestraErr, Result};

/// How many OS assigned ports are tried before giving up.
pub const MAX_PORT_ATTEMPTS: usize = 10;

/// The host and port every rank uses to reach the global leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEndpoint {
    pub host: String,
    pub port: u16,
}

impl MasterEndpoint {
    /// Exports the endpoint as `MASTER_ADDR` and `MASTER_PORT`.
    pub fn publish(&self) {
        env::set_var("MASTER_ADDR", &self.host);
        env::set_var("MASTER_PORT", self.port.to_string());
    }
}

impl fmt::Display for MasterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What the leader broadcasts, a failure travels too so no rank waits forever.
#[derive(Debug, Serialize, Deserialize)]
enum Negotiation {
    Ready(MasterEndpoint),
    Failed { attempts: usize },
}

pub(super) fn negotiate<C: Collective + ?Sized>(
    comm: &mut C,
    layout: &Layout,
    preferred_port: u16,
    host_suffix: Option<&str>,
    attempts: usize,
) -> Result<MasterEndpoint> {
    let proposal = layout.is_global_leader().then(|| {
        let mut host = local_hostname();
        if let Some(suffix) = host_suffix {
            host.push_str(suffix);
        }

        match find_free_port_if_taken(preferred_port, attempts) {
            Ok(port) => Negotiation::Ready(MasterEndpoint { host, port }),
            Err(e) => {
                warn!("master endpoint negotiation failed: {e}");
                Negotiation::Failed { attempts }
            }
        }
    });

    match comm.broadcast(proposal.as_ref(), 0)? {
        Negotiation::Ready(endpoint) => {
            debug!("master endpoint is {endpoint}");
            Ok(endpoint)
        }
        Negotiation::Failed { attempts } => Err(OrchestraErr::PortAllocation { attempts }),
    }
}

/// The name of this host.
///
/// Read from `HOSTNAME`, then `/etc/hostname`, falling back to `localhost`.
pub fn local_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Whether something is already bound to `port` on any interface.
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
}

/// Asks the OS for a port that is free right now.
pub fn find_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Returns `preferred` if it's free, otherwise an OS assigned free port.
///
/// # Arguments
/// * `preferred` - The port to use when nothing is bound to it.
/// * `attempts` - How many OS assigned ports to try.
///
/// # Returns
/// The port, or a `PortAllocation` error once the attempts are exhausted.
pub fn find_free_port_if_taken(preferred: u16, attempts: usize) -> Result<u16> {
    if !is_port_in_use(preferred) {
        return Ok(preferred);
    }

    for _ in 0..attempts {
        match find_free_port() {
            Ok(port) if !is_port_in_use(port) => return Ok(port),
            Ok(port) => debug!("port {port} was taken before it could be used"),
            Err(e) => debug!("couldn't get a free port: {e}"),
        }
    }

    Err(OrchestraErr::PortAllocation { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taken_port_is_replaced() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(taken));

        let port = find_free_port_if_taken(taken, MAX_PORT_ATTEMPTS).unwrap();
        assert_ne!(port, taken);
    }

    #[test]
    fn free_port_is_kept() {
        let port = find_free_port().unwrap();
        assert_eq!(find_free_port_if_taken(port, MAX_PORT_ATTEMPTS).unwrap(), port);
    }

    #[test]
    fn zero_attempts_fail_on_a_taken_port() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        assert!(matches!(
            find_free_port_if_taken(taken, 0),
            Err(OrchestraErr::PortAllocation { attempts: 0 })
        ));
    }

    #[test]
    fn endpoint_displays_as_host_port() {
        let endpoint = MasterEndpoint {
            host: "node-0.example.org".into(),
            port: 23456,
        };
        assert_eq!(endpoint.to_string(), "node-0.example.org:23456");
    }
}
