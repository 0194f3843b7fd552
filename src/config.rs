//! Service configuration for the installer and the join peer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ops::{AppRef, DnsConfig, DockerConfig, Mount};

/// How long the installer waits for all agents to report.
pub const AGENT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the join peer waits for the agent report to list its agent.
pub const WAIT_FOR_AGENTS_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval while waiting for an operation to become ready.
pub const WAIT_FOR_OPERATION_INTERVAL: Duration = Duration::from_secs(1);

/// Tick of the progress poller feeding the event stream.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name of the control socket inside the installer state dir.
pub const INSTALLER_SOCKET: &str = "installer.sock";

/// Name of the control socket inside the peer state dir.
pub const PEER_SOCKET: &str = "peer.sock";

fn check_addr(addr: &str) -> Result<()> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(Error::invalid_argument(format!(
            "advertise address {:?} is not host:port",
            addr
        ))),
    }
}

/// Configuration of the installer service.
#[derive(Clone, Debug)]
pub struct InstallerConfig {
    /// Directory for operation state and the control socket
    pub state_dir: PathBuf,
    /// Address other nodes use to reach this node's agent
    pub advertise_addr: String,
    /// Domain of the cluster being installed
    pub cluster_name: String,
    pub app: AppRef,
    /// Role of the installer node
    pub role: String,
    /// Install token shared with joining nodes
    pub token: String,
    pub cloud_provider: Option<String>,
    pub mounts: Vec<Mount>,
    pub dns_config: DnsConfig,
    pub docker: DockerConfig,
    /// Listen address of the wizard operator API
    pub operator_listen_addr: SocketAddr,
    /// Listen address of this node's agent
    pub agent_listen_addr: SocketAddr,
    /// Number of servers the install operation waits for before the plan
    /// may begin
    pub expected_servers: usize,
}

impl InstallerConfig {
    /// Validates required fields.
    pub fn check(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument("missing state dir"));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::invalid_argument("missing cluster name"));
        }
        if self.token.is_empty() {
            return Err(Error::invalid_argument("missing token"));
        }
        if self.role.is_empty() {
            return Err(Error::invalid_argument("missing role"));
        }
        check_addr(&self.advertise_addr)?;
        if self.expected_servers == 0 {
            return Err(Error::invalid_argument("expected servers must be at least 1"));
        }
        Ok(())
    }

    /// Path of the control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join(INSTALLER_SOCKET)
    }
}

/// Configuration of the join peer.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Addresses of installer or cluster nodes to try
    pub peers: Vec<String>,
    /// Address other nodes use to reach this node's agent
    pub advertise_addr: String,
    /// Secret join token
    pub token: String,
    /// Role of the joining node. Always explicit: the role decides the
    /// agent instructions this node receives.
    pub role: String,
    pub state_dir: PathBuf,
    /// Id of an existing expand operation created via the UI; a new
    /// operation is created when unset
    pub operation_id: Option<String>,
    pub cloud_provider: Option<String>,
    pub mounts: Vec<Mount>,
    /// Listen address of this node's agent
    pub agent_listen_addr: SocketAddr,
}

impl PeerConfig {
    /// Validates required fields.
    pub fn check(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::invalid_argument("missing peers"));
        }
        if self.token.is_empty() {
            return Err(Error::invalid_argument("missing token"));
        }
        if self.role.is_empty() {
            return Err(Error::invalid_argument("missing role"));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument("missing state dir"));
        }
        check_addr(&self.advertise_addr)?;
        Ok(())
    }

    /// Path of the control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join(PEER_SOCKET)
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> PeerConfig {
        self.operation_id = Some(operation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_config() -> PeerConfig {
        PeerConfig {
            peers: vec!["192.168.1.1".to_string()],
            advertise_addr: "192.168.1.2:7575".to_string(),
            token: "secret".to_string(),
            role: "node".to_string(),
            state_dir: PathBuf::from("/var/lib/mooring"),
            operation_id: None,
            cloud_provider: None,
            mounts: Vec::new(),
            agent_listen_addr: "0.0.0.0:7575".parse().unwrap(),
        }
    }

    #[test]
    fn test_peer_config_requires_fields() {
        assert!(peer_config().check().is_ok());

        let mut config = peer_config();
        config.peers.clear();
        assert_eq!(config.check().unwrap_err().exit_code(), 1);

        let mut config = peer_config();
        config.token.clear();
        assert!(config.check().is_err());

        let mut config = peer_config();
        config.role.clear();
        assert!(config.check().is_err());

        let mut config = peer_config();
        config.advertise_addr = "no-port".to_string();
        assert!(config.check().is_err());
    }
}
