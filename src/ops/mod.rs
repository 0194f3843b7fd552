//! Core data model shared by the installer service and the join peer:
//! clusters, servers, operations and their lifecycle, progress entries and
//! the aggregated agent report.

pub mod backend;
pub mod client;
pub mod events;
pub mod http;
pub mod operator;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reference to the application bundle a cluster is installed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRef {
    pub name: String,
    pub version: String,
    /// Manifest hooks the application defines (e.g. a network overlay
    /// install hook), consulted by the plan builder.
    #[serde(default)]
    pub hooks: Vec<String>,
}

/// Manifest hook enabling a custom network overlay install phase.
pub const HOOK_NETWORK_INSTALL: &str = "network-install";

/// Cluster DNS configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub addrs: Vec<String>,
    pub port: u16,
}

/// Container runtime configuration for cluster nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub storage_driver: String,
    pub device: Option<String>,
}

/// Cluster as persisted by the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster name
    pub domain: String,
    pub account_id: String,
    pub app: AppRef,
    pub dns_config: DnsConfig,
    pub state: String,
    pub docker: DockerConfig,
}

/// Named bind mount made available to a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub source: String,
}

/// Member of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    pub role: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub system_device: Option<String>,
    #[serde(default)]
    pub docker_device: Option<String>,
    #[serde(default)]
    pub cloud_metadata: Option<serde_json::Value>,
}

/// Role assigned to controller nodes.
pub const ROLE_MASTER: &str = "master";

impl Server {
    pub fn is_master(&self) -> bool {
        self.role == ROLE_MASTER
    }
}

/// Type of a durable operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Expand,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Install => write!(f, "install"),
            OperationType::Expand => write!(f, "expand"),
        }
    }
}

/// Lifecycle state of an operation.
///
/// `Created` and `Provisioning` are the pre-ready states an installer
/// operation passes through while agents are still reporting; `Ready` means
/// all agents have reported and the plan may begin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Provisioning,
    Ready,
    Running,
    Completed,
    Failed,
}

impl OperationState {
    /// Whether a transition from this state to `to` is valid.
    pub fn can_transition(self, to: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, to),
            (Created, Provisioning)
                | (Created, Ready)
                | (Created, Failed)
                | (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Running)
                | (Ready, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }

    /// Whether a peer may still join an install operation in this state.
    pub fn accepts_joins(self) -> bool {
        matches!(
            self,
            OperationState::Created | OperationState::Provisioning | OperationState::Failed
        )
    }
}

/// Per-role instructions handed to joining nodes: where to connect and the
/// secret that authenticates the agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstruction {
    pub token: String,
    pub server_addr: String,
}

/// Free-form operation variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationVars {
    #[serde(default)]
    pub vxlan_port: Option<u16>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Durable unit of work with a lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub cluster_domain: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub vars: OperationVars,
    /// Per-role agent instructions emitted on operation creation.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentInstruction>,
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            cluster_domain: self.cluster_domain.clone(),
            operation_id: self.id.clone(),
        }
    }

    /// Agent instructions for the given role.
    pub fn agent_instruction(&self, role: &str) -> Result<&AgentInstruction> {
        self.agents
            .get(role)
            .ok_or_else(|| Error::aborted(format!("no agent instructions for role {:?}", role)))
    }
}

/// Addresses a single operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub account_id: String,
    pub cluster_domain: String,
    pub operation_id: String,
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_id, self.cluster_domain, self.operation_id
        )
    }
}

/// Completion value of a finished operation.
pub const COMPLETION_DONE: u8 = 100;

/// Point-in-time progress of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub operation_id: String,
    /// 0..=100
    pub completion: u8,
    pub message: String,
    pub created: DateTime<Utc>,
}

impl ProgressEntry {
    pub fn is_completed(&self) -> bool {
        self.completion >= COMPLETION_DONE
    }

    /// Whether two entries describe the same progress step.
    pub fn is_equal(&self, other: &ProgressEntry) -> bool {
        self.completion == other.completion && self.message == other.message
    }
}

/// System information reported by a node agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub num_cpus: u32,
}

impl SystemInfo {
    /// Collect information about the local host.
    pub fn local() -> SystemInfo {
        SystemInfo {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            os: std::env::consts::OS.to_string(),
            num_cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// A peer that has registered with the coordinator via `PeerJoin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub node_id: String,
    pub advertise_addr: String,
    pub role: String,
    pub system_info: SystemInfo,
}

impl PeerRegistration {
    /// The server record this registration corresponds to.
    pub fn to_server(&self) -> Server {
        let ip = self
            .advertise_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| self.advertise_addr.clone());
        Server {
            hostname: self.system_info.hostname.clone(),
            advertise_ip: ip,
            role: self.role.clone(),
            mounts: Vec::new(),
            system_device: None,
            docker_device: None,
            cloud_metadata: None,
        }
    }
}

/// The coordinator's aggregated view of all peers that have joined an
/// operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub servers: Vec<PeerRegistration>,
}

/// Request to create a new expand operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewExpandOperation {
    pub account_id: String,
    pub cluster_domain: String,
    /// Role of the joining node
    pub role: String,
    pub created_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use OperationState::*;
        assert!(Created.can_transition(Ready));
        assert!(Ready.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Failed.can_transition(Running));
        assert!(!Completed.can_transition(Running));
        assert!(!Created.can_transition(Running));
        assert!(!Ready.can_transition(Completed));
    }

    #[test]
    fn test_join_states() {
        use OperationState::*;
        assert!(Created.accepts_joins());
        assert!(Provisioning.accepts_joins());
        assert!(Failed.accepts_joins());
        assert!(!Running.accepts_joins());
        assert!(!Completed.accepts_joins());
    }

    #[test]
    fn test_registration_to_server() {
        let reg = PeerRegistration {
            node_id: "node-2".to_string(),
            advertise_addr: "192.168.1.12:7575".to_string(),
            role: "node".to_string(),
            system_info: SystemInfo {
                hostname: "node-2".to_string(),
                os: "linux".to_string(),
                num_cpus: 4,
            },
        };
        let server = reg.to_server();
        assert_eq!(server.hostname, "node-2");
        assert_eq!(server.advertise_ip, "192.168.1.12");
        assert_eq!(server.role, "node");
    }
}
