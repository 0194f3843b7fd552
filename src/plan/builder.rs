//! Deterministic construction of operation plans.
//!
//! The builder is a pure function of the cluster and operation records: two
//! invocations with identical inputs produce structurally equal plans. Fan-out
//! groups order their children by hostname.

use crate::error::{Error, Result};
use crate::ops::{Cluster, Operation, OperationType, Server, HOOK_NETWORK_INSTALL};
use crate::plan::{OperationPlan, Phase};

/// Executor kinds emitted by the builder. The registry consumed by the FSM
/// must cover every kind referenced by a plan's leaves.
pub mod kinds {
    pub const CHECKS: &str = "checks";
    pub const CONFIGURE: &str = "configure";
    pub const BOOTSTRAP: &str = "bootstrap";
    pub const PULL: &str = "pull";
    pub const SYSTEM: &str = "system";
    pub const WAIT: &str = "wait";
    pub const RBAC: &str = "rbac";
    pub const COREDNS: &str = "coredns";
    pub const RESOURCES: &str = "resources";
    pub const EXPORT: &str = "export";
    pub const OVERLAY: &str = "overlay";
    pub const HEALTH: &str = "health";
    pub const RUNTIME: &str = "runtime";
    pub const APP: &str = "app";
    pub const CONNECT_INSTALLER: &str = "connect-installer";
    pub const ELECTIONS: &str = "elections";
    pub const EXTRA_RESOURCES: &str = "extra-resources";

    /// Every kind the builder may emit.
    pub const ALL: &[&str] = &[
        CHECKS,
        CONFIGURE,
        BOOTSTRAP,
        PULL,
        SYSTEM,
        WAIT,
        RBAC,
        COREDNS,
        RESOURCES,
        EXPORT,
        OVERLAY,
        HEALTH,
        RUNTIME,
        APP,
        CONNECT_INSTALLER,
        ELECTIONS,
        EXTRA_RESOURCES,
    ];
}

/// Builds operation plans from a cluster description and operation record.
pub struct PlanBuilder {
    cluster: Cluster,
    operation: Operation,
    masters: Vec<Server>,
    nodes: Vec<Server>,
    preflight_checks: bool,
}

impl PlanBuilder {
    pub fn new(cluster: &Cluster, operation: &Operation) -> Result<PlanBuilder> {
        if operation.servers.is_empty() {
            return Err(Error::invalid_argument(format!(
                "operation {} has no servers to plan for",
                operation.id
            )));
        }
        let mut servers = operation.servers.clone();
        servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        let (masters, nodes): (Vec<Server>, Vec<Server>) =
            servers.into_iter().partition(|s| s.is_master());
        if operation.op_type == OperationType::Install && masters.is_empty() {
            return Err(Error::invalid_argument("install requires at least one master"));
        }
        Ok(PlanBuilder {
            cluster: cluster.clone(),
            operation: operation.clone(),
            masters,
            nodes,
            preflight_checks: true,
        })
    }

    /// Skip the preflight checks phase.
    pub fn without_preflight_checks(mut self) -> PlanBuilder {
        self.preflight_checks = false;
        self
    }

    pub fn build(&self) -> Result<OperationPlan> {
        let phases = match self.operation.op_type {
            OperationType::Install => self.install_phases(),
            OperationType::Expand => self.expand_phases(),
        };
        let plan = OperationPlan {
            operation_id: self.operation.id.clone(),
            operation_type: self.operation.op_type,
            account_id: self.operation.account_id.clone(),
            cluster_name: self.cluster.domain.clone(),
            servers: self
                .masters
                .iter()
                .chain(self.nodes.iter())
                .cloned()
                .collect(),
            dns_config: self.cluster.dns_config.clone(),
            phases,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn install_phases(&self) -> Vec<Phase> {
        let all: Vec<&Server> = self.masters.iter().chain(self.nodes.iter()).collect();
        let mut chain = Chain::default();
        let mut phases = Vec::new();

        if self.preflight_checks {
            phases.push(chain.leaf("/checks", kinds::CHECKS));
        }
        phases.push(chain.leaf("/configure", kinds::CONFIGURE));
        phases.push(chain.fan_out("/bootstrap", kinds::BOOTSTRAP, &all));
        phases.push(chain.fan_out("/pull", kinds::PULL, &all));
        phases.push(chain.system_group("/masters", &self.masters));
        if !self.nodes.is_empty() {
            phases.push(chain.system_group("/nodes", &self.nodes));
        }
        phases.push(chain.leaf("/wait", kinds::WAIT));
        phases.push(chain.leaf("/rbac", kinds::RBAC));
        phases.push(chain.leaf("/coredns", kinds::COREDNS));
        phases.push(chain.leaf("/resources", kinds::RESOURCES));
        phases.push(chain.leaf("/export", kinds::EXPORT));
        if self.cluster.app.hooks.iter().any(|h| h == HOOK_NETWORK_INSTALL) {
            phases.push(chain.leaf("/overlay", kinds::OVERLAY));
        }
        phases.push(chain.leaf("/health", kinds::HEALTH));
        phases.push(chain.leaf("/runtime", kinds::RUNTIME));
        phases.push(chain.leaf("/app", kinds::APP));
        phases.push(chain.leaf("/connect-installer", kinds::CONNECT_INSTALLER));
        phases.push(chain.leaf("/elections", kinds::ELECTIONS));
        phases.push(chain.leaf("/extra-resources", kinds::EXTRA_RESOURCES));
        phases
    }

    fn expand_phases(&self) -> Vec<Phase> {
        let joining: Vec<&Server> = self.masters.iter().chain(self.nodes.iter()).collect();
        let mut chain = Chain::default();
        let mut phases = Vec::new();

        phases.push(chain.leaf("/configure", kinds::CONFIGURE));
        phases.push(chain.fan_out("/bootstrap", kinds::BOOTSTRAP, &joining));
        phases.push(chain.fan_out("/pull", kinds::PULL, &joining));
        phases.push(chain.system_group_refs("/joins", &joining));
        phases.push(chain.leaf("/wait", kinds::WAIT));
        phases.push(chain.leaf("/elections", kinds::ELECTIONS));
        phases
    }
}

/// Tracks the implicit dependency of each top-level phase on its predecessor.
#[derive(Default)]
struct Chain {
    prev: Option<String>,
}

impl Chain {
    fn requires(&mut self, id: &str) -> Vec<String> {
        let requires = match self.prev.take() {
            Some(prev) => vec![prev],
            None => Vec::new(),
        };
        self.prev = Some(id.to_string());
        requires
    }

    fn leaf(&mut self, id: &str, kind: &str) -> Phase {
        Phase {
            id: id.to_string(),
            executor: kind.to_string(),
            node_ref: None,
            requires: self.requires(id),
            data: None,
            phases: Vec::new(),
        }
    }

    /// Group with one node-bound leaf per server; children may run
    /// concurrently within the group.
    fn fan_out(&mut self, id: &str, kind: &str, servers: &[&Server]) -> Phase {
        let children = servers
            .iter()
            .map(|server| Phase {
                id: format!("{}/{}", id, server.hostname),
                executor: kind.to_string(),
                node_ref: Some(server.hostname.clone()),
                requires: Vec::new(),
                data: serde_json::to_value(server).ok(),
                phases: Vec::new(),
            })
            .collect();
        Phase {
            id: id.to_string(),
            executor: String::new(),
            node_ref: None,
            requires: self.requires(id),
            data: None,
            phases: children,
        }
    }

    /// Group with a per-server subgroup holding the system install leaf,
    /// e.g. `/masters/node-1/install`.
    fn system_group(&mut self, id: &str, servers: &[Server]) -> Phase {
        let refs: Vec<&Server> = servers.iter().collect();
        self.system_group_refs(id, &refs)
    }

    fn system_group_refs(&mut self, id: &str, servers: &[&Server]) -> Phase {
        let children = servers
            .iter()
            .map(|server| {
                let group_id = format!("{}/{}", id, server.hostname);
                Phase {
                    id: group_id.clone(),
                    executor: String::new(),
                    node_ref: None,
                    requires: Vec::new(),
                    data: None,
                    phases: vec![Phase {
                        id: format!("{}/install", group_id),
                        executor: kinds::SYSTEM.to_string(),
                        node_ref: Some(server.hostname.clone()),
                        requires: Vec::new(),
                        data: serde_json::to_value(server).ok(),
                        phases: Vec::new(),
                    }],
                }
            })
            .collect();
        Phase {
            id: id.to_string(),
            executor: String::new(),
            node_ref: None,
            requires: self.requires(id),
            data: None,
            phases: children,
        }
    }
}

/// Builds the plan for the given operation.
pub fn build_plan(cluster: &Cluster, operation: &Operation) -> Result<OperationPlan> {
    PlanBuilder::new(cluster, operation)?.build()
}
