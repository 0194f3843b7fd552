//! The operator service: the authoritative API for clusters, operations,
//! plans and progress.
//!
//! `LocalOperator` is the embedded implementation used by the installer
//! wizard and by a running cluster; the join peer consumes the same interface
//! remotely through `ops::client::HttpOperator`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use slog::{info, Logger};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ops::events::AuditEvent;
use crate::ops::store::OperationStore;
use crate::ops::{
    AgentReport, Cluster, NewExpandOperation, Operation, OperationKey, OperationState,
    OperationType, ProgressEntry, Server,
};
use crate::plan::{OperationPlan, PhaseState};

/// Source of the aggregated agent report, implemented by the RPC peer store.
pub trait ReportSource: Send + Sync {
    fn agent_report(&self) -> AgentReport;
}

/// The operator API consumed by the FSM, the installer and the join peer.
#[tonic::async_trait]
pub trait Operator: Send + Sync {
    async fn get_cluster(&self) -> Result<Cluster>;
    /// The most recent install operation.
    async fn get_install_operation(&self) -> Result<Operation>;
    async fn get_operation(&self, key: &OperationKey) -> Result<Operation>;
    async fn create_expand_operation(&self, req: NewExpandOperation) -> Result<Operation>;
    async fn set_operation_state(&self, key: &OperationKey, state: OperationState) -> Result<()>;
    /// Attaches the servers reported by agents to an expand operation.
    async fn update_expand_servers(&self, key: &OperationKey, servers: Vec<Server>) -> Result<()>;
    async fn delete_operation(&self, key: &OperationKey) -> Result<()>;
    async fn get_agent_report(&self, key: &OperationKey) -> Result<AgentReport>;
    async fn create_plan(&self, key: &OperationKey, plan: OperationPlan) -> Result<()>;
    async fn get_plan(&self, key: &OperationKey) -> Result<OperationPlan>;
    async fn get_phase_state(&self, key: &OperationKey, phase_id: &str) -> Result<PhaseState>;
    async fn update_phase_state(&self, key: &OperationKey, state: PhaseState) -> Result<()>;
    async fn list_phase_states(&self, key: &OperationKey) -> Result<Vec<PhaseState>>;
    async fn create_progress_entry(&self, key: &OperationKey, entry: ProgressEntry) -> Result<()>;
    async fn get_progress(&self, key: &OperationKey) -> Result<ProgressEntry>;
    async fn emit_audit_event(&self, event: AuditEvent) -> Result<()>;
    /// Appends a chunk to the operation's log blob.
    async fn stream_operation_logs(&self, key: &OperationKey, data: Vec<u8>) -> Result<()>;
}

/// Store-backed operator embedded in the installer and the cluster.
pub struct LocalOperator {
    store: OperationStore,
    reports: RwLock<HashMap<String, Arc<dyn ReportSource>>>,
    progress: RwLock<HashMap<String, ProgressEntry>>,
    audit: Mutex<Vec<AuditEvent>>,
    logger: Logger,
}

impl LocalOperator {
    pub fn new(store: OperationStore, logger: Logger) -> LocalOperator {
        LocalOperator {
            store,
            reports: RwLock::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            logger,
        }
    }

    pub fn store(&self) -> &OperationStore {
        &self.store
    }

    /// Registers the live agent report source for an operation.
    pub fn set_report_source(&self, operation_id: &str, source: Arc<dyn ReportSource>) {
        self.reports
            .write()
            .unwrap()
            .insert(operation_id.to_string(), source);
    }

    /// Creates the cluster record. Fails if one already exists.
    pub async fn create_cluster(&self, cluster: Cluster) -> Result<Cluster> {
        if self.store.get_cluster().await.is_ok() {
            return Err(Error::already_exists(format!(
                "cluster {} already exists",
                cluster.domain
            )));
        }
        self.store.put_cluster(&cluster).await?;
        Ok(cluster)
    }

    /// Creates the install operation if none exists yet and returns it.
    pub async fn ensure_install_operation(&self, operation: Operation) -> Result<Operation> {
        match self.get_install_operation().await {
            Ok(existing) => Ok(existing),
            Err(Error::NotFound(_)) => {
                self.store.create_operation(&operation).await?;
                Ok(operation)
            }
            Err(err) => Err(err),
        }
    }

    /// Audit events emitted so far, oldest first.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.lock().unwrap().clone()
    }

    fn check_key(&self, key: &OperationKey, operation: &Operation) -> Result<()> {
        if operation.account_id != key.account_id || operation.cluster_domain != key.cluster_domain
        {
            return Err(Error::not_found(format!("operation {}", key)));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Operator for LocalOperator {
    async fn get_cluster(&self) -> Result<Cluster> {
        self.store.get_cluster().await
    }

    async fn get_install_operation(&self) -> Result<Operation> {
        self.store
            .list_operations()
            .await?
            .into_iter()
            .find(|op| op.op_type == OperationType::Install)
            .ok_or_else(|| Error::not_found("no install operation"))
    }

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        let operation = self.store.get_operation(&key.operation_id).await?;
        self.check_key(key, &operation)?;
        Ok(operation)
    }

    async fn create_expand_operation(&self, req: NewExpandOperation) -> Result<Operation> {
        let cluster = self.store.get_cluster().await?;
        if cluster.domain != req.cluster_domain || cluster.account_id != req.account_id {
            return Err(Error::not_found(format!("cluster {}", req.cluster_domain)));
        }
        // A node may only join once the install has finished and no other
        // operation is running.
        let install = self.get_install_operation().await?;
        if install.state != OperationState::Completed {
            return Err(Error::compare_failed(
                "the install operation is still in progress",
            ));
        }
        for operation in self.store.list_operations().await? {
            if !operation.state.is_terminal() {
                return Err(Error::compare_failed(format!(
                    "another operation {} is in progress",
                    operation.id
                )));
            }
        }
        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            cluster_domain: cluster.domain,
            account_id: req.account_id,
            op_type: OperationType::Expand,
            state: OperationState::Created,
            created_at: Utc::now(),
            created_by: req.created_by,
            servers: Vec::new(),
            vars: install.vars.clone(),
            // The joining node authenticates with the same credential
            // bundle the install operation issued.
            agents: install.agents.clone(),
        };
        if !operation.agents.contains_key(&req.role) {
            return Err(Error::aborted(format!(
                "node role {:?} is not defined for this cluster",
                req.role
            )));
        }
        self.store.create_operation(&operation).await?;
        info!(self.logger, "Created expand operation";
            "operation" => &operation.id, "role" => &req.role);
        Ok(operation)
    }

    async fn set_operation_state(&self, key: &OperationKey, state: OperationState) -> Result<()> {
        self.store
            .set_operation_state(&key.operation_id, state)
            .await?;
        Ok(())
    }

    async fn update_expand_servers(&self, key: &OperationKey, servers: Vec<Server>) -> Result<()> {
        let mut operation = self.get_operation(key).await?;
        operation.servers = servers;
        self.store.update_operation(&operation).await
    }

    async fn delete_operation(&self, key: &OperationKey) -> Result<()> {
        self.store.delete_operation(&key.operation_id).await
    }

    async fn get_agent_report(&self, key: &OperationKey) -> Result<AgentReport> {
        let reports = self.reports.read().unwrap();
        Ok(reports
            .get(&key.operation_id)
            .map(|source| source.agent_report())
            .unwrap_or_default())
    }

    async fn create_plan(&self, key: &OperationKey, plan: OperationPlan) -> Result<()> {
        if plan.operation_id != key.operation_id {
            return Err(Error::invalid_argument("plan addresses a different operation"));
        }
        self.store.create_plan(&plan).await
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        self.store.get_plan(&key.operation_id).await
    }

    async fn get_phase_state(&self, key: &OperationKey, phase_id: &str) -> Result<PhaseState> {
        self.store.get_phase_state(&key.operation_id, phase_id).await
    }

    async fn update_phase_state(&self, key: &OperationKey, state: PhaseState) -> Result<()> {
        self.store.update_phase_state(&key.operation_id, &state).await
    }

    async fn list_phase_states(&self, key: &OperationKey) -> Result<Vec<PhaseState>> {
        self.store.list_phase_states(&key.operation_id).await
    }

    async fn create_progress_entry(&self, key: &OperationKey, entry: ProgressEntry) -> Result<()> {
        self.progress
            .write()
            .unwrap()
            .insert(key.operation_id.clone(), entry);
        Ok(())
    }

    async fn get_progress(&self, key: &OperationKey) -> Result<ProgressEntry> {
        self.progress
            .read()
            .unwrap()
            .get(&key.operation_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no progress for operation {}", key)))
    }

    async fn emit_audit_event(&self, event: AuditEvent) -> Result<()> {
        info!(self.logger, "Audit event";
            "code" => event.code.clone(),
            "name" => event.name.clone(),
            "operation" => event.id.clone());
        self.audit.lock().unwrap().push(event);
        Ok(())
    }

    async fn stream_operation_logs(&self, key: &OperationKey, data: Vec<u8>) -> Result<()> {
        self.store.append_log(&key.operation_id, &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::ops::backend::MemBackend;
    use crate::ops::{AgentInstruction, AppRef, DnsConfig, DockerConfig, OperationVars};
    use std::collections::BTreeMap;

    fn cluster() -> Cluster {
        Cluster {
            domain: "example.com".to_string(),
            account_id: "system".to_string(),
            app: AppRef {
                name: "telekube".to_string(),
                version: "1.0.0".to_string(),
                hooks: vec![],
            },
            dns_config: DnsConfig::default(),
            state: "active".to_string(),
            docker: DockerConfig::default(),
        }
    }

    fn install_operation(state: OperationState) -> Operation {
        let mut agents = BTreeMap::new();
        agents.insert(
            "node".to_string(),
            AgentInstruction {
                token: "secret".to_string(),
                server_addr: "192.168.1.1:7575".to_string(),
            },
        );
        Operation {
            id: "install-1".to_string(),
            cluster_domain: "example.com".to_string(),
            account_id: "system".to_string(),
            op_type: OperationType::Install,
            state,
            created_at: Utc::now(),
            created_by: "installer@example.com".to_string(),
            servers: Vec::new(),
            vars: OperationVars::default(),
            agents,
        }
    }

    fn operator() -> LocalOperator {
        let store = OperationStore::new(Arc::new(MemBackend::new()));
        LocalOperator::new(store, logging::discard())
    }

    fn expand_request(role: &str) -> NewExpandOperation {
        NewExpandOperation {
            account_id: "system".to_string(),
            cluster_domain: "example.com".to_string(),
            role: role.to_string(),
            created_by: "agent@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_expand_requires_completed_install() {
        let operator = operator();
        operator.create_cluster(cluster()).await.unwrap();
        operator
            .ensure_install_operation(install_operation(OperationState::Running))
            .await
            .unwrap();

        let err = operator
            .create_expand_operation(expand_request("node"))
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[tokio::test]
    async fn test_expand_inherits_agents_and_conflicts() {
        let operator = operator();
        operator.create_cluster(cluster()).await.unwrap();
        operator
            .ensure_install_operation(install_operation(OperationState::Completed))
            .await
            .unwrap();

        let expand = operator
            .create_expand_operation(expand_request("node"))
            .await
            .unwrap();
        assert_eq!(expand.op_type, OperationType::Expand);
        assert_eq!(expand.agents["node"].token, "secret");

        // A second expand while the first is not terminal conflicts.
        let err = operator
            .create_expand_operation(expand_request("node"))
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[tokio::test]
    async fn test_expand_unknown_role_aborts() {
        let operator = operator();
        operator.create_cluster(cluster()).await.unwrap();
        operator
            .ensure_install_operation(install_operation(OperationState::Completed))
            .await
            .unwrap();

        let err = operator
            .create_expand_operation(expand_request("worker"))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_cluster_create_once() {
        let operator = operator();
        operator.create_cluster(cluster()).await.unwrap();
        assert!(operator
            .create_cluster(cluster())
            .await
            .unwrap_err()
            .is_already_exists());
    }
}
