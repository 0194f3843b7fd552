//! The join peer: locates an active installer or an existing cluster,
//! enrolls this node as a member, joins the agent fleet and drives the
//! expand plan to completion.

pub mod discovery;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{info, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::bus::{self, EventSender};
use crate::config::{PeerConfig, WAIT_FOR_AGENTS_TIMEOUT, WAIT_FOR_OPERATION_INTERVAL};
use crate::error::{Error, Result};
use crate::fsm::registry::PhaseRegistry;
use crate::fsm::{Fsm, FsmConfig};
use crate::install::service::{serve_uds, InstallService, OperationExecutor, ServiceHandle};
use crate::install::{spawn_progress_poller, spawn_reconnect_watcher};
use crate::ops::backend::FileBackend;
use crate::ops::events;
use crate::ops::operator::LocalOperator;
use crate::ops::store::OperationStore;
use crate::ops::{Cluster, Operation, OperationState, OperationType, SystemInfo};
use crate::rpc::client::{AgentClient, Backoff};
use crate::rpc::fleet::PeerStore;
use crate::rpc::proto::{
    ExecuteRequest, Mount as ProtoMount, PeerJoinRequest, PeerLeaveRequest, RuntimeConfig,
    SystemInfo as ProtoSystemInfo,
};
use crate::rpc::server::{start_agent, AgentConfig, AgentHandle};
use crate::rpc::Credentials;

use discovery::OperationContext;

/// Local preflight checks run against the cluster manifest before a node
/// commits to joining. A failure aborts the join and is not retried.
pub type PreflightCheck = Arc<dyn Fn(&Cluster, &Operation) -> Result<()> + Send + Sync>;

/// A client that manages joining the cluster.
pub struct Peer {
    config: PeerConfig,
    registry: Arc<PhaseRegistry>,
    preflight: PreflightCheck,
    /// Local join backend mirroring the authoritative plan
    store: OperationStore,
    progress: EventSender,
    cancel: CancellationToken,
    agent: Mutex<Option<AgentHandle>>,
    /// Coordinator endpoint, recorded once the agent has joined
    coordinator: Mutex<Option<(String, Credentials)>>,
    logger: Logger,
}

impl Peer {
    /// Constructs the peer and binds its control socket.
    pub async fn start(
        config: PeerConfig,
        registry: Arc<PhaseRegistry>,
        parent_cancel: CancellationToken,
        logger: Logger,
    ) -> Result<(Arc<Peer>, ServiceHandle)> {
        Peer::start_with_preflight(config, registry, Arc::new(|_, _| Ok(())), parent_cancel, logger)
            .await
    }

    pub async fn start_with_preflight(
        config: PeerConfig,
        registry: Arc<PhaseRegistry>,
        preflight: PreflightCheck,
        parent_cancel: CancellationToken,
        logger: Logger,
    ) -> Result<(Arc<Peer>, ServiceHandle)> {
        config.check()?;
        let cancel = parent_cancel.child_token();
        let logger = logger.new(slog::o!("service" => "peer"));

        tokio::fs::create_dir_all(&config.state_dir).await?;
        let store = OperationStore::new(Arc::new(FileBackend::new(&config.state_dir)));
        let (progress, events_rx) =
            bus::channel(bus::DEFAULT_CAPACITY, cancel.clone(), logger.clone());

        let peer = Arc::new(Peer {
            config: config.clone(),
            registry,
            preflight,
            store,
            progress,
            cancel: cancel.clone(),
            agent: Mutex::new(None),
            coordinator: Mutex::new(None),
            logger: logger.clone(),
        });

        let service = InstallService::new(
            peer.clone(),
            events_rx,
            parent_cancel,
            cancel,
            logger,
        );
        let handle = serve_uds(service, &config.socket_path()).await?;
        Ok((peer, handle))
    }

    pub fn peers(&self) -> &[String] {
        &self.config.peers
    }

    pub fn token(&self) -> &str {
        &self.config.token
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.config.operation_id.as_deref()
    }

    pub fn advertise_addr(&self) -> &str {
        &self.config.advertise_addr
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn run_preflight(&self, cluster: &Cluster, operation: &Operation) -> Result<()> {
        (self.preflight)(cluster, operation).map_err(|err| match err {
            // Failed checks must not be retried.
            Error::Aborted(_) => err,
            other => Error::aborted(other.to_string()),
        })
    }

    /// The peer main flow.
    async fn run(&self) -> Result<()> {
        let ctx = discovery::connect(self, &self.progress).await?;
        info!(self.logger, "Connected";
            "operation" => &ctx.operation.id, "type" => %ctx.operation.op_type);

        // Mirror the operation record for manual phase execution.
        match self.store.create_operation(&ctx.operation).await {
            Ok(()) | Err(Error::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
        // Load the RPC credential package from the remote service.
        ctx.credentials.save(&self.config.state_dir)?;

        spawn_progress_poller(
            ctx.operator.clone(),
            ctx.operation.key(),
            self.progress.clone(),
            self.cancel.clone(),
            self.logger.clone(),
        );

        self.start_agent(&ctx).await?;

        if ctx.operation.op_type != OperationType::Expand {
            // Joined an active install: the installer orchestrates; this
            // node only serves its agent.
            self.progress.send_message(
                &ctx.operation.id,
                "Joined the install operation; waiting for instructions",
            );
            self.wait_for_agent_exit().await;
            return Ok(());
        }

        let result = self.run_expand(&ctx).await;
        if let Err(err) = &result {
            warn!(self.logger, "Peer is exiting with error"; "error" => %err);
            self.cleanup_operation(&ctx).await;
        }
        result
    }

    /// Deletes a freshly created operation that never started. Operations
    /// created via the UI are left alone so the user can cancel them there.
    async fn cleanup_operation(&self, ctx: &OperationContext) {
        if self.config.operation_id.is_some() {
            return;
        }
        let key = ctx.operation.key();
        match ctx.operator.get_operation(&key).await {
            Ok(operation) if should_delete_operation(&operation) => {
                warn!(self.logger, "Cleaning up unstarted operation"; "operation" => &operation.id);
                if let Err(err) = ctx.operator.delete_operation(&key).await {
                    warn!(self.logger, "Failed to delete unstarted operation"; "error" => %err);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(self.logger, "Failed to query operation for cleanup"; "error" => %err);
            }
        }
    }

    /// Starts this node's RPC agent and registers it with the coordinator.
    async fn start_agent(&self, ctx: &OperationContext) -> Result<()> {
        let credentials = ctx.credentials.clone();
        let (peer_store, watch_rx) =
            PeerStore::new(credentials.clone(), self.cancel.clone(), self.logger.clone());
        spawn_reconnect_watcher(watch_rx, self.cancel.clone(), self.logger.clone());

        let agent = start_agent(
            AgentConfig::new(
                self.config.agent_listen_addr,
                credentials.clone(),
                self.runtime_config(&credentials),
            ),
            peer_store,
            self.logger.clone(),
        )
        .await?;
        *self.agent.lock().unwrap() = Some(agent);

        let instruction = ctx.operation.agent_instruction(self.role())?;
        let server_addr = instruction.server_addr.clone();
        let mut client =
            AgentClient::connect_with_backoff(&server_addr, &credentials, Backoff::reconnect())
                .await?;
        let system_info = SystemInfo::local();
        client
            .peer_join(PeerJoinRequest {
                addr: self.config.advertise_addr.clone(),
                node_id: system_info.hostname.clone(),
                system_info: Some(ProtoSystemInfo {
                    payload: serde_json::to_vec(&system_info)?,
                }),
                runtime_config: Some(self.runtime_config(&credentials)),
            })
            .await?;
        info!(self.logger, "Joined the agent fleet"; "coordinator" => &server_addr);
        *self.coordinator.lock().unwrap() = Some((server_addr, credentials));
        Ok(())
    }

    fn runtime_config(&self, credentials: &Credentials) -> RuntimeConfig {
        RuntimeConfig {
            role: self.config.role.clone(),
            advertise_addr: self.config.advertise_addr.clone(),
            system_device: String::new(),
            docker_device: String::new(),
            mounts: self
                .config
                .mounts
                .iter()
                .map(|m| ProtoMount {
                    name: m.name.clone(),
                    source: m.source.clone(),
                })
                .collect(),
            state_dir: self.config.state_dir.to_string_lossy().to_string(),
            token: credentials.token.clone(),
            cloud_metadata: self.config.cloud_provider.clone().unwrap_or_default(),
        }
    }

    async fn wait_for_agent_exit(&self) {
        loop {
            let done = self
                .agent
                .lock()
                .unwrap()
                .as_ref()
                .map(|agent| agent.is_done())
                .unwrap_or(true);
            if done || self.cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Blocks until the expand operation is ready to execute.
    async fn wait_for_operation(&self, ctx: &OperationContext) -> Result<()> {
        let key = ctx.operation.key();
        info!(self.logger, "Waiting for the operation to become ready";
            "operation" => &key.operation_id);
        loop {
            let operation = ctx.operator.get_operation(&key).await?;
            match operation.state {
                OperationState::Ready | OperationState::Running => return Ok(()),
                state => {
                    slog::debug!(self.logger, "Operation is not ready yet"; "state" => ?state);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::aborted("peer is shutting down"))
                }
                _ = tokio::time::sleep(WAIT_FOR_OPERATION_INTERVAL) => {}
            }
        }
    }

    /// Blocks until the agent report lists at least one server, then
    /// attaches the reported servers to the operation.
    async fn wait_for_agents(&self, ctx: &OperationContext) -> Result<()> {
        let key = ctx.operation.key();
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            1.5,
            Duration::from_secs(10),
            WAIT_FOR_AGENTS_TIMEOUT,
        );
        info!(self.logger, "Waiting for the agent to join"; "operation" => &key.operation_id);
        loop {
            match ctx.operator.get_agent_report(&key).await {
                Ok(report) if !report.servers.is_empty() => {
                    let servers = report.servers.iter().map(|peer| peer.to_server()).collect();
                    ctx.operator.update_expand_servers(&key, servers).await?;
                    info!(self.logger, "Installation can proceed";
                        "servers" => report.servers.len());
                    return Ok(());
                }
                Ok(_) => {
                    slog::debug!(self.logger, "Agent hasn't joined yet");
                }
                Err(err) => {
                    warn!(self.logger, "Failed to query agent report"; "error" => %err);
                }
            }
            match backoff.next() {
                Some(delay) => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::aborted("peer is shutting down"))
                    }
                    _ = tokio::time::sleep(delay) => {}
                },
                None => {
                    return Err(Error::connection_problem(
                        "timed out waiting for agents to join",
                    ))
                }
            }
        }
    }

    /// Initializes the operation plan unless one exists already.
    async fn init_plan(&self, ctx: &OperationContext) -> Result<()> {
        let key = ctx.operation.key();
        let operation = ctx.operator.get_operation(&key).await?;
        let plan = crate::plan::builder::build_plan(&ctx.cluster, &operation)?;
        match ctx.operator.create_plan(&key, plan).await {
            Ok(()) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn run_expand(&self, ctx: &OperationContext) -> Result<()> {
        let key = ctx.operation.key();
        self.wait_for_operation(ctx).await?;
        self.wait_for_agents(ctx).await?;
        self.init_plan(ctx).await?;

        // Sync the authoritative plan into the local join backend for crash
        // resume and manual phase execution.
        let plan = ctx.operator.get_plan(&key).await?;
        self.store.sync_plan(&plan).await?;

        let operation = ctx.operator.get_operation(&key).await?;
        ctx.operator
            .emit_audit_event(events::for_operation(
                &operation,
                events::start_event(OperationType::Expand),
            ))
            .await?;

        let fsm = Fsm::new(FsmConfig {
            operator: ctx.operator.clone(),
            key: key.clone(),
            registry: self.registry.clone(),
            runner: None,
            local_hostname: Some(SystemInfo::local().hostname),
            progress: self.progress.clone(),
            logger: self.logger.clone(),
        });
        let plan_result = fsm.execute_plan(&self.cancel).await;
        if let Err(err) = &plan_result {
            warn!(self.logger, "Failed to execute plan"; "error" => %err);
        }
        fsm.complete(plan_result.clone())
            .await
            .map_err(|err| Error::internal(format!("failed to complete operation: {}", err)))?;

        let operation = ctx.operator.get_operation(&key).await?;
        ctx.operator
            .emit_audit_event(events::for_operation(
                &operation,
                events::terminal_event(OperationType::Expand, plan_result.is_ok()),
            ))
            .await?;
        plan_result
    }
}

/// Whether a failed join may delete the operation: only if it never
/// started executing.
pub fn should_delete_operation(operation: &Operation) -> bool {
    matches!(
        operation.state,
        OperationState::Created | OperationState::Provisioning | OperationState::Ready
    )
}

#[tonic::async_trait]
impl OperationExecutor for Peer {
    async fn execute(&self, req: ExecuteRequest) -> Result<()> {
        if !req.phase_id.is_empty() && req.phase_id != crate::plan::ROOT_PHASE {
            // Manual mode runs against the locally synced plan.
            let operation = self
                .store
                .list_operations()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found("no operation synced to this node"))?;
            let operator = Arc::new(LocalOperator::new(self.store.clone(), self.logger.clone()));
            let fsm = Fsm::new(FsmConfig {
                operator,
                key: operation.key(),
                registry: self.registry.clone(),
                runner: None,
                local_hostname: Some(SystemInfo::local().hostname),
                progress: self.progress.clone(),
                logger: self.logger.clone(),
            });
            return fsm.execute_phase(&req.phase_id, req.force).await;
        }
        self.run().await
    }

    async fn stop(&self) -> Result<()> {
        info!(self.logger, "Stopping peer");
        let mut errors = Vec::new();
        // Tell the coordinator this peer is leaving.
        let coordinator = self.coordinator.lock().unwrap().clone();
        if let Some((server_addr, credentials)) = coordinator {
            match AgentClient::connect(&server_addr, &credentials).await {
                Ok(mut client) => {
                    if let Err(err) = client
                        .peer_leave(PeerLeaveRequest {
                            addr: self.config.advertise_addr.clone(),
                            node_id: SystemInfo::local().hostname,
                        })
                        .await
                    {
                        errors.push(err);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        if let Some(agent) = self.agent.lock().unwrap().as_ref() {
            agent.shutdown();
        }
        self.cancel.cancel();
        crate::error::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationVars;
    use std::collections::BTreeMap;

    fn operation(state: OperationState) -> Operation {
        Operation {
            id: "expand-1".to_string(),
            cluster_domain: "example.com".to_string(),
            account_id: "system".to_string(),
            op_type: OperationType::Expand,
            state,
            created_at: chrono::Utc::now(),
            created_by: "peer@node-2".to_string(),
            servers: Vec::new(),
            vars: OperationVars::default(),
            agents: BTreeMap::new(),
        }
    }

    #[test]
    fn test_unstarted_operations_are_deleted() {
        assert!(should_delete_operation(&operation(OperationState::Created)));
        assert!(should_delete_operation(&operation(OperationState::Ready)));
        assert!(!should_delete_operation(&operation(OperationState::Running)));
        assert!(!should_delete_operation(&operation(OperationState::Failed)));
        assert!(!should_delete_operation(&operation(
            OperationState::Completed
        )));
    }
}
