//! The installer service: a long-lived process that owns the install
//! operation, the FSM, the agent fleet and the local control socket, and
//! hosts the wizard operator API while the cluster does not exist yet.

pub mod service;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slog::{info, warn, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{self, EventSender};
use crate::config::{InstallerConfig, AGENT_DEPLOY_TIMEOUT, PROGRESS_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::fsm::registry::PhaseRegistry;
use crate::fsm::{Fsm, FsmConfig};
use crate::install::service::{serve_uds, InstallService, OperationExecutor, ServiceHandle};
use crate::ops::backend::FileBackend;
use crate::ops::events;
use crate::ops::http::{self, OperatorHttpHandle};
use crate::ops::operator::{LocalOperator, Operator};
use crate::ops::store::OperationStore;
use crate::ops::{
    AgentInstruction, Cluster, Operation, OperationKey, OperationState, OperationType,
    OperationVars, PeerRegistration, ProgressEntry, SystemInfo, ROLE_MASTER,
};
use crate::rpc::client::Backoff;
use crate::rpc::fleet::{AgentFleet, PeerStore, WatchEvent};
use crate::rpc::proto::{ExecuteRequest, Mount as ProtoMount, RuntimeConfig};
use crate::rpc::server::{start_agent, AgentConfig, AgentHandle};
use crate::rpc::Credentials;

/// The installer process.
pub struct Installer {
    config: InstallerConfig,
    operator: Arc<LocalOperator>,
    registry: Arc<PhaseRegistry>,
    fleet: Arc<AgentFleet>,
    key: OperationKey,
    progress: EventSender,
    agent: AgentHandle,
    operator_http: OperatorHttpHandle,
    cancel: CancellationToken,
    logger: Logger,
}

impl Installer {
    /// Constructs the installer: binds the control socket and the wizard
    /// API, logs in to the embedded operator, ensures the install operation
    /// and starts this node's agent.
    pub async fn start(
        config: InstallerConfig,
        registry: Arc<PhaseRegistry>,
        parent_cancel: CancellationToken,
        logger: Logger,
    ) -> Result<(Arc<Installer>, ServiceHandle)> {
        config.check()?;
        let cancel = parent_cancel.child_token();
        let logger = logger.new(slog::o!("service" => "installer"));

        tokio::fs::create_dir_all(&config.state_dir).await?;
        let credentials = Credentials::new(config.token.clone());
        credentials.save(&config.state_dir)?;

        let store = OperationStore::new(Arc::new(FileBackend::new(&config.state_dir)));
        let operator = Arc::new(LocalOperator::new(store, logger.clone()));

        let cluster = ensure_cluster(&operator, &config).await?;
        let operation = operator
            .ensure_install_operation(install_operation(&cluster, &config))
            .await?;
        let key = operation.key();

        // The agent fleet: this node's agent plus every joining peer.
        let (peer_store, watch_rx) =
            PeerStore::new(credentials.clone(), cancel.clone(), logger.clone());
        operator.set_report_source(&key.operation_id, peer_store.clone());
        let fleet = Arc::new(AgentFleet::new(
            peer_store.clone(),
            credentials.clone(),
            logger.clone(),
        ));

        let agent = start_agent(
            AgentConfig::new(
                config.agent_listen_addr,
                credentials.clone(),
                runtime_config(&config),
            ),
            peer_store.clone(),
            logger.clone(),
        )
        .await?;
        // The installer node participates in the operation like any other
        // peer; register its agent directly with the coordinator.
        peer_store.insert(PeerRegistration {
            node_id: SystemInfo::local().hostname,
            advertise_addr: config.advertise_addr.clone(),
            role: config.role.clone(),
            system_info: SystemInfo::local(),
        });

        let operator_http = http::serve(
            config.operator_listen_addr,
            operator.clone(),
            credentials.clone(),
            cancel.clone(),
            logger.clone(),
        )
        .await?;

        let (progress, events_rx) =
            bus::channel(bus::DEFAULT_CAPACITY, cancel.clone(), logger.clone());

        let installer = Arc::new(Installer {
            config: config.clone(),
            operator,
            registry,
            fleet,
            key,
            progress,
            agent,
            operator_http,
            cancel: cancel.clone(),
            logger: logger.clone(),
        });

        spawn_reconnect_watcher(watch_rx, cancel.clone(), logger.clone());

        let service = InstallService::new(
            installer.clone(),
            events_rx,
            parent_cancel,
            cancel,
            logger,
        );
        let handle = serve_uds(service, &config.socket_path()).await?;
        Ok((installer, handle))
    }

    /// The wizard operator API address (for peers joining the install).
    pub fn operator_addr(&self) -> std::net::SocketAddr {
        self.operator_http.addr
    }

    pub fn operator(&self) -> Arc<LocalOperator> {
        self.operator.clone()
    }

    pub fn operation_key(&self) -> &OperationKey {
        &self.key
    }

    fn fsm(&self) -> Fsm {
        Fsm::new(FsmConfig {
            operator: self.operator.clone(),
            key: self.key.clone(),
            registry: self.registry.clone(),
            runner: Some(self.fleet.clone()),
            local_hostname: Some(SystemInfo::local().hostname),
            progress: self.progress.clone(),
            logger: self.logger.clone(),
        })
    }

    /// Waits until every expected agent has reported, then attaches the
    /// reported servers to the operation.
    async fn wait_for_agents(&self) -> Result<()> {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            1.5,
            Duration::from_secs(10),
            AGENT_DEPLOY_TIMEOUT,
        );
        loop {
            let report = self.operator.get_agent_report(&self.key).await?;
            if report.servers.len() >= self.config.expected_servers {
                let servers = report.servers.iter().map(|peer| peer.to_server()).collect();
                self.operator
                    .update_expand_servers(&self.key, servers)
                    .await?;
                info!(self.logger, "All agents have joined";
                    "count" => report.servers.len());
                return Ok(());
            }
            self.progress.send_message(
                &self.key.operation_id,
                format!(
                    "Waiting for agents to join ({}/{})",
                    report.servers.len(),
                    self.config.expected_servers
                ),
            );
            match backoff.next() {
                Some(delay) => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(Error::aborted("installer is shutting down"))
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

    /// Initializes the operation plan unless one already exists.
    async fn init_plan(&self) -> Result<()> {
        let cluster = self.operator.get_cluster().await?;
        let operation = self.operator.get_operation(&self.key).await?;
        let plan = crate::plan::builder::build_plan(&cluster, &operation)?;
        match self.operator.create_plan(&self.key, plan).await {
            Ok(()) => Ok(()),
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn run(&self) -> Result<()> {
        self.progress
            .send_message(&self.key.operation_id, "Waiting for agents to join");
        self.wait_for_agents().await?;

        let operation = self.operator.get_operation(&self.key).await?;
        if !operation.state.is_terminal() && operation.state != OperationState::Running {
            if operation.state == OperationState::Created {
                self.operator
                    .set_operation_state(&self.key, OperationState::Provisioning)
                    .await?;
            }
            self.operator
                .set_operation_state(&self.key, OperationState::Ready)
                .await?;
        }
        self.init_plan().await?;

        let operation = self.operator.get_operation(&self.key).await?;
        self.operator
            .emit_audit_event(events::for_operation(
                &operation,
                events::start_event(OperationType::Install),
            ))
            .await?;

        spawn_progress_poller(
            self.operator.clone(),
            self.key.clone(),
            self.progress.clone(),
            self.cancel.clone(),
            self.logger.clone(),
        );

        let fsm = self.fsm();
        let plan_result = fsm.execute_plan(&self.cancel).await;
        if plan_result.is_ok() {
            self.print_endpoints().await;
        }
        let success = plan_result.is_ok();
        fsm.complete(plan_result.clone()).await?;

        let operation = self.operator.get_operation(&self.key).await?;
        self.operator
            .emit_audit_event(events::for_operation(
                &operation,
                events::terminal_event(OperationType::Install, success),
            ))
            .await?;
        plan_result
    }

    /// Publishes the cluster endpoint summary after a successful install.
    async fn print_endpoints(&self) {
        let message = format!(
            "Cluster {} endpoints:\n  operator: https://{}\n  agents:   {}",
            self.config.cluster_name,
            self.operator_http.addr,
            self.config.advertise_addr,
        );
        self.progress.send(crate::bus::Event::Progress(ProgressEntry {
            operation_id: self.key.operation_id.clone(),
            completion: 99,
            message,
            created: Utc::now(),
        }));
    }
}

#[tonic::async_trait]
impl OperationExecutor for Installer {
    async fn execute(&self, req: ExecuteRequest) -> Result<()> {
        if !req.phase_id.is_empty() && req.phase_id != crate::plan::ROOT_PHASE {
            // Manual mode: run a single phase.
            return self.fsm().execute_phase(&req.phase_id, req.force).await;
        }
        self.run().await
    }

    async fn stop(&self) -> Result<()> {
        info!(self.logger, "Stopping installer");
        let mut errors = Vec::new();
        if let Err(err) = self.fleet.shutdown_agents().await {
            errors.push(err);
        }
        self.agent.shutdown();
        self.operator_http.shutdown();
        self.cancel.cancel();
        crate::error::aggregate(errors)
    }
}

fn runtime_config(config: &InstallerConfig) -> RuntimeConfig {
    RuntimeConfig {
        role: config.role.clone(),
        advertise_addr: config.advertise_addr.clone(),
        system_device: String::new(),
        docker_device: config.docker.device.clone().unwrap_or_default(),
        mounts: config
            .mounts
            .iter()
            .map(|m| ProtoMount {
                name: m.name.clone(),
                source: m.source.clone(),
            })
            .collect(),
        state_dir: config.state_dir.to_string_lossy().to_string(),
        token: config.token.clone(),
        cloud_metadata: config.cloud_provider.clone().unwrap_or_default(),
    }
}

async fn ensure_cluster(operator: &Arc<LocalOperator>, config: &InstallerConfig) -> Result<Cluster> {
    match operator.get_cluster().await {
        Ok(cluster) => Ok(cluster),
        Err(Error::NotFound(_)) => {
            operator
                .create_cluster(Cluster {
                    domain: config.cluster_name.clone(),
                    account_id: "system".to_string(),
                    app: config.app.clone(),
                    dns_config: config.dns_config.clone(),
                    state: "installing".to_string(),
                    docker: config.docker.clone(),
                })
                .await
        }
        Err(err) => Err(err),
    }
}

fn install_operation(cluster: &Cluster, config: &InstallerConfig) -> Operation {
    // Every role connects to the installer's agent endpoint with the same
    // install token.
    let mut agents = BTreeMap::new();
    for role in [ROLE_MASTER, "node", config.role.as_str()] {
        agents.insert(
            role.to_string(),
            AgentInstruction {
                token: config.token.clone(),
                server_addr: config.advertise_addr.clone(),
            },
        );
    }
    Operation {
        id: Uuid::new_v4().to_string(),
        cluster_domain: cluster.domain.clone(),
        account_id: cluster.account_id.clone(),
        op_type: OperationType::Install,
        state: OperationState::Created,
        created_at: Utc::now(),
        created_by: format!("installer@{}", cluster.domain),
        servers: Vec::new(),
        vars: OperationVars::default(),
        agents,
    }
}

/// Cancels the local context when the fleet reports a hard disconnect.
pub fn spawn_reconnect_watcher(
    mut watch_rx: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    logger: Logger,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = watch_rx.recv() => match event {
                    Some(event) => {
                        let Some(err) = event.error else { continue };
                        warn!(logger, "Failed to reconnect, will abort";
                            "peer" => &event.peer, "error" => %err);
                        cancel.cancel();
                        return;
                    }
                    None => return,
                },
                _ = cancel.cancelled() => return,
            }
        }
    });
}

/// Watches operation progress and re-emits changed entries on the bus until
/// the operation completes.
pub fn spawn_progress_poller(
    operator: Arc<dyn Operator>,
    key: OperationKey,
    progress: EventSender,
    cancel: CancellationToken,
    logger: Logger,
) {
    tokio::spawn(async move {
        info!(logger, "Start progress feedback loop"; "operation" => &key.operation_id);
        let mut interval = tokio::time::interval(PROGRESS_POLL_INTERVAL);
        let mut last: Option<ProgressEntry> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
            let entry = match operator.get_progress(&key).await {
                Ok(entry) => entry,
                Err(Error::NotFound(_)) => continue,
                Err(err) => {
                    warn!(logger, "Failed to query operation progress"; "error" => %err);
                    continue;
                }
            };
            if last.as_ref().map(|l| l.is_equal(&entry)).unwrap_or(false) {
                continue;
            }
            let completed = entry.is_completed();
            last = Some(entry.clone());
            if !completed {
                progress.send(crate::bus::Event::Progress(entry));
            }
            if completed {
                return;
            }
        }
    });
}
