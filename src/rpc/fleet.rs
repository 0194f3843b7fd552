//! Coordinator-side peer store and the fleet used by the FSM to execute
//! commands on remote nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, warn, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::EventSender;
use crate::error::{Error, Result};
use crate::fsm::RemoteRunner;
use crate::ops::operator::ReportSource;
use crate::ops::{AgentReport, OperationKey, PeerRegistration, Server};
use crate::rpc::client::{AgentClient, Backoff};
use crate::rpc::proto::{exec_output, message};
use crate::rpc::Credentials;

/// Interval between liveness probes of a joined peer.
const PEER_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Emitted on the watch channel when a peer's connection state changes.
/// A non-nil error means the peer could not be reached within the reconnect
/// budget; the owning service is expected to cancel.
#[derive(Debug)]
pub struct WatchEvent {
    pub peer: String,
    pub error: Option<Error>,
}

/// Registry of peers that have joined the coordinator.
pub struct PeerStore {
    peers: Mutex<HashMap<String, PeerRegistration>>,
    watch_tx: mpsc::Sender<WatchEvent>,
    credentials: Credentials,
    cancel: CancellationToken,
    logger: Logger,
}

impl PeerStore {
    /// Creates the store together with the receiving half of its watch
    /// channel.
    pub fn new(
        credentials: Credentials,
        cancel: CancellationToken,
        logger: Logger,
    ) -> (Arc<PeerStore>, mpsc::Receiver<WatchEvent>) {
        let (watch_tx, watch_rx) = mpsc::channel(16);
        let store = Arc::new(PeerStore {
            peers: Mutex::new(HashMap::new()),
            watch_tx,
            credentials,
            cancel,
            logger,
        });
        (store, watch_rx)
    }

    /// Registers a peer and starts monitoring its connection.
    pub fn insert(self: &Arc<Self>, registration: PeerRegistration) {
        let addr = registration.advertise_addr.clone();
        let existing = self
            .peers
            .lock()
            .unwrap()
            .insert(addr.clone(), registration)
            .is_some();
        if existing {
            // Re-registration after an agent restart; the monitor task for
            // the previous registration exits on its next failed probe.
            debug!(self.logger, "Peer re-joined"; "peer" => &addr);
            return;
        }
        let _ = self.watch_tx.try_send(WatchEvent {
            peer: addr.clone(),
            error: None,
        });
        let store = self.clone();
        tokio::spawn(async move {
            store.monitor(addr).await;
        });
    }

    pub fn remove(&self, addr: &str) {
        self.peers.lock().unwrap().remove(addr);
    }

    pub fn list(&self) -> Vec<PeerRegistration> {
        let mut peers: Vec<PeerRegistration> =
            self.peers.lock().unwrap().values().cloned().collect();
        peers.sort_by(|a, b| a.advertise_addr.cmp(&b.advertise_addr));
        peers
    }

    pub fn find_by_hostname(&self, hostname: &str) -> Option<PeerRegistration> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .find(|peer| peer.system_info.hostname == hostname)
            .cloned()
    }

    fn contains(&self, addr: &str) -> bool {
        self.peers.lock().unwrap().contains_key(addr)
    }

    /// Probes the peer until it is removed, the store shuts down, or the
    /// reconnect budget is exhausted.
    async fn monitor(self: Arc<Self>, addr: String) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(PEER_PING_INTERVAL) => {}
            }
            if !self.contains(&addr) {
                return;
            }
            if self.ping(&addr).await.is_ok() {
                continue;
            }
            // Transient loss: retry on the reconnect schedule before
            // declaring the peer gone.
            let mut backoff = Backoff::reconnect();
            let recovered = loop {
                match backoff.next() {
                    None => break false,
                    Some(delay) => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if !self.contains(&addr) {
                            return;
                        }
                        if self.ping(&addr).await.is_ok() {
                            break true;
                        }
                    }
                }
            };
            if recovered {
                debug!(self.logger, "Peer reconnected"; "peer" => &addr);
                continue;
            }
            warn!(self.logger, "Peer is gone"; "peer" => &addr);
            self.remove(&addr);
            let _ = self
                .watch_tx
                .send(WatchEvent {
                    peer: addr.clone(),
                    error: Some(Error::connection_problem(format!(
                        "lost connection to peer {}",
                        addr
                    ))),
                })
                .await;
            return;
        }
    }

    async fn ping(&self, addr: &str) -> Result<()> {
        let mut client = AgentClient::connect(addr, &self.credentials).await?;
        client.get_current_time().await?;
        Ok(())
    }
}

impl ReportSource for PeerStore {
    fn agent_report(&self) -> AgentReport {
        AgentReport {
            servers: self.list(),
        }
    }
}

/// Client-side fleet: executes phase commands on joined peers on behalf of
/// the FSM.
pub struct AgentFleet {
    store: Arc<PeerStore>,
    credentials: Credentials,
    logger: Logger,
}

impl AgentFleet {
    pub fn new(store: Arc<PeerStore>, credentials: Credentials, logger: Logger) -> AgentFleet {
        AgentFleet {
            store,
            credentials,
            logger,
        }
    }

    pub fn report(&self) -> AgentReport {
        self.store.agent_report()
    }

    /// Sends a shutdown request to every joined agent, aggregating failures.
    pub async fn shutdown_agents(&self) -> Result<()> {
        let mut errors = Vec::new();
        for peer in self.store.list() {
            match AgentClient::connect(&peer.advertise_addr, &self.credentials).await {
                Ok(mut client) => {
                    if let Err(err) = client.shutdown().await {
                        errors.push(err);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        crate::error::aggregate(errors)
    }

    fn resolve(&self, server: &Server) -> Result<PeerRegistration> {
        if let Some(peer) = self.store.find_by_hostname(&server.hostname) {
            return Ok(peer);
        }
        self.store
            .list()
            .into_iter()
            .find(|peer| peer.advertise_addr.starts_with(&server.advertise_ip))
            .ok_or_else(|| {
                Error::not_found(format!("no agent has joined for node {}", server.hostname))
            })
    }

    /// Issues the command once and converts the response stream into
    /// progress events. Returns the final status.
    async fn run_once(
        &self,
        addr: &str,
        key: &OperationKey,
        args: Vec<String>,
        progress: &EventSender,
    ) -> Result<()> {
        let mut client = AgentClient::connect(addr, &self.credentials).await?;
        let mut stream = client.command(args, true).await?;
        while let Some(msg) = stream.message().await? {
            match msg.payload {
                Some(message::Payload::Output(output)) => {
                    let line = String::from_utf8_lossy(&output.data).to_string();
                    if output.fd == exec_output::Fd::Stderr as i32 {
                        debug!(self.logger, "Remote stderr"; "peer" => addr, "line" => &line);
                    }
                    progress.send_message(&key.operation_id, line);
                }
                Some(message::Payload::Completed(completed)) => {
                    if completed.exit_code != 0 {
                        let reason = if completed.error.is_empty() {
                            format!("exit code {}", completed.exit_code)
                        } else {
                            completed.error
                        };
                        return Err(Error::internal(format!(
                            "remote command failed on {}: {}",
                            addr, reason
                        )));
                    }
                    return Ok(());
                }
                None => {}
            }
        }
        Err(Error::connection_problem(format!(
            "command stream from {} ended without a status",
            addr
        )))
    }
}

#[tonic::async_trait]
impl RemoteRunner for AgentFleet {
    /// At-least-once delivery: a command interrupted by connection loss is
    /// re-issued until the reconnect budget runs out. Phase executors are
    /// required to be idempotent.
    async fn run(
        &self,
        key: &OperationKey,
        server: &Server,
        args: Vec<String>,
        progress: &EventSender,
    ) -> Result<()> {
        let peer = self.resolve(server)?;
        let addr = peer.advertise_addr;
        info!(self.logger, "Dispatching phase command";
            "peer" => &addr, "args" => ?args);
        let mut backoff = Backoff::reconnect();
        loop {
            match self.run_once(&addr, key, args.clone(), progress).await {
                Ok(()) => return Ok(()),
                Err(err @ Error::ConnectionProblem(_)) => match backoff.next() {
                    Some(delay) => {
                        warn!(self.logger, "Retrying remote command";
                            "peer" => &addr, "error" => %err);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}
