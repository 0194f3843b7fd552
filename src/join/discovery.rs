//! Discovery and handshake: locating an active installer wizard or a
//! running cluster among the configured peer addresses.

use std::sync::Arc;

use slog::{debug, info};

use crate::bus::EventSender;
use crate::error::{Error, Result};
use crate::ops::client::HttpOperator;
use crate::ops::http::DEFAULT_OPERATOR_PORT;
use crate::ops::operator::Operator;
use crate::ops::{Cluster, Operation, OperationState};
use crate::rpc::client::Backoff;
use crate::rpc::Credentials;

use super::Peer;

/// The active install/expand operation a peer has connected to.
pub struct OperationContext {
    /// Operator service of the wizard or cluster
    pub operator: Arc<dyn Operator>,
    /// Address of the peer this node joined through
    pub peer_addr: String,
    pub operation: Operation,
    pub cluster: Cluster,
    /// RPC credentials for this node's agent
    pub credentials: Credentials,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("operator", &"<dyn Operator>")
            .field("peer_addr", &self.peer_addr)
            .field("operation", &self.operation)
            .field("cluster", &self.cluster)
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Expands a bare `host[:port]` to an operator URL; URL forms pass through
/// unchanged.
pub fn format_cluster_url(addr: &str) -> String {
    if addr.contains("http") {
        return addr.to_string();
    }
    if addr.contains(':') {
        format!("http://{}", addr)
    } else {
        format!("http://{}:{}", addr, DEFAULT_OPERATOR_PORT)
    }
}

/// Dials to either a running installer wizard or a cluster, trying every
/// configured peer address. Transient errors retry with backoff;
/// `AccessDenied` and `Aborted` terminate immediately.
pub async fn connect(peer: &Peer, progress: &EventSender) -> Result<OperationContext> {
    let mut backoff = Backoff::unlimited();
    progress.send_message("", "Connecting to cluster");
    loop {
        match try_connect_once(peer, progress).await {
            Ok(ctx) => return Ok(ctx),
            Err(err) if err.is_access_denied() => {
                // The join token is incorrect; fail immediately.
                return Err(Error::access_denied("bad secret token"));
            }
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => {
                debug!(peer.logger(), "Connect attempt failed"; "error" => %err);
            }
        }
        let delay = backoff.next().unwrap_or(crate::rpc::client::BACKOFF_CAP);
        tokio::select! {
            _ = peer.cancelled() => return Err(Error::aborted("peer is shutting down")),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A single pass over the configured peer addresses: wizard first, then
/// cluster. An `AlreadyExists` from the wizard returns without attempting
/// the cluster dial.
pub async fn try_connect_once(peer: &Peer, progress: &EventSender) -> Result<OperationContext> {
    let mut last_err = Error::connection_problem("no peers to connect to");
    for addr in peer.peers() {
        debug!(peer.logger(), "Trying peer"; "peer" => addr);
        match dial_wizard(peer, addr).await {
            Ok(ctx) => {
                info!(peer.logger(), "Connected to wizard"; "addr" => addr);
                progress.send_message("", format!("Connected to installer at {}", addr));
                return Ok(ctx);
            }
            Err(err) if err.is_access_denied() || err.is_aborted() => return Err(err),
            Err(err) if err.is_already_exists() => {
                // An install operation is still in progress: do not attempt
                // the cluster until it finishes.
                progress.send_message("", "Waiting for the install operation to finish");
                return Err(err);
            }
            Err(err) => {
                debug!(peer.logger(), "Failed connecting to wizard"; "error" => %err);
                last_err = err;
            }
        }

        match dial_cluster(peer, addr).await {
            Ok(ctx) => {
                info!(peer.logger(), "Connected to cluster"; "addr" => addr);
                progress.send_message("", format!("Connected to existing cluster at {}", addr));
                return Ok(ctx);
            }
            Err(err) if err.is_access_denied() || err.is_aborted() => return Err(err),
            Err(err) => {
                if err.is_compare_failed() {
                    progress.send_message(
                        "",
                        format!("Waiting for another operation to finish at {}", addr),
                    );
                }
                debug!(peer.logger(), "Failed connecting to cluster"; "error" => %err);
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Connects to an installer wizard: the peer joins the active install
/// operation. Joinable states are `Created`, `Provisioning` and `Failed`;
/// anything else still in flight yields `AlreadyExists`.
async fn dial_wizard(peer: &Peer, addr: &str) -> Result<OperationContext> {
    let url = format_cluster_url(addr);
    let operator = Arc::new(HttpOperator::new(url, peer.token(), peer.logger().clone())?);
    let info = operator.wizard_info().await?;
    let (cluster, operation) = (info.cluster, info.operation);

    if operation.state == OperationState::Completed {
        return Err(Error::not_found("installation has already completed"));
    }
    if !operation.state.accepts_joins() {
        return Err(Error::already_exists(format!(
            "operation {} is in progress",
            operation.id
        )));
    }
    let instruction = operation.agent_instruction(peer.role())?.clone();
    peer.run_preflight(&cluster, &operation)?;
    Ok(OperationContext {
        operator,
        peer_addr: addr.to_string(),
        credentials: Credentials::new(instruction.token),
        operation,
        cluster,
    })
}

/// Connects to a running cluster and creates (or, in UI mode, fetches) the
/// expand operation.
async fn dial_cluster(peer: &Peer, addr: &str) -> Result<OperationContext> {
    let url = format_cluster_url(addr);
    let operator = Arc::new(HttpOperator::new(url, peer.token(), peer.logger().clone())?);
    let cluster = operator.get_cluster().await?;
    let install = operator.get_install_operation().await?;
    peer.run_preflight(&cluster, &install)?;

    let operation = match peer.operation_id() {
        None => {
            let operation = operator
                .create_expand_operation(crate::ops::NewExpandOperation {
                    account_id: cluster.account_id.clone(),
                    cluster_domain: cluster.domain.clone(),
                    role: peer.role().to_string(),
                    created_by: format!("peer@{}", peer.advertise_addr()),
                })
                .await?;
            operator
                .set_operation_state(&operation.key(), OperationState::Ready)
                .await?;
            operator.get_operation(&operation.key()).await?
        }
        Some(id) => {
            let mut key = install.key();
            key.operation_id = id.to_string();
            operator.get_operation(&key).await?
        }
    };
    let instruction = operation.agent_instruction(peer.role())?.clone();
    Ok(OperationContext {
        operator,
        peer_addr: addr.to_string(),
        credentials: Credentials::new(instruction.token),
        operation,
        cluster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_default_port() {
        assert_eq!(
            format_cluster_url("192.168.1.1"),
            format!("http://192.168.1.1:{}", DEFAULT_OPERATOR_PORT)
        );
    }

    #[test]
    fn test_host_port_kept() {
        assert_eq!(
            format_cluster_url("192.168.1.1:8080"),
            "http://192.168.1.1:8080"
        );
    }

    #[test]
    fn test_url_passes_through() {
        assert_eq!(
            format_cluster_url("https://cluster.example.com:32009"),
            "https://cluster.example.com:32009"
        );
    }
}
