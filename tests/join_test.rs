use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mooring::bus;
use mooring::config::PeerConfig;
use mooring::fsm::registry::PhaseRegistry;
use mooring::join::discovery;
use mooring::join::Peer;
use mooring::logging;
use mooring::ops::backend::MemBackend;
use mooring::ops::http;
use mooring::ops::operator::LocalOperator;
use mooring::ops::store::OperationStore;
use mooring::ops::{
    AgentInstruction, AppRef, Cluster, DnsConfig, DockerConfig, Operation, OperationState,
    OperationType, OperationVars,
};
use mooring::rpc::Credentials;

const TOKEN: &str = "good-token";

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

fn install_operation(id: &str, state: OperationState) -> Operation {
    let mut agents = BTreeMap::new();
    agents.insert(
        "node".to_string(),
        AgentInstruction {
            token: TOKEN.to_string(),
            server_addr: "127.0.0.1:7575".to_string(),
        },
    );
    Operation {
        id: id.to_string(),
        cluster_domain: "example.com".to_string(),
        account_id: "system".to_string(),
        op_type: OperationType::Install,
        state,
        created_at: chrono::Utc::now(),
        created_by: "installer@example.com".to_string(),
        servers: Vec::new(),
        vars: OperationVars::default(),
        agents,
    }
}

/// Starts an in-process operator API around the given store.
async fn start_operator(store: OperationStore) -> (Arc<LocalOperator>, String) {
    let operator = Arc::new(LocalOperator::new(store, logging::discard()));
    let handle = http::serve(
        "127.0.0.1:0".parse().unwrap(),
        operator.clone(),
        Credentials::new(TOKEN),
        CancellationToken::new(),
        logging::discard(),
    )
    .await
    .unwrap();
    (operator, handle.addr.to_string())
}

async fn start_peer(addr: &str, token: &str) -> Arc<Peer> {
    let state_dir = tempfile::tempdir().unwrap();
    let config = PeerConfig {
        peers: vec![addr.to_string()],
        advertise_addr: "127.0.0.1:7575".to_string(),
        token: token.to_string(),
        role: "node".to_string(),
        state_dir: state_dir.keep(),
        operation_id: None,
        cloud_provider: None,
        mounts: Vec::new(),
        agent_listen_addr: "127.0.0.1:0".parse().unwrap(),
    };
    let (peer, _handle) = Peer::start(
        config,
        Arc::new(PhaseRegistry::new()),
        CancellationToken::new(),
        logging::discard(),
    )
    .await
    .unwrap();
    peer
}

#[tokio::test]
async fn test_bad_token_terminates_connect() {
    let store = OperationStore::new(Arc::new(MemBackend::new()));
    store.put_cluster(&cluster()).await.unwrap();
    store
        .create_operation(&install_operation("install-1", OperationState::Created))
        .await
        .unwrap();
    let (_operator, addr) = start_operator(store).await;

    let peer = start_peer(&addr, "wrong").await;
    let cancel = CancellationToken::new();
    let (progress, _events) = bus::channel(100, cancel, logging::discard());

    // AccessDenied terminates on the first occurrence; no retries.
    let err = tokio::time::timeout(Duration::from_secs(10), discovery::connect(&peer, &progress))
        .await
        .expect("connect should fail fast")
        .unwrap_err();
    assert!(err.is_access_denied());
    assert_eq!(err.to_string(), "access denied: bad secret token");
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn test_wizard_in_progress_skips_cluster_dial() {
    let store = OperationStore::new(Arc::new(MemBackend::new()));
    store.put_cluster(&cluster()).await.unwrap();
    // The install operation is running: joining must wait, and the peer
    // must not fall through to the cluster dial.
    store
        .create_operation(&install_operation("install-1", OperationState::Running))
        .await
        .unwrap();
    let (_operator, addr) = start_operator(store).await;

    let peer = start_peer(&addr, TOKEN).await;
    let cancel = CancellationToken::new();
    let (progress, mut events) = bus::channel(100, cancel, logging::discard());

    // A cluster dial would surface CompareFailed from the expand creation;
    // the wizard classification must win with AlreadyExists instead.
    let err = discovery::try_connect_once(&peer, &progress)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    let mut messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let mooring::bus::Event::Progress(entry) = event {
            messages.push(entry.message);
        }
    }
    assert!(messages
        .iter()
        .any(|m| m.contains("Waiting for the install operation to finish")));
}

#[tokio::test]
async fn test_wizard_joinable_when_install_initiated() {
    let store = OperationStore::new(Arc::new(MemBackend::new()));
    store.put_cluster(&cluster()).await.unwrap();
    store
        .create_operation(&install_operation("install-1", OperationState::Created))
        .await
        .unwrap();
    let (_operator, addr) = start_operator(store).await;

    let peer = start_peer(&addr, TOKEN).await;
    let cancel = CancellationToken::new();
    let (progress, _events) = bus::channel(100, cancel, logging::discard());

    let ctx = discovery::connect(&peer, &progress).await.unwrap();
    // Joining an active install adopts the install operation itself.
    assert_eq!(ctx.operation.op_type, OperationType::Install);
    assert_eq!(ctx.operation.id, "install-1");
    assert_eq!(ctx.credentials.token, TOKEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_busy_retries_until_success() {
    let store = OperationStore::new(Arc::new(MemBackend::new()));
    store.put_cluster(&cluster()).await.unwrap();
    store
        .create_operation(&install_operation("install-1", OperationState::Completed))
        .await
        .unwrap();
    // Another expand operation hogs the cluster.
    let mut blocker = install_operation("expand-0", OperationState::Running);
    blocker.op_type = OperationType::Expand;
    store.create_operation(&blocker).await.unwrap();

    let (_operator, addr) = start_operator(store.clone()).await;
    let peer = start_peer(&addr, TOKEN).await;
    let cancel = CancellationToken::new();
    let (progress, mut events) = bus::channel(100, cancel, logging::discard());

    // Unblock the cluster shortly after the first rejections.
    let unblock = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        store
            .set_operation_state("expand-0", OperationState::Completed)
            .await
            .unwrap();
    });

    let ctx = tokio::time::timeout(Duration::from_secs(30), discovery::connect(&peer, &progress))
        .await
        .expect("connect should eventually succeed")
        .unwrap();
    unblock.await.unwrap();

    assert_eq!(ctx.operation.op_type, OperationType::Expand);
    assert_eq!(ctx.operation.state, OperationState::Ready);

    let mut messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let mooring::bus::Event::Progress(entry) = event {
            messages.push(entry.message);
        }
    }
    assert!(messages
        .iter()
        .any(|m| m.contains("Waiting for another operation to finish")));
    assert!(messages
        .iter()
        .any(|m| m.contains("Connected to existing cluster")));
}

#[tokio::test]
async fn test_unknown_role_aborts() {
    let store = OperationStore::new(Arc::new(MemBackend::new()));
    store.put_cluster(&cluster()).await.unwrap();
    store
        .create_operation(&install_operation("install-1", OperationState::Created))
        .await
        .unwrap();
    let (_operator, addr) = start_operator(store).await;

    // The install operation has no instructions for this role.
    let state_dir = tempfile::tempdir().unwrap();
    let config = PeerConfig {
        peers: vec![addr],
        advertise_addr: "127.0.0.1:7575".to_string(),
        token: TOKEN.to_string(),
        role: "database".to_string(),
        state_dir: state_dir.keep(),
        operation_id: None,
        cloud_provider: None,
        mounts: Vec::new(),
        agent_listen_addr: "127.0.0.1:0".parse().unwrap(),
    };
    let (peer, _handle) = Peer::start(
        config,
        Arc::new(PhaseRegistry::new()),
        CancellationToken::new(),
        logging::discard(),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let (progress, _events) = bus::channel(100, cancel, logging::discard());
    let err = tokio::time::timeout(Duration::from_secs(10), discovery::connect(&peer, &progress))
        .await
        .expect("connect should abort fast")
        .unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_operation_cleanup_distinguishes_cli_and_ui_mode() {
    use mooring::join::should_delete_operation;
    let mut operation = install_operation("expand-1", OperationState::Ready);
    operation.op_type = OperationType::Expand;
    // CLI mode deletes unstarted operations...
    assert!(should_delete_operation(&operation));
    // ...but never one that has begun executing.
    operation.state = OperationState::Running;
    assert!(!should_delete_operation(&operation));
}
