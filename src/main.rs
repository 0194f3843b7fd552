use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use slog::{info, warn, Logger};
use tokio_util::sync::CancellationToken;

use mooring::config::{InstallerConfig, PeerConfig};
use mooring::error::{Error, Result};
use mooring::fsm::registry::PhaseRegistry;
use mooring::fsm::{Fsm, FsmConfig};
use mooring::install::service::connect_uds;
use mooring::install::Installer;
use mooring::join::Peer;
use mooring::ops::backend::FileBackend;
use mooring::ops::operator::LocalOperator;
use mooring::ops::store::OperationStore;
use mooring::ops::{AppRef, DnsConfig, DockerConfig, Mount, SystemInfo};
use mooring::plan::builder::kinds;
use mooring::rpc::proto::ExecuteRequest;
use mooring::{bus, logging};

#[derive(Parser)]
#[command(name = "mooring", about = "Cluster installation and node-join orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a new cluster from this node
    Install(InstallArgs),
    /// Join this node to an installer or an existing cluster
    Join(JoinArgs),
    /// Operate on the synced operation plan
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
}

#[derive(Parser)]
struct InstallArgs {
    #[arg(long, default_value = "/var/lib/mooring")]
    state_dir: PathBuf,
    /// Address other nodes use to reach this node's agent (host:port)
    #[arg(long)]
    advertise_addr: String,
    #[arg(long)]
    cluster_name: String,
    #[arg(long, default_value = "master")]
    role: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    cloud_provider: Option<String>,
    /// Mounts as name=path, comma separated
    #[arg(long, value_delimiter = ',')]
    mounts: Vec<String>,
    #[arg(long, default_value = "app")]
    app_name: String,
    #[arg(long, default_value = "0.0.1")]
    app_version: String,
    #[arg(long, default_value = "0.0.0.0:32100")]
    operator_listen_addr: SocketAddr,
    #[arg(long, default_value = "0.0.0.0:7575")]
    agent_listen_addr: SocketAddr,
    /// Number of nodes the install waits for before it starts
    #[arg(long, default_value_t = 1)]
    servers: usize,
}

#[derive(Parser)]
struct JoinArgs {
    /// Installer or cluster addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,
    #[arg(long)]
    advertise_addr: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    role: String,
    #[arg(long, default_value = "/var/lib/mooring")]
    state_dir: PathBuf,
    /// Id of an expand operation created via the UI
    #[arg(long)]
    operation_id: Option<String>,
    #[arg(long)]
    cloud_provider: Option<String>,
    #[arg(long, value_delimiter = ',')]
    mounts: Vec<String>,
    #[arg(long, default_value = "0.0.0.0:7575")]
    agent_listen_addr: SocketAddr,
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Execute a single phase of the synced plan on this node
    Execute(PlanArgs),
    /// Roll back a phase of the synced plan
    Rollback(PlanArgs),
}

#[derive(Parser)]
struct PlanArgs {
    #[arg(long)]
    phase: String,
    #[arg(long)]
    operation_id: Option<String>,
    #[arg(long, default_value = "/var/lib/mooring")]
    state_dir: PathBuf,
    #[arg(long)]
    force: bool,
}

fn parse_mounts(specs: &[String]) -> Result<Vec<Mount>> {
    specs
        .iter()
        .map(|spec| match spec.split_once('=') {
            Some((name, source)) => Ok(Mount {
                name: name.to_string(),
                source: source.to_string(),
            }),
            None => Err(Error::invalid_argument(format!(
                "mount {:?} is not name=path",
                spec
            ))),
        })
        .collect()
}

/// Phase executors wired into the reference binary. Real deployments
/// register the full phase catalog here.
fn phase_registry() -> Arc<PhaseRegistry> {
    let mut registry = PhaseRegistry::new();
    for kind in kinds::ALL.iter().copied() {
        registry
            .register_fn(kind, |ctx| async move {
                ctx.progress
                    .send_message(&ctx.key.operation_id, format!("Running {}", ctx.phase.id));
                Ok(())
            })
            .expect("phase kinds are unique");
    }
    Arc::new(registry)
}

fn exit_code_for_message(message: &str) -> i32 {
    if message.starts_with("access denied") {
        4
    } else if message.starts_with("aborted") {
        3
    } else if message.starts_with("connection problem")
        || message.starts_with("compare failed")
        || message.starts_with("already exists")
    {
        2
    } else {
        1
    }
}

/// Invokes Execute over the control socket and relays progress to stdout.
/// Returns the process exit code.
async fn stream_execution(socket_path: PathBuf, logger: &Logger) -> i32 {
    let mut client = match connect_uds(socket_path).await {
        Ok(client) => client,
        Err(err) => {
            warn!(logger, "Failed to connect to service"; "error" => %err);
            return err.exit_code();
        }
    };
    let mut stream = match client.execute(ExecuteRequest::default()).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            let err = Error::from(status);
            warn!(logger, "Execute failed"; "error" => %err);
            return err.exit_code();
        }
    };
    let mut code = 0;
    loop {
        match stream.message().await {
            Ok(Some(response)) => {
                if !response.message.is_empty() {
                    println!("{}", response.message);
                }
                for error in &response.errors {
                    eprintln!("{}", error.message);
                    code = exit_code_for_message(&error.message);
                }
                if response.complete {
                    break;
                }
            }
            Ok(None) => break,
            Err(status) => {
                let err = Error::from(status);
                eprintln!("{}", err);
                code = err.exit_code();
                break;
            }
        }
    }
    if let Err(status) = client
        .shutdown(mooring::rpc::proto::ShutdownRequest {})
        .await
    {
        warn!(logger, "Failed to shut down service"; "error" => %status);
    }
    code
}

async fn run_install(args: InstallArgs, logger: Logger) -> Result<i32> {
    let config = InstallerConfig {
        state_dir: args.state_dir.clone(),
        advertise_addr: args.advertise_addr,
        cluster_name: args.cluster_name,
        app: AppRef {
            name: args.app_name,
            version: args.app_version,
            hooks: Vec::new(),
        },
        role: args.role,
        token: args.token,
        cloud_provider: args.cloud_provider,
        mounts: parse_mounts(&args.mounts)?,
        dns_config: DnsConfig::default(),
        docker: DockerConfig::default(),
        operator_listen_addr: args.operator_listen_addr,
        agent_listen_addr: args.agent_listen_addr,
        expected_servers: args.servers,
    };
    let parent_cancel = CancellationToken::new();
    spawn_signal_handler(parent_cancel.clone(), logger.clone());

    let (installer, handle) =
        Installer::start(config.clone(), phase_registry(), parent_cancel, logger.clone()).await?;
    info!(logger, "Installer is running";
        "socket" => %config.socket_path().display(),
        "operator" => %installer.operator_addr());

    let code = stream_execution(config.socket_path(), &logger).await;
    let _ = handle.wait().await;
    Ok(code)
}

async fn run_join(args: JoinArgs, logger: Logger) -> Result<i32> {
    let config = PeerConfig {
        peers: args.peers,
        advertise_addr: args.advertise_addr,
        token: args.token,
        role: args.role,
        state_dir: args.state_dir.clone(),
        operation_id: args.operation_id,
        cloud_provider: args.cloud_provider,
        mounts: parse_mounts(&args.mounts)?,
        agent_listen_addr: args.agent_listen_addr,
    };
    let parent_cancel = CancellationToken::new();
    spawn_signal_handler(parent_cancel.clone(), logger.clone());

    let (_peer, handle) =
        Peer::start(config.clone(), phase_registry(), parent_cancel, logger.clone()).await?;
    info!(logger, "Peer is running"; "socket" => %config.socket_path().display());

    let code = stream_execution(config.socket_path(), &logger).await;
    let _ = handle.wait().await;
    Ok(code)
}

async fn run_plan(command: PlanCommand, logger: Logger) -> Result<i32> {
    let (args, rollback) = match command {
        PlanCommand::Execute(args) => (args, false),
        PlanCommand::Rollback(args) => (args, true),
    };
    let store = OperationStore::new(Arc::new(FileBackend::new(&args.state_dir)));
    let operation = match &args.operation_id {
        Some(id) => store.get_operation(id).await?,
        None => store
            .list_operations()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("no operation synced to this node"))?,
    };
    let operator = Arc::new(LocalOperator::new(store, logger.clone()));
    let cancel = CancellationToken::new();
    let (progress, mut events_rx) = bus::channel(bus::DEFAULT_CAPACITY, cancel, logger.clone());
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let mooring::bus::Event::Progress(entry) = event {
                println!("{}", entry.message);
            }
        }
    });

    let fsm = Fsm::new(FsmConfig {
        operator,
        key: operation.key(),
        registry: phase_registry(),
        runner: None,
        local_hostname: Some(SystemInfo::local().hostname),
        progress,
        logger,
    });
    if rollback {
        fsm.rollback_phase(&args.phase, args.force).await?;
    } else {
        fsm.execute_phase(&args.phase, args.force).await?;
    }
    Ok(0)
}

fn spawn_signal_handler(cancel: CancellationToken, logger: Logger) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(logger, "Interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let logger = logging::console();

    let result = match cli.command {
        Command::Install(args) => run_install(args, logger.clone()).await,
        Command::Join(args) => run_join(args, logger.clone()).await,
        Command::Plan { command } => run_plan(command, logger.clone()).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}
