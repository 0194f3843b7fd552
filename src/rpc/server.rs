//! Per-node agent RPC server.
//!
//! The agent executes commands on behalf of the orchestrator and accepts
//! peer registrations when acting as the coordinator. All RPCs are
//! authenticated with the shared operation token.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, warn, Logger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::error::{Error, Result};
use crate::ops::{PeerRegistration, SystemInfo as SystemInfoRecord};
use crate::rpc::fleet::PeerStore;
use crate::rpc::proto::agent_server::{Agent, AgentServer as ProtoAgentServer};
use crate::rpc::proto::{
    exec_output, message, AgentShutdownRequest, AgentShutdownResponse, CommandArgs, CurrentTime,
    CurrentTimeRequest, ExecCompleted, ExecOutput, Message, PeerJoinRequest, PeerJoinResponse,
    PeerLeaveRequest, PeerLeaveResponse, RuntimeConfig, RuntimeConfigRequest, SystemInfo,
    SystemInfoRequest,
};
use crate::rpc::{Credentials, TOKEN_METADATA_KEY};

/// How long a remote command may run before the agent kills it.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent server configuration.
#[derive(Clone)]
pub struct AgentConfig {
    /// Address to listen on; port 0 picks a free port.
    pub listen_addr: SocketAddr,
    pub credentials: Credentials,
    /// Runtime configuration reported to the coordinator.
    pub runtime: RuntimeConfig,
    pub command_timeout: Duration,
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr, credentials: Credentials, runtime: RuntimeConfig) -> Self {
        AgentConfig {
            listen_addr,
            credentials,
            runtime,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Handle to a running agent server.
pub struct AgentHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl AgentHandle {
    /// Requests shutdown of the serving loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the serving loop to exit.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(Error::internal(format!("agent task failed: {}", err))),
        }
    }

    pub fn is_done(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Clone)]
struct AgentService {
    config: AgentConfig,
    peers: Arc<PeerStore>,
    cancel: CancellationToken,
    logger: Logger,
}

/// Starts the agent server and returns its handle once the listener is
/// bound.
pub async fn start_agent(
    config: AgentConfig,
    peers: Arc<PeerStore>,
    logger: Logger,
) -> Result<AgentHandle> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    let service = AgentService {
        config: config.clone(),
        peers,
        cancel: cancel.clone(),
        logger: logger.new(slog::o!("server" => "agent")),
    };

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(crate::rpc::proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|err| Error::internal(format!("reflection: {}", err)))?;

    let credentials = config.credentials.clone();
    let auth = move |request: Request<()>| -> std::result::Result<Request<()>, Status> {
        let token = request
            .metadata()
            .get(TOKEN_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !credentials.matches(token) {
            return Err(Status::permission_denied("bad secret token"));
        }
        Ok(request)
    };

    info!(logger, "Agent listening"; "addr" => %addr);
    let shutdown = cancel.clone();
    let task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ProtoAgentServer::with_interceptor(service, auth))
            .add_service(reflection)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await
            .map_err(Error::from)
    });

    Ok(AgentHandle { addr, cancel, task })
}

#[tonic::async_trait]
impl Agent for AgentService {
    type CommandStream = ReceiverStream<std::result::Result<Message, Status>>;

    async fn command(
        &self,
        request: Request<CommandArgs>,
    ) -> std::result::Result<Response<Self::CommandStream>, Status> {
        let req = request.into_inner();
        if req.args.is_empty() {
            return Err(Status::invalid_argument("at least one argument is required"));
        }
        debug!(self.logger, "Command"; "args" => ?req.args);

        let mut args = req.args;
        if req.self_command {
            let exe = std::env::current_exe()
                .map_err(|err| Status::internal(format!("cannot resolve executable: {}", err)))?;
            args.insert(0, exe.to_string_lossy().to_string());
        }

        let (tx, rx) = mpsc::channel(64);
        let timeout = self.config.command_timeout;
        let logger = self.logger.clone();
        tokio::spawn(async move {
            run_command(args, tx, timeout, logger).await;
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn peer_join(
        &self,
        request: Request<PeerJoinRequest>,
    ) -> std::result::Result<Response<PeerJoinResponse>, Status> {
        let req = request.into_inner();
        let runtime = req
            .runtime_config
            .ok_or_else(|| Status::invalid_argument("missing runtime config"))?;
        let system_info: SystemInfoRecord = req
            .system_info
            .as_ref()
            .and_then(|info| serde_json::from_slice(&info.payload).ok())
            .unwrap_or_default();
        let registration = PeerRegistration {
            node_id: req.node_id,
            advertise_addr: req.addr,
            role: runtime.role,
            system_info,
        };
        info!(self.logger, "PeerJoin";
            "peer" => &registration.advertise_addr, "role" => &registration.role);
        self.peers.insert(registration);
        Ok(Response::new(PeerJoinResponse {}))
    }

    async fn peer_leave(
        &self,
        request: Request<PeerLeaveRequest>,
    ) -> std::result::Result<Response<PeerLeaveResponse>, Status> {
        let req = request.into_inner();
        info!(self.logger, "PeerLeave"; "peer" => &req.addr);
        self.peers.remove(&req.addr);
        Ok(Response::new(PeerLeaveResponse {}))
    }

    async fn get_system_info(
        &self,
        _request: Request<SystemInfoRequest>,
    ) -> std::result::Result<Response<SystemInfo>, Status> {
        let info = SystemInfoRecord::local();
        let payload = serde_json::to_vec(&info)
            .map_err(|err| Status::internal(format!("encode system info: {}", err)))?;
        Ok(Response::new(SystemInfo { payload }))
    }

    async fn get_runtime_config(
        &self,
        _request: Request<RuntimeConfigRequest>,
    ) -> std::result::Result<Response<RuntimeConfig>, Status> {
        Ok(Response::new(self.config.runtime.clone()))
    }

    async fn get_current_time(
        &self,
        _request: Request<CurrentTimeRequest>,
    ) -> std::result::Result<Response<CurrentTime>, Status> {
        Ok(Response::new(CurrentTime {
            unix_millis: chrono::Utc::now().timestamp_millis(),
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<AgentShutdownRequest>,
    ) -> std::result::Result<Response<AgentShutdownResponse>, Status> {
        info!(self.logger, "Shutdown");
        self.cancel.cancel();
        Ok(Response::new(AgentShutdownResponse {}))
    }
}

fn output_message(fd: exec_output::Fd, data: Vec<u8>) -> Message {
    Message {
        payload: Some(message::Payload::Output(ExecOutput {
            fd: fd as i32,
            data,
        })),
    }
}

fn completed_message(exit_code: i32, error: String) -> Message {
    Message {
        payload: Some(message::Payload::Completed(ExecCompleted {
            exit_code,
            error,
        })),
    }
}

/// Spawns the command and streams its output line by line, followed by the
/// final status.
async fn run_command(
    args: Vec<String>,
    tx: mpsc::Sender<std::result::Result<Message, Status>>,
    timeout: Duration,
    logger: Logger,
) {
    let mut child = match tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(logger, "Failed to spawn command"; "args" => ?args, "error" => %err);
            let _ = tx
                .send(Ok(completed_message(-1, format!("failed to spawn: {}", err))))
                .await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_tx = tx.clone();
    let out_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message = output_message(exec_output::Fd::Stdout, line.into_bytes());
                if out_tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        }
    });
    let err_tx = tx.clone();
    let err_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message = output_message(exec_output::Fd::Stderr, line.into_bytes());
                if err_tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        }
    });

    let status = tokio::time::timeout(timeout, child.wait()).await;
    let _ = out_task.await;
    let _ = err_task.await;

    let message = match status {
        Ok(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            completed_message(code, String::new())
        }
        Ok(Err(err)) => completed_message(-1, format!("wait failed: {}", err)),
        Err(_) => {
            let _ = child.kill().await;
            completed_message(-1, format!("command timed out after {:?}", timeout))
        }
    };
    let _ = tx.send(Ok(message)).await;
}
