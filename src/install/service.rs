//! Control-socket gRPC service shared by the installer and the join peer.
//!
//! `Execute` is single-shot: the first call starts the operation, every
//! later call attaches to the same event stream and receives the same
//! terminal result.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slog::{info, warn, Logger};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Response, Status};

use crate::bus::Event;
use crate::error::{Error, Result};
use crate::rpc::proto::installer_client::InstallerClient;
use crate::rpc::proto::installer_server::{Installer, InstallerServer};
use crate::rpc::proto::{
    ExecuteRequest, ProgressResponse, ShutdownRequest, ShutdownResponse, UninstallRequest,
    UninstallResponse,
};

/// The single-shot operation driven by the service.
#[tonic::async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Runs the operation once. Progress flows through the event bus the
    /// service was constructed with.
    async fn execute(&self, req: ExecuteRequest) -> Result<()>;
    /// Releases resources owned by the executor.
    async fn stop(&self) -> Result<()>;
}

/// Terminal outcome broadcast to every attached `Execute` stream.
#[derive(Clone, Debug, Default)]
struct Outcome {
    finished: bool,
    error: Option<String>,
}

/// gRPC service streaming operation progress over the local control socket.
pub struct InstallService {
    executor: Arc<dyn OperationExecutor>,
    events: broadcast::Sender<Event>,
    outcome_tx: watch::Sender<Outcome>,
    started: AtomicBool,
    /// External lifetime; cancellation aborts all streams with an error.
    parent_cancel: CancellationToken,
    /// Local lifetime; canceled by `Shutdown` for a clean exit.
    cancel: CancellationToken,
    logger: Logger,
}

impl InstallService {
    /// Creates the service and starts the fan-out loop that moves events
    /// from the bus to the attached streams.
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        mut events_rx: mpsc::Receiver<Event>,
        parent_cancel: CancellationToken,
        cancel: CancellationToken,
        logger: Logger,
    ) -> Arc<InstallService> {
        let (events, _) = broadcast::channel(128);
        let (outcome_tx, _) = watch::channel(Outcome::default());
        let service = Arc::new(InstallService {
            executor,
            events: events.clone(),
            outcome_tx: outcome_tx.clone(),
            started: AtomicBool::new(false),
            parent_cancel,
            cancel: cancel.clone(),
            logger,
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => match event {
                        Some(event) => {
                            let terminal = event.is_terminal();
                            let _ = events.send(event);
                            if terminal {
                                outcome_tx.send_modify(|outcome| outcome.finished = true);
                            }
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        service
    }

    /// Starts the operation on the first call.
    fn ensure_started(self: &Arc<Self>, req: ExecuteRequest) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service.executor.execute(req).await {
                warn!(service.logger, "Failed to execute"; "error" => %err);
                let _ = service.events.send(Event::Error(err.clone()));
                service.outcome_tx.send_modify(|outcome| {
                    outcome.finished = true;
                    outcome.error = Some(err.to_string());
                });
            } else {
                service
                    .outcome_tx
                    .send_modify(|outcome| outcome.finished = true);
            }
        });
    }
}

fn event_response(event: &Event) -> ProgressResponse {
    match event {
        Event::Progress(entry) => ProgressResponse {
            message: entry.message.clone(),
            errors: vec![],
            complete: false,
        },
        Event::Error(err) => ProgressResponse {
            message: String::new(),
            errors: vec![crate::rpc::proto::Error {
                message: err.to_string(),
            }],
            complete: false,
        },
        Event::Completed(entry) => ProgressResponse {
            message: entry.message.clone(),
            errors: vec![],
            complete: true,
        },
    }
}

#[tonic::async_trait]
impl Installer for Arc<InstallService> {
    type ExecuteStream = ReceiverStream<std::result::Result<ProgressResponse, Status>>;

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> std::result::Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        // All calls after the first attach to the run already in flight.
        let mut events = self.events.subscribe();
        let mut outcome_rx = self.outcome_tx.subscribe();
        self.ensure_started(req);

        let (tx, rx) = mpsc::channel(32);
        let parent_cancel = self.parent_cancel.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            // A late joiner may attach after the operation finished.
            if outcome_rx.borrow().finished {
                let outcome = outcome_rx.borrow().clone();
                let response = ProgressResponse {
                    message: String::new(),
                    errors: outcome
                        .error
                        .map(|message| vec![crate::rpc::proto::Error { message }])
                        .unwrap_or_default(),
                    complete: true,
                };
                let _ = tx.send(Ok(response)).await;
                return;
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            let response = event_response(&event);
                            let complete = response.complete;
                            if tx.send(Ok(response)).await.is_err() {
                                return;
                            }
                            if complete {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    result = outcome_rx.changed() => {
                        if result.is_err() || outcome_rx.borrow().finished {
                            let outcome = outcome_rx.borrow().clone();
                            let response = ProgressResponse {
                                message: String::new(),
                                errors: outcome
                                    .error
                                    .map(|message| vec![crate::rpc::proto::Error { message }])
                                    .unwrap_or_default(),
                                complete: true,
                            };
                            let _ = tx.send(Ok(response)).await;
                            return;
                        }
                    }
                    _ = parent_cancel.cancelled() => {
                        let _ = tx
                            .send(Err(Status::cancelled("service is shutting down")))
                            .await;
                        return;
                    }
                    _ = cancel.cancelled() => {
                        // Clean exit.
                        return;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> std::result::Result<Response<ShutdownResponse>, Status> {
        info!(self.logger, "Shutdown requested");
        if let Err(err) = self.executor.stop().await {
            warn!(self.logger, "Failed to stop executor"; "error" => %err);
        }
        self.cancel.cancel();
        Ok(Response::new(ShutdownResponse {}))
    }

    async fn uninstall(
        &self,
        _request: Request<UninstallRequest>,
    ) -> std::result::Result<Response<UninstallResponse>, Status> {
        // TODO: abort the operation and clean up local state
        Ok(Response::new(UninstallResponse {}))
    }
}

/// Handle to the serving loop on the control socket.
pub struct ServiceHandle {
    pub socket_path: PathBuf,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl ServiceHandle {
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(Error::internal(format!("service task failed: {}", err))),
        }
    }
}

/// Binds the control socket and serves the installer service until the
/// local context is canceled.
pub async fn serve_uds(
    service: Arc<InstallService>,
    socket_path: &Path,
) -> Result<ServiceHandle> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Remove a stale socket from a previous run.
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let listener = UnixListener::bind(socket_path)?;
    let cancel = service.cancel.clone();
    let path = socket_path.to_path_buf();
    let task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(InstallerServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                cancel.cancelled().await;
            })
            .await
            .map_err(Error::from)
    });
    Ok(ServiceHandle {
        socket_path: socket_path.to_path_buf(),
        task,
    })
}

/// Connects to a service over its control socket.
pub async fn connect_uds(socket_path: impl Into<PathBuf>) -> Result<InstallerClient<Channel>> {
    let socket_path: Arc<Path> = socket_path.into().into();
    // The URI is required by the endpoint but never resolved; the connector
    // dials the domain socket.
    let channel = Endpoint::try_from("http://localhost")
        .map_err(|err| Error::internal(format!("endpoint: {}", err)))?
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(socket_path.as_ref()).await?;
                Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(InstallerClient::new(channel))
}
