use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mooring::bus::{self, Event, EventSender};
use mooring::error::{Error, Result};
use mooring::install::service::{connect_uds, serve_uds, InstallService, OperationExecutor};
use mooring::logging;
use mooring::ops::ProgressEntry;
use mooring::rpc::proto::{ExecuteRequest, ProgressResponse, ShutdownRequest};

/// Executor that counts invocations and publishes a terminal event.
struct CountingExecutor {
    count: AtomicUsize,
    progress: EventSender,
    fail: bool,
}

#[tonic::async_trait]
impl OperationExecutor for CountingExecutor {
    async fn execute(&self, _req: ExecuteRequest) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.fail {
            return Err(Error::aborted("preflight checks failed"));
        }
        self.progress.send(Event::Progress(ProgressEntry {
            operation_id: "op-1".to_string(),
            completion: 50,
            message: "halfway there".to_string(),
            created: chrono::Utc::now(),
        }));
        self.progress.send(Event::Completed(ProgressEntry {
            operation_id: "op-1".to_string(),
            completion: 100,
            message: "Operation has completed".to_string(),
            created: chrono::Utc::now(),
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

struct Setup {
    executor: Arc<CountingExecutor>,
    socket_path: std::path::PathBuf,
    _state_dir: tempfile::TempDir,
}

async fn setup(fail: bool) -> Setup {
    let state_dir = tempfile::tempdir().unwrap();
    let socket_path = state_dir.path().join("installer.sock");
    let parent_cancel = CancellationToken::new();
    let cancel = parent_cancel.child_token();
    let (progress, events_rx) = bus::channel(100, cancel.clone(), logging::discard());

    let executor = Arc::new(CountingExecutor {
        count: AtomicUsize::new(0),
        progress,
        fail,
    });
    let service = InstallService::new(
        executor.clone(),
        events_rx,
        parent_cancel,
        cancel,
        logging::discard(),
    );
    serve_uds(service, &socket_path).await.unwrap();
    Setup {
        executor,
        socket_path,
        _state_dir: state_dir,
    }
}

async fn drain(
    stream: &mut tonic::Streaming<ProgressResponse>,
) -> (Vec<String>, Vec<String>, bool) {
    let mut messages = Vec::new();
    let mut errors = Vec::new();
    let mut complete = false;
    while let Some(response) = stream.message().await.unwrap() {
        if !response.message.is_empty() {
            messages.push(response.message.clone());
        }
        for error in &response.errors {
            errors.push(error.message.clone());
        }
        if response.complete {
            complete = true;
            break;
        }
    }
    (messages, errors, complete)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_execute_runs_once() {
    let setup = setup(false).await;

    let mut first = connect_uds(&setup.socket_path).await.unwrap();
    let mut second = connect_uds(&setup.socket_path).await.unwrap();

    // Two concurrent Execute calls: the second attaches to the same run.
    let (one, two) = tokio::join!(
        first.execute(ExecuteRequest::default()),
        second.execute(ExecuteRequest::default()),
    );
    let mut stream_one = one.unwrap().into_inner();
    let mut stream_two = two.unwrap().into_inner();

    let ((_, _, done_one), (_, _, done_two)) =
        tokio::join!(drain(&mut stream_one), drain(&mut stream_two));
    assert!(done_one);
    assert!(done_two);
    assert_eq!(setup.executor.count.load(Ordering::SeqCst), 1);

    // A late joiner receives the terminal result immediately.
    let mut third = connect_uds(&setup.socket_path).await.unwrap();
    let mut stream = third
        .execute(ExecuteRequest::default())
        .await
        .unwrap()
        .into_inner();
    let (_, _, done) = drain(&mut stream).await;
    assert!(done);
    assert_eq!(setup.executor.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_progress_messages_reach_the_client() {
    let setup = setup(false).await;
    let mut client = connect_uds(&setup.socket_path).await.unwrap();
    let mut stream = client
        .execute(ExecuteRequest::default())
        .await
        .unwrap()
        .into_inner();
    let (messages, errors, complete) = drain(&mut stream).await;
    assert!(complete);
    assert!(errors.is_empty());
    assert!(messages.iter().any(|m| m == "halfway there"));
}

#[tokio::test]
async fn test_errors_are_streamed_and_stream_closes() {
    let setup = setup(true).await;
    let mut client = connect_uds(&setup.socket_path).await.unwrap();
    let mut stream = client
        .execute(ExecuteRequest::default())
        .await
        .unwrap()
        .into_inner();
    let (_messages, errors, complete) = drain(&mut stream).await;
    // The failure is forwarded and the stream closes normally.
    assert!(complete);
    assert!(errors.iter().any(|e| e.contains("preflight checks failed")));

    // The service stays alive for inspection until Shutdown.
    let mut again = connect_uds(&setup.socket_path).await.unwrap();
    let mut stream = again
        .execute(ExecuteRequest::default())
        .await
        .unwrap()
        .into_inner();
    let (_messages, errors, complete) = drain(&mut stream).await;
    assert!(complete);
    assert!(!errors.is_empty());
    assert_eq!(setup.executor.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_closes_cleanly() {
    let setup = setup(false).await;
    let mut client = connect_uds(&setup.socket_path).await.unwrap();
    let mut stream = client
        .execute(ExecuteRequest::default())
        .await
        .unwrap()
        .into_inner();
    let (_, _, complete) = drain(&mut stream).await;
    assert!(complete);

    client.shutdown(ShutdownRequest {}).await.unwrap();
    // After shutdown the socket no longer accepts calls.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let result = connect_uds(&setup.socket_path).await;
    if let Ok(mut client) = result {
        assert!(client.execute(ExecuteRequest::default()).await.is_err());
    }
}
