//! Event bus carrying operation progress from the FSM to streaming clients.
//!
//! The bus is a bounded multi-producer / single-consumer channel. Producers
//! never block: when the consumer falls behind the event is dropped with a
//! warning. Progress is advisory; the authoritative state lives in the
//! operation store.

use slog::{warn, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::ops::ProgressEntry;

/// Default capacity of the event queue.
pub const DEFAULT_CAPACITY: usize = 100;

/// A single progress event streamed to clients.
#[derive(Clone, Debug)]
pub enum Event {
    /// Operation progress update
    Progress(ProgressEntry),
    /// An error surfaced by the operation
    Error(Error),
    /// Terminal progress entry; closes client streams
    Completed(ProgressEntry),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed(_))
    }
}

/// Producer half of the event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    logger: Logger,
}

/// Create a new event bus with the given capacity. The receiver is handed to
/// the service's stream fan-out loop.
pub fn channel(
    capacity: usize,
    cancel: CancellationToken,
    logger: Logger,
) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx, cancel, logger }, rx)
}

impl EventSender {
    /// Publish an event without blocking.
    ///
    /// Once the service context is canceled this is a successful no-op; a
    /// full queue drops the event.
    pub fn send(&self, event: Event) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(err) = self.tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(self.logger, "Failed to publish event"; "event" => ?event);
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Publish a plain progress message.
    pub fn send_message(&self, operation_id: &str, message: impl Into<String>) {
        self.send(Event::Progress(ProgressEntry {
            operation_id: operation_id.to_string(),
            completion: 0,
            message: message.into(),
            created: chrono::Utc::now(),
        }));
    }

    pub fn send_error(&self, err: Error) {
        self.send(Event::Error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_send_never_blocks_with_stalled_consumer() {
        let cancel = CancellationToken::new();
        let (bus, mut rx) = channel(DEFAULT_CAPACITY, cancel, logging::discard());

        // Consumer never reads while we produce.
        let start = Instant::now();
        for i in 0..10_000 {
            bus.send_message("op-1", format!("step {}", i));
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        // Once the consumer resumes, at most the queue capacity is delivered.
        drop(bus);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= DEFAULT_CAPACITY);
        assert!(received > 0);
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let cancel = CancellationToken::new();
        let (bus, mut rx) = channel(10, cancel, logging::discard());
        bus.send_message("op-1", "first");
        bus.send_message("op-1", "second");

        match rx.recv().await.unwrap() {
            Event::Progress(entry) => assert_eq!(entry.message, "first"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::Progress(entry) => assert_eq!(entry.message, "second"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_cancel_is_noop() {
        let cancel = CancellationToken::new();
        let (bus, mut rx) = channel(10, cancel.clone(), logging::discard());
        cancel.cancel();
        bus.send_message("op-1", "late");
        drop(bus);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_receiver_drop_is_noop() {
        let cancel = CancellationToken::new();
        let (bus, rx) = channel(10, cancel, logging::discard());
        drop(rx);
        // Does not panic or block.
        bus.send_message("op-1", "orphaned");
    }
}
