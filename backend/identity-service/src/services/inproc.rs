/// In-process event bus for single-process deployments
///
/// `ChannelSink` enqueues onto an unbounded tokio channel; the paired
/// `ProjectionWorker` applies messages one at a time in publish order.
/// Transient handler failures are retried with backoff before the next
/// message is taken.
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use super::projection::{ProjectionHandler, RetryConfig};
use crate::domain::{EventSink, PublishError};

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl EventSink for ChannelSink {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.tx
            .send(BusMessage {
                subject: subject.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| PublishError::Closed)
    }
}

pub struct ProjectionWorker {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    handler: ProjectionHandler,
    retry: RetryConfig,
}

/// Build a connected sink and worker
pub fn channel(handler: ProjectionHandler) -> (ChannelSink, ProjectionWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = ProjectionWorker {
        rx,
        handler,
        retry: RetryConfig::default(),
    };
    (ChannelSink { tx }, worker)
}

impl ProjectionWorker {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Apply messages until every sink is dropped or `shutdown` flips to
    /// `true`. Messages already queued at shutdown are still applied.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!("Starting in-process projection worker");
        let mut applied = 0;

        loop {
            tokio::select! {
                biased;

                message = self.rx.recv() => match message {
                    Some(message) => applied += self.apply(message).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.rx.close();
                        while let Some(message) = self.rx.recv().await {
                            applied += self.apply(message).await;
                        }
                        break;
                    }
                }
            }
        }

        info!(applied, "In-process projection worker stopped");
        applied
    }

    async fn apply(&self, message: BusMessage) -> usize {
        match self
            .handler
            .handle_message_with_retry(&message.subject, &message.payload, &self.retry)
            .await
        {
            Ok(()) => 1,
            Err(e) => {
                error!(subject = %message.subject, "Failed to apply event: {}", e);
                0
            }
        }
    }
}
