//! Inline sending.
//!
//! An [`InlineSender`] pushes a single-envelope batch through the wire
//! protocol and awaits the outcome, surfacing transport errors directly
//! to the caller instead of routing them through durability recovery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use url::Url;

use super::{OutgoingMessageBatch, Sender, SenderCallback, SenderProtocol};
use crate::{envelope::Envelope, error::Error};

pub struct InlineSender {
    destination: Url,
    protocol: Arc<dyn SenderProtocol>,
}

impl InlineSender {
    pub fn new(destination: Url, protocol: Arc<dyn SenderProtocol>) -> Self {
        Self {
            destination,
            protocol,
        }
    }
}

#[async_trait]
impl Sender for InlineSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        let capture = CapturingCallback::default();
        let batch = OutgoingMessageBatch::new(self.destination.clone(), vec![envelope]);

        self.protocol.send_batch(&capture, batch).await;

        let outcome = capture.outcome.lock().await.take();
        match outcome {
            Some(Outcome::Success) => Ok(()),
            Some(Outcome::ProcessingFailure) => Err(Error::transport(
                self.destination.to_string(),
                "transport reported a processing failure",
            )),
            Some(Outcome::SerializationFailure) => Err(Error::Serialization {
                message_type: String::new(),
                source: serde_json::Error::io(std::io::Error::other(
                    "transport could not serialize the envelope",
                )),
            }),
            Some(Outcome::QueueMissing) => Err(Error::QueueMissing {
                uri: self.destination.to_string(),
            }),
            Some(Outcome::TimedOut) => Err(Error::SendTimeout {
                uri: self.destination.to_string(),
            }),
            Some(Outcome::Latched) => Err(Error::SenderLatched {
                uri: self.destination.to_string(),
            }),
            // a protocol that reports nothing is a bug; fail loudly
            None => Err(Error::transport(
                self.destination.to_string(),
                "protocol reported no outcome",
            )),
        }
    }

    async fn ping(&self) -> bool {
        let probe = Envelope::ping(self.destination.clone());
        self.send(probe).await.is_ok()
    }
}

enum Outcome {
    Success,
    ProcessingFailure,
    SerializationFailure,
    QueueMissing,
    TimedOut,
    Latched,
}

#[derive(Default)]
struct CapturingCallback {
    outcome: Mutex<Option<Outcome>>,
}

impl CapturingCallback {
    async fn record(&self, outcome: Outcome) {
        *self.outcome.lock().await = Some(outcome);
    }
}

#[async_trait]
impl SenderCallback for CapturingCallback {
    async fn mark_successful(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::Success).await;
    }

    async fn mark_processing_failure(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::ProcessingFailure).await;
    }

    async fn mark_serialization_failure(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::SerializationFailure).await;
    }

    async fn mark_queue_missing(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::QueueMissing).await;
    }

    async fn mark_timed_out(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::TimedOut).await;
    }

    async fn mark_latched(&self, _batch: &OutgoingMessageBatch) {
        self.record(Outcome::Latched).await;
    }
}
