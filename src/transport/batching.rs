//! Batched sending.
//!
//! Envelopes destined for the same endpoint within a short window are
//! coalesced into one [`OutgoingMessageBatch`] to amortize round-trips.
//! The worker owns the accumulation loop; outcomes flow back through the
//! [`SenderCallback`] so partial failures stay decomposable.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{OutgoingMessageBatch, Sender, SenderCallback, SenderProtocol};
use crate::{envelope::Envelope, error::Error};

const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BATCH: usize = 100;

pub struct BatchedSender {
    destination: Url,
    tx: mpsc::UnboundedSender<Envelope>,
    latched: Arc<AtomicBool>,
    native_scheduling: bool,
}

impl BatchedSender {
    /// Spawns the accumulation worker and returns the sender half.
    pub fn start(
        destination: Url,
        protocol: Arc<dyn SenderProtocol>,
        callback: Arc<dyn SenderCallback>,
        cancel: CancellationToken,
    ) -> Self {
        Self::start_with(
            destination,
            protocol,
            callback,
            cancel,
            DEFAULT_FLUSH_WINDOW,
            DEFAULT_MAX_BATCH,
        )
    }

    pub fn start_with(
        destination: Url,
        protocol: Arc<dyn SenderProtocol>,
        callback: Arc<dyn SenderCallback>,
        cancel: CancellationToken,
        flush_window: Duration,
        max_batch: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let latched = Arc::new(AtomicBool::new(false));

        let worker = BatchWorker {
            destination: destination.clone(),
            protocol,
            callback,
            rx,
            cancel,
            flush_window,
            max_batch,
            latched: latched.clone(),
        };
        tokio::spawn(worker.run());

        Self {
            destination,
            tx,
            latched,
            native_scheduling: false,
        }
    }

    pub fn with_native_scheduling(mut self) -> Self {
        self.native_scheduling = true;
        self
    }

    pub fn latch(&self) {
        self.latched.store(true, Ordering::SeqCst);
    }

    pub fn unlatch(&self) {
        self.latched.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sender for BatchedSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    fn supports_native_scheduled_send(&self) -> bool {
        self.native_scheduling
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        if self.latched.load(Ordering::SeqCst) {
            return Err(Error::SenderLatched {
                uri: self.destination.to_string(),
            });
        }
        self.tx
            .send(envelope)
            .map_err(|_| Error::transport(self.destination.to_string(), "sender worker is gone"))
    }

    async fn ping(&self) -> bool {
        !self.tx.is_closed() && !self.latched.load(Ordering::SeqCst)
    }
}

struct BatchWorker {
    destination: Url,
    protocol: Arc<dyn SenderProtocol>,
    callback: Arc<dyn SenderCallback>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
    flush_window: Duration,
    max_batch: usize,
    latched: Arc<AtomicBool>,
}

impl BatchWorker {
    /// Accumulates envelopes until the flush window elapses or the batch
    /// is full, then hands one batch to the protocol. On cancellation,
    /// in-flight work is flushed before the loop exits.
    async fn run(mut self) {
        let mut pending: Vec<Envelope> = Vec::new();
        let mut window = tokio::time::interval(self.flush_window);
        window.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // drain whatever is queued, then flush once
                    while let Ok(envelope) = self.rx.try_recv() {
                        pending.push(envelope);
                    }
                    self.flush(&mut pending).await;
                    return;
                }
                envelope = self.rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            pending.push(envelope);
                            if pending.len() >= self.max_batch {
                                self.flush(&mut pending).await;
                            }
                        }
                        None => {
                            self.flush(&mut pending).await;
                            return;
                        }
                    }
                }
                _ = window.tick() => {
                    self.flush(&mut pending).await;
                }
            }
        }
    }

    async fn flush(&self, pending: &mut Vec<Envelope>) {
        if pending.is_empty() {
            return;
        }

        let batch = OutgoingMessageBatch::new(self.destination.clone(), std::mem::take(pending));

        if self.latched.load(Ordering::SeqCst) {
            self.callback.mark_latched(&batch).await;
            return;
        }

        tracing::debug!(
            destination = %self.destination,
            size = batch.len(),
            "flushing outgoing batch"
        );
        self.protocol.send_batch(self.callback.as_ref(), batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Protocol that accepts envelopes unless their group id is
    /// "reject", reporting the split through the callback.
    struct SelectiveProtocol;

    #[async_trait]
    impl SenderProtocol for SelectiveProtocol {
        async fn send_batch(&self, callback: &dyn SenderCallback, batch: OutgoingMessageBatch) {
            let rejected: Vec<Uuid> = batch
                .entries
                .iter()
                .filter(|e| e.envelope.group_id.as_deref() == Some("reject"))
                .map(|e| e.correlation_key)
                .collect();

            if rejected.is_empty() {
                callback.mark_successful(&batch).await;
                return;
            }

            let (failed, succeeded) = batch.split_by_keys(&rejected);
            if !succeeded.is_empty() {
                callback.mark_successful(&succeeded).await;
            }
            callback.mark_processing_failure(&failed).await;
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        successful: Mutex<Vec<String>>,
        failed: Mutex<Vec<String>>,
        latched: Mutex<usize>,
    }

    #[async_trait]
    impl SenderCallback for RecordingCallback {
        async fn mark_successful(&self, batch: &OutgoingMessageBatch) {
            self.successful
                .lock()
                .unwrap()
                .extend(batch.envelopes().map(|e| e.message_type.clone()));
        }

        async fn mark_processing_failure(&self, batch: &OutgoingMessageBatch) {
            self.failed
                .lock()
                .unwrap()
                .extend(batch.envelopes().map(|e| e.message_type.clone()));
        }

        async fn mark_serialization_failure(&self, _batch: &OutgoingMessageBatch) {}
        async fn mark_queue_missing(&self, _batch: &OutgoingMessageBatch) {}
        async fn mark_timed_out(&self, _batch: &OutgoingMessageBatch) {}

        async fn mark_latched(&self, batch: &OutgoingMessageBatch) {
            *self.latched.lock().unwrap() += batch.len();
        }
    }

    #[tokio::test]
    async fn partial_failure_is_isolated_per_envelope() {
        let callback = Arc::new(RecordingCallback::default());
        let cancel = CancellationToken::new();

        let sender = BatchedSender::start_with(
            "tcp://127.0.0.1:4000/orders".parse().unwrap(),
            Arc::new(SelectiveProtocol),
            callback.clone(),
            cancel.clone(),
            Duration::from_millis(5),
            100,
        );

        for i in 0..10 {
            let mut envelope = Envelope::new(format!("orders.{i}"), "{}");
            if [0, 3, 6].contains(&i) {
                envelope.group_id = Some("reject".into());
            }
            sender.send(envelope).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let successful = callback.successful.lock().unwrap().clone();
        let failed = callback.failed.lock().unwrap().clone();

        assert_eq!(successful.len(), 7);
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|t| ["orders.0", "orders.3", "orders.6"].contains(&t.as_str())));
    }

    #[tokio::test]
    async fn envelopes_flush_in_enqueue_order() {
        let callback = Arc::new(RecordingCallback::default());
        let cancel = CancellationToken::new();

        let sender = BatchedSender::start_with(
            "tcp://127.0.0.1:4000/orders".parse().unwrap(),
            Arc::new(SelectiveProtocol),
            callback.clone(),
            cancel.clone(),
            Duration::from_millis(5),
            100,
        );

        for i in 0..5 {
            sender
                .send(Envelope::new(format!("orders.{i}"), "{}"))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let successful = callback.successful.lock().unwrap().clone();
        assert_eq!(
            successful,
            vec!["orders.0", "orders.1", "orders.2", "orders.3", "orders.4"]
        );
    }

    #[tokio::test]
    async fn latched_batches_are_reported_not_sent() {
        let callback = Arc::new(RecordingCallback::default());
        let cancel = CancellationToken::new();

        let sender = BatchedSender::start_with(
            "tcp://127.0.0.1:4000/orders".parse().unwrap(),
            Arc::new(SelectiveProtocol),
            callback.clone(),
            cancel.clone(),
            Duration::from_millis(5),
            100,
        );

        sender
            .send(Envelope::new("orders.placed", "{}"))
            .await
            .unwrap();
        sender.latch();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            sender.send(Envelope::new("orders.placed", "{}")).await,
            Err(Error::SenderLatched { .. })
        ));
        assert_eq!(*callback.latched.lock().unwrap(), 1);
        assert!(callback.successful.lock().unwrap().is_empty());

        cancel.cancel();
    }
}
