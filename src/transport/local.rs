//! In-process queue transport.
//!
//! The default transport for a single-process deployment and the
//! workhorse of the test suite. A [`LocalChannel`] pairs a sender that
//! pushes into an unbounded queue with a listener loop that drains it
//! into a [`Receiver`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Listener, Receiver, Sender};
use crate::{envelope::Envelope, error::Error};

pub fn channel(address: Url) -> (LocalSender, LocalListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LocalSender {
            destination: address.clone(),
            tx: tx.clone(),
            latched: AtomicBool::new(false),
        },
        LocalListener {
            address,
            tx,
            rx: Mutex::new(Some(rx)),
            stopping: CancellationToken::new(),
        },
    )
}

pub struct LocalSender {
    destination: Url,
    tx: mpsc::UnboundedSender<Envelope>,
    latched: AtomicBool,
}

impl LocalSender {
    pub fn latch(&self) {
        self.latched.store(true, Ordering::SeqCst);
    }

    pub fn unlatch(&self) {
        self.latched.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sender for LocalSender {
    fn destination(&self) -> &Url {
        &self.destination
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        if self.latched.load(Ordering::SeqCst) {
            return Err(Error::SenderLatched {
                uri: self.destination.to_string(),
            });
        }
        self.tx
            .send(envelope)
            .map_err(|_| Error::transport(self.destination.to_string(), "listener is gone"))
    }

    async fn ping(&self) -> bool {
        !self.tx.is_closed() && !self.latched.load(Ordering::SeqCst)
    }
}

pub struct LocalListener {
    address: Url,
    /// Kept so `defer` can requeue without going through the sender.
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    stopping: CancellationToken,
}

impl LocalListener {
    /// Receive loop: forwards envelopes to the receiver one at a time,
    /// preserving intake order. Runs until stop/dispose or the external
    /// cancellation fires; on stop, already-queued envelopes are drained
    /// first.
    pub async fn run(&self, receiver: &dyn Receiver, cancel: CancellationToken) {
        let mut rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            // a second run would steal the loop; refuse
            None => return,
        };

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = self.stopping.cancelled() => {
                    // graceful stop: drain whatever is already queued
                    while let Ok(envelope) = rx.try_recv() {
                        if let Err(error) = receiver.received(vec![envelope]).await {
                            tracing::error!(%error, address = %self.address, "listener drain failed");
                        }
                    }
                    break;
                }
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if let Err(error) = receiver.received(vec![envelope]).await {
                                tracing::error!(%error, address = %self.address, "receiver failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Listener for LocalListener {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn complete(&self, _envelope: &Envelope) -> Result<(), Error> {
        // consuming from the channel already removed the envelope
        Ok(())
    }

    async fn defer(&self, envelope: &Envelope) -> Result<(), Error> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| Error::transport(self.address.to_string(), "listener is gone"))
    }

    async fn stop(&self) -> Result<(), Error> {
        self.stopping.cancel();
        Ok(())
    }

    async fn dispose(&self) -> Result<(), Error> {
        self.stopping.cancel();
        self.rx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Collector {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Receiver for Collector {
        async fn received(&self, envelopes: Vec<Envelope>) -> Result<(), Error> {
            let mut seen = self.seen.lock().unwrap();
            for envelope in envelopes {
                seen.push(envelope.message_type);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let (sender, listener) = channel("local://orders".parse().unwrap());
        let collector = Collector {
            seen: StdMutex::new(Vec::new()),
        };

        for i in 0..3 {
            sender
                .send(Envelope::new(format!("orders.{i}"), "{}"))
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        listener.stop().await.unwrap();
        listener.run(&collector, cancel).await;

        assert_eq!(
            *collector.seen.lock().unwrap(),
            vec!["orders.0", "orders.1", "orders.2"]
        );
    }

    #[tokio::test]
    async fn latched_sender_rejects_work_and_fails_ping() {
        let (sender, _listener) = channel("local://orders".parse().unwrap());

        assert!(sender.ping().await);

        sender.latch();
        assert!(!sender.ping().await);
        assert!(matches!(
            sender.send(Envelope::new("orders.placed", "{}")).await,
            Err(Error::SenderLatched { .. })
        ));

        sender.unlatch();
        assert!(sender.ping().await);
    }

    #[tokio::test]
    async fn ping_fails_once_the_listener_is_disposed() {
        let (sender, listener) = channel("local://orders".parse().unwrap());
        assert!(sender.ping().await);

        listener.dispose().await.unwrap();
        assert!(!sender.ping().await);
    }
}
