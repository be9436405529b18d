//! The durability agent.
//!
//! A set of independent polling loops that keep the durable store
//! converging: stale-ownership recovery, unowned work pickup, scheduled
//! promotion, retention expiry and node heartbeating. Every loop is
//! self-healing (an error is logged, the loop keeps polling), stops on
//! the shared cancellation token, and jitters its interval so multiple
//! nodes sharing one database do not poll in lockstep.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::Error,
    receiver::ExecutionPipeline,
    store::sqlite::SqliteStore,
    transport::{EndpointRegistry, Receiver},
};

pub struct DurabilityAgent {
    store: Arc<SqliteStore>,
    pipeline: Arc<ExecutionPipeline>,
    endpoints: Arc<EndpointRegistry>,
    config: Config,
    cancel: CancellationToken,
}

impl DurabilityAgent {
    pub fn new(
        store: Arc<SqliteStore>,
        pipeline: Arc<ExecutionPipeline>,
        endpoints: Arc<EndpointRegistry>,
        config: Config,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            pipeline,
            endpoints,
            config,
            cancel,
        }
    }

    /// Spawns every loop and returns the handles. The loops run until
    /// the cancellation token fires; await the handles before closing
    /// the store to know no loop still touches it.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().scheduled_loop()),
            tokio::spawn(self.clone().recovery_loop()),
            tokio::spawn(self.clone().expiry_loop()),
            tokio::spawn(self.heartbeat_loop()),
        ]
    }

    /// Sleeps one jittered interval or returns `false` on cancellation.
    async fn pause(&self, interval: Duration) -> bool {
        let jitter = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(interval + Duration::from_millis(jitter)) => true,
        }
    }

    /// Promotes due scheduled envelopes and feeds them to the pipeline.
    #[tracing::instrument(skip_all)]
    async fn scheduled_loop(self: Arc<Self>) {
        let interval = self.config.scheduled_poll_interval();
        while self.pause(interval).await {
            if let Err(error) = self.promote_scheduled().await {
                tracing::error!(%error, "scheduled promotion failed");
            }
        }
    }

    async fn promote_scheduled(&self) -> Result<(), Error> {
        let batch = self.config.recovery_batch_size();
        loop {
            let due = self
                .store
                .promote_due_scheduled(chrono::Utc::now(), batch)
                .await?;
            if due.is_empty() {
                return Ok(());
            }
            let count = due.len();
            tracing::debug!(count, "promoted scheduled envelopes");
            self.pipeline.received(due).await?;
        }
    }

    /// Recovers work nobody is making progress on: bumps stale owned
    /// incoming rows back to unowned, then claims unowned incoming and
    /// outgoing work for this node.
    #[tracing::instrument(skip_all)]
    async fn recovery_loop(self: Arc<Self>) {
        let interval = self.config.recovery_poll_interval();
        while self.pause(interval).await {
            if let Err(error) = self.recover_incoming().await {
                tracing::error!(%error, "incoming recovery failed");
            }
            if let Err(error) = self.recover_outgoing().await {
                tracing::error!(%error, "outgoing recovery failed");
            }
        }
    }

    async fn recover_incoming(&self) -> Result<(), Error> {
        let now = chrono::Utc::now();
        let bumped = self
            .store
            .bump_stale_incoming(now, self.config.staleness_window())
            .await?;
        if bumped > 0 {
            tracing::info!(bumped, "released stale incoming envelopes");
        }

        let claimed = self
            .store
            .claim_unowned_incoming(self.config.recovery_batch_size())
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }
        tracing::info!(count = claimed.len(), "recovered incoming envelopes");
        self.pipeline.received(claimed).await
    }

    /// Redelivers committed-but-unsent outgoing envelopes. A successful
    /// send deletes the row; a failed one releases ownership so the next
    /// pass (on any node) tries again. Duplicates are possible by
    /// design; the inbox on the receiving side deduplicates.
    async fn recover_outgoing(&self) -> Result<(), Error> {
        let claimed = self
            .store
            .claim_unowned_outgoing(self.config.recovery_batch_size())
            .await?;

        for envelope in claimed {
            let id = envelope.id;
            let uri = match &envelope.destination {
                Some(uri) => uri.clone(),
                None => {
                    tracing::error!(%id, "outgoing envelope has no destination, dropping");
                    self.store.delete_outgoing(&[id]).await?;
                    continue;
                }
            };

            let sent = match self.endpoints.get(&uri) {
                Some(endpoint) => endpoint.sender.send(envelope).await,
                None => Err(Error::unknown_endpoint(uri.to_string())),
            };

            match sent {
                Ok(()) => self.store.delete_outgoing(&[id]).await?,
                Err(error) => {
                    tracing::warn!(%error, %id, destination = %uri, "outgoing redelivery failed");
                    self.store.increment_outgoing_attempts(&[id]).await?;
                    self.store.release_outgoing(&[id]).await?;
                }
            }
        }
        Ok(())
    }

    /// Deletes handled rows past retention, expired outgoing envelopes
    /// and old dead letters.
    #[tracing::instrument(skip_all)]
    async fn expiry_loop(self: Arc<Self>) {
        let interval = self.config.expiry_poll_interval();
        while self.pause(interval).await {
            let now = chrono::Utc::now();

            match self
                .store
                .delete_expired(now, self.config.dead_letter_retention())
                .await
            {
                Ok((0, 0)) => {}
                Ok((handled, dead)) => {
                    tracing::info!(handled, dead, "expired persisted envelopes");
                }
                Err(error) => tracing::error!(%error, "expiry sweep failed"),
            }

            match self.store.delete_expired_outgoing(now).await {
                Ok(0) => {}
                Ok(dropped) => tracing::info!(dropped, "dropped expired outgoing envelopes"),
                Err(error) => tracing::error!(%error, "outgoing expiry sweep failed"),
            }
        }
    }

    /// Records this node's heartbeat and reassigns work owned by nodes
    /// that stopped heartbeating.
    #[tracing::instrument(skip_all)]
    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval();
        loop {
            let now = chrono::Utc::now();
            if let Err(error) = self.store.record_heartbeat(None, now).await {
                tracing::error!(%error, "heartbeat failed");
            }

            match self
                .store
                .reassign_dormant_nodes(now, self.config.node_timeout())
                .await
            {
                Ok(0) => {}
                Ok(released) => {
                    tracing::warn!(released, "reassigned work from dormant nodes");
                }
                Err(error) => tracing::error!(%error, "dormant node reassignment failed"),
            }

            if !self.pause(interval).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        continuation::FailurePolicies,
        envelope::Envelope,
        handler::HandlerRegistry,
        routing::MessageRouter,
        scheduled::InMemoryScheduler,
        serialization::SerializerRegistry,
        store::{Admin, Inbox},
        transport::{local, Endpoint, EndpointMode, Listener, Receiver},
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use url::Url;

    struct Fixture {
        agent: Arc<DurabilityAgent>,
        store: Arc<SqliteStore>,
        handlers: Arc<HandlerRegistry>,
        endpoints: Arc<EndpointRegistry>,
        cancel: CancellationToken,
        #[allow(unused)]
        tmpdir: TempDir,
    }

    async fn fixture() -> Fixture {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: Some(
                tmpdir
                    .path()
                    .join("ironbus.db")
                    .to_string_lossy()
                    .to_string(),
            ),
            scheduled_poll_ms: Some(20),
            recovery_poll_ms: Some(20),
            expiry_poll_ms: Some(20),
            heartbeat_ms: Some(20),
            staleness_ms: Some(50),
            ..Default::default()
        };
        let store = Arc::new(SqliteStore::connect(&config).await.unwrap());

        let endpoints = Arc::new(EndpointRegistry::default());
        let serializers = Arc::new(SerializerRegistry::default());
        let handlers = Arc::new(HandlerRegistry::default());
        let scheduler = Arc::new(InMemoryScheduler::new());
        let router = Arc::new(MessageRouter::new(
            endpoints.clone(),
            serializers.clone(),
            "local://scheduled".parse().unwrap(),
        ));

        let pipeline = Arc::new(
            ExecutionPipeline::builder()
                .store(store.clone())
                .handlers(handlers.clone())
                .serializers(serializers)
                .router(router)
                .endpoints(endpoints.clone())
                .scheduler(scheduler)
                .policies(FailurePolicies::default())
                .build(),
        );

        let cancel = CancellationToken::new();
        let agent = Arc::new(DurabilityAgent::new(
            store.clone(),
            pipeline,
            endpoints.clone(),
            config,
            cancel.clone(),
        ));

        Fixture {
            agent,
            store,
            handlers,
            endpoints,
            cancel,
            tmpdir,
        }
    }

    #[tokio::test]
    async fn due_scheduled_envelopes_are_promoted_and_executed() {
        let fx = fixture().await;
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        fx.handlers.register_fn("orders.place", move |_ctx| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let envelope = Envelope::new("orders.place", "{}");
        fx.store
            .schedule_execution(&envelope, chrono::Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        fx.agent.clone().start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.cancel.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let counts = fx.store.fetch_counts().await.unwrap();
        assert_eq!(counts.scheduled, 0);
        assert_eq!(counts.handled, 1);
    }

    #[tokio::test]
    async fn stale_incoming_work_is_redelivered_at_least_once() {
        let fx = fixture().await;
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        fx.handlers.register_fn("orders.place", move |_ctx| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // owned by this node but never progressed; staleness is 50ms
        let envelope = Envelope::new("orders.place", "{}");
        fx.store
            .store_incoming(std::slice::from_ref(&envelope))
            .await
            .unwrap();

        fx.agent.clone().start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        fx.cancel.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.fetch_counts().await.unwrap().handled, 1);
    }

    #[tokio::test]
    async fn unsent_outgoing_envelopes_are_redelivered() {
        let fx = fixture().await;

        let address: Url = "local://downstream".parse().unwrap();
        let (sender, listener) = local::channel(address.clone());
        fx.endpoints.register(Arc::new(Endpoint::new(
            address.clone(),
            EndpointMode::Durable,
            Arc::new(sender),
        )));

        // a committed outgoing row whose send never happened
        let mut envelope = Envelope::new("orders.place", "{}");
        envelope.destination = Some(address);
        fx.store
            .store_outgoing(std::slice::from_ref(&envelope))
            .await
            .unwrap();
        fx.store.release_outgoing(&[envelope.id]).await.unwrap();

        fx.agent.clone().start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.cancel.cancel();

        // the row is gone and the envelope reached the transport
        assert_eq!(fx.store.fetch_counts().await.unwrap().outgoing, 0);

        struct Collect(std::sync::Mutex<usize>);
        #[async_trait::async_trait]
        impl Receiver for Collect {
            async fn received(&self, envelopes: Vec<Envelope>) -> Result<(), Error> {
                *self.0.lock().unwrap() += envelopes.len();
                Ok(())
            }
        }
        let collector = Collect(std::sync::Mutex::new(0));
        listener.stop().await.unwrap();
        listener.run(&collector, CancellationToken::new()).await;
        assert_eq!(*collector.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_loops_finish_before_the_pool_closes() {
        let fx = fixture().await;
        let tasks = fx.agent.clone().start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.cancel.cancel();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("loop did not stop on cancellation")
                .unwrap();
        }

        // no loop holds the store anymore
        fx.store.pool().close().await;
    }
}
