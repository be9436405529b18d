//! The inbound execution pipeline.
//!
//! Everything a listener (or the scheduler, or the durability agent)
//! hands the runtime flows through [`ExecutionPipeline`]: ping
//! acknowledgment, deliver-by expiry, scheduled deferral, inbox
//! bookkeeping, handler dispatch and the failure continuation machine.
//!
//! # Inline vs queued semantics
//!
//! Queued execution honors the full continuation machine. Inline
//! invocation (`invoke`) honors only `Retry` and `RetryWithCooldown`;
//! any other continuation propagates the failure to the caller, because
//! an awaiting caller wants the error, not a dead-lettered message it
//! cannot see.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    continuation::{Continuation, FailurePolicies, HandlerFailure},
    envelope::{Envelope, EnvelopeStatus, DEFERRED_DESTINATION_HEADER},
    error::Error,
    handler::{HandlerContext, HandlerRegistry},
    routing::MessageRouter,
    scheduled::InMemoryScheduler,
    serialization::SerializerRegistry,
    store::{sqlite::SqliteStore, Inbox},
    transport::{EndpointMode, EndpointRegistry, Receiver},
};

pub struct ExecutionPipeline {
    /// Absent for purely in-memory deployments; durable bookkeeping is
    /// skipped when no store is configured.
    store: Option<Arc<SqliteStore>>,
    handlers: Arc<HandlerRegistry>,
    serializers: Arc<SerializerRegistry>,
    router: Arc<MessageRouter>,
    endpoints: Arc<EndpointRegistry>,
    scheduler: Arc<InMemoryScheduler>,
    policies: FailurePolicies,
    handled_retention: chrono::Duration,
}

#[bon::bon]
impl ExecutionPipeline {
    #[builder]
    pub fn new(
        store: Option<Arc<SqliteStore>>,
        handlers: Arc<HandlerRegistry>,
        serializers: Arc<SerializerRegistry>,
        router: Arc<MessageRouter>,
        endpoints: Arc<EndpointRegistry>,
        scheduler: Arc<InMemoryScheduler>,
        #[builder(default)] policies: FailurePolicies,
        #[builder(default = chrono::Duration::days(14))] handled_retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            serializers,
            router,
            endpoints,
            scheduler,
            policies,
            handled_retention,
        }
    }

    /// Queued execution with the full continuation machine.
    #[tracing::instrument(skip_all, fields(id = %envelope.id, message_type = %envelope.message_type))]
    pub async fn execute_queued(&self, mut envelope: Envelope) -> Result<(), Error> {
        let now = Utc::now();

        if envelope.is_ping() {
            tracing::debug!("acknowledged ping");
            return Ok(());
        }

        if envelope.is_expired(now) {
            tracing::info!(deliver_by = ?envelope.deliver_by, "discarding expired envelope");
            if let Some(store) = &self.store {
                store
                    .mark_incoming_handled(&envelope, now + self.handled_retention)
                    .await?;
            }
            return Ok(());
        }

        if let Some(time) = envelope.scheduled_time.filter(|_| envelope.is_scheduled_after(now)) {
            match &self.store {
                Some(store) => store.schedule_execution(&envelope, time).await?,
                None => self.scheduler.enqueue(envelope, time),
            }
            return Ok(());
        }

        // a deferred envelope is due; resume its routed destination
        // instead of executing locally
        if let Some(via) = envelope.headers.remove(DEFERRED_DESTINATION_HEADER) {
            let destination: url::Url = via
                .parse()
                .map_err(|_| Error::unknown_endpoint(via.clone()))?;
            tracing::debug!(%destination, "dispatching deferred envelope to its destination");
            envelope.destination = Some(destination);
            envelope.scheduled_time = None;
            if let Some(store) = &self.store {
                store
                    .mark_incoming_handled(&envelope, now + self.handled_retention)
                    .await?;
            }
            return self.dispatch_outgoing(vec![envelope]).await;
        }

        if let Some(store) = &self.store {
            if store.incoming_status(envelope.id).await? == Some(EnvelopeStatus::Handled) {
                tracing::debug!("dropping replayed envelope, already handled");
                return Ok(());
            }
            store.store_incoming(std::slice::from_ref(&envelope)).await?;
        }

        let handler = self.handlers.resolve(&envelope.message_type)?;

        loop {
            envelope.record_attempt();
            if let Some(store) = &self.store {
                store.increment_incoming_attempts(&envelope).await?;
            }

            let ctx = HandlerContext::new(
                envelope.clone(),
                self.serializers.clone(),
                self.router.clone(),
            );

            let failure = match handler(ctx.clone()).await {
                Ok(()) => return self.complete(&envelope, ctx.take_cascades()).await,
                Err(failure) => failure,
            };

            tracing::warn!(%failure, attempts = envelope.attempts, "handler failed");

            match self.policies.decide(&failure, envelope.attempts) {
                Continuation::Success => return self.complete(&envelope, Vec::new()).await,
                Continuation::Retry => continue,
                Continuation::RetryWithCooldown(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Continuation::ScheduleRetry(delay) => {
                    let due = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_default();
                    match &self.store {
                        Some(store) => store.schedule_execution(&envelope, due).await?,
                        None => self.scheduler.enqueue(envelope, due),
                    }
                    return Ok(());
                }
                Continuation::Requeue => {
                    // back of the local queue, redelivered by the
                    // scheduler loop with attempts preserved
                    self.scheduler.enqueue(envelope, Utc::now());
                    return Ok(());
                }
                Continuation::MoveToErrorQueue(failure) => {
                    return self.dead_letter(&envelope, &failure).await;
                }
                Continuation::Discard(callback) => {
                    if let Some(callback) = callback {
                        callback(&failure);
                    }
                    tracing::info!("discarding envelope after failure");
                    if let Some(store) = &self.store {
                        store
                            .mark_incoming_handled(&envelope, Utc::now() + self.handled_retention)
                            .await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Inline invocation: the caller awaits the result. Only `Retry` and
    /// `RetryWithCooldown` are honored; everything else propagates.
    pub async fn execute_inline(&self, mut envelope: Envelope) -> Result<(), Error> {
        if envelope.is_ping() {
            return Ok(());
        }

        let handler = self.handlers.resolve(&envelope.message_type)?;

        loop {
            envelope.record_attempt();

            let ctx = HandlerContext::new(
                envelope.clone(),
                self.serializers.clone(),
                self.router.clone(),
            );

            let failure = match handler(ctx.clone()).await {
                Ok(()) => {
                    self.dispatch_outgoing(ctx.take_cascades()).await?;
                    return Ok(());
                }
                Err(failure) => failure,
            };

            match self.policies.decide(&failure, envelope.attempts) {
                Continuation::Retry => continue,
                Continuation::RetryWithCooldown(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                _ => {
                    return Err(Error::HandlerFailure {
                        message_type: envelope.message_type,
                        message: failure.to_string(),
                    });
                }
            }
        }
    }

    async fn complete(&self, envelope: &Envelope, cascades: Vec<Envelope>) -> Result<(), Error> {
        if let Some(store) = &self.store {
            store
                .mark_incoming_handled(envelope, Utc::now() + self.handled_retention)
                .await?;
        }
        // cascades flush only after the inbox bookkeeping lands
        self.dispatch_outgoing(cascades).await
    }

    async fn dead_letter(&self, envelope: &Envelope, failure: &HandlerFailure) -> Result<(), Error> {
        tracing::error!(%failure, attempts = envelope.attempts, "moving envelope to dead letters");
        match &self.store {
            Some(store) => store.move_to_dead_letter(envelope, failure).await,
            None => Ok(()),
        }
    }

    /// Sends envelopes through their endpoints. A durable endpoint gets
    /// an outbox row before the send and loses it only once the sender
    /// accepted the envelope; a failed durable send releases the row for
    /// the recovery loop instead of surfacing the error.
    pub(crate) async fn dispatch_outgoing(&self, envelopes: Vec<Envelope>) -> Result<(), Error> {
        for envelope in envelopes {
            let uri = envelope
                .destination
                .clone()
                .ok_or_else(|| Error::no_routes(envelope.message_type.clone()))?;
            let endpoint = self.endpoints.resolve(&uri)?;

            let durable = endpoint.mode == EndpointMode::Durable && self.store.is_some();
            let id = envelope.id;

            if durable {
                if let Some(store) = &self.store {
                    store.store_outgoing(std::slice::from_ref(&envelope)).await?;
                }
            }

            match endpoint.sender.send(envelope).await {
                Ok(()) => {
                    if durable {
                        if let Some(store) = &self.store {
                            store.delete_outgoing(&[id]).await?;
                        }
                    }
                }
                Err(error) if durable => {
                    tracing::warn!(%error, %id, destination = %uri, "durable send failed, leaving for recovery");
                    if let Some(store) = &self.store {
                        store.release_outgoing(&[id]).await?;
                    }
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for ExecutionPipeline {
    async fn received(&self, envelopes: Vec<Envelope>) -> Result<(), Error> {
        for envelope in envelopes {
            self.execute_queued(envelope).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        continuation::FailureAction,
        routing::Message,
        store::Admin,
        transport::{local, Endpoint, Listener},
    };
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use url::Url;

    #[derive(Serialize, Deserialize)]
    struct PlaceOrder {
        sku: String,
    }

    impl Message for PlaceOrder {
        fn message_type() -> &'static str {
            "orders.place"
        }
    }

    struct Fixture {
        pipeline: ExecutionPipeline,
        store: Arc<SqliteStore>,
        handlers: Arc<HandlerRegistry>,
        scheduler: Arc<InMemoryScheduler>,
        endpoints: Arc<EndpointRegistry>,
        #[allow(unused)]
        tmpdir: TempDir,
    }

    async fn fixture(policies: FailurePolicies) -> Fixture {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = Config {
            db_path: Some(
                tmpdir
                    .path()
                    .join("ironbus.db")
                    .to_string_lossy()
                    .to_string(),
            ),
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

        let pipeline = ExecutionPipeline::builder()
            .store(store.clone())
            .handlers(handlers.clone())
            .serializers(serializers)
            .router(router)
            .endpoints(endpoints.clone())
            .scheduler(scheduler.clone())
            .policies(policies)
            .build();

        Fixture {
            pipeline,
            store,
            handlers,
            scheduler,
            endpoints,
            tmpdir,
        }
    }

    fn order_envelope() -> Envelope {
        Envelope::new("orders.place", r#"{"sku":"A-1"}"#)
    }

    fn counting_handler(fx: &Fixture, fail_first: u32) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        fx.handlers.register_fn("orders.place", move |_ctx| {
            let seen = seen.clone();
            async move {
                let call = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= fail_first {
                    Err(HandlerFailure::new("app::Transient", "not yet"))
                } else {
                    Ok(())
                }
            }
        });
        calls
    }

    #[tokio::test]
    async fn success_marks_the_envelope_handled() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, 0);

        fx.pipeline.execute_queued(order_envelope()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let counts = fx.store.fetch_counts().await.unwrap();
        assert_eq!(counts.handled, 1);
        assert_eq!(counts.incoming, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_move_the_envelope_to_dead_letters() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, u32::MAX);

        fx.pipeline.execute_queued(order_envelope()).await.unwrap();

        // default policy: three attempts total, then dead letter
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let counts = fx.store.fetch_counts().await.unwrap();
        assert_eq!(counts.dead_letter, 1);
        assert_eq!(counts.incoming, 0);
    }

    #[tokio::test]
    async fn already_handled_envelopes_are_not_reexecuted() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, 0);

        let envelope = order_envelope();
        fx.pipeline.execute_queued(envelope.clone()).await.unwrap();
        fx.pipeline.execute_queued(envelope).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_envelopes_never_reach_the_handler() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, 0);

        let mut envelope = order_envelope();
        envelope.deliver_by = Some(Utc::now() - chrono::Duration::seconds(1));
        fx.pipeline.execute_queued(envelope).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn future_scheduled_envelopes_are_deferred_to_the_store() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, 0);

        let mut envelope = order_envelope();
        envelope.scheduled_time = Some(Utc::now() + chrono::Duration::hours(1));
        fx.pipeline.execute_queued(envelope).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.store.fetch_counts().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn pings_are_acknowledged_without_a_handler() {
        let fx = fixture(FailurePolicies::default()).await;
        let ping = Envelope::ping("local://system".parse().unwrap());
        fx.pipeline.execute_queued(ping).await.unwrap();
    }

    #[tokio::test]
    async fn requeue_goes_to_the_back_of_the_local_queue() {
        let policies = FailurePolicies::new(FailureAction::Requeue { max_requeues: 3 });
        let fx = fixture(policies).await;
        let _calls = counting_handler(&fx, u32::MAX);

        fx.pipeline.execute_queued(order_envelope()).await.unwrap();

        // one failed attempt, then requeued instead of retried in place
        assert_eq!(fx.scheduler.len(), 1);
        let requeued = fx.scheduler.play_all();
        assert_eq!(requeued[0].attempts, 1);
    }

    #[tokio::test]
    async fn discard_completes_the_envelope_without_dead_lettering() {
        let delegated = Arc::new(AtomicU32::new(0));
        let seen = delegated.clone();
        let policies = FailurePolicies::new(FailureAction::DiscardAndDelegate(Arc::new(
            move |_failure: &HandlerFailure| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )));
        let fx = fixture(policies).await;
        let calls = counting_handler(&fx, u32::MAX);

        fx.pipeline.execute_queued(order_envelope()).await.unwrap();

        // one failed attempt, then the envelope is dropped on the floor
        // with the delegate told why
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(delegated.load(Ordering::SeqCst), 1);

        let counts = fx.store.fetch_counts().await.unwrap();
        assert_eq!(counts.dead_letter, 0);
        assert_eq!(counts.incoming, 0);
        assert_eq!(counts.handled, 1);
    }

    #[tokio::test]
    async fn inline_invocation_honors_retry_only() {
        let fx = fixture(FailurePolicies::default()).await;
        let calls = counting_handler(&fx, 2);

        // default retry policy: two failures then success, all inline
        fx.pipeline.execute_inline(order_envelope()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn inline_invocation_propagates_non_retry_continuations() {
        let policies = FailurePolicies::new(FailureAction::MoveToErrorQueue);
        let fx = fixture(policies).await;
        let calls = counting_handler(&fx, u32::MAX);

        let err = fx.pipeline.execute_inline(order_envelope()).await.unwrap_err();
        assert!(matches!(err, Error::HandlerFailure { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // inline failures never dead-letter; the caller got the error
        assert_eq!(fx.store.fetch_counts().await.unwrap().dead_letter, 0);
    }

    #[tokio::test]
    async fn cascades_flush_only_after_success() {
        let fx = fixture(FailurePolicies::new(FailureAction::MoveToErrorQueue)).await;

        let address: Url = "local://downstream".parse().unwrap();
        let (sender, listener) = local::channel(address.clone());
        fx.endpoints.register(Arc::new(Endpoint::new(
            address.clone(),
            EndpointMode::BufferedInMemory,
            Arc::new(sender),
        )));

        // failing handler cascades a send that must not go out
        fx.handlers.register_fn("orders.place", move |ctx| {
            let uri = address.clone();
            async move {
                ctx.send_to_destination(&PlaceOrder { sku: "B-2".into() }, &uri)
                    .map_err(|err| HandlerFailure::from_error(&err))?;
                Err(HandlerFailure::new("app::Broken", "fails after cascading"))
            }
        });

        fx.pipeline.execute_queued(order_envelope()).await.unwrap();

        // stop drains anything queued into the collector; there must be
        // nothing
        struct Collect(std::sync::Mutex<usize>);
        #[async_trait]
        impl Receiver for Collect {
            async fn received(&self, envelopes: Vec<Envelope>) -> Result<(), Error> {
                *self.0.lock().unwrap() += envelopes.len();
                Ok(())
            }
        }
        let collector = Collect(std::sync::Mutex::new(0));
        listener.stop().await.unwrap();
        listener
            .run(&collector, tokio_util::sync::CancellationToken::new())
            .await;
        assert_eq!(*collector.0.lock().unwrap(), 0);
    }
}
