//! The assembled message bus.
//!
//! [`message_bus`] wires configuration, the SQLite store, the router,
//! the execution pipeline, the in-memory scheduler and the durability
//! agent into one running [`MessageBus`]. The bus is the application
//! surface: register handlers, open endpoints, subscribe message types,
//! then send, publish or invoke.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use url::Url;

use crate::{
    config::Config,
    continuation::FailurePolicies,
    durability::DurabilityAgent,
    envelope::Envelope,
    error::Error,
    handler::HandlerRegistry,
    receiver::ExecutionPipeline,
    routing::{DeliveryOptions, Message, MessageRouter},
    scheduled::InMemoryScheduler,
    serialization::SerializerRegistry,
    store::{
        sqlite::{SqliteEnvelopeTransaction, SqliteStore},
        Admin, DeadLetter, DeadLetters, EnvelopeTransaction, PersistedCounts,
    },
    transport::{local, Endpoint, EndpointMode, EndpointRole, EndpointRegistry, Listener},
};

const DEFAULT_SCHEDULING_URI: &str = "local://ironbus.scheduled";

/// Returns a builder for a running message bus.
///
/// ```no_run
/// # async fn demo() -> Result<(), ironbus::Error> {
/// let bus = ironbus::message_bus().start().await?;
/// # Ok(()) }
/// ```
#[bon::builder(finish_fn = start)]
pub async fn message_bus(
    config: Option<Config>,
    #[builder(default)] policies: FailurePolicies,
    scheduling_uri: Option<Url>,
) -> Result<Arc<MessageBus>, Error> {
    // a host that installed its own subscriber wins
    let _ = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("IRONBUS_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish()
        .try_init();

    let config = match config {
        Some(config) => config,
        None => Config::load().map_err(|source| Error::Whatever {
            message: format!("failed to load configuration: {source}"),
            source: Some(source),
        })?,
    };

    let store = Arc::new(SqliteStore::connect(&config).await?);

    let endpoints = Arc::new(EndpointRegistry::default());
    let serializers = Arc::new(SerializerRegistry::default());
    let handlers = Arc::new(HandlerRegistry::default());
    let scheduler = Arc::new(InMemoryScheduler::new());
    let cancel = CancellationToken::new();

    let scheduling_uri =
        scheduling_uri.unwrap_or_else(|| DEFAULT_SCHEDULING_URI.parse().expect("valid uri"));

    let router = Arc::new(MessageRouter::new(
        endpoints.clone(),
        serializers.clone(),
        scheduling_uri.clone(),
    ));

    let pipeline = Arc::new(
        ExecutionPipeline::builder()
            .store(store.clone())
            .handlers(handlers.clone())
            .serializers(serializers.clone())
            .router(router.clone())
            .endpoints(endpoints.clone())
            .scheduler(scheduler.clone())
            .policies(policies)
            .handled_retention(config.handled_retention())
            .build(),
    );

    tokio::spawn(scheduler.clone().run(pipeline.clone(), cancel.clone()));

    let bus = Arc::new(MessageBus {
        config: config.clone(),
        store: store.clone(),
        router,
        endpoints: endpoints.clone(),
        serializers,
        handlers,
        scheduler,
        pipeline: pipeline.clone(),
        cancel: cancel.clone(),
        listeners: Mutex::new(Vec::new()),
        listener_tasks: Mutex::new(Vec::new()),
        agent_tasks: Mutex::new(Vec::new()),
    });

    // the system scheduling endpoint backs the scheduled-send fallback
    bus.open_local_endpoint_with_role(scheduling_uri, EndpointMode::Durable, EndpointRole::System)?;

    let agent = Arc::new(DurabilityAgent::new(
        store,
        pipeline,
        endpoints,
        config,
        cancel,
    ));
    *bus.agent_tasks.lock().expect("agent lock poisoned") = agent.start();

    Ok(bus)
}

pub struct MessageBus {
    config: Config,
    store: Arc<SqliteStore>,
    router: Arc<MessageRouter>,
    endpoints: Arc<EndpointRegistry>,
    serializers: Arc<SerializerRegistry>,
    handlers: Arc<HandlerRegistry>,
    scheduler: Arc<InMemoryScheduler>,
    pipeline: Arc<ExecutionPipeline>,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Arc<local::LocalListener>>>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    agent_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The receiver side of the bus, for wiring external transport
    /// listeners into the execution pipeline.
    pub fn receiver(&self) -> Arc<ExecutionPipeline> {
        self.pipeline.clone()
    }

    /// Opens an in-process endpoint and starts its listener loop.
    pub fn open_local_endpoint(&self, uri: Url, mode: EndpointMode) -> Result<(), Error> {
        self.open_local_endpoint_with_role(uri, mode, EndpointRole::Application)
    }

    fn open_local_endpoint_with_role(
        &self,
        uri: Url,
        mode: EndpointMode,
        role: EndpointRole,
    ) -> Result<(), Error> {
        let (sender, listener) = local::channel(uri.clone());
        let listener = Arc::new(listener);

        self.endpoints.register(Arc::new(
            Endpoint::new(uri, mode, Arc::new(sender)).with_role(role),
        ));

        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.clone();
        let task = {
            let listener = listener.clone();
            tokio::spawn(async move {
                listener.run(&*pipeline, cancel).await;
            })
        };

        self.listeners.lock().expect("listener lock poisoned").push(listener);
        self.listener_tasks
            .lock()
            .expect("listener lock poisoned")
            .push(task);
        Ok(())
    }

    /// Registers an externally built endpoint (a transport plugin).
    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) {
        self.endpoints.register(endpoint);
    }

    pub fn subscribe(&self, message_type: impl Into<String>, uri: Url) -> Result<(), Error> {
        self.router.subscribe(message_type, uri)
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Point-to-point send to every subscribed endpoint.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.send_with(message, None).await
    }

    pub async fn send_with<M: Message>(
        &self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        let envelopes = self.router.route_for_send(message, options)?;
        self.pipeline.dispatch_outgoing(envelopes).await
    }

    /// Broadcast; zero subscribers is a no-op, not an error.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.publish_with(message, None).await
    }

    pub async fn publish_with<M: Message>(
        &self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        let envelopes = self.router.route_for_publish(message, options)?;
        self.pipeline.dispatch_outgoing(envelopes).await
    }

    /// Direct addressing, bypassing subscriptions.
    pub async fn send_to_destination<M: Message>(
        &self,
        message: &M,
        uri: &Url,
    ) -> Result<(), Error> {
        self.ensure_running()?;
        let envelope = self.router.route_to_destination(message, uri, None)?;
        self.pipeline.dispatch_outgoing(vec![envelope]).await
    }

    /// Fan-out to every topic-routed endpoint.
    pub async fn send_to_topic<M: Message>(&self, message: &M, topic: &str) -> Result<(), Error> {
        self.ensure_running()?;
        let envelopes = self.router.route_to_topic(message, topic, None)?;
        self.pipeline.dispatch_outgoing(envelopes).await
    }

    /// Inline invocation: runs the registered handler in the caller's
    /// task and awaits the outcome. Only retry continuations are
    /// honored; other failures propagate as errors.
    pub async fn invoke<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.ensure_running()?;
        let data = self.serializers.write_message(
            crate::envelope::JSON_CONTENT_TYPE,
            M::message_type(),
            message,
        )?;
        self.pipeline
            .execute_inline(Envelope::new(M::message_type(), data))
            .await
    }

    /// Probes an endpoint's sender. Never raises.
    pub async fn ping(&self, uri: &Url) -> bool {
        match self.endpoints.get(uri) {
            Some(endpoint) => endpoint.sender.ping().await,
            None => false,
        }
    }

    /// Starts an outbox transaction: envelope persistence enlisted in a
    /// caller-owned unit of work, flushed to the transports only after
    /// commit.
    pub fn transaction(&self) -> OutboxTransaction<'_> {
        OutboxTransaction {
            bus: self,
            tx: self.store.transaction(),
            pending: Vec::new(),
        }
    }

    // ---- operational surface ----

    pub async fn counts(&self) -> Result<PersistedCounts, Error> {
        self.store.fetch_counts().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
        self.store.all_dead_letters().await
    }

    /// Flags dead letters matching the error type for replay and moves
    /// every replayable dead letter back to the incoming queue. Returns
    /// the number of envelopes queued for re-execution.
    pub async fn replay_dead_letters_by_error_type(&self, error_type: &str) -> Result<u64, Error> {
        self.store.mark_replayable_by_error_type(error_type).await?;
        self.store.move_replayable_to_incoming().await
    }

    pub async fn replay_dead_letters_by_ids(&self, ids: &[uuid::Uuid]) -> Result<u64, Error> {
        self.store.mark_replayable_by_ids(ids).await?;
        self.store.move_replayable_to_incoming().await
    }

    /// Graceful shutdown: listeners drain their queues, the agent and
    /// scheduler loops stop and are awaited, then the pool closes.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .drain(..)
            .collect();
        for listener in &listeners {
            listener.stop().await?;
        }

        let tasks: Vec<_> = self
            .listener_tasks
            .lock()
            .expect("listener lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        self.cancel.cancel();

        let agent_tasks: Vec<_> = self
            .agent_tasks
            .lock()
            .expect("agent lock poisoned")
            .drain(..)
            .collect();
        for task in agent_tasks {
            let _ = task.await;
        }

        self.scheduler.empty_all();
        self.store.pool().close().await;
        Ok(())
    }
}

/// Envelope sends enlisted in a caller-owned database transaction.
///
/// Routed envelopes are persisted as outgoing rows inside the
/// transaction; nothing touches a transport until [`commit`] succeeds.
/// On rollback the rows vanish with the transaction, so a failed unit
/// of work leaves no trace.
///
/// [`commit`]: OutboxTransaction::commit
pub struct OutboxTransaction<'a> {
    bus: &'a MessageBus,
    tx: SqliteEnvelopeTransaction,
    pending: Vec<Envelope>,
}

impl OutboxTransaction<'_> {
    pub async fn send<M: Message>(&mut self, message: &M) -> Result<(), Error> {
        self.send_with(message, None).await
    }

    pub async fn send_with<M: Message>(
        &mut self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<(), Error> {
        let envelopes = self.bus.router.route_for_send(message, options)?;
        self.tx.persist_outgoing(&envelopes).await?;
        self.pending.extend(envelopes);
        Ok(())
    }

    pub async fn publish<M: Message>(&mut self, message: &M) -> Result<(), Error> {
        let envelopes = self.bus.router.route_for_publish(message, None)?;
        self.tx.persist_outgoing(&envelopes).await?;
        self.pending.extend(envelopes);
        Ok(())
    }

    /// Runs business work inside the same transaction the envelopes are
    /// persisted in.
    pub async fn execute<F, T>(&mut self, work: F) -> Result<T, Error>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::SqliteConnection,
        )
            -> futures_util::future::BoxFuture<'c, Result<T, Error>>,
    {
        self.tx.execute(work).await
    }

    /// Commits the transaction, then flushes the persisted envelopes to
    /// their transports. A flush failure is not an error: the committed
    /// rows stay in the outgoing table and the recovery loop redelivers.
    pub async fn commit(self) -> Result<(), Error> {
        self.tx.commit().await?;

        for envelope in self.pending {
            let id = envelope.id;
            let sent = match envelope
                .destination
                .clone()
                .ok_or_else(|| Error::no_routes(envelope.message_type.clone()))
                .and_then(|uri| self.bus.endpoints.resolve(&uri))
            {
                Ok(endpoint) => endpoint.sender.send(envelope).await,
                Err(error) => Err(error),
            };

            match sent {
                Ok(()) => self.bus.store.delete_outgoing(&[id]).await?,
                Err(error) => {
                    tracing::warn!(%error, %id, "outbox flush failed, leaving for recovery");
                    self.bus.store.release_outgoing(&[id]).await?;
                }
            }
        }
        Ok(())
    }

    /// Abandons the transaction. Persisted envelopes disappear with it;
    /// nothing is sent.
    pub async fn rollback(mut self) -> Result<(), Error> {
        self.tx.rollback().await
    }
}
