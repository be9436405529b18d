//! Handler registration and the execution context.
//!
//! Handlers are keyed by message-type identity strings and stored as
//! boxed async closures, so dispatch needs no reflection and no
//! codegen. The [`HandlerContext`] hands the handler its envelope, a
//! typed view of the payload and a cascade buffer; messages a handler
//! sends are collected there and only flushed by the pipeline after the
//! handler succeeds and the inbox bookkeeping commits.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    continuation::HandlerFailure,
    envelope::Envelope,
    error::Error,
    routing::{DeliveryOptions, Message, MessageRouter},
    serialization::SerializerRegistry,
};

pub type HandlerResult = Result<(), HandlerFailure>;

type HandlerFn = Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Everything a handler invocation sees.
#[derive(Clone)]
pub struct HandlerContext {
    envelope: Envelope,
    serializers: Arc<SerializerRegistry>,
    router: Arc<MessageRouter>,
    cascades: Arc<Mutex<Vec<Envelope>>>,
}

impl HandlerContext {
    pub fn new(
        envelope: Envelope,
        serializers: Arc<SerializerRegistry>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            envelope,
            serializers,
            router,
            cascades: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Deserializes the payload into the handler's message type.
    pub fn message<M: DeserializeOwned>(&self) -> Result<M, Error> {
        self.serializers.read_message(&self.envelope)
    }

    /// Queues a point-to-point send that goes out only after this
    /// handler succeeds.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), Error> {
        self.send_with(message, None)
    }

    pub fn send_with<M: Message>(
        &self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<(), Error> {
        let envelopes = self.router.route_for_send(message, options)?;
        self.buffer(envelopes);
        Ok(())
    }

    /// Queues a publish; zero subscribers is not an error.
    pub fn publish<M: Message>(&self, message: &M) -> Result<(), Error> {
        let envelopes = self.router.route_for_publish(message, None)?;
        self.buffer(envelopes);
        Ok(())
    }

    pub fn send_to_destination<M: Message>(&self, message: &M, uri: &Url) -> Result<(), Error> {
        let envelope = self.router.route_to_destination(message, uri, None)?;
        self.buffer(vec![envelope]);
        Ok(())
    }

    /// Queues the response to a request that carried a reply uri,
    /// inverting the correlation chain.
    pub fn reply<M: Message>(&self, message: &M) -> Result<(), Error> {
        if self.envelope.reply_uri.is_none() {
            return Err(Error::no_routes(M::message_type()));
        }

        let data = self.serializers.write_message(
            &self.envelope.content_type,
            M::message_type(),
            message,
        )?;
        let response = self.envelope.for_response(M::message_type(), data);
        self.buffer(vec![response]);
        Ok(())
    }

    fn buffer(&self, envelopes: Vec<Envelope>) {
        self.cascades
            .lock()
            .expect("cascade lock poisoned")
            .extend(envelopes);
    }

    /// Drains the cascade buffer. Called by the pipeline after the
    /// handler completes successfully.
    pub fn take_cascades(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.cascades.lock().expect("cascade lock poisoned"))
    }
}

/// Message-type keyed registry of async handlers.
pub struct HandlerRegistry {
    handlers: papaya::HashMap<String, HandlerFn>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: papaya::HashMap::new(),
        }
    }
}

impl HandlerRegistry {
    /// Registers a raw closure for a message-type string. Last
    /// registration for a type wins.
    pub fn register_fn<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.pin().insert(message_type.into(), handler);
    }

    /// Registers a typed handler. The payload is deserialized before the
    /// closure runs; a decode failure goes through the failure machinery
    /// like any other handler error.
    pub fn register<M, F, Fut>(&self, handler: F)
    where
        M: Message + DeserializeOwned + 'static,
        F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_fn(M::message_type(), move |ctx: HandlerContext| {
            let handler = handler.clone();
            async move {
                let message: M = ctx.message().map_err(|err| HandlerFailure::from_error(&err))?;
                handler(message, ctx).await
            }
        });
    }

    pub fn get(&self, message_type: &str) -> Option<HandlerFn> {
        self.handlers.pin().get(message_type).cloned()
    }

    pub fn resolve(&self, message_type: &str) -> Result<HandlerFn, Error> {
        self.get(message_type).ok_or_else(|| Error::NoHandler {
            message_type: message_type.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{local, Endpoint, EndpointMode, EndpointRegistry};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize, Deserialize)]
    struct PlaceOrder {
        sku: String,
        quantity: u32,
    }

    impl Message for PlaceOrder {
        fn message_type() -> &'static str {
            "orders.place"
        }
    }

    #[derive(Serialize, Deserialize)]
    struct OrderPlaced {
        sku: String,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.placed"
        }
    }

    fn context_for(envelope: Envelope) -> HandlerContext {
        let endpoints = Arc::new(EndpointRegistry::default());
        let address: Url = "local://orders".parse().unwrap();
        let (sender, _listener) = local::channel(address.clone());
        endpoints.register(Arc::new(Endpoint::new(
            address,
            EndpointMode::BufferedInMemory,
            Arc::new(sender),
        )));

        let serializers = Arc::new(SerializerRegistry::default());
        let router = Arc::new(MessageRouter::new(
            endpoints,
            serializers.clone(),
            "local://scheduled".parse().unwrap(),
        ));
        router
            .subscribe("orders.placed", "local://orders".parse().unwrap())
            .unwrap();

        HandlerContext::new(envelope, serializers, router)
    }

    #[tokio::test]
    async fn typed_handlers_see_the_decoded_message() {
        let registry = HandlerRegistry::default();
        let quantities = Arc::new(AtomicU32::new(0));
        let seen = quantities.clone();

        registry.register::<PlaceOrder, _, _>(move |order, _ctx| {
            let seen = seen.clone();
            async move {
                seen.store(order.quantity, Ordering::SeqCst);
                Ok(())
            }
        });

        let envelope = Envelope::new("orders.place", r#"{"sku":"A-1","quantity":4}"#);
        let handler = registry.resolve("orders.place").unwrap();
        handler(context_for(envelope)).await.unwrap();

        assert_eq!(quantities.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn undecodable_payloads_fail_the_handler_not_the_registry() {
        let registry = HandlerRegistry::default();
        registry.register::<PlaceOrder, _, _>(|_order, _ctx| async { Ok(()) });

        let envelope = Envelope::new("orders.place", "not json");
        let handler = registry.resolve("orders.place").unwrap();
        assert!(handler(context_for(envelope)).await.is_err());
    }

    #[test]
    fn missing_handlers_are_a_configuration_error() {
        let registry = HandlerRegistry::default();
        let err = registry.resolve("orders.unknown").err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn cascaded_sends_stay_buffered_until_taken() {
        let ctx = context_for(Envelope::new("orders.place", "{}"));

        ctx.send(&OrderPlaced { sku: "A-1".into() }).unwrap();
        ctx.publish(&OrderPlaced { sku: "A-2".into() }).unwrap();

        let cascades = ctx.take_cascades();
        assert_eq!(cascades.len(), 2);
        assert!(ctx.take_cascades().is_empty());
    }

    #[test]
    fn replies_require_a_reply_uri() {
        let ctx = context_for(Envelope::new("orders.place", "{}"));
        assert!(ctx.reply(&OrderPlaced { sku: "A-1".into() }).is_err());

        let mut envelope = Envelope::new("orders.place", "{}");
        envelope.reply_uri = Some("local://replies".parse().unwrap());
        let ctx = context_for(envelope);

        ctx.reply(&OrderPlaced { sku: "A-1".into() }).unwrap();
        let cascades = ctx.take_cascades();
        assert_eq!(cascades.len(), 1);
        assert!(cascades[0].is_response);
        assert_eq!(
            cascades[0].destination.as_ref().unwrap().as_str(),
            "local://replies"
        );
    }
}
