//! Message routing.
//!
//! The router resolves one or more destinations for an outbound message
//! and stamps delivery metadata. Routes are computed once per message
//! type and cached in a lock-free map; the precedence for envelope
//! metadata is endpoint rules, then message-type rules, then explicit
//! [`DeliveryOptions`], which win over everything computed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::{
    envelope::{Envelope, DEFERRED_DESTINATION_HEADER},
    error::Error,
    serialization::SerializerRegistry,
    transport::{Endpoint, EndpointRegistry, EnvelopeRule},
};

/// A logical message that can travel through the bus. The type name is
/// the wire identity; it is deliberately a string, not a language type.
pub trait Message: Serialize + Send + Sync {
    fn message_type() -> &'static str
    where
        Self: Sized;
}

/// Explicit per-send overrides. Everything here takes precedence over
/// endpoint- and message-type-level rules.
#[derive(Default, Clone)]
pub struct DeliveryOptions {
    pub scheduled_time: Option<DateTime<Utc>>,
    pub deliver_by: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub reply_uri: Option<Url>,
    pub reply_requested: Option<String>,
    pub ack_requested: bool,
    pub headers: HashMap<String, String>,
}

impl DeliveryOptions {
    pub fn scheduled_at(time: DateTime<Utc>) -> Self {
        Self {
            scheduled_time: Some(time),
            ..Default::default()
        }
    }

    pub fn delayed_by(delay: Duration) -> Self {
        Self::scheduled_at(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
    }

    pub fn deliver_within(window: Duration) -> Self {
        Self {
            deliver_by: Some(Utc::now() + chrono::Duration::from_std(window).unwrap_or_default()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    fn apply(&self, envelope: &mut Envelope) {
        if let Some(t) = self.scheduled_time {
            envelope.scheduled_time = Some(t);
        }
        if let Some(t) = self.deliver_by {
            envelope.deliver_by = Some(t);
        }
        if let Some(v) = &self.correlation_id {
            envelope.correlation_id = Some(v.clone());
        }
        if let Some(v) = &self.tenant_id {
            envelope.tenant_id = Some(v.clone());
        }
        if let Some(v) = &self.group_id {
            envelope.group_id = Some(v.clone());
        }
        if let Some(v) = &self.deduplication_id {
            envelope.deduplication_id = Some(v.clone());
        }
        if let Some(v) = &self.reply_uri {
            envelope.reply_uri = Some(v.clone());
        }
        if let Some(v) = &self.reply_requested {
            envelope.reply_requested = Some(v.clone());
        }
        if self.ack_requested {
            envelope.ack_requested = true;
        }
        for (key, value) in &self.headers {
            envelope.headers.insert(key.clone(), value.clone());
        }
    }
}

/// An immutable binding of a message type to a target endpoint plus the
/// ordered rules applied to every envelope using the route.
pub struct MessageRoute {
    pub endpoint: Arc<Endpoint>,
    /// Endpoint rules first, then message-type rules.
    pub rules: Vec<EnvelopeRule>,
}

pub struct MessageRouter {
    endpoints: Arc<EndpointRegistry>,
    serializers: Arc<SerializerRegistry>,
    /// Destination uri of the local durable scheduling queue, used as
    /// the transport-agnostic fallback for scheduled sends.
    scheduling_uri: Url,

    /// message type -> subscribed endpoint uris
    subscriptions: papaya::HashMap<String, Vec<Url>>,
    /// message type -> rules applied on top of endpoint rules
    message_rules: papaya::HashMap<String, Vec<EnvelopeRule>>,
    /// computed routes, built lazily per message type
    route_cache: papaya::HashMap<String, Arc<Vec<MessageRoute>>>,
}

impl MessageRouter {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        serializers: Arc<SerializerRegistry>,
        scheduling_uri: Url,
    ) -> Self {
        Self {
            endpoints,
            serializers,
            scheduling_uri,
            subscriptions: papaya::HashMap::new(),
            message_rules: papaya::HashMap::new(),
            route_cache: papaya::HashMap::new(),
        }
    }

    pub fn scheduling_uri(&self) -> &Url {
        &self.scheduling_uri
    }

    /// Subscribes an endpoint to a message type. Invalidate-on-write:
    /// the cached routes for the type are recomputed on next use.
    pub fn subscribe(&self, message_type: impl Into<String>, uri: Url) -> Result<(), Error> {
        self.endpoints.resolve(&uri)?;
        let message_type = message_type.into();

        let map = self.subscriptions.pin();
        let mut uris = map.get(&message_type).cloned().unwrap_or_default();
        if !uris.contains(&uri) {
            uris.push(uri);
        }
        map.insert(message_type.clone(), uris);
        drop(map);

        self.route_cache.pin().remove(&message_type);
        Ok(())
    }

    pub fn add_message_rule(&self, message_type: impl Into<String>, rule: EnvelopeRule) {
        let message_type = message_type.into();
        let map = self.message_rules.pin();
        let mut rules = map.get(&message_type).cloned().unwrap_or_default();
        rules.push(rule);
        map.insert(message_type.clone(), rules);
        drop(map);

        self.route_cache.pin().remove(&message_type);
    }

    fn routes_for(&self, message_type: &str) -> Result<Arc<Vec<MessageRoute>>, Error> {
        if let Some(routes) = self.route_cache.pin().get(message_type) {
            return Ok(routes.clone());
        }

        let uris = self
            .subscriptions
            .pin()
            .get(message_type)
            .cloned()
            .unwrap_or_default();

        let message_rules = self
            .message_rules
            .pin()
            .get(message_type)
            .cloned()
            .unwrap_or_default();

        let mut routes = Vec::with_capacity(uris.len());
        for uri in uris {
            let endpoint = self.endpoints.resolve(&uri)?;
            let mut rules = endpoint.rules.clone();
            rules.extend(message_rules.iter().cloned());
            routes.push(MessageRoute { endpoint, rules });
        }

        let routes = Arc::new(routes);
        self.route_cache
            .pin()
            .insert(message_type.to_owned(), routes.clone());
        Ok(routes)
    }

    /// Point-to-point send; at least one route must exist.
    pub fn route_for_send<M: Message>(
        &self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<Vec<Envelope>, Error> {
        let message_type = M::message_type();
        let routes = self.routes_for(message_type)?;
        if routes.is_empty() {
            return Err(Error::no_routes(message_type));
        }
        self.build_envelopes(message_type, message, &routes, options)
    }

    /// Broadcast semantics: zero subscribers yields an empty list, not
    /// an error.
    pub fn route_for_publish<M: Message>(
        &self,
        message: &M,
        options: Option<&DeliveryOptions>,
    ) -> Result<Vec<Envelope>, Error> {
        let message_type = M::message_type();
        let routes = self.routes_for(message_type)?;
        self.build_envelopes(message_type, message, &routes, options)
    }

    /// Direct addressing, bypassing subscriptions.
    pub fn route_to_destination<M: Message>(
        &self,
        message: &M,
        uri: &Url,
        options: Option<&DeliveryOptions>,
    ) -> Result<Envelope, Error> {
        let endpoint = self.endpoints.resolve(uri)?;
        let message_type = M::message_type();

        let mut rules = endpoint.rules.clone();
        rules.extend(
            self.message_rules
                .pin()
                .get(message_type)
                .cloned()
                .unwrap_or_default(),
        );

        let route = MessageRoute { endpoint, rules };
        let mut envelopes =
            self.build_envelopes(message_type, message, std::slice::from_ref(&route), options)?;
        Ok(envelopes.remove(0))
    }

    /// Fan-out to every topic-routed endpoint, stamping the topic name.
    pub fn route_to_topic<M: Message>(
        &self,
        message: &M,
        topic_name: &str,
        options: Option<&DeliveryOptions>,
    ) -> Result<Vec<Envelope>, Error> {
        let message_type = M::message_type();
        let endpoints = self.endpoints.topic_routed();
        if endpoints.is_empty() {
            return Err(Error::IndeterminateRoutes {
                message_type: message_type.to_owned(),
                reason: "no topic-routed endpoints are registered".to_owned(),
            });
        }

        let message_rules = self
            .message_rules
            .pin()
            .get(message_type)
            .cloned()
            .unwrap_or_default();

        let routes: Vec<MessageRoute> = endpoints
            .into_iter()
            .map(|endpoint| {
                let mut rules = endpoint.rules.clone();
                rules.extend(message_rules.iter().cloned());
                MessageRoute { endpoint, rules }
            })
            .collect();

        let mut envelopes = self.build_envelopes(message_type, message, &routes, options)?;
        for envelope in &mut envelopes {
            envelope.topic_name = Some(topic_name.to_owned());
        }
        Ok(envelopes)
    }

    fn build_envelopes<M: Message>(
        &self,
        message_type: &str,
        message: &M,
        routes: &[MessageRoute],
        options: Option<&DeliveryOptions>,
    ) -> Result<Vec<Envelope>, Error> {
        let mut envelopes = Vec::with_capacity(routes.len());

        for route in routes {
            let data = self.serializers.write_message(
                &route.endpoint.content_type,
                message_type,
                message,
            )?;

            let mut envelope = Envelope::new(message_type, data);
            envelope.content_type = route.endpoint.content_type.clone();
            envelope.destination = Some(route.endpoint.uri.clone());

            for rule in &route.rules {
                rule.apply(&mut envelope);
            }
            if let Some(options) = options {
                options.apply(&mut envelope);
            }

            self.apply_scheduling_fallback(&route.endpoint, &mut envelope);
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }

    /// A scheduled envelope whose sender has no native scheduled send is
    /// rewritten to the local durable scheduling queue. The routed
    /// destination rides along in a header so the pipeline can resume
    /// the route once the envelope is due.
    fn apply_scheduling_fallback(&self, endpoint: &Endpoint, envelope: &mut Envelope) {
        if envelope.is_scheduled_after(Utc::now())
            && !endpoint.sender.supports_native_scheduled_send()
        {
            if let Some(original) = envelope.destination.take() {
                if original != self.scheduling_uri {
                    envelope
                        .headers
                        .insert(DEFERRED_DESTINATION_HEADER.to_owned(), original.to_string());
                }
            }
            envelope.destination = Some(self.scheduling_uri.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{local, EndpointMode};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct OrderPlaced {
        sku: String,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.placed"
        }
    }

    fn fixture() -> (MessageRouter, Arc<EndpointRegistry>) {
        let endpoints = Arc::new(EndpointRegistry::default());
        let serializers = Arc::new(SerializerRegistry::default());

        for (uri, topic) in [
            ("local://orders", false),
            ("local://audit", true),
            ("local://analytics", true),
        ] {
            let address: Url = uri.parse().unwrap();
            let (sender, _listener) = local::channel(address.clone());
            let mut endpoint = Endpoint::new(
                address,
                EndpointMode::BufferedInMemory,
                Arc::new(sender),
            );
            if topic {
                endpoint = endpoint.topic_routed();
            }
            endpoints.register(Arc::new(endpoint));
        }

        let router = MessageRouter::new(
            endpoints.clone(),
            serializers,
            "local://scheduled".parse().unwrap(),
        );
        (router, endpoints)
    }

    fn order() -> OrderPlaced {
        OrderPlaced { sku: "A-1".into() }
    }

    #[test]
    fn send_requires_at_least_one_route() {
        let (router, _) = fixture();
        assert!(matches!(
            router.route_for_send(&order(), None),
            Err(Error::NoRoutes { .. })
        ));

        router
            .subscribe("orders.placed", "local://orders".parse().unwrap())
            .unwrap();

        let envelopes = router.route_for_send(&order(), None).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            envelopes[0].destination.as_ref().unwrap().as_str(),
            "local://orders"
        );
    }

    #[test]
    fn publish_with_no_subscribers_is_empty_not_an_error() {
        let (router, _) = fixture();
        assert!(router.route_for_publish(&order(), None).unwrap().is_empty());
    }

    #[test]
    fn destination_routing_rejects_unknown_uris() {
        let (router, _) = fixture();
        let unknown: Url = "local://nowhere".parse().unwrap();
        assert!(matches!(
            router.route_to_destination(&order(), &unknown, None),
            Err(Error::UnknownEndpoint { .. })
        ));
    }

    #[test]
    fn topic_routing_fans_out_and_stamps_the_topic() {
        let (router, _) = fixture();
        let envelopes = router.route_to_topic(&order(), "orders", None).unwrap();

        assert_eq!(envelopes.len(), 2);
        assert!(envelopes
            .iter()
            .all(|e| e.topic_name.as_deref() == Some("orders")));
    }

    #[test]
    fn options_override_endpoint_and_message_rules() {
        let (router, _) = fixture();
        router
            .subscribe("orders.placed", "local://orders".parse().unwrap())
            .unwrap();
        router.add_message_rule(
            "orders.placed",
            EnvelopeRule::Header("region".into(), "rule-value".into()),
        );

        let options = DeliveryOptions::default()
            .with_header("region", "option-value")
            .with_tenant("tenant-9");

        let envelopes = router.route_for_send(&order(), Some(&options)).unwrap();
        assert_eq!(
            envelopes[0].headers.get("region").map(String::as_str),
            Some("option-value")
        );
        assert_eq!(envelopes[0].tenant_id.as_deref(), Some("tenant-9"));
    }

    #[test]
    fn scheduled_sends_fall_back_to_the_local_scheduling_queue() {
        let (router, _) = fixture();
        router
            .subscribe("orders.placed", "local://orders".parse().unwrap())
            .unwrap();

        let options = DeliveryOptions::scheduled_at(Utc::now() + chrono::Duration::hours(1));
        let envelopes = router.route_for_send(&order(), Some(&options)).unwrap();

        // the local sender has no native scheduled send; the routed
        // destination survives in the header
        assert_eq!(
            envelopes[0].destination.as_ref().unwrap().as_str(),
            "local://scheduled"
        );
        assert_eq!(
            envelopes[0]
                .headers
                .get(DEFERRED_DESTINATION_HEADER)
                .map(String::as_str),
            Some("local://orders")
        );
        assert!(envelopes[0].scheduled_time.is_some());
    }

    #[test]
    fn routes_are_cached_until_subscriptions_change() {
        let (router, _) = fixture();
        router
            .subscribe("orders.placed", "local://orders".parse().unwrap())
            .unwrap();

        assert_eq!(router.route_for_send(&order(), None).unwrap().len(), 1);

        router
            .subscribe("orders.placed", "local://audit".parse().unwrap())
            .unwrap();
        assert_eq!(router.route_for_send(&order(), None).unwrap().len(), 2);
    }
}
