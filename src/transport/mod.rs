//! Transport abstraction: endpoints, senders, listeners and batches.
//!
//! Routing and durability never talk to a concrete wire protocol; they
//! operate on the contracts in this module. A transport plugin supplies
//! a [`Sender`] for the outbound half and a [`Listener`] for the inbound
//! half of an [`Endpoint`], mapping its native message format to and
//! from [`Envelope`] fields.

pub mod batching;
pub mod inline;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use crate::{envelope::Envelope, error::Error};

/// How an endpoint participates in durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EndpointMode {
    /// Envelopes are persisted to the store before/while in flight.
    #[strum(serialize = "durable")]
    Durable,
    /// Envelopes are queued in memory only; lost on crash.
    #[strum(serialize = "buffered")]
    BufferedInMemory,
    /// Sends complete synchronously with the caller awaiting the result.
    #[strum(serialize = "inline")]
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Owned by the runtime itself (scheduling, control messages).
    System,
    Application,
}

/// Modification applied to every envelope leaving through an endpoint,
/// or configured per message type.
#[derive(Debug, Clone)]
pub enum EnvelopeRule {
    DeliverWithin(chrono::Duration),
    ScheduleDelay(chrono::Duration),
    Header(String, String),
    Topic(String),
}

impl EnvelopeRule {
    pub fn apply(&self, envelope: &mut Envelope) {
        let now = chrono::Utc::now();
        match self {
            Self::DeliverWithin(window) => {
                envelope.deliver_by = Some(now + *window);
            }
            Self::ScheduleDelay(delay) => {
                envelope.scheduled_time = Some(now + *delay);
            }
            Self::Header(key, value) => {
                envelope.headers.insert(key.clone(), value.clone());
            }
            Self::Topic(name) => {
                envelope.topic_name = Some(name.clone());
            }
        }
    }
}

/// A named, addressable destination/source. Created once per process and
/// cached by uri; owns exactly one sender.
pub struct Endpoint {
    pub uri: Url,
    pub mode: EndpointMode,
    pub role: EndpointRole,
    /// Serializer key applied to messages leaving through this endpoint.
    pub content_type: String,
    /// Ordered outgoing envelope-modification rules.
    pub rules: Vec<EnvelopeRule>,
    /// Whether this endpoint takes part in topic-based fan-out.
    pub topic_routed: bool,
    pub sender: Arc<dyn Sender>,
}

impl Endpoint {
    pub fn new(uri: Url, mode: EndpointMode, sender: Arc<dyn Sender>) -> Self {
        Self {
            uri,
            mode,
            role: EndpointRole::Application,
            content_type: crate::envelope::JSON_CONTENT_TYPE.to_owned(),
            rules: Vec::new(),
            topic_routed: false,
            sender,
        }
    }

    pub fn with_role(mut self, role: EndpointRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_rule(mut self, rule: EnvelopeRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn topic_routed(mut self) -> Self {
        self.topic_routed = true;
        self
    }
}

/// Uri-keyed endpoint cache. Read-mostly; endpoints are registered at
/// startup and looked up on every send.
pub struct EndpointRegistry {
    endpoints: papaya::HashMap<String, Arc<Endpoint>>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self {
            endpoints: papaya::HashMap::new(),
        }
    }
}

impl EndpointRegistry {
    pub fn register(&self, endpoint: Arc<Endpoint>) {
        self.endpoints
            .pin()
            .insert(endpoint.uri.to_string(), endpoint.clone());
    }

    pub fn get(&self, uri: &Url) -> Option<Arc<Endpoint>> {
        self.endpoints.pin().get(&uri.to_string()).cloned()
    }

    pub fn resolve(&self, uri: &Url) -> Result<Arc<Endpoint>, Error> {
        self.get(uri)
            .ok_or_else(|| Error::unknown_endpoint(uri.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.pin().values().cloned().collect()
    }

    pub fn topic_routed(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .pin()
            .values()
            .filter(|e| e.topic_routed)
            .cloned()
            .collect()
    }
}

/// Outbound half of an endpoint.
#[async_trait]
pub trait Sender: Send + Sync {
    fn destination(&self) -> &Url;

    fn supports_native_scheduled_send(&self) -> bool {
        false
    }

    fn supports_native_scheduled_cancellation(&self) -> bool {
        false
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error>;

    /// Liveness probe. Never raises; a failed probe returns `false`.
    async fn ping(&self) -> bool;
}

/// One entry of an outgoing batch. The correlation key is generated
/// locally before the wire batch is built so per-envelope outcomes can
/// be joined back regardless of what the transport itself returns.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub correlation_key: Uuid,
    pub envelope: Envelope,
}

/// An ordered list of envelopes destined for one endpoint; the unit of
/// network transmission and of success/failure acknowledgment.
#[derive(Debug, Clone)]
pub struct OutgoingMessageBatch {
    pub destination: Url,
    pub entries: Vec<BatchEntry>,
}

impl OutgoingMessageBatch {
    pub fn new(destination: Url, envelopes: Vec<Envelope>) -> Self {
        let entries = envelopes
            .into_iter()
            .map(|envelope| BatchEntry {
                correlation_key: Uuid::new_v4(),
                envelope,
            })
            .collect();
        Self {
            destination,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter().map(|e| &e.envelope)
    }

    /// Splits the batch by correlation key into (matched, rest),
    /// preserving order. Used to decompose partial failures back to
    /// per-envelope outcomes.
    pub fn split_by_keys(self, keys: &[Uuid]) -> (Self, Self) {
        let (matched, rest): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .partition(|entry| keys.contains(&entry.correlation_key));

        (
            Self {
                destination: self.destination.clone(),
                entries: matched,
            },
            Self {
                destination: self.destination,
                entries: rest,
            },
        )
    }
}

/// Outcome sink for batched sends. The durable store applies a
/// differentiated recovery policy per failure class, so the protocol
/// reports which class it hit rather than a bare error.
#[async_trait]
pub trait SenderCallback: Send + Sync {
    async fn mark_successful(&self, batch: &OutgoingMessageBatch);

    /// Recoverable failure; the batch should be retried later.
    async fn mark_processing_failure(&self, batch: &OutgoingMessageBatch);

    /// The payload could not be serialized for the wire. Never retried
    /// blindly.
    async fn mark_serialization_failure(&self, batch: &OutgoingMessageBatch);

    /// The destination queue does not exist; the sender may be paused.
    async fn mark_queue_missing(&self, batch: &OutgoingMessageBatch);

    async fn mark_timed_out(&self, batch: &OutgoingMessageBatch);

    /// The sender is latched and not accepting work.
    async fn mark_latched(&self, batch: &OutgoingMessageBatch);
}

/// The actual wire write for one batch. Implementations report the
/// outcome through the callback instead of returning an error, so a
/// partial failure can be decomposed.
#[async_trait]
pub trait SenderProtocol: Send + Sync {
    async fn send_batch(&self, callback: &dyn SenderCallback, batch: OutgoingMessageBatch);
}

/// Inbound consumer fed by a listener.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn received(&self, envelopes: Vec<Envelope>) -> Result<(), Error>;
}

/// Inbound half of an endpoint. Owns the receive loop and forwards
/// envelopes to a [`Receiver`].
#[async_trait]
pub trait Listener: Send + Sync {
    fn address(&self) -> &Url;

    async fn complete(&self, envelope: &Envelope) -> Result<(), Error>;

    async fn defer(&self, envelope: &Envelope) -> Result<(), Error>;

    /// Drain in-flight work, then stop accepting. Distinct from
    /// `dispose`, which releases resources immediately.
    async fn stop(&self) -> Result<(), Error>;

    async fn dispose(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> OutgoingMessageBatch {
        let envelopes = (0..n)
            .map(|i| Envelope::new(format!("orders.{i}"), "{}"))
            .collect();
        OutgoingMessageBatch::new("local://orders".parse().unwrap(), envelopes)
    }

    #[test]
    fn batches_assign_unique_correlation_keys() {
        let batch = batch_of(4);
        let mut keys: Vec<Uuid> = batch.entries.iter().map(|e| e.correlation_key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn split_by_keys_preserves_order_and_membership() {
        let batch = batch_of(10);
        let rejected: Vec<Uuid> = batch
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 == 0)
            .map(|(_, e)| e.correlation_key)
            .collect();

        let (failed, succeeded) = batch.split_by_keys(&rejected);

        assert_eq!(failed.len(), 4);
        assert_eq!(succeeded.len(), 6);

        let succeeded_types: Vec<&str> = succeeded
            .envelopes()
            .map(|e| e.message_type.as_str())
            .collect();
        assert_eq!(
            succeeded_types,
            vec![
                "orders.1", "orders.2", "orders.4", "orders.5", "orders.7", "orders.8"
            ]
        );
    }

    #[test]
    fn endpoint_rules_stamp_outgoing_envelopes() {
        let mut envelope = Envelope::new("orders.placed", "{}");

        EnvelopeRule::Header("audit-source".into(), "orders-svc".into()).apply(&mut envelope);
        EnvelopeRule::Topic("orders".into()).apply(&mut envelope);
        EnvelopeRule::DeliverWithin(chrono::Duration::minutes(5)).apply(&mut envelope);

        assert_eq!(
            envelope.headers.get("audit-source").map(String::as_str),
            Some("orders-svc")
        );
        assert_eq!(envelope.topic_name.as_deref(), Some("orders"));
        assert!(envelope.deliver_by.unwrap() > chrono::Utc::now());
    }
}
