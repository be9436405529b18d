//! The envelope is the unit of transmission and persistence.
//!
//! Every message moving through the bus is wrapped in an [`Envelope`]
//! carrying identity, routing, delivery-control and audit metadata
//! alongside the serialized payload.
//!
//! # Envelope lifecycle
//!
//! 1. Created by the router (outbound) or a listener deserializing wire
//!    data (inbound)
//! 2. Optionally persisted into the durable store (outgoing table for
//!    sends, incoming table for receives)
//! 3. Handed to a sender (outbound) or the execution pipeline (inbound)
//! 4. Terminal state: acknowledged/deleted, moved to dead-letter
//!    storage, or marked `Handled` and retained until expiration

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Message type reserved for connectivity probes. Receivers acknowledge
/// pings without dispatching to a handler.
pub const PING_MESSAGE_TYPE: &str = "ironbus.ping";

/// Content type of the built-in JSON serializer.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header carrying the routed destination of an envelope that was
/// detoured through the local scheduling queue. The execution pipeline
/// strips it and resumes the route once the envelope is due.
pub const DEFERRED_DESTINATION_HEADER: &str = "deferred-destination";

/// Status of a persisted incoming envelope.
///
/// The status transitions typically follow:
/// `Incoming` -> `Handled`             (success case)
/// `Scheduled` -> `Incoming` -> `Handled` (deferred delivery)
///
/// Outgoing envelopes carry no status; their existence in the outgoing
/// table is the state.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display,
)]
#[sqlx(type_name = "text")]
pub enum EnvelopeStatus {
    /// Waiting to be processed or currently being processed
    #[serde(rename = "incoming")]
    #[sqlx(rename = "incoming")]
    #[strum(serialize = "incoming")]
    Incoming,
    /// Deferred until a future execution time
    #[serde(rename = "scheduled")]
    #[sqlx(rename = "scheduled")]
    #[strum(serialize = "scheduled")]
    Scheduled,
    /// Successfully processed, retained for replay protection
    #[serde(rename = "handled")]
    #[sqlx(rename = "handled")]
    #[strum(serialize = "handled")]
    Handled,
}

/// The message-in-flight value object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique, stable for the life of the envelope, including
    /// after persistence round-trips.
    pub id: Uuid,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub parent_id: Option<String>,
    pub saga_id: Option<String>,
    pub source: Option<String>,

    /// Serialized payload bytes.
    pub data: Bytes,
    /// String identity of the message, not a language type.
    pub message_type: String,
    /// Serializer key, e.g. `application/json`.
    pub content_type: String,
    pub accepted_content_types: Vec<String>,

    pub destination: Option<Url>,
    pub reply_uri: Option<Url>,
    /// Message type name the sender wants back, if any.
    pub reply_requested: Option<String>,
    pub ack_requested: bool,
    pub is_response: bool,
    pub topic_name: Option<String>,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,

    /// If set and in the future, delivery is deferred.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// If passed before execution, the envelope is discarded rather than
    /// processed.
    pub deliver_by: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    /// Only ever increases.
    pub attempts: u32,

    pub status: EnvelopeStatus,
    /// 0 = unowned / any node.
    pub owner_id: u32,
    pub tenant_id: Option<String>,

    /// Open map for cross-cutting metadata.
    pub headers: HashMap<String, String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            saga_id: None,
            source: None,
            data: Bytes::new(),
            message_type: String::new(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            accepted_content_types: Vec::new(),
            destination: None,
            reply_uri: None,
            reply_requested: None,
            ack_requested: false,
            is_response: false,
            topic_name: None,
            group_id: None,
            deduplication_id: None,
            scheduled_time: None,
            deliver_by: None,
            sent_at: Utc::now(),
            attempts: 0,
            status: EnvelopeStatus::Incoming,
            owner_id: 0,
            tenant_id: None,
            headers: HashMap::new(),
        }
    }
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            message_type: message_type.into(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Synthetic envelope used by `Sender::ping` for liveness probes.
    pub fn ping(destination: Url) -> Self {
        Self {
            message_type: PING_MESSAGE_TYPE.to_owned(),
            destination: Some(destination),
            ack_requested: true,
            ..Default::default()
        }
    }

    pub fn is_ping(&self) -> bool {
        self.message_type == PING_MESSAGE_TYPE
    }

    /// True when `deliver_by` has passed and the envelope must not be
    /// handed to a handler.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.map(|d| d <= now).unwrap_or(false)
    }

    /// True when delivery is deferred to a future time.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.map(|t| t > now).unwrap_or(false)
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Builds the reply envelope skeleton for a request that asked for a
    /// response, inverting the correlation chain.
    pub fn for_response(&self, message_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            message_type: message_type.into(),
            data: data.into(),
            correlation_id: self.correlation_id.clone(),
            conversation_id: self.conversation_id,
            parent_id: Some(self.id.to_string()),
            destination: self.reply_uri.clone(),
            is_response: true,
            tenant_id: self.tenant_id.clone(),
            ..Default::default()
        }
    }
}
