//! Durable inbox/outbox contracts.
//!
//! The store gives the bus crash-safe, transactional persistence of
//! in-flight envelopes: the transactional-outbox pattern for sends and
//! the transactional-inbox pattern for receives. Contracts here are the
//! seam between the runtime and a concrete backend; [`sqlite`] ships the
//! built-in implementation.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{continuation::HandlerFailure, envelope::Envelope, error::Error};

/// Incoming-side persistence.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Inserts with status `Incoming`, owned by this node. Duplicate ids
    /// are ignored, which is what makes redelivery idempotent.
    async fn store_incoming(&self, envelopes: &[Envelope]) -> Result<(), Error>;

    /// Inserts or updates with status `Scheduled` and a future execution
    /// time. Idempotent per envelope id: re-scheduling never creates a
    /// duplicate row and never double-fires.
    async fn schedule_execution(
        &self,
        envelope: &Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Idempotent transition to `Handled`; the row is retained until
    /// `keep_until` for replay protection and audit.
    async fn mark_incoming_handled(
        &self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Atomically removes from incoming and records in dead-letter
    /// storage with the failure captured for later triage.
    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &HandlerFailure,
    ) -> Result<(), Error>;

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<(), Error>;
}

/// Dead-letter triage and replay.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    /// Bulk-flags every dead letter whose captured error type matches.
    /// Returns the number of rows affected.
    async fn mark_replayable_by_error_type(&self, error_type: &str) -> Result<u64, Error>;

    async fn mark_replayable_by_ids(&self, ids: &[Uuid]) -> Result<u64, Error>;

    async fn all_dead_letters(&self) -> Result<Vec<DeadLetter>, Error>;
}

/// Operational/test introspection and schema provisioning.
#[async_trait]
pub trait Admin: Send + Sync {
    async fn all_incoming(&self) -> Result<Vec<Envelope>, Error>;

    async fn fetch_counts(&self) -> Result<PersistedCounts, Error>;

    async fn clear_all(&self) -> Result<(), Error>;

    async fn rebuild(&self) -> Result<(), Error>;
}

/// Lets an external unit-of-work enlist envelope writes in its own
/// commit. Implementations must write through the caller's transaction;
/// `rollback` is a no-op when no transaction was ever opened.
#[async_trait]
pub trait EnvelopeTransaction: Send {
    async fn persist_outgoing(&mut self, envelopes: &[Envelope]) -> Result<(), Error>;

    async fn persist_incoming(&mut self, envelopes: &[Envelope]) -> Result<(), Error>;

    async fn rollback(&mut self) -> Result<(), Error>;
}

/// A failed envelope held for triage.
#[derive(Debug, Serialize, FromRow)]
pub struct DeadLetter {
    pub id: String,
    pub message_type: String,
    pub error_type: String,
    pub error_message: String,
    pub replayable: bool,
    /// Unix milliseconds; `None` keeps the row until replayed/cleared.
    pub expires_at: Option<i64>,
    pub received_at: i64,
}

/// Row counts across the persisted tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistedCounts {
    pub incoming: i64,
    pub scheduled: i64,
    pub handled: i64,
    pub outgoing: i64,
    pub dead_letter: i64,
}
