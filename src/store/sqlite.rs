//! SQLite-backed envelope store.
//!
//! Every mutating operation that more than one node can race on is a
//! single conditional statement; ownership changes always carry a
//! `WHERE owner_id = ...` guard so at most one node wins a given
//! reassignment. Envelope metadata needed for queries lives in columns;
//! the full envelope rides along as its wire encoding in `body`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    prelude::FromRow,
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use url::Url;
use uuid::Uuid;

use super::{Admin, DeadLetter, DeadLetters, EnvelopeTransaction, Inbox, PersistedCounts};
use crate::{
    config::Config,
    continuation::HandlerFailure,
    envelope::{Envelope, EnvelopeStatus},
    error::Error,
    wire,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS incoming_envelopes (
    id             TEXT PRIMARY KEY,
    status         TEXT NOT NULL,
    owner_id       INTEGER NOT NULL DEFAULT 0,
    execution_time INTEGER,
    attempts       INTEGER NOT NULL DEFAULT 0,
    message_type   TEXT NOT NULL,
    body           BLOB NOT NULL,
    received_at    INTEGER NOT NULL,
    last_touched   INTEGER NOT NULL,
    keep_until     INTEGER
);

CREATE INDEX IF NOT EXISTS idx_incoming_status_owner
    ON incoming_envelopes (status, owner_id);
CREATE INDEX IF NOT EXISTS idx_incoming_execution_time
    ON incoming_envelopes (execution_time);

CREATE TABLE IF NOT EXISTS outgoing_envelopes (
    id           TEXT PRIMARY KEY,
    owner_id     INTEGER NOT NULL DEFAULT 0,
    destination  TEXT NOT NULL,
    deliver_by   INTEGER,
    attempts     INTEGER NOT NULL DEFAULT 0,
    message_type TEXT NOT NULL,
    body         BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id            TEXT PRIMARY KEY,
    message_type  TEXT NOT NULL,
    error_type    TEXT NOT NULL,
    error_message TEXT NOT NULL,
    replayable    INTEGER NOT NULL DEFAULT 0,
    expires_at    INTEGER,
    received_at   INTEGER NOT NULL,
    body          BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id          INTEGER PRIMARY KEY,
    control_uri TEXT,
    last_seen   INTEGER NOT NULL
);
"#;

const DROP: &str = r#"
DROP TABLE IF EXISTS incoming_envelopes;
DROP TABLE IF EXISTS outgoing_envelopes;
DROP TABLE IF EXISTS dead_letters;
DROP TABLE IF EXISTS nodes;
"#;

fn ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| Error::wire(format!("invalid stored timestamp {value}")))
}

fn encode_body(envelope: &Envelope) -> Vec<u8> {
    wire::write_batch(std::slice::from_ref(envelope)).to_vec()
}

fn decode_body(body: Vec<u8>) -> Result<Envelope, Error> {
    wire::read_batch(Bytes::from(body))?
        .pop()
        .ok_or_else(|| Error::wire("stored envelope body is empty"))
}

#[derive(FromRow)]
struct IncomingRow {
    #[allow(unused)]
    id: String,
    status: EnvelopeStatus,
    owner_id: i64,
    execution_time: Option<i64>,
    attempts: i64,
    body: Vec<u8>,
}

impl IncomingRow {
    fn into_envelope(self) -> Result<Envelope, Error> {
        let mut envelope = decode_body(self.body)?;
        envelope.status = self.status;
        envelope.owner_id = self.owner_id as u32;
        envelope.attempts = self.attempts as u32;
        envelope.scheduled_time = match self.execution_time {
            Some(value) => Some(from_ms(value)?),
            None => None,
        };
        Ok(envelope)
    }
}

#[derive(FromRow)]
struct OutgoingRow {
    #[allow(unused)]
    id: String,
    destination: String,
    attempts: i64,
    body: Vec<u8>,
}

impl OutgoingRow {
    fn into_envelope(self) -> Result<Envelope, Error> {
        let mut envelope = decode_body(self.body)?;
        envelope.attempts = self.attempts as u32;
        envelope.destination = Some(
            self.destination
                .parse::<Url>()
                .map_err(|_| Error::wire(format!("invalid destination {}", self.destination)))?,
        );
        Ok(envelope)
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    node_id: u32,
}

impl SqliteStore {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // an in-memory database exists per connection; keep one
        let pool_opts = if config.db_path().is_none() {
            SqlitePoolOptions::new().max_connections(1)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            node_id: config.node_id(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Starts an envelope transaction for caller-controlled outbox
    /// participation. The database transaction opens lazily on first
    /// write.
    pub fn transaction(&self) -> SqliteEnvelopeTransaction {
        SqliteEnvelopeTransaction {
            pool: self.pool.clone(),
            node_id: self.node_id,
            tx: None,
        }
    }

    // ---- outgoing ----

    pub async fn store_outgoing(&self, envelopes: &[Envelope]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            insert_outgoing(&mut tx, envelope, self.node_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM outgoing_envelopes WHERE id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn increment_outgoing_attempts(&self, ids: &[Uuid]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE outgoing_envelopes SET attempts = attempts + 1 WHERE id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Releases ownership so any node's recovery loop can reclaim the
    /// rows. Used when a sender is paused or latched.
    pub async fn release_outgoing(&self, ids: &[Uuid]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE outgoing_envelopes SET owner_id = 0 WHERE id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Claims a batch of unowned outgoing envelopes for this node in one
    /// conditional statement.
    pub async fn claim_unowned_outgoing(&self, limit: u32) -> Result<Vec<Envelope>, Error> {
        let rows: Vec<OutgoingRow> = sqlx::query_as(
            "UPDATE outgoing_envelopes SET owner_id = $1
             WHERE id IN (SELECT id FROM outgoing_envelopes WHERE owner_id = 0 LIMIT $2)
             RETURNING id, destination, attempts, body",
        )
        .bind(self.node_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutgoingRow::into_envelope).collect()
    }

    /// Discards outgoing envelopes whose `deliver_by` deadline passed
    /// before they could be sent.
    pub async fn delete_expired_outgoing(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM outgoing_envelopes WHERE deliver_by IS NOT NULL AND deliver_by <= $1",
        )
        .bind(ms(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- incoming / durability operations ----

    /// Replay-protection lookup: the persisted status of an incoming
    /// envelope, if the id is known.
    pub async fn incoming_status(&self, id: Uuid) -> Result<Option<EnvelopeStatus>, Error> {
        Ok(sqlx::query_scalar::<_, EnvelopeStatus>(
            "SELECT status FROM incoming_envelopes WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Resets ownership of incoming envelopes whose owner has not
    /// touched them within the staleness window. This is what recovers
    /// work from a node that crashed mid-processing without any explicit
    /// crash signal.
    pub async fn bump_stale_incoming(
        &self,
        now: DateTime<Utc>,
        staleness: chrono::Duration,
    ) -> Result<u64, Error> {
        let cutoff = ms(now - staleness);
        let result = sqlx::query(
            "UPDATE incoming_envelopes SET owner_id = 0
             WHERE owner_id <> 0 AND status = 'incoming' AND last_touched < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Claims unowned incoming envelopes for this node.
    pub async fn claim_unowned_incoming(&self, limit: u32) -> Result<Vec<Envelope>, Error> {
        let rows: Vec<IncomingRow> = sqlx::query_as(
            "UPDATE incoming_envelopes SET owner_id = $1, last_touched = $2
             WHERE id IN (
                 SELECT id FROM incoming_envelopes
                 WHERE owner_id = 0 AND status = 'incoming' LIMIT $3)
             RETURNING id, status, owner_id, execution_time, attempts, body",
        )
        .bind(self.node_id as i64)
        .bind(ms(Utc::now()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncomingRow::into_envelope).collect()
    }

    /// Promotes due scheduled envelopes to `Incoming`, owned by this
    /// node, and returns them for execution. One conditional statement;
    /// concurrent nodes cannot promote the same row twice.
    pub async fn promote_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Envelope>, Error> {
        let rows: Vec<IncomingRow> = sqlx::query_as(
            "UPDATE incoming_envelopes SET status = 'incoming', owner_id = $1, last_touched = $2
             WHERE id IN (
                 SELECT id FROM incoming_envelopes
                 WHERE status = 'scheduled' AND execution_time <= $3 AND owner_id = 0
                 ORDER BY execution_time LIMIT $4)
             RETURNING id, status, owner_id, execution_time, attempts, body",
        )
        .bind(self.node_id as i64)
        .bind(ms(now))
        .bind(ms(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncomingRow::into_envelope).collect()
    }

    /// Removes handled rows past their retention and, when a horizon is
    /// configured, old dead letters. Returns (handled, dead letter)
    /// rows removed.
    pub async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        dead_letter_retention: Option<chrono::Duration>,
    ) -> Result<(u64, u64), Error> {
        let handled = sqlx::query(
            "DELETE FROM incoming_envelopes
             WHERE status = 'handled' AND keep_until IS NOT NULL AND keep_until <= $1",
        )
        .bind(ms(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let mut dead = sqlx::query(
            "DELETE FROM dead_letters WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(ms(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if let Some(retention) = dead_letter_retention {
            dead += sqlx::query("DELETE FROM dead_letters WHERE received_at <= $1")
                .bind(ms(now - retention))
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        Ok((handled, dead))
    }

    /// Moves every replayable dead letter back to incoming with a reset
    /// owner, in one transaction, so replaying a class of failures needs
    /// no per-message intervention.
    pub async fn move_replayable_to_incoming(&self) -> Result<u64, Error> {
        let now = ms(Utc::now());
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "INSERT INTO incoming_envelopes
                 (id, status, owner_id, execution_time, attempts, message_type, body,
                  received_at, last_touched, keep_until)
             SELECT id, 'incoming', 0, NULL, 0, message_type, body, $1, $1, NULL
             FROM dead_letters WHERE replayable = 1
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM dead_letters WHERE replayable = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved)
    }

    // ---- node bookkeeping ----

    pub async fn record_heartbeat(
        &self,
        control_uri: Option<&Url>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO nodes (id, control_uri, last_seen) VALUES ($1, $2, $3)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(self.node_id as i64)
        .bind(control_uri.map(Url::to_string))
        .bind(ms(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases all work owned by nodes that stopped heartbeating, then
    /// forgets those nodes. Returns the number of envelopes released.
    pub async fn reassign_dormant_nodes(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<u64, Error> {
        let cutoff = ms(now - timeout);
        let mut tx = self.pool.begin().await?;

        let incoming = sqlx::query(
            "UPDATE incoming_envelopes SET owner_id = 0
             WHERE owner_id IN (SELECT id FROM nodes WHERE last_seen < $1 AND id <> $2)",
        )
        .bind(cutoff)
        .bind(self.node_id as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outgoing = sqlx::query(
            "UPDATE outgoing_envelopes SET owner_id = 0
             WHERE owner_id IN (SELECT id FROM nodes WHERE last_seen < $1 AND id <> $2)",
        )
        .bind(cutoff)
        .bind(self.node_id as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM nodes WHERE last_seen < $1 AND id <> $2")
            .bind(cutoff)
            .bind(self.node_id as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(incoming + outgoing)
    }
}

async fn insert_incoming(
    db: &mut SqliteConnection,
    envelope: &Envelope,
    status: EnvelopeStatus,
    owner_id: u32,
    execution_time: Option<i64>,
) -> Result<(), Error> {
    let now = ms(Utc::now());
    sqlx::query(
        "INSERT INTO incoming_envelopes
             (id, status, owner_id, execution_time, attempts, message_type, body,
              received_at, last_touched, keep_until)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, NULL)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(envelope.id.to_string())
    .bind(status)
    .bind(owner_id as i64)
    .bind(execution_time)
    .bind(envelope.attempts as i64)
    .bind(&envelope.message_type)
    .bind(encode_body(envelope))
    .bind(now)
    .execute(db)
    .await?;
    Ok(())
}

async fn insert_outgoing(
    db: &mut SqliteConnection,
    envelope: &Envelope,
    owner_id: u32,
) -> Result<(), Error> {
    let destination = envelope
        .destination
        .as_ref()
        .map(Url::to_string)
        .ok_or_else(|| Error::wire(format!("outgoing envelope {} has no destination", envelope.id)))?;

    sqlx::query(
        "INSERT INTO outgoing_envelopes
             (id, owner_id, destination, deliver_by, attempts, message_type, body)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(envelope.id.to_string())
    .bind(owner_id as i64)
    .bind(destination)
    .bind(envelope.deliver_by.map(ms))
    .bind(envelope.attempts as i64)
    .bind(&envelope.message_type)
    .bind(encode_body(envelope))
    .execute(db)
    .await?;
    Ok(())
}

#[async_trait]
impl Inbox for SqliteStore {
    async fn store_incoming(&self, envelopes: &[Envelope]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            insert_incoming(&mut tx, envelope, EnvelopeStatus::Incoming, self.node_id, None)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn schedule_execution(
        &self,
        envelope: &Envelope,
        time: DateTime<Utc>,
    ) -> Result<(), Error> {
        // upsert keyed by id: re-scheduling updates in place
        sqlx::query(
            "INSERT INTO incoming_envelopes
                 (id, status, owner_id, execution_time, attempts, message_type, body,
                  received_at, last_touched, keep_until)
             VALUES ($1, 'scheduled', 0, $2, $3, $4, $5, $6, $6, NULL)
             ON CONFLICT(id) DO UPDATE SET
                 status = 'scheduled',
                 owner_id = 0,
                 execution_time = excluded.execution_time,
                 last_touched = excluded.last_touched",
        )
        .bind(envelope.id.to_string())
        .bind(ms(time))
        .bind(envelope.attempts as i64)
        .bind(&envelope.message_type)
        .bind(encode_body(envelope))
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_incoming_handled(
        &self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE incoming_envelopes
             SET status = 'handled', owner_id = 0, keep_until = $1, last_touched = $2
             WHERE id = $3",
        )
        .bind(ms(keep_until))
        .bind(ms(Utc::now()))
        .bind(envelope.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &Envelope,
        failure: &HandlerFailure,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO dead_letters
                 (id, message_type, error_type, error_message, replayable, expires_at,
                  received_at, body)
             VALUES ($1, $2, $3, $4, 0, NULL, $5, $6)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(envelope.id.to_string())
        .bind(&envelope.message_type)
        .bind(&failure.error_type)
        .bind(&failure.message)
        .bind(ms(Utc::now()))
        .bind(encode_body(envelope))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM incoming_envelopes WHERE id = $1")
            .bind(envelope.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> Result<(), Error> {
        sqlx::query(
            "UPDATE incoming_envelopes SET attempts = $1, last_touched = $2 WHERE id = $3",
        )
        .bind(envelope.attempts as i64)
        .bind(ms(Utc::now()))
        .bind(envelope.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetters for SqliteStore {
    async fn mark_replayable_by_error_type(&self, error_type: &str) -> Result<u64, Error> {
        let result = sqlx::query("UPDATE dead_letters SET replayable = 1 WHERE error_type = $1")
            .bind(error_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_replayable_by_ids(&self, ids: &[Uuid]) -> Result<u64, Error> {
        let mut affected = 0;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            affected += sqlx::query("UPDATE dead_letters SET replayable = 1 WHERE id = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn all_dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
        Ok(sqlx::query_as(
            "SELECT id, message_type, error_type, error_message, replayable, expires_at,
                    received_at
             FROM dead_letters ORDER BY received_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl Admin for SqliteStore {
    async fn all_incoming(&self) -> Result<Vec<Envelope>, Error> {
        let rows: Vec<IncomingRow> = sqlx::query_as(
            "SELECT id, status, owner_id, execution_time, attempts, body
             FROM incoming_envelopes ORDER BY received_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncomingRow::into_envelope).collect()
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, Error> {
        let status_count = |status: &'static str| {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM incoming_envelopes WHERE status = $1",
            )
            .bind(status)
            .fetch_one(&self.pool)
        };

        let incoming = status_count("incoming").await?;
        let scheduled = status_count("scheduled").await?;
        let handled = status_count("handled").await?;

        let outgoing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outgoing_envelopes")
            .fetch_one(&self.pool)
            .await?;
        let dead_letter = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(PersistedCounts {
            incoming,
            scheduled,
            handled,
            outgoing,
            dead_letter,
        })
    }

    async fn clear_all(&self) -> Result<(), Error> {
        // independent truncations; no transaction needed
        sqlx::raw_sql(
            "DELETE FROM incoming_envelopes;
             DELETE FROM outgoing_envelopes;
             DELETE FROM dead_letters;
             DELETE FROM nodes;",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), Error> {
        sqlx::raw_sql(DROP).execute(&self.pool).await?;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// Envelope persistence enlisted in a caller-owned transaction. The
/// database transaction opens on first write; rollback with nothing
/// opened is a no-op.
pub struct SqliteEnvelopeTransaction {
    pool: SqlitePool,
    node_id: u32,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteEnvelopeTransaction {
    async fn ensure_open(&mut self) -> Result<&mut Transaction<'static, Sqlite>, Error> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        Ok(self.tx.as_mut().expect("transaction was just opened"))
    }

    /// Runs a piece of business work inside the same transaction the
    /// envelopes are persisted in.
    pub async fn execute<F, T>(&mut self, work: F) -> Result<T, Error>
    where
        F: for<'c> FnOnce(
            &'c mut SqliteConnection,
        )
            -> futures_util::future::BoxFuture<'c, Result<T, Error>>,
    {
        let tx = self.ensure_open().await?;
        work(&mut **tx).await
    }

    pub async fn commit(mut self) -> Result<(), Error> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeTransaction for SqliteEnvelopeTransaction {
    async fn persist_outgoing(&mut self, envelopes: &[Envelope]) -> Result<(), Error> {
        let node_id = self.node_id;
        let tx = self.ensure_open().await?;
        for envelope in envelopes {
            insert_outgoing(&mut **tx, envelope, node_id).await?;
        }
        Ok(())
    }

    async fn persist_incoming(&mut self, envelopes: &[Envelope]) -> Result<(), Error> {
        let node_id = self.node_id;
        let tx = self.ensure_open().await?;
        for envelope in envelopes {
            insert_incoming(&mut **tx, envelope, EnvelopeStatus::Incoming, node_id, None).await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
