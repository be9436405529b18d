//! Binary envelope-batch wire format.
//!
//! Used by point-to-point transports to move whole batches in one write.
//! The stream is length-prefixed throughout:
//!
//! ```text
//! i32 count
//! per envelope:
//!   i64 sent-at (unix milliseconds)
//!   i32 header count
//!   header count x (string key, string value)
//!   i32 body length, body bytes
//! ```
//!
//! Strings are a u32 byte length followed by UTF-8. Envelope fields are
//! carried as headers under a fixed key vocabulary; keys outside the
//! vocabulary fall through to the envelope's free-form header map. The
//! format round-trips every populated field exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::{envelope::Envelope, error::Error};

mod keys {
    pub const ID: &str = "id";
    pub const SOURCE: &str = "source";
    pub const MESSAGE_TYPE: &str = "message-type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const REPLY_URI: &str = "reply-uri";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CONVERSATION_ID: &str = "conversation-id";
    pub const DESTINATION: &str = "destination";
    pub const SAGA_ID: &str = "saga-id";
    pub const PARENT_ID: &str = "parent-id";
    pub const TENANT_ID: &str = "tenant-id";
    pub const TOPIC_NAME: &str = "topic-name";
    pub const ACCEPTED_CONTENT_TYPES: &str = "accepted-content-types";
    pub const REPLY_REQUESTED: &str = "reply-requested";
    pub const ACK_REQUESTED: &str = "ack-requested";
    pub const IS_RESPONSE: &str = "is-response";
    pub const GROUP_ID: &str = "group-id";
    pub const DEDUPLICATION_ID: &str = "deduplication-id";
    pub const EXECUTION_TIME: &str = "execution-time";
    pub const ATTEMPTS: &str = "attempts";
    pub const DELIVER_BY: &str = "deliver-by";
}

pub fn write_batch(envelopes: &[Envelope]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(envelopes.len() as i32);
    for envelope in envelopes {
        write_envelope(&mut buf, envelope);
    }
    buf.freeze()
}

pub fn read_batch(mut data: Bytes) -> Result<Vec<Envelope>, Error> {
    if data.remaining() < 4 {
        return Err(Error::wire("truncated batch header"));
    }
    let count = data.get_i32();
    if count < 0 {
        return Err(Error::wire(format!("negative envelope count {count}")));
    }

    let mut envelopes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        envelopes.push(read_envelope(&mut data)?);
    }
    Ok(envelopes)
}

fn write_envelope(buf: &mut BytesMut, envelope: &Envelope) {
    buf.put_i64(envelope.sent_at.timestamp_millis());

    let mut pairs: Vec<(String, String)> = Vec::new();

    pairs.push((keys::ID.into(), envelope.id.to_string()));
    pairs.push((keys::MESSAGE_TYPE.into(), envelope.message_type.clone()));
    pairs.push((keys::CONTENT_TYPE.into(), envelope.content_type.clone()));
    pairs.push((keys::ATTEMPTS.into(), envelope.attempts.to_string()));

    if let Some(v) = &envelope.source {
        pairs.push((keys::SOURCE.into(), v.clone()));
    }
    if let Some(v) = &envelope.correlation_id {
        pairs.push((keys::CORRELATION_ID.into(), v.clone()));
    }
    if let Some(v) = &envelope.conversation_id {
        pairs.push((keys::CONVERSATION_ID.into(), v.to_string()));
    }
    if let Some(v) = &envelope.parent_id {
        pairs.push((keys::PARENT_ID.into(), v.clone()));
    }
    if let Some(v) = &envelope.saga_id {
        pairs.push((keys::SAGA_ID.into(), v.clone()));
    }
    if let Some(v) = &envelope.destination {
        pairs.push((keys::DESTINATION.into(), v.to_string()));
    }
    if let Some(v) = &envelope.reply_uri {
        pairs.push((keys::REPLY_URI.into(), v.to_string()));
    }
    if let Some(v) = &envelope.reply_requested {
        pairs.push((keys::REPLY_REQUESTED.into(), v.clone()));
    }
    if envelope.ack_requested {
        pairs.push((keys::ACK_REQUESTED.into(), "true".into()));
    }
    if envelope.is_response {
        pairs.push((keys::IS_RESPONSE.into(), "true".into()));
    }
    if let Some(v) = &envelope.topic_name {
        pairs.push((keys::TOPIC_NAME.into(), v.clone()));
    }
    if let Some(v) = &envelope.group_id {
        pairs.push((keys::GROUP_ID.into(), v.clone()));
    }
    if let Some(v) = &envelope.deduplication_id {
        pairs.push((keys::DEDUPLICATION_ID.into(), v.clone()));
    }
    if let Some(v) = &envelope.tenant_id {
        pairs.push((keys::TENANT_ID.into(), v.clone()));
    }
    if !envelope.accepted_content_types.is_empty() {
        pairs.push((
            keys::ACCEPTED_CONTENT_TYPES.into(),
            envelope.accepted_content_types.join(","),
        ));
    }
    if let Some(v) = &envelope.scheduled_time {
        pairs.push((keys::EXECUTION_TIME.into(), v.to_rfc3339()));
    }
    if let Some(v) = &envelope.deliver_by {
        pairs.push((keys::DELIVER_BY.into(), v.to_rfc3339()));
    }

    for (key, value) in &envelope.headers {
        pairs.push((key.clone(), value.clone()));
    }

    buf.put_i32(pairs.len() as i32);
    for (key, value) in &pairs {
        write_string(buf, key);
        write_string(buf, value);
    }

    buf.put_i32(envelope.data.len() as i32);
    buf.put_slice(&envelope.data);
}

fn read_envelope(data: &mut Bytes) -> Result<Envelope, Error> {
    if data.remaining() < 12 {
        return Err(Error::wire("truncated envelope header"));
    }

    let sent_at_millis = data.get_i64();
    let sent_at = Utc
        .timestamp_millis_opt(sent_at_millis)
        .single()
        .ok_or_else(|| Error::wire(format!("invalid sent-at timestamp {sent_at_millis}")))?;

    let mut envelope = Envelope {
        sent_at,
        content_type: String::new(),
        ..Default::default()
    };

    let header_count = data.get_i32();
    if header_count < 0 {
        return Err(Error::wire(format!("negative header count {header_count}")));
    }

    for _ in 0..header_count {
        let key = read_string(data)?;
        let value = read_string(data)?;
        apply_header(&mut envelope, &key, value)?;
    }

    if data.remaining() < 4 {
        return Err(Error::wire("truncated body length"));
    }
    let body_len = data.get_i32();
    if body_len < 0 {
        return Err(Error::wire(format!("negative body length {body_len}")));
    }
    if data.remaining() < body_len as usize {
        return Err(Error::wire("truncated body"));
    }
    envelope.data = data.split_to(body_len as usize);

    Ok(envelope)
}

fn apply_header(envelope: &mut Envelope, key: &str, value: String) -> Result<(), Error> {
    match key {
        keys::ID => {
            envelope.id = value
                .parse()
                .map_err(|_| Error::wire(format!("invalid envelope id {value}")))?;
        }
        keys::MESSAGE_TYPE => envelope.message_type = value,
        keys::CONTENT_TYPE => envelope.content_type = value,
        keys::ATTEMPTS => {
            envelope.attempts = value
                .parse()
                .map_err(|_| Error::wire(format!("invalid attempts value {value}")))?;
        }
        keys::SOURCE => envelope.source = Some(value),
        keys::CORRELATION_ID => envelope.correlation_id = Some(value),
        keys::CONVERSATION_ID => {
            envelope.conversation_id = Some(
                value
                    .parse()
                    .map_err(|_| Error::wire(format!("invalid conversation id {value}")))?,
            );
        }
        keys::PARENT_ID => envelope.parent_id = Some(value),
        keys::SAGA_ID => envelope.saga_id = Some(value),
        keys::DESTINATION => {
            envelope.destination = Some(parse_url(keys::DESTINATION, &value)?);
        }
        keys::REPLY_URI => {
            envelope.reply_uri = Some(parse_url(keys::REPLY_URI, &value)?);
        }
        keys::REPLY_REQUESTED => envelope.reply_requested = Some(value),
        keys::ACK_REQUESTED => envelope.ack_requested = value == "true",
        keys::IS_RESPONSE => envelope.is_response = value == "true",
        keys::TOPIC_NAME => envelope.topic_name = Some(value),
        keys::GROUP_ID => envelope.group_id = Some(value),
        keys::DEDUPLICATION_ID => envelope.deduplication_id = Some(value),
        keys::TENANT_ID => envelope.tenant_id = Some(value),
        keys::ACCEPTED_CONTENT_TYPES => {
            envelope.accepted_content_types = value.split(',').map(str::to_owned).collect();
        }
        keys::EXECUTION_TIME => {
            envelope.scheduled_time = Some(parse_time(keys::EXECUTION_TIME, &value)?);
        }
        keys::DELIVER_BY => {
            envelope.deliver_by = Some(parse_time(keys::DELIVER_BY, &value)?);
        }
        // Anything outside the vocabulary is user metadata.
        _ => {
            envelope.headers.insert(key.to_owned(), value);
        }
    }
    Ok(())
}

fn parse_url(key: &str, value: &str) -> Result<url::Url, Error> {
    value
        .parse()
        .map_err(|_| Error::wire(format!("invalid {key} uri {value}")))
}

fn parse_time(key: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::wire(format!("invalid {key} timestamp {value}")))
}

fn write_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn read_string(data: &mut Bytes) -> Result<String, Error> {
    if data.remaining() < 4 {
        return Err(Error::wire("truncated string length"));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(Error::wire("truncated string"));
    }
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::wire("string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fully_populated() -> Envelope {
        let sent_at = Utc
            .timestamp_millis_opt(Utc::now().timestamp_millis())
            .single()
            .unwrap();

        let mut env = Envelope::new("orders.placed", r#"{"sku":"A-1"}"#);
        env.sent_at = sent_at;
        env.correlation_id = Some("corr-9".into());
        env.conversation_id = Some(uuid::Uuid::new_v4());
        env.parent_id = Some("parent-1".into());
        env.saga_id = Some("saga-7".into());
        env.source = Some("node-a".into());
        env.accepted_content_types = vec!["application/json".into(), "binary/ironbus".into()];
        env.destination = Some("tcp://127.0.0.1:4000/orders".parse().unwrap());
        env.reply_uri = Some("tcp://127.0.0.1:4001/replies".parse().unwrap());
        env.reply_requested = Some("orders.confirmed".into());
        env.ack_requested = true;
        env.is_response = true;
        env.topic_name = Some("orders".into());
        env.group_id = Some("customer-42".into());
        env.deduplication_id = Some("dedup-5".into());
        env.scheduled_time = Some(sent_at + Duration::minutes(5));
        env.deliver_by = Some(sent_at + Duration::hours(1));
        env.tenant_id = Some("tenant-1".into());
        env.attempts = 3;
        env.headers.insert("trace-state".into(), "abc".into());
        env.headers.insert("audit-user".into(), "ops".into());
        env
    }

    #[test]
    fn round_trips_every_populated_field() {
        let original = fully_populated();
        let decoded = read_batch(write_batch(std::slice::from_ref(&original))).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], original);
    }

    #[test]
    fn round_trips_with_optional_fields_unset() {
        let mut original = Envelope::new("orders.placed", "{}");
        // the wire format carries millisecond precision
        original.sent_at = Utc
            .timestamp_millis_opt(original.sent_at.timestamp_millis())
            .single()
            .unwrap();
        let decoded = read_batch(write_batch(std::slice::from_ref(&original))).unwrap();

        assert_eq!(decoded[0], original);
        assert!(decoded[0].scheduled_time.is_none());
        assert!(decoded[0].deliver_by.is_none());
        assert!(decoded[0].tenant_id.is_none());
        assert!(decoded[0].headers.is_empty());
    }

    #[test]
    fn preserves_batch_order() {
        let batch: Vec<Envelope> = (0..5)
            .map(|i| Envelope::new(format!("orders.{i}"), "{}"))
            .collect();

        let decoded = read_batch(write_batch(&batch)).unwrap();
        let types: Vec<&str> = decoded.iter().map(|e| e.message_type.as_str()).collect();

        assert_eq!(
            types,
            vec!["orders.0", "orders.1", "orders.2", "orders.3", "orders.4"]
        );
    }

    #[test]
    fn rejects_truncated_input() {
        let data = write_batch(&[fully_populated()]);
        let truncated = data.slice(0..data.len() - 3);
        assert!(read_batch(truncated).is_err());
    }
}
