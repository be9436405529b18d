//! Content-type keyed payload serialization.
//!
//! The router and transports never assume a wire format; they go through
//! a [`MessageSerializer`] looked up by the envelope's `content_type`
//! string. The registry is read-mostly and backed by a lock-free map.

use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    envelope::{Envelope, JSON_CONTENT_TYPE},
    error::Error,
};

pub trait MessageSerializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn write(&self, value: &serde_json::Value) -> Result<Bytes, Error>;

    fn read(&self, envelope: &Envelope) -> Result<serde_json::Value, Error>;
}

/// The default serializer. Payloads are stored as canonical JSON text.
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn write(&self, value: &serde_json::Value) -> Result<Bytes, Error> {
        Ok(Bytes::from(serde_json::to_vec(value).map_err(|source| {
            Error::Serialization {
                message_type: String::new(),
                source,
            }
        })?))
    }

    fn read(&self, envelope: &Envelope) -> Result<serde_json::Value, Error> {
        serde_json::from_slice(&envelope.data).map_err(|source| Error::Serialization {
            message_type: envelope.message_type.clone(),
            source,
        })
    }
}

/// Registry of serializers keyed by content type.
pub struct SerializerRegistry {
    serializers: papaya::HashMap<String, Arc<dyn MessageSerializer>>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        let registry = Self {
            serializers: papaya::HashMap::new(),
        };
        registry.register(Arc::new(JsonSerializer));
        registry
    }
}

impl SerializerRegistry {
    pub fn register(&self, serializer: Arc<dyn MessageSerializer>) {
        self.serializers
            .pin()
            .insert(serializer.content_type().to_owned(), serializer.clone());
    }

    pub fn get(&self, content_type: &str) -> Result<Arc<dyn MessageSerializer>, Error> {
        self.serializers
            .pin()
            .get(content_type)
            .cloned()
            .ok_or_else(|| Error::UnknownSerializer {
                content_type: content_type.to_owned(),
            })
    }

    /// Serializes a typed message into payload bytes for the given
    /// content type.
    pub fn write_message<M: Serialize>(
        &self,
        content_type: &str,
        message_type: &str,
        message: &M,
    ) -> Result<Bytes, Error> {
        let value = serde_json::to_value(message).map_err(|source| Error::Serialization {
            message_type: message_type.to_owned(),
            source,
        })?;
        self.get(content_type)?.write(&value)
    }

    /// Deserializes an envelope's payload into a typed message.
    pub fn read_message<M: DeserializeOwned>(&self, envelope: &Envelope) -> Result<M, Error> {
        let value = self.get(&envelope.content_type)?.read(envelope)?;
        serde_json::from_value(value).map_err(|source| Error::Serialization {
            message_type: envelope.message_type.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct PlaceOrder {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn json_round_trip_through_the_registry() {
        let registry = SerializerRegistry::default();

        let data = registry
            .write_message(
                JSON_CONTENT_TYPE,
                "orders.place",
                &PlaceOrder {
                    sku: "A-1".into(),
                    quantity: 3,
                },
            )
            .unwrap();

        let mut envelope = Envelope::new("orders.place", data);
        envelope.content_type = JSON_CONTENT_TYPE.to_owned();

        let decoded: PlaceOrder = registry.read_message(&envelope).unwrap();
        assert_eq!(
            decoded,
            PlaceOrder {
                sku: "A-1".into(),
                quantity: 3
            }
        );
    }

    #[test]
    fn unknown_content_type_is_a_configuration_error() {
        let registry = SerializerRegistry::default();
        let err = registry.get("application/x-unknown").err().unwrap();
        assert!(err.is_configuration_error());
    }
}
