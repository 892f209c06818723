//! Message body encoding.
//!
//! A [`Serializer`] turns bodies into a `serde_json::Value` and back. Handlers never see
//! the intermediate value: the body extractor of a handler converts it into the declared
//! message type.
use crate::amqp::{BasicProperties, Envelope};
use serde::Serialize;

/// Encodes and decodes message bodies.
pub trait Serializer: Send + Sync + 'static {
    /// The `content_type` stamped on messages published with this serializer.
    fn content_type(&self) -> &str;

    fn serialize(
        &self,
        properties: &BasicProperties,
        value: &serde_json::Value,
    ) -> Result<Vec<u8>, SerializationError>;

    /// Decode the body of `envelope`.
    ///
    /// An empty (or whitespace-only) body decodes to `None`.
    fn deserialize(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<serde_json::Value>, SerializationError>;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("The message body is not valid {content_type}")]
    Decode {
        content_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("The message body cannot be read as `{type_name}`")]
    Shape {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("The message body is empty but `{type_name}` is not optional")]
    MissingBody { type_name: &'static str },
    #[error("Failed to encode the payload")]
    Encode(#[source] serde_json::Error),
    #[error("Unsupported content type `{0}`")]
    UnsupportedContentType(String),
}

/// JSON bodies, via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    const CONTENT_TYPE: &'static str = "application/json";
}

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn serialize(
        &self,
        _properties: &BasicProperties,
        value: &serde_json::Value,
    ) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(SerializationError::Encode)
    }

    fn deserialize(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<serde_json::Value>, SerializationError> {
        // Messages without a content type are assumed to be JSON.
        if let Some(content_type) = envelope.properties.content_type() {
            if !content_type.as_str().contains("json") {
                return Err(SerializationError::UnsupportedContentType(
                    content_type.to_string(),
                ));
            }
        }
        if envelope.data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        match serde_json::from_slice(&envelope.data) {
            Ok(serde_json::Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(source) => Err(SerializationError::Decode {
                content_type: Self::CONTENT_TYPE.into(),
                source,
            }),
        }
    }
}

/// The body of a message published by a [`BrokerAction`](crate::consumers::BrokerAction).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded with the consumer's [`Serializer`].
    Value(serde_json::Value),
    /// Published as is.
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, SerializationError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(SerializationError::Encode)
    }

    pub(crate) fn encode(
        &self,
        serializer: &dyn Serializer,
        properties: &BasicProperties,
    ) -> Result<Vec<u8>, SerializationError> {
        match self {
            Self::Value(value) => serializer.serialize(properties, value),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// The content type to stamp, if the payload goes through the serializer.
    pub(crate) fn content_type<'a>(&self, serializer: &'a dyn Serializer) -> Option<&'a str> {
        match self {
            Self::Value(_) => Some(serializer.content_type()),
            Self::Bytes(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}
