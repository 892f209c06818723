//! Helpers around [`BasicProperties`], whose headers `lapin` only exposes immutably.
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use std::borrow::Cow;

/// The value of header `name`, if present.
pub fn header<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    properties.headers().as_ref()?.inner().get(name)
}

/// Reads a header value as text. `None` unless it is a short or long string.
pub fn header_text(value: &AMQPValue) -> Option<Cow<'_, str>> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes())),
        AMQPValue::ShortString(text) => Some(Cow::Borrowed(text.as_str())),
        _ => None,
    }
}

/// Returns `properties` with header `name` set to `value`, replacing any previous value.
///
/// ```rust
/// use carrot_dispatch::amqp::convenience::{header, header_text, with_header};
/// use carrot_dispatch::amqp::types::AMQPValue;
/// use carrot_dispatch::amqp::BasicProperties;
///
/// let properties = with_header(
///     BasicProperties::default(),
///     "x-region",
///     AMQPValue::LongString("eu-west".into()),
/// );
/// let region = header(&properties, "x-region").and_then(header_text);
/// assert_eq!(region.as_deref(), Some("eu-west"));
/// ```
pub fn with_header(properties: BasicProperties, name: &str, value: AMQPValue) -> BasicProperties {
    let mut headers: FieldTable = properties.headers().clone().unwrap_or_default();
    headers.insert(name.into(), value);
    properties.with_headers(headers)
}

/// Copy every property except `expiration`.
///
/// Used when a delivery is re-published: a TTL set on the original message must not leak
/// into the copy.
pub fn without_expiration(properties: &BasicProperties) -> BasicProperties {
    let mut copy = BasicProperties::default();
    if let Some(v) = properties.content_type() {
        copy = copy.with_content_type(v.clone());
    }
    if let Some(v) = properties.content_encoding() {
        copy = copy.with_content_encoding(v.clone());
    }
    if let Some(v) = properties.headers() {
        copy = copy.with_headers(v.clone());
    }
    if let Some(v) = properties.delivery_mode() {
        copy = copy.with_delivery_mode(*v);
    }
    if let Some(v) = properties.priority() {
        copy = copy.with_priority(*v);
    }
    if let Some(v) = properties.correlation_id() {
        copy = copy.with_correlation_id(v.clone());
    }
    if let Some(v) = properties.reply_to() {
        copy = copy.with_reply_to(v.clone());
    }
    if let Some(v) = properties.message_id() {
        copy = copy.with_message_id(v.clone());
    }
    if let Some(v) = properties.timestamp() {
        copy = copy.with_timestamp(*v);
    }
    if let Some(v) = properties.kind() {
        copy = copy.with_kind(v.clone());
    }
    if let Some(v) = properties.user_id() {
        copy = copy.with_user_id(v.clone());
    }
    if let Some(v) = properties.app_id() {
        copy = copy.with_app_id(v.clone());
    }
    if let Some(v) = properties.cluster_id() {
        copy = copy.with_cluster_id(v.clone());
    }
    copy
}
