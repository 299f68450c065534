//! # Message model for deliveries handed to listeners.
//!
//! A [`Message`] is one broker delivery: an opaque body plus the
//! [`MessageProperties`] the broker attached to it. Serialization of the body
//! is out of scope for this crate; listeners receive the raw bytes.

use std::collections::BTreeMap;

/// Broker-assigned and publisher-assigned metadata for one delivery.
///
/// `delivery_tag` and `consumer_tag` are channel-local and only valid until
/// the delivery is acked or rejected on the same channel.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// Publisher-assigned message id, if any. Used as the key for stateful
    /// retry middleware.
    pub message_id: Option<String>,
    /// Publisher-assigned correlation id, if any.
    pub correlation_id: Option<String>,
    /// MIME content type of the body, if declared by the publisher.
    pub content_type: Option<String>,
    /// Application headers.
    pub headers: BTreeMap<String, String>,
    /// True when the broker redelivered this message after a requeue.
    pub redelivered: bool,
    /// Channel-local identifier of this delivery.
    pub delivery_tag: u64,
    /// Tag of the consumer the broker delivered this message to.
    pub consumer_tag: String,
    /// Name of the queue this message was consumed from.
    pub queue: String,
}

/// One delivery: body bytes plus broker properties.
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw message payload.
    pub body: Vec<u8>,
    /// Delivery metadata.
    pub properties: MessageProperties,
}

impl Message {
    /// Creates a message from a body and its properties.
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }

    /// Channel-local delivery tag of this message.
    pub fn delivery_tag(&self) -> u64 {
        self.properties.delivery_tag
    }

    /// Queue this message was consumed from.
    pub fn queue(&self) -> &str {
        &self.properties.queue
    }

    /// True when the broker redelivered this message.
    pub fn redelivered(&self) -> bool {
        self.properties.redelivered
    }
}
