//! Call signaling protocol
//!
//! Offers, answers, ICE candidates and hang-ups travel over a topic-scoped
//! pub/sub channel, one topic per conversation. Every participant sees every
//! message on the topic (its own included), so receivers filter by sender and
//! addressee.

use crate::identity::UserId;
use crate::types::{IceCandidateInit, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Publish failed
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Joining a topic failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Channel no longer usable
    #[error("Signaling channel closed")]
    Closed,

    /// Payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Signaling message types
///
/// Serialized with the event name in `event` and camelCase fields, e.g.
/// `{"event":"offer","senderId":"x","receiverId":"y","offer":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SignalingMessage {
    /// Session offer
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer {
        /// Caller
        sender_id: UserId,
        /// Callee
        receiver_id: UserId,
        /// Offer description
        offer: SessionDescription,
    },

    /// Session answer
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        /// Callee
        sender_id: UserId,
        /// Caller
        receiver_id: UserId,
        /// Answer description
        answer: SessionDescription,
    },

    /// Trickled ICE candidate
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Candidate owner
        sender_id: UserId,
        /// Intended receiver
        target_id: UserId,
        /// The candidate
        candidate: IceCandidateInit,
    },

    /// Hang-up
    #[serde(rename = "end-call", rename_all = "camelCase")]
    EndCall {
        /// Who hung up
        sender_id: UserId,
        /// The other party
        target_id: UserId,
    },
}

impl SignalingMessage {
    /// Who published the message
    #[must_use]
    pub fn sender(&self) -> &UserId {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. }
            | Self::EndCall { sender_id, .. } => sender_id,
        }
    }

    /// Who the message is addressed to
    #[must_use]
    pub fn recipient(&self) -> &UserId {
        match self {
            Self::Offer { receiver_id, .. } | Self::Answer { receiver_id, .. } => receiver_id,
            Self::IceCandidate { target_id, .. } | Self::EndCall { target_id, .. } => target_id,
        }
    }

    /// Whether the message is addressed to `user`
    #[must_use]
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        self.recipient() == user
    }

    /// Event name on the wire
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::EndCall { .. } => "end-call",
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a known message
    pub fn from_json(s: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(s).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// Split into a wire event name and its payload fields
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_event(&self) -> Result<ChannelEvent, SignalingError> {
        let mut payload =
            serde_json::to_value(self).map_err(|e| SignalingError::Codec(e.to_string()))?;
        if let Some(fields) = payload.as_object_mut() {
            fields.remove("event");
        }
        Ok(ChannelEvent {
            event: self.event_name().to_string(),
            payload,
        })
    }

    /// Rebuild a message from a wire event
    ///
    /// # Errors
    ///
    /// Returns error if the event name is unknown or the payload lacks a field
    pub fn from_event(event: &ChannelEvent) -> Result<Self, SignalingError> {
        let serde_json::Value::Object(fields) = &event.payload else {
            return Err(SignalingError::Codec(format!(
                "{} payload is not an object",
                event.event
            )));
        };
        let mut tagged = fields.clone();
        tagged.insert(
            "event".to_string(),
            serde_json::Value::String(event.event.clone()),
        );
        serde_json::from_value(serde_json::Value::Object(tagged))
            .map_err(|e| SignalingError::Codec(e.to_string()))
    }
}

/// A named JSON event as carried by a generic realtime backend
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    /// Event name (`offer`, `answer`, `ice-candidate`, `end-call`)
    pub event: String,
    /// Message fields
    pub payload: serde_json::Value,
}

/// Handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A joined topic
///
/// Messages arrive on `messages` in per-sender publish order.
#[derive(Debug)]
pub struct Subscription {
    /// Handle to pass to [`SignalingChannel::unsubscribe`]
    pub id: SubscriptionId,
    /// Topic name
    pub topic: String,
    /// Inbound messages
    pub messages: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Topic-scoped pub/sub channel
///
/// Implement this over the application's realtime backend.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Join a topic
    ///
    /// Every message published on the topic is delivered, including the
    /// subscriber's own.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError>;

    /// Fire-and-forget publish, no delivery acknowledgment
    async fn publish(&self, topic: &str, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Leave a topic. Must be called exactly once per subscription.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError>;
}

/// A joined topic on an [`EventChannel`]
#[derive(Debug)]
pub struct EventSubscription {
    /// Handle to pass to [`EventChannel::unsubscribe`]
    pub id: SubscriptionId,
    /// Topic name
    pub topic: String,
    /// Raw inbound events
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Untyped pub/sub backend: `publish(event, payload)` on a topic
///
/// This is the shape most realtime services expose. Wrap one in
/// [`JsonSignalingChannel`] to get a [`SignalingChannel`].
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Join a topic
    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, SignalingError>;

    /// Publish a named event
    async fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError>;

    /// Leave a topic
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError>;
}

/// [`SignalingChannel`] over an [`EventChannel`]
///
/// Each subscription runs a decoder task. Payloads that do not decode into a
/// [`SignalingMessage`] are logged and dropped; the subscription keeps
/// delivering. The task stops once the backend closes the raw stream or the
/// typed receiver is dropped.
pub struct JsonSignalingChannel {
    events: Arc<dyn EventChannel>,
}

impl JsonSignalingChannel {
    /// Wrap a raw backend
    #[must_use]
    pub fn new(events: Arc<dyn EventChannel>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl SignalingChannel for JsonSignalingChannel {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        let EventSubscription {
            id,
            topic,
            mut events,
        } = self.events.subscribe(topic).await?;
        let (tx, messages) = mpsc::unbounded_channel();
        let decode_topic = topic.clone();
        tokio::spawn(async move {
            while let Some(raw) = events.recv().await {
                match SignalingMessage::from_event(&raw) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(
                        topic = %decode_topic,
                        event = %raw.event,
                        error = %e,
                        "Dropping malformed signaling payload"
                    ),
                }
            }
            tracing::trace!(topic = %decode_topic, "Signaling decoder stopped");
        });
        Ok(Subscription {
            id,
            topic,
            messages,
        })
    }

    async fn publish(&self, topic: &str, message: SignalingMessage) -> Result<(), SignalingError> {
        let ChannelEvent { event, payload } = message.to_event()?;
        self.events.publish(topic, &event, payload).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError> {
        self.events.unsubscribe(id).await
    }
}

/// Signaling handler bound to one conversation topic
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
    topic: String,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
        }
    }

    /// Topic this handler publishes on
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Join the topic
    ///
    /// # Errors
    ///
    /// Returns error if the channel refuses the subscription
    #[tracing::instrument(skip(self), fields(topic = %self.topic))]
    pub async fn subscribe(&self) -> Result<Subscription, SignalingError> {
        let sub = self.channel.subscribe(&self.topic).await?;
        tracing::debug!(subscription = %sub.id, "Joined signaling topic");
        Ok(sub)
    }

    /// Leave the topic
    ///
    /// # Errors
    ///
    /// Returns error if the channel fails to release the subscription
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError> {
        self.channel.unsubscribe(id).await?;
        tracing::debug!(topic = %self.topic, subscription = %id, "Left signaling topic");
        Ok(())
    }

    /// Publish a message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(topic = %self.topic, event = message.event_name()))]
    pub async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Publishing signaling message");
        self.channel.publish(&self.topic, message).await
    }

    /// Publish without surfacing failures
    ///
    /// Failures are not retried; a lost candidate only narrows the candidate
    /// set. Returns whether the publish succeeded.
    pub async fn publish_best_effort(&self, message: SignalingMessage) -> bool {
        let event = message.event_name();
        match self.publish(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(topic = %self.topic, event, error = %e, "Signaling publish dropped");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEventBus, MemorySignalingHub};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn offer() -> SignalingMessage {
        SignalingMessage::Offer {
            sender_id: UserId::from("x"),
            receiver_id: UserId::from("y"),
            offer: SessionDescription::offer("v=0\r\n"),
        }
    }

    #[test]
    fn test_offer_wire_shape() {
        let json: serde_json::Value = serde_json::from_str(&offer().to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["senderId"], "x");
        assert_eq!(json["receiverId"], "y");
        assert_eq!(json["offer"]["type"], "offer");
    }

    #[test]
    fn test_candidate_and_end_call_use_target_id() {
        let ice = SignalingMessage::IceCandidate {
            sender_id: UserId::from("x"),
            target_id: UserId::from("y"),
            candidate: IceCandidateInit::new("candidate:1"),
        };
        let json: serde_json::Value = serde_json::from_str(&ice.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "ice-candidate");
        assert_eq!(json["targetId"], "y");
        assert_eq!(json["candidate"]["candidate"], "candidate:1");

        let end = SignalingMessage::from_json(r#"{"event":"end-call","senderId":"y","targetId":"x"}"#)
            .unwrap();
        assert_eq!(
            end,
            SignalingMessage::EndCall {
                sender_id: UserId::from("y"),
                target_id: UserId::from("x"),
            }
        );
    }

    #[test]
    fn test_addressing() {
        let msg = offer();
        assert_eq!(msg.sender(), &UserId::from("x"));
        assert!(msg.is_addressed_to(&UserId::from("y")));
        assert!(!msg.is_addressed_to(&UserId::from("x")));
    }

    #[test]
    fn test_unknown_event_is_codec_error() {
        let result = SignalingMessage::from_json(r#"{"event":"renegotiate","senderId":"x"}"#);
        assert!(matches!(result, Err(SignalingError::Codec(_))));
    }

    #[tokio::test]
    async fn test_handler_publish_reaches_subscriber() {
        let hub = Arc::new(MemorySignalingHub::new());
        let handler = SignalingHandler::new(hub.clone(), "videocall:c1");

        let mut sub = handler.subscribe().await.unwrap();
        handler.publish(offer()).await.unwrap();

        assert_eq!(sub.messages.recv().await, Some(offer()));
        handler.unsubscribe(sub.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failure() {
        let hub = Arc::new(MemorySignalingHub::new());
        hub.set_publish_failure(true);
        let handler = SignalingHandler::new(hub.clone(), "videocall:c1");

        assert!(!handler.publish_best_effort(offer()).await);
        assert!(hub.published("videocall:c1").is_empty());
    }

    #[test]
    fn test_event_payload_omits_tag() {
        let event = offer().to_event().unwrap();
        assert_eq!(event.event, "offer");
        assert_eq!(event.payload["senderId"], "x");
        assert!(event.payload.get("event").is_none());
        assert_eq!(SignalingMessage::from_event(&event).unwrap(), offer());
    }

    #[test]
    fn test_event_with_non_object_payload_is_codec_error() {
        let event = ChannelEvent {
            event: "offer".to_string(),
            payload: json!("v=0"),
        };
        assert!(matches!(
            SignalingMessage::from_event(&event),
            Err(SignalingError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_json_channel_drops_malformed_payloads() {
        let bus = Arc::new(MemoryEventBus::new());
        let channel = JsonSignalingChannel::new(bus.clone());
        let mut sub = channel.subscribe("videocall:c1").await.unwrap();

        bus.publish("videocall:c1", "offer", json!(42)).await.unwrap();
        bus.publish("videocall:c1", "offer", json!({"senderId": "x"}))
            .await
            .unwrap();
        bus.publish("videocall:c1", "renegotiate", json!({"senderId": "x"}))
            .await
            .unwrap();
        channel.publish("videocall:c1", offer()).await.unwrap();

        assert_eq!(sub.messages.recv().await, Some(offer()));
        assert!(sub.messages.try_recv().is_err());

        let raw = bus.published("videocall:c1");
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[3].event, "offer");
        assert_eq!(raw[3].payload["receiverId"], "y");
    }

    #[tokio::test]
    async fn test_json_channel_unsubscribe_ends_stream() {
        let bus = Arc::new(MemoryEventBus::new());
        let channel = JsonSignalingChannel::new(bus.clone());
        let mut sub = channel.subscribe("videocall:c1").await.unwrap();
        assert_eq!(bus.subscriber_count("videocall:c1"), 1);

        channel.unsubscribe(sub.id).await.unwrap();

        assert_eq!(bus.subscriber_count("videocall:c1"), 0);
        assert_eq!(sub.messages.recv().await, None);
    }
}
