//! Call controller facade
//!
//! [`CallController`] is what an application holds: it joins the
//! conversation's signaling topic, pumps inbound messages into the session
//! machine and exposes the user-level call operations.

use crate::identity::{IdentityProvider, UserId};
use crate::media::{MediaDeviceManager, MediaDevices, MediaStream};
use crate::peer::{PeerConfig, TransportFactory};
use crate::session::{CallError, CallSnapshot, SessionMachine};
use crate::signaling::{SignalingChannel, SignalingHandler, Subscription, SubscriptionId};
use crate::types::{CallEvent, CallState, ConversationId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Call controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Topic prefix; the topic is `{prefix}:{conversation}`
    pub topic_prefix: String,
    /// Buffered call events per subscriber
    pub event_capacity: usize,
    /// Peer connection settings
    pub peer: PeerConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "videocall".to_string(),
            event_capacity: 100,
            peer: PeerConfig::default(),
        }
    }
}

/// One-to-one call controller for a conversation
pub struct CallController {
    machine: Arc<SessionMachine>,
    subscription: Mutex<Option<SubscriptionId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    /// Create a builder
    #[must_use]
    pub fn builder(
        conversation_id: ConversationId,
        identity: Arc<dyn IdentityProvider>,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
    ) -> CallControllerBuilder {
        CallControllerBuilder::new(conversation_id, identity, channel, devices)
    }

    async fn start(
        conversation_id: ConversationId,
        local_user: UserId,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        let topic = conversation_id.topic(&config.topic_prefix);
        let machine = SessionMachine::new(
            conversation_id,
            local_user,
            SignalingHandler::new(channel, topic),
            MediaDeviceManager::new(devices),
            transports,
            config.peer,
            config.event_capacity,
        );

        let subscription = machine.signaling().subscribe().await?;
        let id = subscription.id;
        let pump = spawn_message_pump(Arc::downgrade(&machine), subscription);
        tracing::info!(
            conversation = %machine.conversation_id(),
            user = %machine.local_user(),
            topic = machine.signaling().topic(),
            "Call controller started"
        );

        Ok(Self {
            machine,
            subscription: Mutex::new(Some(id)),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Call `remote`
    ///
    /// # Errors
    ///
    /// Returns error if a call is live or setup fails
    pub async fn start_call(&self, remote: impl Into<UserId>) -> Result<(), CallError> {
        self.machine.start_call(remote.into()).await
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or setup fails
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.machine.answer_call().await
    }

    /// Hang up, decline or cancel. A no-op without a live call.
    pub async fn end_call(&self) {
        self.machine.end_call().await;
    }

    /// Mute or unmute the microphone
    pub async fn toggle_audio(&self, enabled: bool) -> bool {
        self.machine.toggle_audio(enabled).await
    }

    /// Turn the camera on or off
    pub async fn toggle_video(&self, enabled: bool) -> bool {
        self.machine.toggle_video(enabled).await
    }

    /// Send the screen instead of the camera
    ///
    /// # Errors
    ///
    /// Returns error outside an active call or if capture fails
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.machine.start_screen_share().await
    }

    /// Return to the camera
    ///
    /// # Errors
    ///
    /// Returns error if the camera cannot be restored
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.machine.stop_screen_share().await
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.machine.snapshot()
    }

    /// Watch snapshots as they change
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<CallSnapshot> {
        self.machine.observe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.machine.subscribe_events()
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.machine.snapshot().state
    }

    /// Local stream, if any
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.machine.snapshot().local_stream
    }

    /// Remote stream, if any
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.machine.snapshot().remote_stream
    }

    /// Offering or active
    #[must_use]
    pub fn is_call_active(&self) -> bool {
        self.machine.snapshot().is_call_active
    }

    /// Ringing
    #[must_use]
    pub fn is_call_incoming(&self) -> bool {
        self.machine.snapshot().is_call_incoming
    }

    /// Sharing the screen
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.machine.snapshot().is_screen_sharing
    }

    /// Most recent surfaced failure
    #[must_use]
    pub fn last_error(&self) -> Option<CallError> {
        self.machine.snapshot().last_error
    }

    /// Local participant
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        self.machine.local_user()
    }

    /// Conversation served
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        self.machine.conversation_id()
    }

    /// End any live call and leave the signaling topic
    ///
    /// Idempotent: the topic is left exactly once.
    pub async fn shutdown(&self) {
        self.machine.shutdown().await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            if let Err(e) = self.machine.signaling().unsubscribe(id).await {
                tracing::warn!(error = %e, "Failed to leave signaling topic");
            }
            tracing::info!(conversation = %self.machine.conversation_id(), "Call controller stopped");
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if self.subscription.lock().is_some() {
            tracing::warn!(
                conversation = %self.machine.conversation_id(),
                "Call controller dropped without shutdown"
            );
        }
    }
}

fn spawn_message_pump(machine: Weak<SessionMachine>, subscription: Subscription) -> JoinHandle<()> {
    let mut messages = subscription.messages;
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let Some(machine) = machine.upgrade() else {
                break;
            };
            machine.handle_message(message).await;
        }
        tracing::debug!("Signaling message pump finished");
    })
}

/// Builder for [`CallController`]
pub struct CallControllerBuilder {
    conversation_id: ConversationId,
    identity: Arc<dyn IdentityProvider>,
    channel: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    transports: Option<Arc<dyn TransportFactory>>,
    config: CallConfig,
}

impl CallControllerBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        identity: Arc<dyn IdentityProvider>,
        channel: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            conversation_id,
            identity,
            channel,
            devices,
            transports: None,
            config: CallConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific transport backend
    ///
    /// Defaults to the `webrtc` crate backend when the `webrtc-backend`
    /// feature is enabled, and to the in-memory loopback otherwise.
    #[must_use]
    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Subscribe to the conversation topic and start the controller
    ///
    /// # Errors
    ///
    /// Returns error if the signaling subscription fails
    pub async fn build(self) -> Result<CallController, CallError> {
        let transports = self.transports.unwrap_or_else(default_transports);
        let local_user = self.identity.current_user_id();
        CallController::start(
            self.conversation_id,
            local_user,
            self.channel,
            self.devices,
            transports,
            self.config,
        )
        .await
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_transports() -> Arc<dyn TransportFactory> {
    Arc::new(crate::webrtc_transport::WebRtcTransportFactory::new())
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_transports() -> Arc<dyn TransportFactory> {
    Arc::new(crate::memory::MemoryTransportFactory::new())
}
