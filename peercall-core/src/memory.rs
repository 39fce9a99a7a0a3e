//! In-process signaling hub and loopback transport
//!
//! All stand in for network services: [`MemorySignalingHub`] and
//! [`MemoryEventBus`] for the realtime pub/sub backend (typed messages and
//! raw JSON events respectively) and [`MemoryTransportFactory`] for the
//! media transport. Descriptions produced by the loopback transport are
//! SDP-shaped and carry `a=msid` lines, so applying a remote description
//! surfaces the remote party's tracks the same way a real transport does.

use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    announced_tracks, ConnectionState, PeerConfig, PeerError, PeerTransport, TransportEvent,
    TransportFactory,
};
use crate::signaling::{
    ChannelEvent, EventChannel, EventSubscription, SignalingChannel, SignalingError,
    SignalingMessage, Subscription, SubscriptionId,
};
use crate::types::{IceCandidateInit, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// Signaling hub
// ============================================================================

struct Topics<T> {
    next_id: u64,
    subscribers: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<T>)>>,
    log: HashMap<String, Vec<T>>,
    fail_publish: bool,
    fail_subscribe: bool,
}

impl<T> Default for Topics<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: HashMap::new(),
            log: HashMap::new(),
            fail_publish: false,
            fail_subscribe: false,
        }
    }
}

impl<T: Clone> Topics<T> {
    fn subscribe(
        &mut self,
        topic: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<T>), SignalingError> {
        if self.fail_subscribe {
            return Err(SignalingError::Subscribe(format!("cannot join {topic}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        Ok((id, rx))
    }

    fn publish(&mut self, topic: &str, item: T) -> Result<(), SignalingError> {
        if self.fail_publish {
            return Err(SignalingError::Publish("channel unavailable".to_string()));
        }
        self.log
            .entry(topic.to_string())
            .or_default()
            .push(item.clone());
        if let Some(subs) = self.subscribers.get_mut(topic) {
            subs.retain(|(_, tx)| tx.send(item.clone()).is_ok());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> Result<(), SignalingError> {
        for subs in self.subscribers.values_mut() {
            if let Some(pos) = subs.iter().position(|(sub_id, _)| *sub_id == id) {
                subs.remove(pos);
                return Ok(());
            }
        }
        Err(SignalingError::Subscribe(format!("unknown subscription {id}")))
    }

    fn published(&self, topic: &str) -> Vec<T> {
        self.log.get(topic).cloned().unwrap_or_default()
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, Vec::len)
    }
}

/// In-memory topic pub/sub
///
/// Delivers every publish to every subscriber of the topic, the publisher
/// included, preserving publish order.
#[derive(Default)]
pub struct MemorySignalingHub {
    state: Mutex<Topics<SignalingMessage>>,
}

impl MemorySignalingHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_publish_failure(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Make subsequent subscribes fail (or succeed again)
    pub fn set_subscribe_failure(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    /// Every message successfully published on `topic`, in order
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<SignalingMessage> {
        self.state.lock().published(topic)
    }

    /// Live subscriptions on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.lock().subscriber_count(topic)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignalingHub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        let (id, messages) = self.state.lock().subscribe(topic)?;
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            messages,
        })
    }

    async fn publish(&self, topic: &str, message: SignalingMessage) -> Result<(), SignalingError> {
        self.state.lock().publish(topic, message)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError> {
        self.state.lock().unsubscribe(id)
    }
}

/// In-memory bus of named JSON events
///
/// The untyped counterpart of [`MemorySignalingHub`]: it carries whatever
/// payload is published, well-formed or not. Wrap it in a
/// [`JsonSignalingChannel`](crate::signaling::JsonSignalingChannel) to drive a
/// call over it.
#[derive(Default)]
pub struct MemoryEventBus {
    state: Mutex<Topics<ChannelEvent>>,
}

impl MemoryEventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event published on `topic`, in order
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<ChannelEvent> {
        self.state.lock().published(topic)
    }

    /// Live subscriptions on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.lock().subscriber_count(topic)
    }
}

#[async_trait]
impl EventChannel for MemoryEventBus {
    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, SignalingError> {
        let (id, events) = self.state.lock().subscribe(topic)?;
        Ok(EventSubscription {
            id,
            topic: topic.to_string(),
            events,
        })
    }

    async fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        self.state.lock().publish(
            topic,
            ChannelEvent {
                event: event.to_string(),
                payload,
            },
        )
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SignalingError> {
        self.state.lock().unsubscribe(id)
    }
}

// ============================================================================
// Loopback transport
// ============================================================================

#[derive(Default)]
struct TransportState {
    tracks: Vec<(String, TrackKind)>,
    outbound_video: Option<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidateInit>,
    offers_created: usize,
    next_port: u16,
    connected: bool,
    closed: bool,
    close_count: usize,
}

/// Loopback peer transport
pub struct MemoryTransport {
    session_id: String,
    stream_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            stream_id: format!("stream-{}", Uuid::new_v4().simple()),
            events,
            state: Mutex::new(TransportState {
                next_port: 50000,
                ..Default::default()
            }),
        }
    }

    /// Build an SDP-shaped description announcing `tracks`
    #[must_use]
    pub fn sdp_for(stream_id: &str, tracks: &[(String, TrackKind)]) -> String {
        let mut sdp = String::from("v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for (mid, (track_id, kind)) in tracks.iter().enumerate() {
            let media = match kind {
                TrackKind::Audio => "audio 9 UDP/TLS/RTP/SAVPF 111",
                TrackKind::Video => "video 9 UDP/TLS/RTP/SAVPF 96",
            };
            sdp.push_str(&format!(
                "m={media}\r\na=mid:{mid}\r\na=msid:{stream_id} {track_id}\r\n"
            ));
        }
        sdp
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_connected(&self, state: &mut TransportState) {
        if !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            self.emit(TransportEvent::StateChanged(ConnectionState::Connected));
        }
    }

    /// Candidates applied so far, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidateInit> {
        self.state.lock().applied_candidates.clone()
    }

    /// Id of the track currently sent as video
    #[must_use]
    pub fn outbound_video(&self) -> Option<String> {
        self.state.lock().outbound_video.clone()
    }

    /// Number of offers generated (renegotiations included)
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// How many times `close` was called
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Whether the remote description is set
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    /// Simulate loss of connectivity
    pub fn fail_connection(&self) {
        self.emit(TransportEvent::StateChanged(ConnectionState::Failed));
    }

    /// Simulate first media arriving on a remote track
    pub fn deliver_remote_track(&self, track_id: &str, kind: TrackKind) {
        self.emit(TransportEvent::RemoteTrack {
            track_id: track_id.to_string(),
            kind,
        });
    }

    fn check_open(state: &TransportState) -> Result<(), PeerError> {
        if state.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.tracks.push((track.id().to_string(), track.kind()));
        if track.kind() == TrackKind::Video && state.outbound_video.is_none() {
            state.outbound_video = Some(track.id().to_string());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.offers_created += 1;
        Ok(SessionDescription::offer(Self::sdp_for(
            &self.stream_id,
            &state.tracks,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                Self::sdp_for(&self.stream_id, &state.tracks),
            )),
            _ => Err(PeerError::Transport(
                "cannot answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.local = Some(desc);
        for foundation in 1..=2u16 {
            let port = state.next_port;
            state.next_port += 1;
            self.emit(TransportEvent::LocalCandidate(IceCandidateInit {
                candidate: format!(
                    "candidate:{foundation} 1 udp 2130706431 127.0.0.1 {port} typ host"
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: Some(self.session_id[..8].to_string()),
            }));
        }
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::SignalingApply(
                "malformed session description".to_string(),
            ));
        }
        for (track_id, kind) in announced_tracks(&desc.sdp) {
            self.emit(TransportEvent::RemoteTrack { track_id, kind });
        }
        state.remote = Some(desc);
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(PeerError::SignalingApply(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::SignalingApply(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.outbound_video.is_none() {
            return Err(PeerError::Transport("no outbound video sender".to_string()));
        }
        state.outbound_video = Some(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.close_count += 1;
        if !state.closed {
            state.closed = true;
            self.emit(TransportEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Factory for [`MemoryTransport`]s
///
/// Keeps every transport it built so callers can inspect them.
#[derive(Default)]
pub struct MemoryTransportFactory {
    created: Mutex<Vec<Arc<MemoryTransport>>>,
    fail_create: Mutex<bool>,
}

impl MemoryTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail (or succeed again)
    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock() = fail;
    }

    /// The `index`-th transport created
    #[must_use]
    pub fn transport(&self, index: usize) -> Option<Arc<MemoryTransport>> {
        self.created.lock().get(index).cloned()
    }

    /// Most recently created transport
    #[must_use]
    pub fn latest(&self) -> Option<Arc<MemoryTransport>> {
        self.created.lock().last().cloned()
    }

    /// Number of transports created
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        if *self.fail_create.lock() {
            return Err(PeerError::Transport(
                "transport construction failed".to_string(),
            ));
        }
        let transport = Arc::new(MemoryTransport::new(events));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
