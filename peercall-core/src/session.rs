//! Call session state machine
//!
//! A [`SessionMachine`] drives at most one call per conversation through
//! `Idle -> Offering | Incoming -> Active -> Ended`. Every piece of per-call
//! data lives in one `CallSession` behind an async mutex.
//!
//! Device prompts and offer/answer negotiation run outside the lock. Each
//! call attempt carries a generation number; teardown bumps it, and any
//! in-flight step that re-locks and finds a different generation releases
//! what it acquired and returns [`CallError::Cancelled`]. A hang-up that
//! lands mid-negotiation therefore always wins.

use crate::identity::UserId;
use crate::media::{MediaDeviceManager, MediaError, MediaStream, MediaTrack, TrackKind};
use crate::peer::{
    ConnectionState, PeerConfig, PeerConnectionManager, PeerError, TransportEvent,
    TransportFactory,
};
use crate::signaling::{SignalingError, SignalingHandler, SignalingMessage};
use crate::types::{
    CallEvent, CallState, ConversationId, EndReason, IceCandidateInit, SdpType,
    SessionDescription,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::AbortHandle;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Local capture failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Negotiation or transport failed
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    /// Signaling channel failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Operation not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: CallState,
    },

    /// Another call is already live
    #[error("A call is already in progress")]
    CallInProgress,

    /// Nothing to answer
    #[error("No pending offer to answer")]
    NoPendingOffer,

    /// Caller and callee are the same user
    #[error("Cannot call yourself")]
    SelfCall,

    /// The call ended while this operation was in flight
    #[error("Call ended during negotiation")]
    Cancelled,
}

/// Read-only view of the session
///
/// Derived from the session on every change and published through
/// [`SessionMachine::observe`].
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Lifecycle state
    pub state: CallState,
    /// The other party of the current or last call
    pub remote_user: Option<UserId>,
    /// Camera/microphone (or screen) stream being sent
    pub local_stream: Option<MediaStream>,
    /// Tracks received from the remote party
    pub remote_stream: Option<MediaStream>,
    /// Offering or active
    pub is_call_active: bool,
    /// Ringing, waiting for [`SessionMachine::answer_call`]
    pub is_call_incoming: bool,
    /// Screen capture replaces the camera
    pub is_screen_sharing: bool,
    /// An offer is waiting to be answered
    pub has_pending_offer: bool,
    /// Any local audio track is unmuted
    pub is_audio_enabled: bool,
    /// Any local video track is unmuted
    pub is_video_enabled: bool,
    /// Most recent surfaced failure; cleared when a new call starts
    pub last_error: Option<CallError>,
    /// When the call became active
    pub connected_at: Option<DateTime<Utc>>,
}

struct ScreenShare {
    active: MediaTrack,
    displaced: MediaTrack,
    watcher: Option<AbortHandle>,
}

impl ScreenShare {
    fn cancel_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

struct CallSession {
    state: CallState,
    remote_user: Option<UserId>,
    local_media: Option<MediaStream>,
    remote_media: Option<MediaStream>,
    peer: Option<PeerConnectionManager>,
    pending_offer: Option<SessionDescription>,
    // Remote candidates that arrive before a peer exists
    early_candidates: VecDeque<IceCandidateInit>,
    // Local candidates gathered before our offer/answer went out
    outbound_candidates: Vec<IceCandidateInit>,
    description_sent: bool,
    screen_share: Option<ScreenShare>,
    last_error: Option<CallError>,
    connected_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl CallSession {
    fn new() -> Self {
        Self {
            state: CallState::Idle,
            remote_user: None,
            local_media: None,
            remote_media: None,
            peer: None,
            pending_offer: None,
            early_candidates: VecDeque::new(),
            outbound_candidates: Vec::new(),
            description_sent: false,
            screen_share: None,
            last_error: None,
            connected_at: None,
            generation: 0,
        }
    }

    /// Reset per-call data for a new attempt. Resources must already be
    /// released.
    fn begin(&mut self, remote: UserId) {
        self.generation = self.generation.wrapping_add(1);
        self.remote_user = Some(remote);
        self.pending_offer = None;
        self.early_candidates.clear();
        self.outbound_candidates.clear();
        self.description_sent = false;
        self.last_error = None;
        self.connected_at = None;
    }

    fn snapshot(&self) -> CallSnapshot {
        let enabled = |kind| {
            self.local_media
                .as_ref()
                .is_some_and(|s| s.tracks_of(kind).iter().any(MediaTrack::is_enabled))
        };
        let is_audio_enabled = enabled(TrackKind::Audio);
        let is_video_enabled = enabled(TrackKind::Video);
        CallSnapshot {
            state: self.state,
            remote_user: self.remote_user.clone(),
            local_stream: self.local_media.clone(),
            remote_stream: self.remote_media.clone(),
            is_call_active: matches!(self.state, CallState::Offering | CallState::Active),
            is_call_incoming: self.state == CallState::Incoming,
            is_screen_sharing: self.screen_share.is_some(),
            has_pending_offer: self.pending_offer.is_some(),
            is_audio_enabled,
            is_video_enabled,
            last_error: self.last_error.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Call session state machine
pub struct SessionMachine {
    conversation_id: ConversationId,
    local_user: UserId,
    session: Mutex<CallSession>,
    signaling: SignalingHandler,
    media: MediaDeviceManager,
    transports: Arc<dyn TransportFactory>,
    peer_config: PeerConfig,
    snapshot_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
    this: Weak<Self>,
}

impl SessionMachine {
    /// Create an idle machine
    ///
    /// The machine does not subscribe to signaling itself; feed inbound
    /// messages to [`Self::handle_message`].
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        signaling: SignalingHandler,
        media: MediaDeviceManager,
        transports: Arc<dyn TransportFactory>,
        peer_config: PeerConfig,
        event_capacity: usize,
    ) -> Arc<Self> {
        let session = CallSession::new();
        let (snapshot_tx, _) = watch::channel(session.snapshot());
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            conversation_id,
            local_user,
            session: Mutex::new(session),
            signaling,
            media,
            transports,
            peer_config,
            snapshot_tx,
            event_tx,
            this: this.clone(),
        })
    }

    /// Conversation this machine serves
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Local participant
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Signaling handler for the conversation topic
    #[must_use]
    pub fn signaling(&self) -> &SignalingHandler {
        &self.signaling
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch snapshots as they change
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Call `remote`
    ///
    /// Acquires camera and microphone, creates the peer connection and
    /// publishes the offer. On failure everything acquired is released and
    /// the session ends.
    ///
    /// # Errors
    ///
    /// Returns `CallInProgress` if a call is live, `SelfCall` for the local
    /// user, `Cancelled` if the call was ended meanwhile, or the underlying
    /// media/peer/signaling error
    #[tracing::instrument(skip(self, remote), fields(conversation = %self.conversation_id, remote = %remote))]
    pub async fn start_call(&self, remote: UserId) -> Result<(), CallError> {
        if remote == self.local_user {
            return Err(CallError::SelfCall);
        }
        let generation = {
            let mut session = self.session.lock().await;
            if session.state.is_live() {
                tracing::warn!(state = %session.state, "Call already in progress");
                return Err(CallError::CallInProgress);
            }
            session.begin(remote.clone());
            self.transition(&mut session, CallState::Offering);
            session.generation
        };

        match self.negotiate_offer(generation, &remote).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_attempt(generation, &e, false).await;
                Err(e)
            }
        }
    }

    /// Accept the pending offer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless a call is incoming, `NoPendingOffer` if
    /// it is already being answered, or the underlying failure. A failed
    /// answer tears the session down and tells the caller.
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn answer_call(&self) -> Result<(), CallError> {
        let (generation, remote, offer) = {
            let mut session = self.session.lock().await;
            if session.state != CallState::Incoming {
                return Err(CallError::InvalidState {
                    operation: "answer",
                    state: session.state,
                });
            }
            let remote = session.remote_user.clone().ok_or(CallError::NoPendingOffer)?;
            let offer = session.pending_offer.take().ok_or(CallError::NoPendingOffer)?;
            self.publish_snapshot(&session);
            (session.generation, remote, offer)
        };

        match self.negotiate_answer(generation, &remote, offer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_attempt(generation, &e, true).await;
                Err(e)
            }
        }
    }

    /// Hang up (or decline, or cancel an outgoing call)
    ///
    /// Publishes `end-call` to the other party and releases everything. A
    /// no-op when no call is live.
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn end_call(&self) {
        let mut session = self.session.lock().await;
        if !session.state.is_live() {
            tracing::debug!(state = %session.state, "No call to end");
            return;
        }
        self.teardown(&mut session, EndReason::LocalHangup, true)
            .await;
    }

    /// End any live call before the owner goes away
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        if session.state.is_live() {
            self.teardown(&mut session, EndReason::Shutdown, true).await;
        }
    }

    /// Mute or unmute the local microphone
    ///
    /// Returns whether an audio track was found.
    pub async fn toggle_audio(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Audio, enabled).await
    }

    /// Turn the local video on or off
    ///
    /// Returns whether a video track was found.
    pub async fn toggle_video(&self, enabled: bool) -> bool {
        self.toggle(TrackKind::Video, enabled).await
    }

    async fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        let session = self.session.lock().await;
        let Some(local) = &session.local_media else {
            tracing::debug!(?kind, "No local media to toggle");
            return false;
        };
        let matched = self.media.toggle_track(local, kind, enabled);
        if kind == TrackKind::Video {
            // Keep the parked camera in step so restoring it doesn't unmute
            if let Some(share) = &session.screen_share {
                share.displaced.set_enabled(enabled);
            }
        }
        self.publish_snapshot(&session);
        matched
    }

    /// Send the screen instead of the camera
    ///
    /// Dismissing the picker is not an error and leaves the call unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside an active call, `Media` if capture is
    /// refused or unsupported, `Peer` if the track cannot be swapped
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let generation = {
            let session = self.session.lock().await;
            if session.state != CallState::Active {
                return Err(CallError::InvalidState {
                    operation: "share screen",
                    state: session.state,
                });
            }
            if session.screen_share.is_some() {
                tracing::debug!("Already sharing screen");
                return Ok(());
            }
            session.generation
        };

        let capture = match self.media.acquire_screen().await {
            Ok(stream) => stream,
            Err(MediaError::UserCancelled) => {
                tracing::info!("Screen share cancelled by user");
                return Ok(());
            }
            Err(e) => {
                let error = CallError::from(e);
                self.record_error(generation, &error).await;
                return Err(error);
            }
        };
        let Some(screen) = capture.video_track() else {
            self.media.release(&capture);
            let error = CallError::Media(MediaError::NotSupported(
                "screen capture produced no video".to_string(),
            ));
            self.record_error(generation, &error).await;
            return Err(error);
        };

        let mut session = self.session.lock().await;
        if session.generation != generation || session.state != CallState::Active {
            drop(session);
            self.media.release(&capture);
            return Err(CallError::Cancelled);
        }
        if session.screen_share.is_some() {
            drop(session);
            self.media.release(&capture);
            return Ok(());
        }

        let swapped = match session.peer.as_mut() {
            Some(peer) => peer.replace_outbound_video_track(screen.clone()).await,
            None => Err(PeerError::Closed),
        };
        let displaced = match swapped {
            Ok(track) => track,
            Err(e) => {
                self.media.release(&capture);
                let error = CallError::from(e);
                tracing::warn!(error = %error, "Failed to swap in screen track");
                session.last_error = Some(error.clone());
                self.publish_snapshot(&session);
                self.emit(CallEvent::Error {
                    error: error.to_string(),
                });
                return Err(error);
            }
        };

        // Extra capture tracks (tab audio) are not forwarded
        for track in capture.tracks() {
            if track != screen {
                track.stop();
            }
        }
        if let Some(local) = &session.local_media {
            if local.replace_track(displaced.id(), screen.clone()).is_none() {
                local.add_track(screen.clone());
            }
        }
        let watcher = self.spawn_screen_watcher(screen.clone());
        session.screen_share = Some(ScreenShare {
            active: screen,
            displaced,
            watcher: Some(watcher),
        });
        self.publish_snapshot(&session);
        tracing::info!("Screen share started");
        self.emit(CallEvent::ScreenShareStarted);
        Ok(())
    }

    /// Go back to the camera
    ///
    /// A no-op when not sharing.
    ///
    /// # Errors
    ///
    /// Returns error if the camera cannot be restored; sharing stops anyway
    #[tracing::instrument(skip(self), fields(conversation = %self.conversation_id))]
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        match session.screen_share.as_mut() {
            Some(share) => share.cancel_watcher(),
            None => {
                tracing::debug!("Not sharing screen");
                return Ok(());
            }
        }
        self.restore_camera(&mut session).await
    }

    // ------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------

    /// Process one message from the conversation topic
    ///
    /// Never fails: problems are logged and the subscription keeps running.
    #[tracing::instrument(
        skip(self, message),
        fields(
            conversation = %self.conversation_id,
            event = message.event_name(),
            sender = %message.sender()
        )
    )]
    pub async fn handle_message(&self, message: SignalingMessage) {
        if message.sender() == &self.local_user {
            tracing::trace!("Own message ignored");
            return;
        }
        let addressed = message.is_addressed_to(&self.local_user);
        match message {
            SignalingMessage::EndCall { sender_id, .. } => {
                self.on_remote_end(sender_id, addressed).await;
            }
            _ if !addressed => tracing::trace!("Message for another participant ignored"),
            SignalingMessage::Offer {
                sender_id, offer, ..
            } => self.on_offer(sender_id, offer).await,
            SignalingMessage::Answer {
                sender_id, answer, ..
            } => self.on_answer(sender_id, answer).await,
            SignalingMessage::IceCandidate {
                sender_id,
                candidate,
                ..
            } => self.on_remote_candidate(sender_id, candidate).await,
        }
    }

    async fn on_offer(&self, from: UserId, offer: SessionDescription) {
        if offer.sdp_type != SdpType::Offer {
            tracing::warn!("Offer message carries a non-offer description");
            return;
        }
        let mut session = self.session.lock().await;
        let state = session.state;
        match state {
            CallState::Idle | CallState::Ended => {}
            CallState::Offering if session.remote_user.as_ref() == Some(&from) => {
                // Both sides called each other; the smaller id keeps its offer
                if self.local_user < from {
                    tracing::info!("Simultaneous offers, keeping ours");
                    return;
                }
                tracing::info!("Simultaneous offers, yielding to remote");
                // Generation moves twice: teardown retires our attempt, begin
                // below opens the incoming one
                self.teardown(&mut session, EndReason::Superseded, false)
                    .await;
            }
            _ => {
                tracing::info!(%state, "Busy, ignoring offer");
                return;
            }
        }

        session.begin(from.clone());
        session.pending_offer = Some(offer);
        self.transition(&mut session, CallState::Incoming);
        tracing::info!("Incoming call");
        self.emit(CallEvent::IncomingCall { from });
    }

    async fn on_answer(&self, from: UserId, answer: SessionDescription) {
        if answer.sdp_type != SdpType::Answer {
            tracing::warn!("Answer message carries a non-answer description");
            return;
        }
        let mut session = self.session.lock().await;
        if session.state != CallState::Offering || session.remote_user.as_ref() != Some(&from) {
            tracing::debug!(state = %session.state, "Unexpected answer ignored");
            return;
        }
        let Some(peer) = session.peer.as_mut() else {
            tracing::warn!("Answer arrived before the offer was sent");
            return;
        };
        if let Err(e) = peer.apply_remote_description(answer).await {
            tracing::warn!(error = %e, "Failed to apply answer");
            return;
        }

        session.connected_at = Some(Utc::now());
        self.transition(&mut session, CallState::Active);
        tracing::info!("Call connected");
        self.emit(CallEvent::Connected { remote: from });
    }

    async fn on_remote_candidate(&self, from: UserId, candidate: IceCandidateInit) {
        let mut session = self.session.lock().await;
        if !session.state.is_live() || session.remote_user.as_ref() != Some(&from) {
            tracing::trace!("Candidate outside the current call ignored");
            return;
        }
        if let Some(peer) = session.peer.as_mut() {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                tracing::warn!(error = %e, "Remote candidate rejected");
            }
            return;
        }

        let limit = self.peer_config.max_pending_candidates.max(1);
        if session.early_candidates.len() >= limit {
            session.early_candidates.pop_front();
            tracing::warn!(limit, "Early candidate buffer full, dropped oldest");
        }
        session.early_candidates.push_back(candidate);
    }

    async fn on_remote_end(&self, from: UserId, addressed: bool) {
        let mut session = self.session.lock().await;
        if !session.state.is_live() {
            return;
        }
        let from_remote = session.remote_user.as_ref() == Some(&from);
        if !addressed && !from_remote {
            tracing::trace!("Hang-up for another call ignored");
            return;
        }
        tracing::info!("Remote party ended the call");
        self.teardown(&mut session, EndReason::RemoteHangup, false)
            .await;
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn negotiate_offer(&self, generation: u64, remote: &UserId) -> Result<(), CallError> {
        let stream = self.media.acquire_camera_and_mic().await?;
        if !self.adopt_local_media(generation, &stream).await {
            return Err(CallError::Cancelled);
        }

        let mut peer = self.open_peer(generation).await?;
        let offer = match offer_with_tracks(&mut peer, &stream).await {
            Ok(offer) => offer,
            Err(e) => {
                peer.close().await;
                return Err(e.into());
            }
        };

        let mut session = self.session.lock().await;
        if session.generation != generation {
            drop(session);
            peer.close().await;
            return Err(CallError::Cancelled);
        }
        session.peer = Some(peer);
        self.signaling
            .publish(SignalingMessage::Offer {
                sender_id: self.local_user.clone(),
                receiver_id: remote.clone(),
                offer,
            })
            .await?;
        self.flush_outbound_candidates(&mut session).await;
        tracing::info!("Offer sent");
        self.emit(CallEvent::Offering { to: remote.clone() });
        Ok(())
    }

    async fn negotiate_answer(
        &self,
        generation: u64,
        remote: &UserId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let stream = self.media.acquire_camera_and_mic().await?;
        if !self.adopt_local_media(generation, &stream).await {
            return Err(CallError::Cancelled);
        }

        let mut peer = self.open_peer(generation).await?;
        let answer = match answer_with_tracks(&mut peer, &stream, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                peer.close().await;
                return Err(e.into());
            }
        };

        let mut session = self.session.lock().await;
        if session.generation != generation {
            drop(session);
            peer.close().await;
            return Err(CallError::Cancelled);
        }
        let early: Vec<_> = session.early_candidates.drain(..).collect();
        if !early.is_empty() {
            tracing::debug!(count = early.len(), "Applying candidates received while ringing");
        }
        for candidate in early {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                tracing::warn!(error = %e, "Early candidate rejected");
            }
        }
        session.peer = Some(peer);
        self.signaling
            .publish(SignalingMessage::Answer {
                sender_id: self.local_user.clone(),
                receiver_id: remote.clone(),
                answer,
            })
            .await?;

        session.connected_at = Some(Utc::now());
        self.transition(&mut session, CallState::Active);
        self.flush_outbound_candidates(&mut session).await;
        tracing::info!("Call answered");
        self.emit(CallEvent::Connected {
            remote: remote.clone(),
        });
        Ok(())
    }

    /// Store freshly acquired media, or release it if the attempt is stale
    async fn adopt_local_media(&self, generation: u64, stream: &MediaStream) -> bool {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            drop(session);
            tracing::debug!("Call ended during media acquisition, releasing stream");
            self.media.release(stream);
            return false;
        }
        session.local_media = Some(stream.clone());
        self.publish_snapshot(&session);
        true
    }

    async fn open_peer(&self, generation: u64) -> Result<PeerConnectionManager, CallError> {
        let (peer, events) =
            PeerConnectionManager::create(self.transports.as_ref(), &self.peer_config).await?;
        self.spawn_transport_pump(generation, events);
        Ok(peer)
    }

    async fn flush_outbound_candidates(&self, session: &mut CallSession) {
        session.description_sent = true;
        let queued = std::mem::take(&mut session.outbound_candidates);
        let Some(remote) = session.remote_user.clone() else {
            return;
        };
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Sending queued local candidates");
        }
        for candidate in queued {
            self.signaling
                .publish_best_effort(SignalingMessage::IceCandidate {
                    sender_id: self.local_user.clone(),
                    target_id: remote.clone(),
                    candidate,
                })
                .await;
        }
    }

    async fn abort_attempt(&self, generation: u64, error: &CallError, notify_remote: bool) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            tracing::debug!(error = %error, "Stale negotiation discarded");
            return;
        }
        tracing::error!(error = %error, "Call setup failed");
        session.last_error = Some(error.clone());
        self.emit(CallEvent::Error {
            error: error.to_string(),
        });
        self.teardown(&mut session, EndReason::SetupFailed, notify_remote)
            .await;
    }

    async fn record_error(&self, generation: u64, error: &CallError) {
        tracing::warn!(error = %error, "Call operation failed");
        let mut session = self.session.lock().await;
        if session.generation == generation {
            session.last_error = Some(error.clone());
            self.publish_snapshot(&session);
        }
        self.emit(CallEvent::Error {
            error: error.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn spawn_transport_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let machine = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                if !machine.handle_transport_event(generation, event).await {
                    break;
                }
            }
        });
    }

    /// Returns `false` once the transport no longer belongs to the session
    async fn handle_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            return false;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if !session.description_sent {
                    session.outbound_candidates.push(candidate);
                } else if let Some(remote) = session.remote_user.clone() {
                    self.signaling
                        .publish_best_effort(SignalingMessage::IceCandidate {
                            sender_id: self.local_user.clone(),
                            target_id: remote,
                            candidate,
                        })
                        .await;
                }
            }
            TransportEvent::RemoteTrack { track_id, kind } => {
                let stream = session
                    .remote_media
                    .get_or_insert_with(MediaStream::empty)
                    .clone();
                if stream.add_track(MediaTrack::remote(track_id.clone(), kind)) {
                    tracing::debug!(%track_id, ?kind, "Remote track added");
                    self.publish_snapshot(&session);
                    self.emit(CallEvent::RemoteTrackAdded { track_id });
                }
            }
            TransportEvent::StateChanged(ConnectionState::Failed) => {
                let error =
                    CallError::Peer(PeerError::Transport("connection failed".to_string()));
                tracing::error!(conversation = %self.conversation_id, "Peer connection failed");
                session.last_error = Some(error.clone());
                self.emit(CallEvent::Error {
                    error: error.to_string(),
                });
                self.teardown(&mut session, EndReason::TransportFailed, true)
                    .await;
                return false;
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "Peer connection state changed");
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Screen share
    // ------------------------------------------------------------------

    fn spawn_screen_watcher(&self, track: MediaTrack) -> AbortHandle {
        let machine = self.this.clone();
        tokio::spawn(async move {
            track.ended().await;
            if let Some(machine) = machine.upgrade() {
                machine.on_screen_track_ended(track.id()).await;
            }
        })
        .abort_handle()
    }

    async fn on_screen_track_ended(&self, track_id: &str) {
        let mut session = self.session.lock().await;
        let Some(share) = session.screen_share.as_mut() else {
            return;
        };
        if share.active.id() != track_id {
            return;
        }
        // This task is the watcher; aborting it here would cut the restore short
        share.watcher = None;
        tracing::info!("Screen capture ended by the platform");
        if let Err(e) = self.restore_camera(&mut session).await {
            tracing::warn!(error = %e, "Camera not restored after screen capture ended");
        }
    }

    async fn restore_camera(&self, session: &mut CallSession) -> Result<(), CallError> {
        let Some(share) = session.screen_share.take() else {
            return Ok(());
        };
        share.active.stop();

        let camera = if share.displaced.is_live() {
            share.displaced
        } else {
            tracing::debug!("Parked camera track ended, re-acquiring");
            match self.media.acquire_camera().await {
                Ok(track) => {
                    // Carry over a video mute set before or during the share
                    track.set_enabled(share.displaced.is_enabled());
                    track
                }
                Err(e) => {
                    if let Some(local) = &session.local_media {
                        local.remove_track(share.active.id());
                    }
                    self.emit(CallEvent::ScreenShareStopped);
                    return Err(self.fail_restore(session, e.into()));
                }
            }
        };

        let swapped = match session.peer.as_mut() {
            Some(peer) => peer
                .replace_outbound_video_track(camera.clone())
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        if let Some(local) = &session.local_media {
            if local.replace_track(share.active.id(), camera.clone()).is_none() {
                local.add_track(camera);
            }
        }
        tracing::info!("Screen share stopped");
        self.emit(CallEvent::ScreenShareStopped);

        match swapped {
            Ok(()) => {
                self.publish_snapshot(session);
                Ok(())
            }
            Err(e) => Err(self.fail_restore(session, e.into())),
        }
    }

    fn fail_restore(&self, session: &mut CallSession, error: CallError) -> CallError {
        tracing::warn!(error = %error, "Failed to restore camera after screen share");
        session.last_error = Some(error.clone());
        self.publish_snapshot(session);
        self.emit(CallEvent::Error {
            error: error.to_string(),
        });
        error
    }

    // ------------------------------------------------------------------
    // Teardown and notifications
    // ------------------------------------------------------------------

    /// Release everything the session holds and move to `Ended`
    async fn teardown(&self, session: &mut CallSession, reason: EndReason, notify_remote: bool) {
        if notify_remote {
            if let Some(remote) = session.remote_user.clone() {
                self.signaling
                    .publish_best_effort(SignalingMessage::EndCall {
                        sender_id: self.local_user.clone(),
                        target_id: remote,
                    })
                    .await;
            }
        }

        session.generation = session.generation.wrapping_add(1);
        if let Some(mut share) = session.screen_share.take() {
            share.cancel_watcher();
            share.active.stop();
            share.displaced.stop();
        }
        if let Some(stream) = session.local_media.take() {
            self.media.release(&stream);
        }
        if let Some(stream) = session.remote_media.take() {
            for track in stream.tracks() {
                track.stop();
            }
        }
        if let Some(mut peer) = session.peer.take() {
            peer.close().await;
        }
        session.pending_offer = None;
        session.early_candidates.clear();
        session.outbound_candidates.clear();
        session.description_sent = false;

        self.transition(session, CallState::Ended);
        tracing::info!(conversation = %self.conversation_id, ?reason, "Call ended");
        self.emit(CallEvent::Ended { reason });
    }

    fn transition(&self, session: &mut CallSession, next: CallState) {
        let previous = session.state;
        session.state = next;
        tracing::debug!(
            conversation = %self.conversation_id,
            from = %previous,
            to = %next,
            "Call state transition"
        );
        self.publish_snapshot(session);
    }

    fn publish_snapshot(&self, session: &CallSession) {
        self.snapshot_tx.send_replace(session.snapshot());
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn offer_with_tracks(
    peer: &mut PeerConnectionManager,
    stream: &MediaStream,
) -> Result<SessionDescription, PeerError> {
    peer.add_local_tracks(stream).await?;
    peer.create_offer().await
}

async fn answer_with_tracks(
    peer: &mut PeerConnectionManager,
    stream: &MediaStream,
    offer: SessionDescription,
) -> Result<SessionDescription, PeerError> {
    peer.add_local_tracks(stream).await?;
    peer.create_answer(offer).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::VirtualMediaDevices;
    use crate::memory::{MemorySignalingHub, MemoryTransport, MemoryTransportFactory};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TOPIC: &str = "videocall:c1";

    struct Fixture {
        machine: Arc<SessionMachine>,
        hub: Arc<MemorySignalingHub>,
        devices: Arc<VirtualMediaDevices>,
        transports: Arc<MemoryTransportFactory>,
    }

    fn fixture(local: &str) -> Fixture {
        let hub = Arc::new(MemorySignalingHub::new());
        let devices = Arc::new(VirtualMediaDevices::new());
        let transports = Arc::new(MemoryTransportFactory::new());
        let machine = SessionMachine::new(
            ConversationId::new("c1"),
            UserId::from(local),
            SignalingHandler::new(hub.clone(), TOPIC),
            MediaDeviceManager::new(devices.clone()),
            transports.clone(),
            PeerConfig::default(),
            16,
        );
        Fixture {
            machine,
            hub,
            devices,
            transports,
        }
    }

    fn remote_offer(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage::Offer {
            sender_id: UserId::from(from),
            receiver_id: UserId::from(to),
            offer: SessionDescription::offer(MemoryTransport::sdp_for(
                "remote",
                &[
                    ("r-audio".to_string(), TrackKind::Audio),
                    ("r-video".to_string(), TrackKind::Video),
                ],
            )),
        }
    }

    fn candidate_from(from: &str, to: &str, n: u16) -> SignalingMessage {
        SignalingMessage::IceCandidate {
            sender_id: UserId::from(from),
            target_id: UserId::from(to),
            candidate: IceCandidateInit::new(format!(
                "candidate:{n} 1 udp 2130706431 192.0.2.9 {} typ host",
                6000 + n
            )),
        }
    }

    async fn wait_for(machine: &SessionMachine, f: impl Fn(&CallSnapshot) -> bool) {
        let mut rx = machine.observe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| f(s)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_call_publishes_offer_before_candidates() {
        let fx = fixture("alice");
        fx.machine.start_call(UserId::from("bob")).await.unwrap();

        let snap = fx.machine.snapshot();
        assert_eq!(snap.state, CallState::Offering);
        assert!(snap.is_call_active);
        assert_eq!(snap.local_stream.unwrap().track_count(), 2);

        // Local candidates trickle out through the transport pump
        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.hub.published(TOPIC).len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let published = fx.hub.published(TOPIC);
        assert_eq!(published[0].event_name(), "offer");
        assert!(published[1..]
            .iter()
            .all(|m| m.event_name() == "ice-candidate" && m.recipient() == &UserId::from("bob")));
    }

    #[tokio::test]
    async fn test_start_call_rejected_while_live() {
        let fx = fixture("alice");
        fx.machine.start_call(UserId::from("bob")).await.unwrap();
        assert_eq!(
            fx.machine.start_call(UserId::from("carol")).await,
            Err(CallError::CallInProgress)
        );
        assert_eq!(fx.machine.snapshot().remote_user, Some(UserId::from("bob")));
    }

    #[tokio::test]
    async fn test_cannot_call_self() {
        let fx = fixture("alice");
        assert_eq!(
            fx.machine.start_call(UserId::from("alice")).await,
            Err(CallError::SelfCall)
        );
        assert_eq!(fx.machine.snapshot().state, CallState::Idle);
    }

    #[tokio::test]
    async fn test_answer_without_offer() {
        let fx = fixture("bob");
        let result = fx.machine.answer_call().await;
        assert_eq!(
            result,
            Err(CallError::InvalidState {
                operation: "answer",
                state: CallState::Idle
            })
        );
    }

    #[tokio::test]
    async fn test_offer_rings_and_busy_offers_are_ignored() {
        let fx = fixture("bob");
        let mut events = fx.machine.subscribe_events();
        fx.machine.handle_message(remote_offer("alice", "bob")).await;

        let snap = fx.machine.snapshot();
        assert_eq!(snap.state, CallState::Incoming);
        assert!(snap.is_call_incoming);
        assert!(snap.has_pending_offer);
        assert!(snap.local_stream.is_none());
        assert!(matches!(
            events.try_recv(),
            Ok(CallEvent::IncomingCall { from }) if from == UserId::from("alice")
        ));

        fx.machine.handle_message(remote_offer("carol", "bob")).await;
        assert_eq!(fx.machine.snapshot().remote_user, Some(UserId::from("alice")));
    }

    #[tokio::test]
    async fn test_messages_for_others_are_ignored() {
        let fx = fixture("bob");
        fx.machine.handle_message(remote_offer("alice", "carol")).await;
        fx.machine.handle_message(remote_offer("bob", "bob")).await;
        assert_eq!(fx.machine.snapshot().state, CallState::Idle);
    }

    #[tokio::test]
    async fn test_candidates_while_ringing_applied_after_answer() {
        let fx = fixture("bob");
        fx.machine.handle_message(remote_offer("alice", "bob")).await;
        for n in 1..=3 {
            fx.machine.handle_message(candidate_from("alice", "bob", n)).await;
        }
        // Someone else's candidate is dropped
        fx.machine.handle_message(candidate_from("carol", "bob", 9)).await;

        fx.machine.answer_call().await.unwrap();
        let snap = fx.machine.snapshot();
        assert_eq!(snap.state, CallState::Active);
        assert!(snap.connected_at.is_some());

        let applied = fx.transports.latest().unwrap().applied_candidates();
        let lines: Vec<_> = applied.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("candidate:1 "));
        assert!(lines[2].starts_with("candidate:3 "));

        let published = fx.hub.published(TOPIC);
        assert_eq!(published[0].event_name(), "answer");
    }

    #[tokio::test]
    async fn test_remote_tracks_collected_into_one_stream() {
        let fx = fixture("bob");
        fx.machine.handle_message(remote_offer("alice", "bob")).await;
        fx.machine.answer_call().await.unwrap();

        wait_for(&fx.machine, |s| {
            s.remote_stream.as_ref().is_some_and(|r| r.track_count() == 2)
        })
        .await;
    }

    #[tokio::test]
    async fn test_repeated_remote_track_is_not_duplicated() {
        let fx = fixture("bob");
        fx.machine.handle_message(remote_offer("alice", "bob")).await;
        fx.machine.answer_call().await.unwrap();
        wait_for(&fx.machine, |s| {
            s.remote_stream.as_ref().is_some_and(|r| r.track_count() == 2)
        })
        .await;
        let mut events = fx.machine.subscribe_events();

        let transport = fx.transports.latest().unwrap();
        let video = fx.machine.snapshot().remote_stream.unwrap().video_track().unwrap();
        transport.deliver_remote_track(video.id(), TrackKind::Video);
        transport.deliver_remote_track("late-cam", TrackKind::Video);

        wait_for(&fx.machine, |s| {
            s.remote_stream.as_ref().is_some_and(|r| r.track_count() == 3)
        })
        .await;
        match events.recv().await.unwrap() {
            CallEvent::RemoteTrackAdded { track_id } => assert_eq!(track_id, "late-cam"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_offer() {
        let fx = fixture("alice");
        fx.machine.start_call(UserId::from("bob")).await.unwrap();
        fx.machine.handle_message(remote_offer("bob", "alice")).await;

        let snap = fx.machine.snapshot();
        assert_eq!(snap.state, CallState::Offering);
        assert_eq!(fx.transports.created_count(), 1);
    }

    #[tokio::test]
    async fn test_glare_larger_id_yields_without_hanging_up() {
        let fx = fixture("bob");
        fx.machine.start_call(UserId::from("alice")).await.unwrap();
        let first = fx.transports.latest().unwrap();

        fx.machine.handle_message(remote_offer("alice", "bob")).await;

        let snap = fx.machine.snapshot();
        assert_eq!(snap.state, CallState::Incoming);
        assert!(snap.local_stream.is_none());
        assert_eq!(first.close_count(), 1);
        assert!(fx.devices.live_tracks().is_empty());
        assert!(!fx
            .hub
            .published(TOPIC)
            .iter()
            .any(|m| m.event_name() == "end-call"));
    }

    #[tokio::test]
    async fn test_end_call_from_third_party_needs_addressing() {
        let fx = fixture("bob");
        fx.machine.handle_message(remote_offer("alice", "bob")).await;

        fx.machine
            .handle_message(SignalingMessage::EndCall {
                sender_id: UserId::from("carol"),
                target_id: UserId::from("dave"),
            })
            .await;
        assert_eq!(fx.machine.snapshot().state, CallState::Incoming);

        // The caller's hang-up counts even if addressed loosely
        fx.machine
            .handle_message(SignalingMessage::EndCall {
                sender_id: UserId::from("alice"),
                target_id: UserId::from("dave"),
            })
            .await;
        assert_eq!(fx.machine.snapshot().state, CallState::Ended);
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down() {
        let fx = fixture("alice");
        fx.machine.start_call(UserId::from("bob")).await.unwrap();
        fx.transports.latest().unwrap().fail_connection();

        wait_for(&fx.machine, |s| s.state == CallState::Ended).await;
        let snap = fx.machine.snapshot();
        assert!(matches!(snap.last_error, Some(CallError::Peer(PeerError::Transport(_)))));
        assert!(fx.devices.live_tracks().is_empty());
        assert!(fx
            .hub
            .published(TOPIC)
            .iter()
            .any(|m| m.event_name() == "end-call"));
    }

    #[tokio::test]
    async fn test_toggle_without_media_is_noop() {
        let fx = fixture("alice");
        assert!(!fx.machine.toggle_audio(false).await);
        assert!(!fx.machine.toggle_video(false).await);
    }

    #[tokio::test]
    async fn test_toggle_reflected_in_snapshot() {
        let fx = fixture("alice");
        fx.machine.start_call(UserId::from("bob")).await.unwrap();
        assert!(fx.machine.snapshot().is_audio_enabled);

        assert!(fx.machine.toggle_audio(false).await);
        let snap = fx.machine.snapshot();
        assert!(!snap.is_audio_enabled);
        assert!(snap.is_video_enabled);
        // Muting keeps the device
        assert_eq!(fx.devices.live_tracks().len(), 2);
    }
}
