//! Peer connection management
//!
//! [`PeerConnectionManager`] wraps one negotiated transport for the lifetime
//! of a call. The transport itself sits behind the [`PeerTransport`] trait so
//! the session logic runs unchanged over the `webrtc` crate or the in-memory
//! loopback.
//!
//! # Candidate ordering
//!
//! A transport rejects remote ICE candidates until the remote description is
//! set. The manager therefore buffers candidates that arrive early and
//! applies them, in arrival order, right after
//! [`PeerConnectionManager::apply_remote_description`].

use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::types::{IceCandidateInit, SdpType, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Remote description or candidate rejected by the transport
    #[error("Signaling apply error: {0}")]
    SignalingApply(String),

    /// Negotiation or connectivity failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,
}

/// Network-traversal helper server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// Username for TURN
    #[serde(default)]
    pub username: String,
    /// Credential for TURN
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Helper servers handed to every transport
    pub ice_servers: Vec<IceServer>,
    /// Early remote candidates kept before the oldest is dropped
    pub max_pending_candidates: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            max_pending_candidates: 64,
        }
    }
}

/// Connectivity state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Checking candidate pairs
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Unrecoverable
    Failed,
    /// Closed locally
    Closed,
}

/// Asynchronous notifications from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the remote party
    LocalCandidate(IceCandidateInit),
    /// Inbound track from the remote party
    RemoteTrack {
        /// Remote track id
        track_id: String,
        /// Audio or video
        kind: TrackKind,
    },
    /// Connectivity changed
    StateChanged(ConnectionState),
}

/// Tracks a session description announces through `a=msid` lines
///
/// Returns `(track_id, kind)` pairs in m-section order. Sections without a
/// track (receive-only, data) are skipped.
pub fn announced_tracks(sdp: &str) -> Vec<(String, TrackKind)> {
    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = if media.starts_with("audio") {
                Some(TrackKind::Audio)
            } else if media.starts_with("video") {
                Some(TrackKind::Video)
            } else {
                None
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            if let (Some(kind), Some(track_id)) = (kind, msid.split_whitespace().nth(1)) {
                tracks.push((track_id.to_string(), kind));
            }
        }
    }
    tracks
}

/// A negotiated media transport
///
/// Implementations report gathered candidates and inbound tracks through the
/// event sender they were created with.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach an outbound track
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Generate an answer; the remote offer must already be applied
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a locally generated description; starts candidate gathering
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote party's description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError>;

    /// Swap the outbound video track without renegotiating
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Tear the transport down
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates transports for new calls
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a transport wired to `events`
    async fn create(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

/// Peer connection manager
///
/// Owns the transport exclusively; nothing else touches it.
pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    max_pending: usize,
    pending_candidates: VecDeque<IceCandidateInit>,
    has_remote_description: bool,
    outbound_video: Option<MediaTrack>,
    closed: bool,
}

impl PeerConnectionManager {
    /// Create a transport and the receiver for its events
    ///
    /// # Errors
    ///
    /// Returns error if the factory cannot build a transport
    #[tracing::instrument(skip(factory, config), fields(ice_servers = config.ice_servers.len()))]
    pub async fn create(
        factory: &dyn TransportFactory,
        config: &PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = factory.create(config, tx).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create transport");
            e
        })?;
        tracing::debug!("Transport created");
        Ok((
            Self {
                transport,
                max_pending: config.max_pending_candidates.max(1),
                pending_candidates: VecDeque::new(),
                has_remote_description: false,
                outbound_video: None,
                closed: false,
            },
            rx,
        ))
    }

    /// Attach every track of `stream` as outbound
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses a track
    pub async fn add_local_tracks(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            self.transport.add_track(&track).await?;
            if track.kind() == TrackKind::Video && self.outbound_video.is_none() {
                self.outbound_video = Some(track.clone());
            }
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Outbound track added");
        }
        Ok(())
    }

    /// Create an offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to negotiate
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        tracing::debug!(sdp_len = offer.sdp.len(), "Offer created");
        Ok(offer)
    }

    /// Apply a remote offer, then create and apply the answer
    ///
    /// Buffered candidates are flushed once the offer is in place.
    ///
    /// # Errors
    ///
    /// Returns error if the offer is rejected or no answer can be made
    pub async fn create_answer(
        &mut self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if remote_offer.sdp_type != SdpType::Offer {
            return Err(PeerError::SignalingApply(
                "expected an offer description".to_string(),
            ));
        }
        self.apply_remote_description(remote_offer).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        tracing::debug!(sdp_len = answer.sdp.len(), "Answer created");
        Ok(answer)
    }

    /// Apply the remote description and flush buffered candidates
    ///
    /// # Errors
    ///
    /// Returns `SignalingApply` if the transport rejects the description.
    /// Individual buffered candidates that are rejected are logged, not
    /// returned.
    pub async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.transport.set_remote_description(desc).await?;
        self.has_remote_description = true;

        let buffered: Vec<_> = self.pending_candidates.drain(..).collect();
        if !buffered.is_empty() {
            tracing::debug!(count = buffered.len(), "Applying buffered candidates");
        }
        for candidate in buffered {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Buffered candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// exists
    ///
    /// # Errors
    ///
    /// Returns `SignalingApply` if the transport rejects the candidate
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), PeerError> {
        if self.closed {
            tracing::trace!("Candidate for closed transport ignored");
            return Ok(());
        }
        if !self.has_remote_description {
            if self.pending_candidates.len() >= self.max_pending {
                self.pending_candidates.pop_front();
                tracing::warn!(limit = self.max_pending, "Candidate buffer full, dropped oldest");
            }
            self.pending_candidates.push_back(candidate);
            tracing::trace!(
                pending = self.pending_candidates.len(),
                "Candidate buffered until remote description"
            );
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate).await
    }

    /// Swap the outbound video track in place
    ///
    /// Returns the displaced track so it can be restored later.
    ///
    /// # Errors
    ///
    /// Returns error if no video track is being sent or the transport cannot
    /// replace it
    pub async fn replace_outbound_video_track(
        &mut self,
        new_track: MediaTrack,
    ) -> Result<MediaTrack, PeerError> {
        self.ensure_open()?;
        if self.outbound_video.is_none() {
            return Err(PeerError::Transport("no outbound video track".to_string()));
        }
        self.transport.replace_video_track(&new_track).await?;
        tracing::debug!(track_id = %new_track.id(), "Outbound video track replaced");
        self.outbound_video
            .replace(new_track)
            .ok_or_else(|| PeerError::Transport("no outbound video track".to_string()))
    }

    /// Current outbound video track
    #[must_use]
    pub fn outbound_video_track(&self) -> Option<&MediaTrack> {
        self.outbound_video.as_ref()
    }

    /// Whether the remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();
        self.outbound_video = None;
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "Transport close reported an error");
        } else {
            tracing::debug!("Transport closed");
        }
    }

    /// Whether [`Self::close`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}
