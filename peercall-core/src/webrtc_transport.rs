//! `PeerTransport` over the `webrtc` crate
//!
//! Outbound tracks are mapped to `TrackLocalStaticSample`s (Opus for audio,
//! VP8 for video). Feeding encoded samples into them belongs to the capture
//! pipeline and is not done here.
//!
//! Remote tracks are reported as soon as a remote description announcing them
//! is applied, without waiting for the first RTP packet. `on_track` reports
//! the same ids again once media flows; consumers deduplicate by track id.

use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    announced_tracks, ConnectionState, PeerConfig, PeerError, PeerTransport, TransportEvent,
    TransportFactory,
};
use crate::types::{IceCandidateInit, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "peercall";

fn transport_err(context: &str, e: webrtc::Error) -> PeerError {
    PeerError::Transport(format!("{context}: {e}"))
}

fn apply_err(context: &str, e: webrtc::Error) -> PeerError {
    PeerError::SignalingApply(format!("{context}: {e}"))
}

fn local_track(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
    let codec = match track.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        track.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| apply_err("invalid session description", e))
}

fn from_rtc_description(desc: &RTCSessionDescription, sdp_type: SdpType) -> SessionDescription {
    SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    }
}

/// Peer transport backed by an `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<TransportEvent>) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!("Candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => {
                        tracing::debug!("Ignoring remote track of unknown kind");
                        return;
                    }
                };
                let _ = tx.send(TransportEvent::RemoteTrack {
                    track_id: track.id(),
                    kind,
                });
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    tracing::debug!(state = ?mapped, "Peer connection state changed");
                    let _ = tx.send(TransportEvent::StateChanged(mapped));
                }
            })
        }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = local_track(track);
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| transport_err("failed to add track", e))?;
        if track.kind() == TrackKind::Video {
            let mut video = self.video_sender.lock();
            if video.is_none() {
                *video = Some(sender);
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| transport_err("failed to create offer", e))?;
        Ok(from_rtc_description(&offer, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| transport_err("failed to create answer", e))?;
        Ok(from_rtc_description(&answer, SdpType::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| transport_err("failed to set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let tracks = announced_tracks(&desc.sdp);
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| apply_err("failed to set remote description", e))?;
        for (track_id, kind) in tracks {
            tracing::debug!(%track_id, ?kind, "Remote description announces track");
            let _ = self.events.send(TransportEvent::RemoteTrack { track_id, kind });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| apply_err("failed to add ICE candidate", e))
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| PeerError::Transport("no outbound video sender".to_string()))?;
        let local: Arc<dyn TrackLocal + Send + Sync> = local_track(track);
        sender
            .replace_track(Some(local))
            .await
            .map_err(|e| transport_err("failed to replace video track", e))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| transport_err("failed to close peer connection", e))
    }
}

/// Factory for [`WebRtcTransport`]s
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, config, events))]
    async fn create(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_err("failed to register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| transport_err("failed to register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| transport_err("failed to create peer connection", e))?;
        WebRtcTransport::register_handlers(&pc, events.clone());
        tracing::debug!("Created peer connection");

        Ok(Arc::new(WebRtcTransport {
            pc: Arc::new(pc),
            video_sender: Mutex::new(None),
            events,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    #[tokio::test]
    async fn test_webrtc_offer_announces_tracks() {
        let factory = WebRtcTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        let mic = MediaTrack::new("mic-1", TrackKind::Audio, TrackSource::Microphone);
        let cam = MediaTrack::new("cam-1", TrackKind::Video, TrackSource::Camera);
        transport.add_track(&mic).await.unwrap();
        transport.add_track(&cam).await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_webrtc_candidate_before_remote_description_is_rejected() {
        let factory = WebRtcTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        let result = transport
            .add_ice_candidate(IceCandidateInit::new(
                "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host",
            ))
            .await;
        assert!(matches!(result, Err(PeerError::SignalingApply(_))));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_webrtc_replace_without_video_sender_fails() {
        let factory = WebRtcTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        let screen = MediaTrack::new("screen-1", TrackKind::Video, TrackSource::Screen);
        let result = transport.replace_video_track(&screen).await;
        assert!(matches!(result, Err(PeerError::Transport(_))));

        transport.close().await.unwrap();
    }

    fn remote_tracks(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<(String, TrackKind)> {
        let mut tracks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::RemoteTrack { track_id, kind } = event {
                tracks.push((track_id, kind));
            }
        }
        tracks
    }

    #[tokio::test]
    async fn test_webrtc_negotiation_reports_remote_tracks() {
        let factory = WebRtcTransportFactory::new();
        let (caller_tx, mut caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, mut callee_rx) = mpsc::unbounded_channel();
        let caller = factory
            .create(&PeerConfig::default(), caller_tx)
            .await
            .unwrap();
        let callee = factory
            .create(&PeerConfig::default(), callee_tx)
            .await
            .unwrap();

        caller
            .add_track(&MediaTrack::new("a-mic", TrackKind::Audio, TrackSource::Microphone))
            .await
            .unwrap();
        caller
            .add_track(&MediaTrack::new("a-cam", TrackKind::Video, TrackSource::Camera))
            .await
            .unwrap();
        callee
            .add_track(&MediaTrack::new("b-mic", TrackKind::Audio, TrackSource::Microphone))
            .await
            .unwrap();
        callee
            .add_track(&MediaTrack::new("b-cam", TrackKind::Video, TrackSource::Camera))
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        let mut seen_by_callee = remote_tracks(&mut callee_rx);
        seen_by_callee.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen_by_callee,
            vec![
                ("a-cam".to_string(), TrackKind::Video),
                ("a-mic".to_string(), TrackKind::Audio),
            ]
        );
        let mut seen_by_caller = remote_tracks(&mut caller_rx);
        seen_by_caller.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen_by_caller,
            vec![
                ("b-cam".to_string(), TrackKind::Video),
                ("b-mic".to_string(), TrackKind::Audio),
            ]
        );

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }
}
