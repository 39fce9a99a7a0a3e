//! Peercall - one-to-one audio/video calls inside a conversation
//!
//! This library negotiates peer-to-peer calls between two participants of a
//! conversation. Offers, answers, ICE candidates and hang-ups travel over a
//! topic-scoped pub/sub channel; media flows directly between the peers. It
//! features:
//!
//! - **Single-call state machine**: `Idle -> Offering | Incoming -> Active -> Ended`
//!   with glare resolution and rollback on every failure path
//! - **Pluggable backends**: signaling, capture devices and media transport
//!   sit behind traits
//! - **WebRTC transport**: ICE/DTLS/SRTP through the `webrtc` crate
//!   (`webrtc-backend` feature, on by default)
//! - **Screen sharing**: swaps the outbound video track without renegotiation
//! - **Observable state**: snapshots over a watch channel, events over broadcast
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), CallError> {
//! let hub = Arc::new(MemorySignalingHub::new());
//! let controller = CallController::builder(
//!     ConversationId::new("conv-42"),
//!     Arc::new(StaticIdentity::new("alice")),
//!     hub,
//!     Arc::new(VirtualMediaDevices::new()),
//! )
//! .build()
//! .await?;
//!
//! controller.start_call("bob").await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Local media acquisition
pub mod media;

/// Signaling protocol and handlers
pub mod signaling;

/// Peer connection management
pub mod peer;

/// In-process signaling hub and loopback transport
pub mod memory;

/// Transport over the `webrtc` crate
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Call session state machine
pub mod session;

/// Call controller facade
pub mod controller;

// Re-export main types at crate root
pub use controller::{CallConfig, CallController, CallControllerBuilder};
pub use identity::{IdentityProvider, StaticIdentity, UserId};
pub use media::{
    MediaDeviceManager, MediaDevices, MediaError, MediaEvent, MediaStream, MediaTrack,
    ScreenPicker, TrackKind, TrackSource, VirtualDeviceConfig, VirtualMediaDevices,
};
pub use memory::{MemoryEventBus, MemorySignalingHub, MemoryTransport, MemoryTransportFactory};
pub use peer::{
    ConnectionState, IceServer, PeerConfig, PeerConnectionManager, PeerError, PeerTransport,
    TransportEvent, TransportFactory,
};
pub use session::{CallError, CallSnapshot, SessionMachine};
pub use signaling::{
    ChannelEvent, EventChannel, EventSubscription, JsonSignalingChannel, SignalingChannel,
    SignalingError, SignalingHandler, SignalingMessage, Subscription, SubscriptionId,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controller::{CallConfig, CallController};
    pub use crate::identity::{IdentityProvider, StaticIdentity, UserId};
    pub use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind, VirtualMediaDevices};
    pub use crate::memory::{MemorySignalingHub, MemoryTransportFactory};
    pub use crate::peer::{PeerConfig, TransportFactory};
    pub use crate::session::{CallError, CallSnapshot};
    pub use crate::signaling::{EventChannel, JsonSignalingChannel, SignalingChannel, SignalingMessage};
    pub use crate::types::{CallEvent, CallState, ConversationId, EndReason};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
