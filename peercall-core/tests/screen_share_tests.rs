//! Screen share swap and restore tests

mod common;

use common::*;
use peercall_core::{
    CallError, CallState, MediaError, MemorySignalingHub, ScreenPicker, TrackKind, TrackSource,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn outbound_source(party: &Party) -> TrackSource {
    party
        .controller
        .local_stream()
        .and_then(|s| s.video_track())
        .map(|t| t.source())
        .unwrap()
}

#[tokio::test]
async fn share_and_stop_restores_camera() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    let camera = x.controller.local_stream().unwrap().video_track().unwrap();

    x.controller.start_screen_share().await.unwrap();
    let snap = x.controller.snapshot();
    assert!(snap.is_screen_sharing);
    assert_eq!(outbound_source(&x), TrackSource::Screen);
    assert_eq!(snap.local_stream.unwrap().track_count(), 2);
    let transport = x.transports.latest().unwrap();
    assert_ne!(transport.outbound_video().as_deref(), Some(camera.id()));

    x.controller.stop_screen_share().await.unwrap();
    assert!(!x.controller.is_screen_sharing());
    let restored = x.controller.local_stream().unwrap().video_track().unwrap();
    assert_eq!(restored, camera);
    assert_eq!(transport.outbound_video().as_deref(), Some(camera.id()));
    assert_eq!(x.controller.local_stream().unwrap().track_count(), 2);

    // Track replacement never renegotiates
    assert_eq!(transport.offers_created(), 1);
    // Only mic and camera remain live
    assert_eq!(x.devices.live_tracks().len(), 2);
}

#[tokio::test]
async fn platform_stop_ends_share() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;

    x.controller.start_screen_share().await.unwrap();
    let screen = x.controller.local_stream().unwrap().video_track().unwrap();
    assert_eq!(screen.source(), TrackSource::Screen);

    screen.end();
    wait_until(&x.controller, "share ended", |s| !s.is_screen_sharing).await;

    assert_eq!(outbound_source(&x), TrackSource::Camera);
    assert_eq!(x.controller.state(), CallState::Active);
    assert!(x.controller.last_error().is_none());
}

#[tokio::test]
async fn ended_camera_is_reacquired() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    let camera = x.controller.local_stream().unwrap().video_track().unwrap();

    x.controller.start_screen_share().await.unwrap();
    camera.end();
    x.controller.stop_screen_share().await.unwrap();

    let fresh = x.controller.local_stream().unwrap().video_track().unwrap();
    assert_ne!(fresh, camera);
    assert!(fresh.is_live());
    assert_eq!(fresh.source(), TrackSource::Camera);
    assert_eq!(
        x.transports.latest().unwrap().outbound_video().as_deref(),
        Some(fresh.id())
    );
}

#[tokio::test]
async fn reacquired_camera_keeps_video_mute() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    let camera = x.controller.local_stream().unwrap().video_track().unwrap();

    x.controller.toggle_video(false).await;
    x.controller.start_screen_share().await.unwrap();
    camera.end();
    x.controller.stop_screen_share().await.unwrap();

    let fresh = x.controller.local_stream().unwrap().video_track().unwrap();
    assert_ne!(fresh, camera);
    assert!(!fresh.is_enabled());
    assert!(!x.controller.snapshot().is_video_enabled);
}

#[tokio::test]
async fn mute_during_share_survives_reacquire() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    let camera = x.controller.local_stream().unwrap().video_track().unwrap();

    x.controller.start_screen_share().await.unwrap();
    x.controller.toggle_video(false).await;
    camera.end();
    x.controller.stop_screen_share().await.unwrap();

    let fresh = x.controller.local_stream().unwrap().video_track().unwrap();
    assert_eq!(fresh.source(), TrackSource::Camera);
    assert!(!fresh.is_enabled());
}

#[tokio::test]
async fn camera_reacquire_failure_is_surfaced() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    let camera = x.controller.local_stream().unwrap().video_track().unwrap();

    x.controller.start_screen_share().await.unwrap();
    camera.end();
    x.devices.update(|c| c.hardware_present = false);

    let result = x.controller.stop_screen_share().await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::DeviceUnavailable(_)))
    ));
    let snap = x.controller.snapshot();
    assert!(!snap.is_screen_sharing);
    assert_eq!(snap.state, CallState::Active);
    assert!(snap.last_error.is_some());
    assert!(snap.local_stream.unwrap().tracks_of(TrackKind::Video).is_empty());
}

#[tokio::test]
async fn cancelled_picker_is_not_an_error() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    x.devices.update(|c| c.screen_picker = ScreenPicker::Cancel);

    x.controller.start_screen_share().await.unwrap();

    let snap = x.controller.snapshot();
    assert!(!snap.is_screen_sharing);
    assert!(snap.last_error.is_none());
    assert_eq!(outbound_source(&x), TrackSource::Camera);
}

#[tokio::test]
async fn unsupported_capture_is_surfaced() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;
    x.devices.update(|c| c.screen_capture_supported = false);

    let result = x.controller.start_screen_share().await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::NotSupported(_)))
    ));
    let snap = x.controller.snapshot();
    assert!(!snap.is_screen_sharing);
    assert!(matches!(
        snap.last_error,
        Some(CallError::Media(MediaError::NotSupported(_)))
    ));
    assert_eq!(snap.state, CallState::Active);
}

#[tokio::test]
async fn share_requires_active_call() {
    let hub = Arc::new(MemorySignalingHub::new());
    let x = party(&hub, "x").await;

    let result = x.controller.start_screen_share().await;
    assert!(matches!(
        result,
        Err(CallError::InvalidState {
            state: CallState::Idle,
            ..
        })
    ));
    assert!(x.devices.issued_tracks().is_empty());
}

#[tokio::test]
async fn stop_without_share_is_noop() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;

    x.controller.stop_screen_share().await.unwrap();
    assert_eq!(outbound_source(&x), TrackSource::Camera);
}

#[tokio::test]
async fn second_start_keeps_single_share() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, _y) = connected_pair(&hub, "x", "y").await;

    x.controller.start_screen_share().await.unwrap();
    x.controller.start_screen_share().await.unwrap();

    // mic + camera (parked) + one screen
    assert_eq!(x.devices.live_tracks().len(), 3);
}

#[tokio::test]
async fn hang_up_during_share_releases_everything() {
    let hub = Arc::new(MemorySignalingHub::new());
    let (x, y) = connected_pair(&hub, "x", "y").await;

    x.controller.start_screen_share().await.unwrap();
    let screen = x.controller.local_stream().unwrap().video_track().unwrap();
    y.controller.end_call().await;
    wait_for_state(&x.controller, CallState::Ended).await;

    assert!(x.devices.live_tracks().is_empty());
    assert!(!x.controller.is_screen_sharing());

    // A late platform stop after teardown changes nothing
    screen.end();
    settle().await;
    assert_eq!(x.controller.state(), CallState::Ended);
}
