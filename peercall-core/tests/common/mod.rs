//! Shared helpers for call integration tests
#![allow(dead_code)]

use peercall_core::{
    CallController, CallSnapshot, CallState, ConversationId, MemorySignalingHub,
    MemoryTransportFactory, SignalingChannel, SignalingMessage, StaticIdentity, VirtualDeviceConfig,
    VirtualMediaDevices,
};
use std::sync::Arc;
use std::time::Duration;

pub const CONVERSATION: &str = "conv-1";
pub const TOPIC: &str = "videocall:conv-1";

/// One participant with inspectable collaborators
pub struct Party {
    pub controller: CallController,
    pub devices: Arc<VirtualMediaDevices>,
    pub transports: Arc<MemoryTransportFactory>,
}

pub async fn party(hub: &Arc<MemorySignalingHub>, user: &str) -> Party {
    party_with(hub, user, VirtualDeviceConfig::default()).await
}

pub async fn party_with(
    hub: &Arc<MemorySignalingHub>,
    user: &str,
    devices: VirtualDeviceConfig,
) -> Party {
    party_on(hub.clone(), user, devices).await
}

/// Participant over any signaling channel
pub async fn party_on(
    channel: Arc<dyn SignalingChannel>,
    user: &str,
    devices: VirtualDeviceConfig,
) -> Party {
    let devices = Arc::new(VirtualMediaDevices::with_config(devices));
    let transports = Arc::new(MemoryTransportFactory::new());
    let controller = CallController::builder(
        ConversationId::new(CONVERSATION),
        Arc::new(StaticIdentity::new(user)),
        channel,
        devices.clone(),
    )
    .with_transports(transports.clone())
    .build()
    .await
    .unwrap();
    Party {
        controller,
        devices,
        transports,
    }
}

/// Wait until the controller's snapshot satisfies `condition`
pub async fn wait_until(
    controller: &CallController,
    what: &str,
    condition: impl Fn(&CallSnapshot) -> bool,
) {
    let mut rx = controller.observe();
    let reached = matches!(
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| condition(s))).await,
        Ok(Ok(_))
    );
    assert!(
        reached,
        "timed out waiting for {what} at {}: {:?}",
        controller.local_user(),
        controller.snapshot().state
    );
}

pub async fn wait_for_state(controller: &CallController, state: CallState) {
    wait_until(controller, &state.to_string(), |s| s.state == state).await;
}

/// Let spawned pumps drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// `caller` calls `callee`, who answers; returns once both are active
pub async fn connected_pair(hub: &Arc<MemorySignalingHub>, caller: &str, callee: &str) -> (Party, Party) {
    let a = party(hub, caller).await;
    let b = party(hub, callee).await;
    a.controller.start_call(callee).await.unwrap();
    wait_until(&b.controller, "ringing", |s| s.is_call_incoming).await;
    b.controller.answer_call().await.unwrap();
    wait_for_state(&a.controller, CallState::Active).await;
    (a, b)
}

pub fn count_events(hub: &MemorySignalingHub, event: &str, sender: &str) -> usize {
    hub.published(TOPIC)
        .iter()
        .filter(|m| m.event_name() == event && m.sender().as_str() == sender)
        .count()
}

pub fn messages(hub: &MemorySignalingHub) -> Vec<SignalingMessage> {
    hub.published(TOPIC)
}
