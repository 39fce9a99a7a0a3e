//! ICE candidate ordering properties

use peercall_core::{
    IceCandidateInit, MemoryTransport, MemoryTransportFactory, PeerConfig, PeerConnectionManager,
    SessionDescription, TrackKind,
};
use proptest::prelude::*;

fn candidate(n: usize) -> IceCandidateInit {
    IceCandidateInit::new(format!("candidate:{n} 1 udp 2130706431 192.0.2.1 {} typ host", 40000 + n))
}

fn remote_offer() -> SessionDescription {
    SessionDescription::offer(MemoryTransport::sdp_for(
        "remote",
        &[("remote-audio".to_string(), TrackKind::Audio)],
    ))
}

proptest! {
    /// Candidates received before the remote description are applied after
    /// it, in arrival order, keeping only the newest `cap`.
    #[test]
    fn early_candidates_applied_in_order(early in 0usize..80, late in 0usize..10, cap in 1usize..40) {
        let applied = tokio_test::block_on(async {
            let factory = MemoryTransportFactory::new();
            let config = PeerConfig { max_pending_candidates: cap, ..PeerConfig::default() };
            let (mut peer, _events) = PeerConnectionManager::create(&factory, &config).await.unwrap();

            for n in 0..early {
                peer.add_remote_candidate(candidate(n)).await.unwrap();
            }
            prop_assert_eq!(peer.pending_candidate_count(), early.min(cap));

            peer.apply_remote_description(remote_offer()).await.unwrap();
            prop_assert_eq!(peer.pending_candidate_count(), 0);

            for n in early..early + late {
                peer.add_remote_candidate(candidate(n)).await.unwrap();
            }
            Ok(factory.latest().unwrap().applied_candidates())
        })?;

        let kept = early.min(cap);
        let expected: Vec<_> = (early - kept..early + late).map(candidate).collect();
        prop_assert_eq!(applied, expected);
    }
}
