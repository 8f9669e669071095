use peerroom::signaling::{events, MemoryRelay};
use peerroom::testing::LoopbackNetwork;
use peerroom::webrtc::{
    ConnectionState, IceCandidate, IceConnectionState, PeerEvent, PeerRole, PeerSignal,
    RTCConfiguration, SessionDescription, SessionNegotiator,
};
use peerroom::{MediaStream, MediaTrack, SessionError, TrackKind};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

fn negotiator(
    network: &LoopbackNetwork,
    relay: &MemoryRelay,
) -> (SessionNegotiator, mpsc::UnboundedReceiver<PeerSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let negotiator = SessionNegotiator::new(
        Arc::new(network.connector("a")),
        Arc::new(relay.connect("a")),
        RTCConfiguration::default(),
        tx,
    );
    (negotiator, rx)
}

fn host_candidate(port: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 UDP 2122260223 127.0.0.1 {} typ host", port),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn remote_offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\na=loopback-peer:remote-1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n")
}

proptest! {
    /// Candidates that arrive before the remote description are applied in
    /// arrival order right after it is installed
    #[test]
    fn buffered_candidates_keep_arrival_order(
        arrivals in prop::collection::vec((1024u16..65000, any::<bool>()), 0..12),
    ) {
        tokio_test::block_on(async {
            let network = LoopbackNetwork::new();
            let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());
            negotiator.open("r", None, PeerRole::Pending).await.unwrap();

            let mut expected = Vec::new();
            for (port, well_formed) in &arrivals {
                let candidate = if *well_formed {
                    host_candidate(*port)
                } else {
                    IceCandidate {
                        candidate: format!("garbage {}", port),
                        sdp_mid: None,
                        sdp_mline_index: None,
                    }
                };
                if *well_formed {
                    expected.push(candidate.clone());
                }
                negotiator.add_remote_candidate(candidate).await.unwrap();
            }
            assert_eq!(negotiator.status().await.pending_candidates, expected.len());

            negotiator.apply_remote_description(remote_offer()).await.unwrap();

            let status = negotiator.status().await;
            assert_eq!(status.pending_candidates, 0);
            assert_eq!(status.role, PeerRole::Answerer);
            let peer = network.latest("a").unwrap();
            assert_eq!(peer.applied_candidates(), expected);
        });
    }
}

#[tokio::test]
async fn test_candidates_after_description_apply_immediately() {
    let network = LoopbackNetwork::new();
    let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());
    negotiator.open("r", None, PeerRole::Pending).await.unwrap();
    negotiator.apply_remote_description(remote_offer()).await.unwrap();

    negotiator.add_remote_candidate(host_candidate(5000)).await.unwrap();
    assert_eq!(negotiator.status().await.pending_candidates, 0);
    assert_eq!(
        network.latest("a").unwrap().applied_candidates(),
        vec![host_candidate(5000)]
    );
}

#[tokio::test]
async fn test_candidate_without_session_is_an_error() {
    let (negotiator, _rx) = negotiator(&LoopbackNetwork::new(), &MemoryRelay::new());
    let err = negotiator
        .add_remote_candidate(host_candidate(5000))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Negotiation(_)));
}

#[tokio::test]
async fn test_reopen_releases_previous_session() {
    let network = LoopbackNetwork::new();
    let (negotiator, mut rx) = negotiator(&network, &MemoryRelay::new());
    let track = MediaTrack::new(TrackKind::Video, "cam", Some("cam1".to_string()));
    let local = MediaStream::new(vec![track.clone()]);

    let first = negotiator.open("r", Some(&local), PeerRole::Pending).await.unwrap();
    let second = negotiator.open("r", Some(&local), PeerRole::Pending).await.unwrap();
    assert!(second > first);

    let peers = network.peers("a");
    assert_eq!(peers.len(), 2);
    assert!(peers[0].is_closed());
    assert!(!peers[1].is_closed());
    assert_eq!(network.open_peers("a"), 1);
    assert_eq!(negotiator.status().await.generation, Some(second));

    // Local capture is shared, not owned by the session
    assert!(track.is_live());

    // The released session no longer forwards callbacks
    tokio::task::yield_now().await;
    peers[0].emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_opens_leave_one_session() {
    let network = LoopbackNetwork::new();
    let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());

    let (a, b) = tokio::join!(
        negotiator.open("r", None, PeerRole::Pending),
        negotiator.open("r", None, PeerRole::Pending),
    );
    assert_ne!(a.unwrap(), b.unwrap());
    assert_eq!(network.peers("a").len(), 2);
    assert_eq!(network.open_peers("a"), 1);
}

#[tokio::test]
async fn test_offer_for_replaced_session_is_discarded() {
    let network = LoopbackNetwork::new();
    let relay = MemoryRelay::new();
    let (negotiator, _rx) = negotiator(&network, &relay);
    let negotiator = Arc::new(negotiator);
    negotiator.open("r", None, PeerRole::Pending).await.unwrap();

    let gate = network.hold_offers();
    let pending = {
        let negotiator = negotiator.clone();
        tokio::spawn(async move { negotiator.create_and_send_offer().await })
    };
    gate.entered().await;

    negotiator.open("r", None, PeerRole::Pending).await.unwrap();
    gate.release();

    let sent = pending.await.unwrap();
    assert!(!sent.unwrap());
    assert_eq!(relay.count("a", events::OFFER), 0);

    let status = negotiator.status().await;
    assert!(!status.has_local_description);
    assert_eq!(status.role, PeerRole::Pending);
}

#[tokio::test]
async fn test_offer_is_installed_and_sent() {
    let network = LoopbackNetwork::new();
    let relay = MemoryRelay::new();
    let (negotiator, mut rx) = negotiator(&network, &relay);
    let generation = negotiator.open("r", None, PeerRole::Pending).await.unwrap();

    assert!(negotiator.create_and_send_offer().await.unwrap());
    let status = negotiator.status().await;
    assert!(status.has_local_description);
    assert_eq!(status.role, PeerRole::Offerer);
    assert!(negotiator.needs_fresh_session().await);

    let offer = relay
        .records()
        .into_iter()
        .find(|r| r.event == events::OFFER)
        .unwrap();
    assert_eq!(offer.room, "r");
    assert_eq!(offer.payload["type"], "offer");

    // Installing the offer gathers a candidate, which goes out as ice_candidate
    let signal = rx.recv().await.unwrap();
    assert_eq!(signal.generation, generation);
    assert!(matches!(signal.event, PeerEvent::LocalCandidate(_)));
    negotiator.handle_peer_event(signal).await.unwrap();

    let candidate = relay
        .records()
        .into_iter()
        .find(|r| r.event == events::ICE_CANDIDATE)
        .unwrap();
    assert_eq!(candidate.payload["label"], 0);
    assert_eq!(candidate.payload["id"], "0");
    assert!(candidate.payload["candidate"]
        .as_str()
        .unwrap()
        .starts_with("candidate:"));
}

#[tokio::test]
async fn test_rejected_answer_leaves_session_untouched() {
    let network = LoopbackNetwork::new();
    let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());
    negotiator.open("r", None, PeerRole::Pending).await.unwrap();

    let answer = SessionDescription::answer("v=0\r\na=loopback-peer:remote-1\r\n");
    let err = negotiator.apply_remote_description(answer).await.unwrap_err();
    assert!(matches!(err, SessionError::Negotiation(_)));

    let status = negotiator.status().await;
    assert!(!status.has_remote_description);
    assert!(!negotiator.needs_fresh_session().await);
}

#[tokio::test]
async fn test_remote_track_then_ice_disconnect() {
    let network = LoopbackNetwork::new();
    let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());
    let generation = negotiator.open("r", None, PeerRole::Pending).await.unwrap();

    let track = MediaTrack::new(TrackKind::Video, "peer cam", None);
    let stream = MediaStream::with_id("remote", vec![track.clone()]);
    let events = [
        PeerEvent::ConnectionStateChanged(ConnectionState::Connected),
        PeerEvent::IceStateChanged(IceConnectionState::Connected),
        PeerEvent::RemoteTrack {
            track,
            streams: vec![stream],
        },
    ];
    for event in events {
        assert!(negotiator
            .handle_peer_event(PeerSignal { generation, event })
            .await
            .unwrap());
    }
    let status = negotiator.status().await;
    assert_eq!(status.remote_stream.as_ref().map(|s| s.id()), Some("remote"));

    negotiator
        .handle_peer_event(PeerSignal {
            generation,
            event: PeerEvent::IceStateChanged(IceConnectionState::Disconnected),
        })
        .await
        .unwrap();
    let status = negotiator.status().await;
    assert!(status.remote_stream.is_none());
    assert_eq!(status.ice_state, IceConnectionState::Disconnected);
    assert_eq!(status.connection_state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let network = LoopbackNetwork::new();
    let (negotiator, _rx) = negotiator(&network, &MemoryRelay::new());
    negotiator.open("r", None, PeerRole::Pending).await.unwrap();

    assert!(negotiator.close().await);
    assert!(!negotiator.close().await);
    assert!(!negotiator.is_open().await);
    assert_eq!(negotiator.status().await.generation, None);
    assert_eq!(network.open_peers("a"), 0);
}
