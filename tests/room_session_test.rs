use peerroom::signaling::{events, MemoryChannel};
use peerroom::testing::{LoopbackNetwork, SyntheticCapture};
use peerroom::webrtc::{ConnectionState, IceConnectionState, PeerEvent, PeerRole};
use peerroom::{
    DeviceError, DeviceKind, ErrorKind, MemoryRelay, MembershipState, PeerRoomConfig,
    RoomSession, SessionError, SessionSnapshot,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    session: RoomSession,
    capture: Arc<SyntheticCapture>,
    channel: Arc<MemoryChannel>,
}

fn client(name: &str, relay: &MemoryRelay, network: &LoopbackNetwork) -> Client {
    let capture = Arc::new(SyntheticCapture::with_default_devices());
    let channel = Arc::new(relay.connect(name));
    let session = RoomSession::new(
        PeerRoomConfig::default(),
        capture.clone(),
        Arc::new(network.connector(name)),
        channel.clone(),
    );
    Client {
        session,
        capture,
        channel,
    }
}

async fn wait_until<F>(session: &RoomSession, what: &str, predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut state = session.subscribe();
    let result = tokio::time::timeout(WAIT, state.wait_for(predicate)).await;
    let snapshot = match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {}: {:#?}", what, session.snapshot()),
    };
    snapshot
}

fn connected_with_video(s: &SessionSnapshot) -> bool {
    s.is_connected() && s.has_remote_video()
}

/// Two clients joined to `room` and fully connected
async fn connected_pair(
    room: &str,
    relay: &MemoryRelay,
    network: &LoopbackNetwork,
) -> (Client, Client) {
    let alice = client("alice", relay, network);
    let bob = client("bob", relay, network);
    alice.session.join(room).await.unwrap();
    bob.session.join(room).await.unwrap();
    wait_until(&alice.session, "alice connected", connected_with_video).await;
    wait_until(&bob.session, "bob connected", connected_with_video).await;
    (alice, bob)
}

#[tokio::test]
async fn test_first_joiner_waits_without_offering() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);

    alice.session.join("42").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = alice.session.snapshot();
    assert_eq!(snapshot.membership, MembershipState::Joined);
    assert_eq!(snapshot.room_id.as_deref(), Some("42"));
    assert_eq!(snapshot.role, PeerRole::Pending);
    assert!(snapshot.has_peer_session);
    assert!(snapshot.local_stream().is_some());
    assert_eq!(relay.count("alice", events::JOIN), 1);
    assert_eq!(relay.count("alice", events::OFFER), 0);
    assert_eq!(relay.members("42"), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_second_joiner_triggers_full_negotiation() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    let a = alice.session.snapshot();
    let b = bob.session.snapshot();
    assert_eq!(a.role, PeerRole::Offerer);
    assert_eq!(b.role, PeerRole::Answerer);
    assert_eq!(a.connection_state, ConnectionState::Connected);
    assert_eq!(a.ice_state, IceConnectionState::Connected);
    assert_eq!(b.connection_state, ConnectionState::Connected);
    assert_eq!(b.ice_state, IceConnectionState::Connected);

    assert_eq!(relay.count("alice", events::OFFER), 1);
    assert_eq!(relay.count("bob", events::ANSWER), 1);
    assert_eq!(relay.count("bob", events::OFFER), 0);

    // Remote is big by default
    let alice_local = a.local_stream().unwrap().id().to_string();
    let bob_local = b.local_stream().unwrap().id().to_string();
    assert_eq!(a.routing.big_stream.as_ref().unwrap().id(), bob_local);
    assert_eq!(a.routing.small_stream.as_ref().unwrap().id(), alice_local);
    assert_eq!(b.routing.big_stream.as_ref().unwrap().id(), alice_local);
}

#[tokio::test]
async fn test_switch_device_renegotiates_and_keeps_layout() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;
    assert!(!bob.session.snapshot().local_is_big);

    alice
        .session
        .switch_device(DeviceKind::VideoInput, "cam2")
        .await
        .unwrap();

    let a = alice.session.snapshot();
    let local = a.local_stream().unwrap().clone();
    assert!(local
        .video_tracks()
        .all(|t| t.device_id() == Some("cam2")));
    assert_eq!(a.media.selected_video.as_ref().map(|d| d.id.as_str()), Some("cam2"));
    assert_eq!(relay.count("alice", events::OFFER), 2);

    let local_id = local.id().to_string();
    let b = wait_until(&bob.session, "bob receives the new stream", |s| {
        connected_with_video(s)
            && s.remote_stream.as_ref().map(|r| r.id()) == Some(local_id.as_str())
    })
    .await;
    assert!(!b.local_is_big);
    assert_eq!(b.routing.big_stream.as_ref().map(|s| s.id()), Some(local_id.as_str()));
    assert_eq!(relay.count("bob", events::ANSWER), 2);

    wait_until(&alice.session, "alice reconnected", connected_with_video).await;
    assert_eq!(network.open_peers("alice"), 1);
    assert_eq!(network.open_peers("bob"), 1);
}

#[tokio::test]
async fn test_ice_disconnect_drops_remote_stream_only() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (_alice, bob) = connected_pair("42", &relay, &network).await;

    let peer = network.latest("bob").unwrap();
    peer.emit(PeerEvent::IceStateChanged(IceConnectionState::Disconnected));

    let b = wait_until(&bob.session, "remote stream cleared", |s| {
        s.remote_stream.is_none()
    })
    .await;
    assert!(!b.has_remote_video());
    assert_eq!(b.ice_state, IceConnectionState::Disconnected);
    assert_eq!(b.connection_state, ConnectionState::Connected);
    assert!(!b.is_connected());
    assert!(b.last_error.is_none());
}

#[tokio::test]
async fn test_ice_failure_is_recorded() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair("42", &relay, &network).await;

    network
        .latest("alice")
        .unwrap()
        .emit(PeerEvent::IceStateChanged(IceConnectionState::Failed));

    let a = wait_until(&alice.session, "ice failure recorded", |s| {
        s.last_error.is_some()
    })
    .await;
    assert_eq!(a.last_error.unwrap().kind, ErrorKind::IceFailure);
    assert_eq!(a.membership, MembershipState::Joined);
}

#[tokio::test]
async fn test_leave_during_offer_creation_discards_offer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);
    let bob = client("bob", &relay, &network);

    let gate = network.hold_offers();
    alice.session.join("42").await.unwrap();
    bob.session.join("42").await.unwrap();
    gate.entered().await;

    alice.session.leave().await.unwrap();
    gate.release();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a = alice.session.snapshot();
    assert_eq!(a.membership, MembershipState::NotJoined);
    assert!(!a.has_peer_session);
    assert!(a.room_id.is_none());
    assert!(a.last_error.is_none());
    assert_eq!(a.role, PeerRole::Pending);
    assert_eq!(relay.count("alice", events::OFFER), 0);
    assert_eq!(alice.capture.live_tracks(), 0);
    assert_eq!(alice.channel.handler_count(events::OFFER), 0);
}

#[tokio::test]
async fn test_peer_leaving_resets_remaining_member() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    bob.session.leave().await.unwrap();
    assert_eq!(bob.session.snapshot().membership, MembershipState::NotJoined);
    assert_eq!(bob.capture.live_tracks(), 0);

    let a = wait_until(&alice.session, "alice reset by bye", |s| {
        s.membership == MembershipState::NotJoined
    })
    .await;
    assert!(!a.has_peer_session);
    assert!(a.remote_stream.is_none());
    assert_eq!(network.open_peers("alice"), 0);
    assert_eq!(alice.channel.handler_count(events::READY), 0);
    // Only the leaver is removed by the relay
    assert_eq!(relay.members("42"), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_rejoin_after_leave_connects_again() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    bob.session.leave().await.unwrap();
    wait_until(&alice.session, "alice reset", |s| !s.is_joined()).await;

    alice.session.join("42").await.unwrap();
    bob.session.join("42").await.unwrap();
    wait_until(&alice.session, "alice connected again", connected_with_video).await;
    wait_until(&bob.session, "bob connected again", connected_with_video).await;
    assert_eq!(relay.count("alice", events::OFFER), 2);
}

#[tokio::test]
async fn test_remaining_member_rejoins_after_leaver() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    bob.session.leave().await.unwrap();
    wait_until(&alice.session, "alice reset", |s| !s.is_joined()).await;

    // The ready for bob's join reaches nobody; alice's own join restarts negotiation
    bob.session.join("42").await.unwrap();
    alice.session.join("42").await.unwrap();
    wait_until(&alice.session, "alice connected again", connected_with_video).await;
    wait_until(&bob.session, "bob connected again", connected_with_video).await;
    assert_eq!(relay.count("bob", events::OFFER), 1);
    assert_eq!(
        relay.members("42"),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn test_leave_after_bye_releases_capture_and_relay() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    bob.session.leave().await.unwrap();
    wait_until(&alice.session, "alice reset", |s| !s.is_joined()).await;
    assert_eq!(relay.members("42"), vec!["alice".to_string()]);

    alice.session.leave().await.unwrap();
    assert_eq!(alice.capture.live_tracks(), 0);
    assert_eq!(relay.count("alice", events::LEAVE), 1);
    assert!(relay.members("42").is_empty());
    assert!(alice.session.snapshot().local_stream().is_none());

    // Nothing left to tell the relay
    alice.session.leave().await.unwrap();
    assert_eq!(relay.count("alice", events::LEAVE), 1);
}

#[tokio::test]
async fn test_join_elsewhere_after_bye_leaves_old_room() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    bob.session.leave().await.unwrap();
    wait_until(&alice.session, "alice reset", |s| !s.is_joined()).await;

    alice.session.join("43").await.unwrap();
    assert!(relay.members("42").is_empty());
    assert_eq!(relay.members("43"), vec!["alice".to_string()]);
    assert!(alice.session.snapshot().is_joined());
}

#[tokio::test]
async fn test_third_joiner_is_turned_away() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (_alice, _bob) = connected_pair("42", &relay, &network).await;
    let carol = client("carol", &relay, &network);

    carol.session.join("42").await.unwrap();
    let c = wait_until(&carol.session, "carol rejected", |s| {
        s.membership == MembershipState::NotJoined && s.last_error.is_some()
    })
    .await;
    assert_eq!(c.last_error.unwrap().kind, ErrorKind::Signaling);
    assert!(!c.has_peer_session);
    assert_eq!(carol.channel.handler_count(events::FULL), 0);
    assert_eq!(relay.members("42").len(), 2);
}

#[tokio::test]
async fn test_join_failure_when_relay_unreachable() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);
    relay.set_failing(true);

    let err = alice.session.join("42").await.unwrap_err();
    assert!(matches!(err, SessionError::Signaling(_)));

    let a = alice.session.snapshot();
    assert_eq!(a.membership, MembershipState::NotJoined);
    assert!(!a.has_peer_session);
    assert!(!a.is_loading);
    assert_eq!(a.last_error.unwrap().kind, ErrorKind::Signaling);
    assert_eq!(alice.channel.handler_count(events::READY), 0);
    assert_eq!(network.open_peers("alice"), 0);
}

#[tokio::test]
async fn test_join_without_capture_permission() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);
    alice.capture.deny_permission(true);

    let err = alice.session.join("42").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Device(DeviceError::PermissionDenied(_))
    ));

    let a = alice.session.snapshot();
    assert_eq!(a.membership, MembershipState::NotJoined);
    assert_eq!(a.last_error.unwrap().kind, ErrorKind::Device);
    assert_eq!(relay.count("alice", events::JOIN), 0);
    assert!(network.peers("alice").is_empty());
}

#[tokio::test]
async fn test_blank_and_repeated_joins_are_ignored() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);

    alice.session.join("   ").await.unwrap();
    assert_eq!(alice.session.snapshot().membership, MembershipState::NotJoined);
    assert!(relay.records().is_empty());

    alice.session.join("42").await.unwrap();
    alice.session.join("43").await.unwrap();
    let a = alice.session.snapshot();
    assert_eq!(a.room_id.as_deref(), Some("42"));
    assert_eq!(relay.count("alice", events::JOIN), 1);
    assert_eq!(network.peers("alice").len(), 1);
}

#[tokio::test]
async fn test_failed_switch_keeps_session() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair("42", &relay, &network).await;
    let before = alice.session.snapshot().local_stream().unwrap().id().to_string();

    let err = alice
        .session
        .switch_device(DeviceKind::VideoInput, "cam9")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Device(DeviceError::NotFound(_))));

    let a = alice.session.snapshot();
    assert_eq!(a.local_stream().unwrap().id(), before);
    assert_eq!(a.last_error.as_ref().unwrap().kind, ErrorKind::Device);
    assert!(a.is_connected());
    assert_eq!(relay.count("alice", events::OFFER), 1);
}

#[tokio::test]
async fn test_switch_without_peer_connection_resets_membership() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair("42", &relay, &network).await;
    network.set_refusing(true);

    let err = alice
        .session
        .switch_device(DeviceKind::VideoInput, "cam2")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Negotiation(_)));

    let a = alice.session.snapshot();
    assert_eq!(a.membership, MembershipState::NotJoined);
    assert!(!a.has_peer_session);
    assert_eq!(a.last_error.unwrap().kind, ErrorKind::Negotiation);
    assert_eq!(alice.channel.handler_count(events::OFFER), 0);
    assert_eq!(relay.count("alice", events::OFFER), 1);

    // Still listed by the relay until told otherwise
    alice.session.leave().await.unwrap();
    assert_eq!(relay.members("42"), vec!["bob".to_string()]);
}

#[tokio::test]
async fn test_renegotiation_without_peer_connection_resets_answerer() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair("42", &relay, &network).await;

    let gate = network.hold_offers();
    let switching = {
        let session = bob.session.clone();
        tokio::spawn(async move { session.switch_device(DeviceKind::VideoInput, "cam2").await })
    };
    gate.entered().await;
    network.set_refusing(true);
    gate.release();
    switching.await.unwrap().unwrap();

    let a = wait_until(&alice.session, "alice gives up", |s| {
        s.membership == MembershipState::NotJoined && s.last_error.is_some()
    })
    .await;
    assert!(!a.has_peer_session);
    assert_eq!(a.last_error.unwrap().kind, ErrorKind::Negotiation);
    assert_eq!(relay.count("bob", events::OFFER), 1);
    assert_eq!(relay.count("alice", events::ANSWER), 0);
}

#[tokio::test]
async fn test_toggles_and_swap() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let (alice, _bob) = connected_pair("42", &relay, &network).await;
    let before = alice.session.snapshot();

    assert!(!alice.session.toggle_video().await);
    let a = alice.session.snapshot();
    assert!(!a.media.video_enabled);
    assert!(a.local_stream().unwrap().video_tracks().all(|t| !t.is_enabled()));
    assert!(a.is_connected());
    assert!(alice.session.toggle_video().await);

    assert!(!alice.session.toggle_audio().await);
    assert!(!alice.session.snapshot().media.audio_enabled);

    assert!(alice.session.swap_streams().await);
    let swapped = alice.session.snapshot();
    assert_eq!(swapped.routing.big_stream, before.routing.small_stream);
    assert_eq!(swapped.routing.small_stream, before.routing.big_stream);
    assert_eq!(swapped.has_remote_video(), before.has_remote_video());

    alice.session.set_local_big(false).await;
    assert!(!alice.session.snapshot().local_is_big);
}

#[tokio::test]
async fn test_reset_keeps_capture() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);
    alice.session.join("42").await.unwrap();

    alice.session.reset().await;
    let a = alice.session.snapshot();
    assert_eq!(a.membership, MembershipState::NotJoined);
    assert!(!a.has_peer_session);
    assert!(a.local_stream().is_some());
    assert!(alice.capture.live_tracks() > 0);
    assert_eq!(alice.channel.handler_count(events::OFFER), 0);
}

#[tokio::test]
async fn test_device_initialization_and_refresh() {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let alice = client("alice", &relay, &network);

    alice.session.initialize_local_devices().await.unwrap();
    let a = alice.session.snapshot();
    assert_eq!(a.media.audio_devices.len(), 2);
    assert_eq!(a.media.video_devices.len(), 2);
    assert!(a.local_stream().is_some());
    assert_eq!(a.membership, MembershipState::NotJoined);

    let devices = alice.session.enumerate_devices().await.unwrap();
    assert_eq!(devices.len(), 4);

    alice.capture.remove_device("cam2");
    let changes = alice.session.refresh_devices().await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(alice.session.snapshot().media.video_devices.len(), 1);
}
