//! Authorization behavior tests.
//!
//! Membership is re-evaluated on every privileged operation, so these tests
//! exercise non-members being rejected per-operation and membership changes
//! taking effect mid-session.

use std::time::Duration;

use tripline_core::{SessionKey, env::Environment};
use tripline_proto::{
    FrameHeader, Opcode, Payload,
    payloads::{ErrorPayload, chat::HistoryRequest, chat::SendMessage},
};
use tripline_server::{
    ConnectionGateway, DriverConfig, MemoryStorage, ServerAction, ServerDriver, ServerEvent,
    Storage, TripRecord, UserRecord,
};

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(0x42);
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }
}

const TRIP: u64 = 42;
const ALICE: u64 = 1;
const CAROL: u64 = 3;

fn session_key() -> SessionKey {
    SessionKey::from_seed([13u8; 32])
}

fn new_driver() -> ServerDriver<TestEnv, MemoryStorage> {
    let storage = MemoryStorage::new();
    storage
        .upsert_user(ALICE, &UserRecord { display_name: "Alice Smith".to_string() })
        .unwrap();
    storage.upsert_user(CAROL, &UserRecord { display_name: "Carol".to_string() }).unwrap();
    storage
        .create_trip(
            TRIP,
            &TripRecord { owner_id: ALICE, name: "Lisbon".to_string(), created_at_secs: 0 },
        )
        .unwrap();

    let gateway = ConnectionGateway::new(session_key().verifier());
    ServerDriver::new(TestEnv, storage, gateway, DriverConfig::default())
}

fn connect_and_authenticate(
    driver: &mut ServerDriver<TestEnv, MemoryStorage>,
    session_id: u64,
    user_id: u64,
) {
    driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();

    let token = session_key().issue(user_id, 1_000, 3_600);
    let frame = Payload::Hello(tripline_proto::payloads::session::Hello { token })
        .into_frame(FrameHeader::new(Opcode::Hello))
        .unwrap();
    driver.process_event(ServerEvent::FrameReceived { session_id, frame }).unwrap();
}

fn error_code_sent_to(actions: &[ServerAction], session_id: u64) -> Option<u16> {
    actions.iter().find_map(|a| match a {
        ServerAction::SendToSession { session_id: target, frame } if *target == session_id => {
            match Payload::from_frame(frame) {
                Ok(Payload::Error(payload)) => Some(payload.code),
                _ => None,
            }
        },
        _ => None,
    })
}

/// A user who is neither owner nor registered participant is rejected at
/// join and never enters the room.
#[test]
fn stranger_join_is_rejected() {
    let mut driver = new_driver();
    connect_and_authenticate(&mut driver, 300, CAROL);

    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(TRIP);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();

    assert_eq!(error_code_sent_to(&actions, 300), Some(ErrorPayload::AUTHORIZATION));
    assert_eq!(driver.sessions_in_trip(TRIP).count(), 0);
}

/// Even a session that slipped into the room set cannot send: sends
/// re-check membership independently of join-time authorization.
#[test]
fn stranger_send_is_rejected_sender_only() {
    let mut driver = new_driver();
    connect_and_authenticate(&mut driver, 100, ALICE);
    connect_and_authenticate(&mut driver, 300, CAROL);

    // Alice joins legitimately.
    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(TRIP);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    driver.process_event(ServerEvent::FrameReceived { session_id: 100, frame }).unwrap();

    // Carol tries to send without membership.
    let mut header = FrameHeader::new(Opcode::SendMessage);
    header.set_trip_id(TRIP);
    header.set_correlation_id(99);
    let frame = Payload::SendMessage(SendMessage { body: "let me in".to_string() })
        .into_frame(header)
        .unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();

    // Sender-only rejection with the correlation id echoed; no broadcast,
    // nothing persisted, room untouched.
    assert_eq!(error_code_sent_to(&actions, 300), Some(ErrorPayload::AUTHORIZATION));
    let error_frame = actions
        .iter()
        .find_map(|a| match a {
            ServerAction::SendToSession { session_id: 300, frame } => Some(frame.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(error_frame.header.correlation_id(), 99);

    assert!(!actions.iter().any(|a| matches!(a, ServerAction::BroadcastToTrip { .. })));
    assert_eq!(driver.storage().latest_message_id(TRIP).unwrap(), None);
    assert_eq!(driver.sessions_in_trip(TRIP).collect::<Vec<_>>(), vec![100]);
}

/// History requires membership too.
#[test]
fn stranger_history_fetch_is_rejected() {
    let mut driver = new_driver();
    connect_and_authenticate(&mut driver, 300, CAROL);

    let mut header = FrameHeader::new(Opcode::HistoryRequest);
    header.set_trip_id(TRIP);
    let frame = Payload::HistoryRequest(HistoryRequest { from_id: 1, limit: 50 })
        .into_frame(header)
        .unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();

    assert_eq!(error_code_sent_to(&actions, 300), Some(ErrorPayload::AUTHORIZATION));
}

/// Registering mid-session grants access on the very next operation; the
/// check is evaluated fresh every time, never cached from a prior failure.
#[test]
fn membership_change_takes_effect_mid_session() {
    let mut driver = new_driver();
    connect_and_authenticate(&mut driver, 300, CAROL);

    // First attempt fails.
    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(TRIP);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();
    assert_eq!(error_code_sent_to(&actions, 300), Some(ErrorPayload::AUTHORIZATION));

    // Carol registers (same live connection).
    let mut header = FrameHeader::new(Opcode::RegisterParticipant);
    header.set_trip_id(TRIP);
    let frame = Payload::RegisterParticipant.into_frame(header).unwrap();
    driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();

    // Second attempt succeeds without reconnecting.
    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(TRIP);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();

    assert_eq!(driver.sessions_in_trip(TRIP).collect::<Vec<_>>(), vec![300]);
}

/// Operations against a nonexistent trip yield NOT_FOUND, not a membership
/// rejection.
#[test]
fn missing_trip_yields_not_found() {
    let mut driver = new_driver();
    connect_and_authenticate(&mut driver, 100, ALICE);

    let mut header = FrameHeader::new(Opcode::RegisterParticipant);
    header.set_trip_id(999);
    let frame = Payload::RegisterParticipant.into_frame(header).unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 100, frame }).unwrap();

    assert_eq!(error_code_sent_to(&actions, 100), Some(ErrorPayload::NOT_FOUND));
}

/// An authorization failure is terminal for that operation only: the same
/// connection keeps working for trips it does belong to.
#[test]
fn rejection_does_not_tear_down_the_connection() {
    let mut driver = new_driver();
    driver
        .storage()
        .create_trip(
            50,
            &TripRecord { owner_id: CAROL, name: "Madeira".to_string(), created_at_secs: 0 },
        )
        .unwrap();
    connect_and_authenticate(&mut driver, 300, CAROL);

    // Rejected on trip 42.
    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(TRIP);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    let actions =
        driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();
    assert!(!actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { .. })));

    // Still welcome on the trip Carol owns.
    let mut header = FrameHeader::new(Opcode::JoinTrip);
    header.set_trip_id(50);
    let frame = Payload::JoinTrip.into_frame(header).unwrap();
    driver.process_event(ServerEvent::FrameReceived { session_id: 300, frame }).unwrap();
    assert_eq!(driver.sessions_in_trip(50).collect::<Vec<_>>(), vec![300]);
}
