//! End-to-end tests wiring real client state machines to the server
//! driver.
//!
//! A tiny in-process "network" executes driver actions against the
//! clients' event loops, so the full round trip runs: optimistic send →
//! authorization → persistence → fan-out → echo reconciliation.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tripline_client::{ChatClient, ClientAction, ClientEvent, MessageStatus};
use tripline_core::{SessionKey, env::Environment};
use tripline_proto::Frame;
use tripline_server::{
    ConnectionGateway, DriverConfig, MemoryStorage, ServerAction, ServerDriver, ServerEvent,
    Storage, TripRecord, UserRecord,
};

#[derive(Clone)]
struct TestEnv {
    seed: u8,
    counter: Arc<AtomicU64>,
}

impl TestEnv {
    fn new(seed: u8) -> Self {
        Self { seed, counter: Arc::new(AtomicU64::new(0)) }
    }
}

impl Environment for TestEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        // Distinct per client (seed byte) and per call (counter) so
        // correlation ids never collide.
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = n.to_be_bytes();
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = if i == 0 { self.seed | 1 } else { bytes[i % 8] };
        }
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }
}

const TRIP: u64 = 42;
const ALICE: u64 = 1;
const BOB: u64 = 2;

fn session_key() -> SessionKey {
    SessionKey::from_seed([23u8; 32])
}

/// In-process wiring of one driver and several clients.
struct Harness {
    driver: ServerDriver<TestEnv, MemoryStorage>,
    clients: HashMap<u64, ChatClient<TestEnv>>,
}

impl Harness {
    fn new() -> Self {
        let storage = MemoryStorage::new();
        storage
            .upsert_user(ALICE, &UserRecord { display_name: "Alice Smith".to_string() })
            .unwrap();
        storage.upsert_user(BOB, &UserRecord { display_name: "Bob Lee".to_string() }).unwrap();
        storage
            .create_trip(
                TRIP,
                &TripRecord { owner_id: ALICE, name: "Lisbon".to_string(), created_at_secs: 0 },
            )
            .unwrap();

        let gateway = ConnectionGateway::new(session_key().verifier());
        Self {
            driver: ServerDriver::new(TestEnv::new(0), storage, gateway, DriverConfig::default()),
            clients: HashMap::new(),
        }
    }

    /// Accept a connection and run the authentication handshake.
    fn connect(&mut self, session_id: u64, user_id: u64, display_name: &str) {
        let token = session_key().issue(user_id, 1_000, 3_600);
        let client =
            ChatClient::new(TestEnv::new(session_id as u8), user_id, display_name, token);
        self.clients.insert(session_id, client);

        let actions =
            self.driver.process_event(ServerEvent::ConnectionAccepted { session_id }).unwrap();
        self.execute_server_actions(actions);

        self.client_event(session_id, ClientEvent::Connected);
        assert!(self.clients[&session_id].is_connected(), "handshake should complete");
    }

    /// Feed an event to a client and route any resulting sends through the
    /// driver.
    fn client_event(&mut self, session_id: u64, event: ClientEvent) {
        let actions = self
            .clients
            .get_mut(&session_id)
            .expect("client exists")
            .handle(event)
            .expect("client event should succeed");

        for action in actions {
            if let ClientAction::Send(frame) = action {
                let server_actions = self
                    .driver
                    .process_event(ServerEvent::FrameReceived { session_id, frame })
                    .expect("driver should process frame");
                self.execute_server_actions(server_actions);
            }
        }
    }

    fn execute_server_actions(&mut self, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::SendToSession { session_id, frame } => {
                    self.deliver(session_id, frame);
                },
                ServerAction::BroadcastToTrip { trip_id, frame } => {
                    let sessions: Vec<u64> = self.driver.sessions_in_trip(trip_id).collect();
                    for session_id in sessions {
                        self.deliver(session_id, frame.clone());
                    }
                },
                ServerAction::CloseConnection { .. } | ServerAction::Log { .. } => {},
            }
        }
    }

    fn deliver(&mut self, session_id: u64, frame: Frame) {
        if let Some(client) = self.clients.get_mut(&session_id) {
            client
                .handle(ClientEvent::FrameReceived(frame))
                .expect("client should accept server frame");
        }
    }
}

/// Scenario: the owner and a registered participant both receive the
/// owner's message as confirmed, and the sender ends with exactly one
/// visible copy.
#[test]
fn owner_message_confirmed_for_both_members() {
    let mut harness = Harness::new();

    harness.connect(100, ALICE, "Alice Smith");
    harness.connect(200, BOB, "Bob Lee");

    harness.client_event(200, ClientEvent::RegisterParticipant { trip_id: TRIP });
    harness.client_event(100, ClientEvent::JoinTrip { trip_id: TRIP });
    harness.client_event(200, ClientEvent::JoinTrip { trip_id: TRIP });

    harness.client_event(
        100,
        ClientEvent::SendMessage { trip_id: TRIP, body: "Hello".to_string() },
    );

    // Alice: one entry, confirmed via her own echo, with the server id.
    let alice_messages = harness.clients[&100].messages(TRIP);
    assert_eq!(alice_messages.len(), 1);
    assert_eq!(alice_messages[0].status, MessageStatus::Confirmed);
    assert_eq!(alice_messages[0].id, Some(1));
    assert_eq!(alice_messages[0].body, "Hello");
    assert_eq!(alice_messages[0].author_name, "Alice Smith");

    // Bob: the same confirmed record.
    let bob_messages = harness.clients[&200].messages(TRIP);
    assert_eq!(bob_messages.len(), 1);
    assert_eq!(bob_messages[0].status, MessageStatus::Confirmed);
    assert_eq!(bob_messages[0].id, Some(1));
    assert_eq!(bob_messages[0].author_name, "Alice Smith");

    // And history agrees.
    let history = harness.driver.storage().load_messages(TRIP, 1, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body, "Hello");
}

/// A non-member's client never sees a broadcast for the room it was
/// refused from.
#[test]
fn outsider_receives_nothing() {
    let mut harness = Harness::new();
    harness.driver.storage().upsert_user(3, &UserRecord { display_name: "Carol".to_string() }).unwrap();

    harness.connect(100, ALICE, "Alice Smith");
    harness.connect(300, 3, "Carol");

    harness.client_event(100, ClientEvent::JoinTrip { trip_id: TRIP });
    // Carol tries to join without registering; the server refuses and her
    // client drops the joined flag.
    harness.client_event(300, ClientEvent::JoinTrip { trip_id: TRIP });
    assert!(!harness.clients[&300].is_joined(TRIP));

    harness.client_event(
        100,
        ClientEvent::SendMessage { trip_id: TRIP, body: "members only".to_string() },
    );

    assert_eq!(harness.clients[&100].messages(TRIP).len(), 1);
    assert!(harness.clients[&300].messages(TRIP).is_empty());
}

/// Both members chatting: everyone observes the same commit order, each
/// sender reconciles its own echoes, and nobody holds duplicates.
#[test]
fn interleaved_sends_converge() {
    let mut harness = Harness::new();

    harness.connect(100, ALICE, "Alice Smith");
    harness.connect(200, BOB, "Bob Lee");

    harness.client_event(200, ClientEvent::RegisterParticipant { trip_id: TRIP });
    harness.client_event(100, ClientEvent::JoinTrip { trip_id: TRIP });
    harness.client_event(200, ClientEvent::JoinTrip { trip_id: TRIP });

    harness.client_event(
        100,
        ClientEvent::SendMessage { trip_id: TRIP, body: "shall we book flights?".to_string() },
    );
    harness.client_event(
        200,
        ClientEvent::SendMessage { trip_id: TRIP, body: "already did".to_string() },
    );
    harness.client_event(
        100,
        ClientEvent::SendMessage { trip_id: TRIP, body: "perfect".to_string() },
    );

    let expected = vec![
        ("shall we book flights?", Some(1)),
        ("already did", Some(2)),
        ("perfect", Some(3)),
    ];

    for session_id in [100, 200] {
        let view: Vec<(&str, Option<u64>)> = harness.clients[&session_id]
            .messages(TRIP)
            .iter()
            .map(|m| (m.body.as_str(), m.id))
            .collect();
        assert_eq!(view, expected, "session {session_id} sees the commit order");
        assert!(
            harness.clients[&session_id]
                .messages(TRIP)
                .iter()
                .all(|m| m.status == MessageStatus::Confirmed)
        );
    }
}

/// Reconnect flow: re-authenticate, re-join, reload history. The rebuilt
/// conversation matches what the persisted log says.
#[test]
fn reconnect_rebuilds_from_history() {
    let mut harness = Harness::new();

    harness.connect(100, ALICE, "Alice Smith");
    harness.client_event(100, ClientEvent::JoinTrip { trip_id: TRIP });
    harness.client_event(
        100,
        ClientEvent::SendMessage { trip_id: TRIP, body: "before the drop".to_string() },
    );

    // Connection drops; server forgets the room membership.
    harness
        .driver
        .process_event(ServerEvent::ConnectionClosed {
            session_id: 100,
            reason: "network blip".to_string(),
        })
        .unwrap();
    assert_eq!(harness.driver.sessions_in_trip(TRIP).count(), 0);

    // New session for the same user and client state.
    let actions =
        harness.driver.process_event(ServerEvent::ConnectionAccepted { session_id: 101 }).unwrap();
    harness.execute_server_actions(actions);
    let client = harness.clients.remove(&100).unwrap();
    harness.clients.insert(101, client);

    harness.client_event(101, ClientEvent::Connected);
    harness.client_event(101, ClientEvent::JoinTrip { trip_id: TRIP });
    harness.client_event(101, ClientEvent::RequestHistory { trip_id: TRIP });

    let messages = harness.clients[&101].messages(TRIP);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "before the drop");
    assert_eq!(messages[0].status, MessageStatus::Confirmed);
    assert_eq!(messages[0].id, Some(1));
}
