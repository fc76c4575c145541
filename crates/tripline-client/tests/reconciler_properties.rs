//! Property tests for optimistic-message reconciliation.
//!
//! Models a server committing messages in delivery order and checks that,
//! for any interleaving of own echoes, foreign messages, and a mid-stream
//! history reload, the conversation converges to exactly one visible copy
//! per message with the confirmed prefix in commit order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use proptest::prelude::*;
use tripline_client::{ChatClient, ClientEvent, Environment, MessageStatus};
use tripline_proto::{
    FrameHeader, Opcode, Payload,
    payloads::chat::{ChatMessage, HistoryResponse, NewMessage},
};

const TRIP: u64 = 42;
const ME: u64 = 1;

#[derive(Clone)]
struct TestEnv {
    counter: Arc<AtomicU64>,
}

impl TestEnv {
    fn new() -> Self {
        Self { counter: Arc::new(AtomicU64::new(0)) }
    }
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = n.to_be_bytes();
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = bytes[i % 8];
        }
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }
}

/// One server-side commit waiting to be delivered.
#[derive(Debug, Clone)]
enum Commit {
    /// Echo of one of our own sends (index into the sent list).
    Own(usize),
    /// Message from another member.
    Foreign(String),
}

fn new_message_frame(message: &ChatMessage, correlation_id: u128) -> tripline_proto::Frame {
    let mut header = FrameHeader::new(Opcode::NewMessage);
    header.set_trip_id(TRIP);
    header.set_sender_id(message.author_id);
    header.set_message_id(message.id);
    header.set_timestamp_ms(message.created_at_ms);
    header.set_correlation_id(correlation_id);
    Payload::NewMessage(NewMessage { message: message.clone() }).into_frame(header).unwrap()
}

fn history_frame(messages: Vec<ChatMessage>) -> tripline_proto::Frame {
    let mut header = FrameHeader::new(Opcode::HistoryResponse);
    header.set_trip_id(TRIP);
    Payload::HistoryResponse(HistoryResponse { messages, has_more: false })
        .into_frame(header)
        .unwrap()
}

proptest! {
    /// Any interleaving of echoes, foreign commits, and one optional
    /// history reload leaves exactly one visible copy per message.
    #[test]
    fn reconciliation_converges(
        own_bodies in prop::collection::vec("[a-z]{1,8}", 1..5),
        foreign_bodies in prop::collection::vec("[a-z]{1,8}", 0..5),
        order_seed in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
        reload_point in any::<prop::sample::Index>(),
        do_reload in any::<bool>(),
    ) {
        let mut client = ChatClient::new(TestEnv::new(), ME, "Alice Smith", vec![1]);
        client.handle(ClientEvent::JoinTrip { trip_id: TRIP }).unwrap();

        // Send everything optimistically first.
        for body in &own_bodies {
            client
                .handle(ClientEvent::SendMessage { trip_id: TRIP, body: body.clone() })
                .unwrap();
        }
        let sent: Vec<(u128, String)> = client
            .messages(TRIP)
            .iter()
            .map(|m| (m.correlation_id, m.body.clone()))
            .collect();
        prop_assert_eq!(sent.len(), own_bodies.len());

        // Build the commit queue: every own send plus every foreign
        // message, interleaved by the generated order.
        let mut queue: Vec<Commit> = (0..own_bodies.len()).map(Commit::Own).collect();
        queue.extend(foreign_bodies.iter().cloned().map(Commit::Foreign));
        for (i, index) in order_seed.iter().enumerate() {
            if queue.len() > 1 {
                let len = queue.len();
                let j = index.index(len);
                queue.swap(i % len, j);
            }
        }

        // Deliver commits in order; the server assigns ids by commit order.
        let mut committed: Vec<ChatMessage> = Vec::new();
        let reload_after = reload_point.index(queue.len() + 1);

        for (pos, commit) in queue.iter().enumerate() {
            let id = committed.len() as u64 + 1;
            let (message, correlation_id) = match commit {
                Commit::Own(i) => {
                    let (correlation_id, body) = &sent[*i];
                    let message = ChatMessage {
                        id,
                        trip_id: TRIP,
                        author_id: ME,
                        author_name: "Alice Smith".to_string(),
                        body: body.clone(),
                        created_at_ms: 1_700_000_001_000 + id,
                    };
                    (message, *correlation_id)
                },
                Commit::Foreign(body) => {
                    let message = ChatMessage {
                        id,
                        trip_id: TRIP,
                        author_id: 2,
                        author_name: "Bob Lee".to_string(),
                        body: body.clone(),
                        created_at_ms: 1_700_000_001_000 + id,
                    };
                    (message, 0)
                },
            };
            committed.push(message.clone());

            client
                .handle(ClientEvent::FrameReceived(new_message_frame(&message, correlation_id)))
                .unwrap();

            if do_reload && pos + 1 == reload_after {
                client
                    .handle(ClientEvent::FrameReceived(history_frame(committed.clone())))
                    .unwrap();
            }
        }

        let messages = client.messages(TRIP);

        // Every commit is visible exactly once and nothing else is.
        prop_assert_eq!(messages.len(), own_bodies.len() + foreign_bodies.len());

        let mut seen_ids: Vec<u64> = messages.iter().filter_map(|m| m.id).collect();
        prop_assert_eq!(seen_ids.len(), messages.len(), "everything ends confirmed");
        let unsorted = seen_ids.clone();
        seen_ids.sort_unstable();
        seen_ids.dedup();
        prop_assert_eq!(seen_ids.len(), messages.len(), "no duplicate ids");

        // Confirmed entries appear in commit order.
        prop_assert_eq!(unsorted, seen_ids);

        // Status and body fidelity.
        for m in messages {
            prop_assert_eq!(m.status, MessageStatus::Confirmed);
        }
        for (correlation_id, body) in &sent {
            let copies: Vec<_> = messages
                .iter()
                .filter(|m| m.correlation_id == *correlation_id)
                .collect();
            prop_assert_eq!(copies.len(), 1, "one copy per correlation id");
            prop_assert_eq!(&copies[0].body, body);
        }
    }

    /// Without echoes, sends stay pending in send order after any history
    /// reload, appended after the persisted prefix.
    #[test]
    fn pending_sends_survive_reload(
        own_bodies in prop::collection::vec("[a-z]{1,8}", 1..5),
        persisted in prop::collection::vec("[a-z]{1,8}", 0..5),
    ) {
        let mut client = ChatClient::new(TestEnv::new(), ME, "Alice Smith", vec![1]);
        client.handle(ClientEvent::JoinTrip { trip_id: TRIP }).unwrap();

        for body in &own_bodies {
            client
                .handle(ClientEvent::SendMessage { trip_id: TRIP, body: body.clone() })
                .unwrap();
        }

        let history: Vec<ChatMessage> = persisted
            .iter()
            .enumerate()
            .map(|(i, body)| ChatMessage {
                id: i as u64 + 1,
                trip_id: TRIP,
                author_id: 2,
                author_name: "Bob Lee".to_string(),
                body: body.clone(),
                created_at_ms: 1_700_000_001_000 + i as u64,
            })
            .collect();

        client.handle(ClientEvent::FrameReceived(history_frame(history))).unwrap();

        let messages = client.messages(TRIP);
        prop_assert_eq!(messages.len(), persisted.len() + own_bodies.len());

        // Persisted prefix first, then our pendings in send order.
        for (i, body) in persisted.iter().enumerate() {
            prop_assert_eq!(messages[i].status, MessageStatus::Confirmed);
            prop_assert_eq!(&messages[i].body, body);
        }
        for (i, body) in own_bodies.iter().enumerate() {
            let m = &messages[persisted.len() + i];
            prop_assert_eq!(m.status, MessageStatus::Pending);
            prop_assert_eq!(&m.body, body);
        }
    }
}
