//! Client state machine.
//!
//! The `ChatClient` manages per-trip conversations and the reconciliation
//! of optimistic messages against server-confirmed records.
//!
//! Every sent message is shown immediately as **Pending** under a fresh
//! client-generated correlation id. The server echoes the committed record
//! to every room member including the sender; when the echo (or any error
//! naming the correlation id) arrives, the local entry becomes **Confirmed**
//! or **Failed**. A failed message keeps its body for manual resend; there
//! are no automatic retries.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tripline_core::{TripId, UserId, env::Environment};
use tripline_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::{
        ErrorPayload,
        chat::{ChatMessage, HistoryRequest, MAX_BODY_LEN, SendMessage},
        session::Hello,
    },
};

use crate::{
    error::ClientError,
    event::{ClientAction, ClientEvent},
};

/// How long a send may stay Pending with no echo before it fails.
///
/// A dropped connection does not always produce a transport error, so the
/// timeout is the backstop that keeps messages from pending forever.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages requested per history page.
const HISTORY_PAGE_SIZE: u32 = 200;

/// Per-message delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Created locally, awaiting the server echo.
    Pending,
    /// Matched against a server-committed record.
    Confirmed,
    /// The send errored or timed out before any echo arrived. The body is
    /// preserved for manual resend.
    Failed,
}

/// A message as the conversation view sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    /// Correlation id linking this entry to its server echo. Zero for
    /// messages authored elsewhere.
    pub correlation_id: u128,
    /// Canonical server id, `None` until confirmed.
    pub id: Option<u64>,
    /// Authoring user.
    pub author_id: UserId,
    /// Author display name.
    pub author_name: String,
    /// Message body.
    pub body: String,
    /// Creation timestamp, Unix milliseconds. Local wall clock while
    /// pending, replaced by the server commit time on confirmation.
    pub created_at_ms: u64,
    /// Delivery state.
    pub status: MessageStatus,
}

impl LocalMessage {
    fn confirmed_from(message: &ChatMessage, correlation_id: u128) -> Self {
        Self {
            correlation_id,
            id: Some(message.id),
            author_id: message.author_id,
            author_name: message.author_name.clone(),
            body: message.body.clone(),
            created_at_ms: message.created_at_ms,
            status: MessageStatus::Confirmed,
        }
    }
}

/// One trip's reconciled message list.
///
/// Invariant: confirmed entries form a prefix in server commit order;
/// entries without a server id (pending or failed) sit after it.
#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<LocalMessage>,
}

impl Conversation {
    fn position_by_correlation(&self, correlation_id: u128) -> Option<usize> {
        if correlation_id == 0 {
            return None;
        }
        self.messages.iter().position(|m| m.correlation_id == correlation_id)
    }

    fn position_by_id(&self, id: u64) -> Option<usize> {
        self.messages.iter().position(|m| m.id == Some(id))
    }

    /// Insertion point for a newly confirmed record: after the confirmed
    /// prefix, before any local-only entries.
    fn confirmed_prefix_len(&self) -> usize {
        self.messages
            .iter()
            .position(|m| m.status != MessageStatus::Confirmed)
            .unwrap_or(self.messages.len())
    }

    /// Reconcile a server-committed record into the list.
    ///
    /// An existing entry with the same correlation id or the same server id
    /// is replaced in place, never appended, so exactly one copy stays
    /// visible.
    fn apply_confirmed(&mut self, message: &ChatMessage, correlation_id: u128) {
        match self
            .position_by_correlation(correlation_id)
            .or_else(|| self.position_by_id(message.id))
        {
            Some(pos) => {
                self.messages[pos] = LocalMessage::confirmed_from(message, correlation_id);
            },
            None => {
                let at = self.confirmed_prefix_len();
                self.messages.insert(at, LocalMessage::confirmed_from(message, correlation_id));
            },
        }
    }

    /// Mark the pending entry with this correlation id as failed.
    ///
    /// A no-op when the entry was already confirmed (the echo won the race)
    /// or does not exist. Returns whether anything changed.
    fn mark_failed(&mut self, correlation_id: u128) -> bool {
        match self.position_by_correlation(correlation_id) {
            Some(pos) if self.messages[pos].status == MessageStatus::Pending => {
                self.messages[pos].status = MessageStatus::Failed;
                true
            },
            _ => false,
        }
    }

    /// Replace the confirmed prefix with the server's ordered history.
    ///
    /// Local entries that never got a server id (still pending or failed)
    /// are re-appended after the newest persisted entry; they have no
    /// commit order yet. Previously confirmed entries are dropped in favor
    /// of the server list, which de-duplicates by id; their correlation
    /// ids carry over so a late duplicate echo still matches in place.
    fn merge_history(&mut self, history: Vec<ChatMessage>) {
        let old: Vec<LocalMessage> = self.messages.drain(..).collect();

        let correlation_by_id: HashMap<u64, u128> = old
            .iter()
            .filter_map(|m| m.id.map(|id| (id, m.correlation_id)))
            .collect();
        let locals: Vec<LocalMessage> = old.into_iter().filter(|m| m.id.is_none()).collect();

        self.messages = history
            .iter()
            .map(|m| {
                let correlation_id = correlation_by_id.get(&m.id).copied().unwrap_or(0);
                LocalMessage::confirmed_from(m, correlation_id)
            })
            .collect();
        self.messages.extend(locals);
    }
}

/// Action-based chat client.
pub struct ChatClient<E: Environment> {
    /// Environment for randomness and timing.
    env: E,

    /// Our stable user id.
    user_id: UserId,

    /// Display name used for optimistic local entries; replaced by the
    /// server-resolved name at handshake.
    display_name: String,

    /// Session credential presented on connect.
    token: Vec<u8>,

    /// Whether the handshake has been acknowledged.
    connected: bool,

    /// Trip rooms we have asked to join this session.
    joined: HashSet<TripId>,

    /// Reconciled conversation per trip.
    conversations: HashMap<TripId, Conversation>,

    /// In-flight sends awaiting their echo, with send time for timeouts.
    pending_sends: HashMap<(TripId, u128), E::Instant>,
}

impl<E: Environment> ChatClient<E> {
    /// Create a new client.
    pub fn new(
        env: E,
        user_id: UserId,
        display_name: impl Into<String>,
        token: Vec<u8>,
    ) -> Self {
        Self {
            env,
            user_id,
            display_name: display_name.into(),
            token,
            connected: false,
            joined: HashSet::new(),
            conversations: HashMap::new(),
            pending_sends: HashMap::new(),
        }
    }

    /// Our stable user id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Current display name (server-resolved after the handshake).
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Whether the handshake has been acknowledged.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether we have joined a trip's room this session.
    pub fn is_joined(&self, trip_id: TripId) -> bool {
        self.joined.contains(&trip_id)
    }

    /// The reconciled message list for a trip, in display order.
    pub fn messages(&self, trip_id: TripId) -> &[LocalMessage] {
        self.conversations.get(&trip_id).map_or(&[], |c| c.messages.as_slice())
    }

    /// Process an event and return resulting actions.
    pub fn handle(
        &mut self,
        event: ClientEvent<E::Instant>,
    ) -> Result<Vec<ClientAction>, ClientError> {
        match event {
            ClientEvent::Connected => Ok(self.handle_connected()),
            ClientEvent::FrameReceived(frame) => self.handle_frame(&frame),
            ClientEvent::Tick { now } => Ok(self.handle_tick(now)),
            ClientEvent::JoinTrip { trip_id } => Ok(self.handle_join(trip_id)),
            ClientEvent::LeaveTrip { trip_id } => Ok(self.handle_leave(trip_id)),
            ClientEvent::SendMessage { trip_id, body } => self.handle_send(trip_id, &body),
            ClientEvent::ResendMessage { trip_id, correlation_id } => {
                self.handle_resend(trip_id, correlation_id)
            },
            ClientEvent::RequestHistory { trip_id } => Ok(self.handle_request_history(trip_id)),
            ClientEvent::RegisterParticipant { trip_id } => Ok(self.handle_register(trip_id)),
            ClientEvent::SendFailed { trip_id, correlation_id, reason } => {
                Ok(self.handle_send_failed(trip_id, correlation_id, &reason))
            },
        }
    }

    /// Start the handshake. Reconnects re-authenticate from scratch: room
    /// membership on the server died with the old connection, so the caller
    /// must re-join every room and reload history afterwards.
    fn handle_connected(&mut self) -> Vec<ClientAction> {
        self.connected = false;
        self.joined.clear();

        let hello = Payload::Hello(Hello { token: self.token.clone() });
        match hello.into_frame(FrameHeader::new(Opcode::Hello)) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => vec![ClientAction::Log { message: format!("failed to encode Hello: {e}") }],
        }
    }

    fn handle_join(&mut self, trip_id: TripId) -> Vec<ClientAction> {
        self.joined.insert(trip_id);
        self.conversations.entry(trip_id).or_default();

        let mut header = FrameHeader::new(Opcode::JoinTrip);
        header.set_trip_id(trip_id);
        header.set_sender_id(self.user_id);

        match Payload::JoinTrip.into_frame(header) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => {
                vec![ClientAction::Log { message: format!("failed to encode JoinTrip: {e}") }]
            },
        }
    }

    fn handle_leave(&mut self, trip_id: TripId) -> Vec<ClientAction> {
        self.joined.remove(&trip_id);

        let mut header = FrameHeader::new(Opcode::LeaveTrip);
        header.set_trip_id(trip_id);
        header.set_sender_id(self.user_id);

        match Payload::LeaveTrip.into_frame(header) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => {
                vec![ClientAction::Log { message: format!("failed to encode LeaveTrip: {e}") }]
            },
        }
    }

    /// Optimistic send: the message appears in the conversation before any
    /// server round trip, keyed by a fresh correlation id.
    fn handle_send(
        &mut self,
        trip_id: TripId,
        body: &str,
    ) -> Result<Vec<ClientAction>, ClientError> {
        if !self.joined.contains(&trip_id) {
            return Err(ClientError::NotJoined { trip_id });
        }

        let body = body.trim();
        if body.is_empty() {
            return Err(ClientError::EmptyBody);
        }
        if body.len() > MAX_BODY_LEN {
            return Err(ClientError::BodyTooLong { limit: MAX_BODY_LEN });
        }

        let correlation_id = self.fresh_correlation_id();

        let local = LocalMessage {
            correlation_id,
            id: None,
            author_id: self.user_id,
            author_name: self.display_name.clone(),
            body: body.to_string(),
            created_at_ms: self.env.wall_clock_millis(),
            status: MessageStatus::Pending,
        };
        self.conversations.entry(trip_id).or_default().messages.push(local);
        self.pending_sends.insert((trip_id, correlation_id), self.env.now());

        let mut actions = vec![ClientAction::ConversationUpdated { trip_id }];
        actions.extend(self.send_frame_for(trip_id, correlation_id, body));
        Ok(actions)
    }

    /// Manual resend of a failed message. The original correlation id is
    /// reused, so if the first attempt actually committed, its echo or a
    /// duplicate commit still collapses into this one entry.
    fn handle_resend(
        &mut self,
        trip_id: TripId,
        correlation_id: u128,
    ) -> Result<Vec<ClientAction>, ClientError> {
        if !self.joined.contains(&trip_id) {
            return Err(ClientError::NotJoined { trip_id });
        }

        let conversation = self.conversations.entry(trip_id).or_default();
        let body = match conversation.position_by_correlation(correlation_id) {
            Some(pos) if conversation.messages[pos].status == MessageStatus::Failed => {
                conversation.messages[pos].status = MessageStatus::Pending;
                conversation.messages[pos].body.clone()
            },
            _ => return Err(ClientError::UnknownMessage { correlation_id }),
        };

        self.pending_sends.insert((trip_id, correlation_id), self.env.now());

        let mut actions = vec![ClientAction::ConversationUpdated { trip_id }];
        actions.extend(self.send_frame_for(trip_id, correlation_id, &body));
        Ok(actions)
    }

    fn handle_request_history(&mut self, trip_id: TripId) -> Vec<ClientAction> {
        let mut header = FrameHeader::new(Opcode::HistoryRequest);
        header.set_trip_id(trip_id);
        header.set_sender_id(self.user_id);

        let request =
            Payload::HistoryRequest(HistoryRequest { from_id: 1, limit: HISTORY_PAGE_SIZE });

        match request.into_frame(header) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => {
                vec![ClientAction::Log { message: format!("failed to encode HistoryRequest: {e}") }]
            },
        }
    }

    fn handle_register(&mut self, trip_id: TripId) -> Vec<ClientAction> {
        let mut header = FrameHeader::new(Opcode::RegisterParticipant);
        header.set_trip_id(trip_id);
        header.set_sender_id(self.user_id);

        match Payload::RegisterParticipant.into_frame(header) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => vec![ClientAction::Log {
                message: format!("failed to encode RegisterParticipant: {e}"),
            }],
        }
    }

    fn handle_send_failed(
        &mut self,
        trip_id: TripId,
        correlation_id: u128,
        reason: &str,
    ) -> Vec<ClientAction> {
        self.pending_sends.remove(&(trip_id, correlation_id));

        let changed = self
            .conversations
            .get_mut(&trip_id)
            .is_some_and(|c| c.mark_failed(correlation_id));

        if changed {
            vec![
                ClientAction::Log {
                    message: format!("send {correlation_id:#x} failed: {reason}"),
                },
                ClientAction::ConversationUpdated { trip_id },
            ]
        } else {
            Vec::new()
        }
    }

    /// Sweep pending sends whose echo window elapsed.
    fn handle_tick(&mut self, now: E::Instant) -> Vec<ClientAction> {
        let expired: Vec<(TripId, u128)> = self
            .pending_sends
            .iter()
            .filter(|(_, since)| now - **since >= PENDING_TIMEOUT)
            .map(|(key, _)| *key)
            .collect();

        let mut actions = Vec::new();
        for (trip_id, correlation_id) in expired {
            self.pending_sends.remove(&(trip_id, correlation_id));

            let changed = self
                .conversations
                .get_mut(&trip_id)
                .is_some_and(|c| c.mark_failed(correlation_id));

            if changed {
                actions.push(ClientAction::Log {
                    message: format!("send {correlation_id:#x} timed out with no echo"),
                });
                actions.push(ClientAction::ConversationUpdated { trip_id });
            }
        }
        actions
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(ClientError::InvalidFrame {
                reason: format!("unknown opcode: {:#06x}", frame.header.opcode()),
            });
        };

        match opcode {
            Opcode::HelloAck => self.handle_hello_ack(frame),
            Opcode::NewMessage => self.handle_new_message(frame),
            Opcode::PostAck => self.handle_post_ack(frame),
            Opcode::HistoryResponse => self.handle_history_response(frame),
            Opcode::RegisterAck => match Payload::from_frame(frame) {
                Ok(Payload::RegisterAck(ack)) => Ok(vec![ClientAction::Log {
                    message: format!(
                        "registered for trip {} (created: {})",
                        frame.header.trip_id(),
                        ack.created
                    ),
                }]),
                Ok(_) | Err(_) => Err(ClientError::InvalidFrame {
                    reason: "malformed RegisterAck payload".to_string(),
                }),
            },
            Opcode::Error => Ok(self.handle_error_frame(frame)),
            Opcode::Goodbye => {
                self.connected = false;
                Ok(vec![ClientAction::Log { message: "server said goodbye".to_string() }])
            },
            _ => Ok(vec![ClientAction::Log {
                message: format!("ignoring unexpected {opcode:?} frame from server"),
            }]),
        }
    }

    fn handle_hello_ack(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let ack = match Payload::from_frame(frame) {
            Ok(Payload::HelloAck(ack)) => ack,
            Ok(_) | Err(_) => {
                return Err(ClientError::InvalidFrame {
                    reason: "malformed HelloAck payload".to_string(),
                });
            },
        };

        self.connected = true;
        // Adopt the server-resolved name; our configured one may be stale.
        self.display_name = ack.display_name;

        Ok(vec![ClientAction::Log {
            message: format!("authenticated as user {} ({})", ack.user_id, self.display_name),
        }])
    }

    fn handle_new_message(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let new_message = match Payload::from_frame(frame) {
            Ok(Payload::NewMessage(new_message)) => new_message,
            Ok(_) | Err(_) => {
                return Err(ClientError::InvalidFrame {
                    reason: "malformed NewMessage payload".to_string(),
                });
            },
        };

        let trip_id = frame.header.trip_id();
        let correlation_id = frame.header.correlation_id();

        self.pending_sends.remove(&(trip_id, correlation_id));
        self.conversations
            .entry(trip_id)
            .or_default()
            .apply_confirmed(&new_message.message, correlation_id);

        Ok(vec![ClientAction::ConversationUpdated { trip_id }])
    }

    /// A `PostAck` confirms a fallback-path submit; reconcile it exactly
    /// like an echo.
    fn handle_post_ack(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let ack = match Payload::from_frame(frame) {
            Ok(Payload::PostAck(ack)) => ack,
            Ok(_) | Err(_) => {
                return Err(ClientError::InvalidFrame {
                    reason: "malformed PostAck payload".to_string(),
                });
            },
        };

        let trip_id = frame.header.trip_id();
        let correlation_id = frame.header.correlation_id();

        self.pending_sends.remove(&(trip_id, correlation_id));
        self.conversations
            .entry(trip_id)
            .or_default()
            .apply_confirmed(&ack.message, correlation_id);

        Ok(vec![ClientAction::ConversationUpdated { trip_id }])
    }

    fn handle_history_response(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        let response = match Payload::from_frame(frame) {
            Ok(Payload::HistoryResponse(response)) => response,
            Ok(_) | Err(_) => {
                return Err(ClientError::InvalidFrame {
                    reason: "malformed HistoryResponse payload".to_string(),
                });
            },
        };

        let trip_id = frame.header.trip_id();
        self.conversations.entry(trip_id).or_default().merge_history(response.messages);

        Ok(vec![ClientAction::ConversationUpdated { trip_id }])
    }

    fn handle_error_frame(&mut self, frame: &Frame) -> Vec<ClientAction> {
        let payload = match Payload::from_frame(frame) {
            Ok(Payload::Error(payload)) => payload,
            Ok(_) | Err(_) => {
                return vec![ClientAction::Log {
                    message: "received undecodable error frame".to_string(),
                }];
            },
        };

        let trip_id = frame.header.trip_id();
        let correlation_id = frame.header.correlation_id();

        // An error naming a correlation id dooms that one send.
        if correlation_id != 0 {
            self.pending_sends.remove(&(trip_id, correlation_id));

            let changed = self
                .conversations
                .get_mut(&trip_id)
                .is_some_and(|c| c.mark_failed(correlation_id));

            let mut actions = vec![ClientAction::Log {
                message: format!("send rejected ({}): {}", payload.code, payload.message),
            }];
            if changed {
                actions.push(ClientAction::ConversationUpdated { trip_id });
            }
            return actions;
        }

        // A membership rejection for a room we thought we joined.
        if trip_id != 0
            && matches!(payload.code, ErrorPayload::AUTHORIZATION | ErrorPayload::NOT_FOUND)
        {
            self.joined.remove(&trip_id);
        }

        vec![ClientAction::Log {
            message: format!("server error ({}): {}", payload.code, payload.message),
        }]
    }

    fn send_frame_for(
        &self,
        trip_id: TripId,
        correlation_id: u128,
        body: &str,
    ) -> Vec<ClientAction> {
        let mut header = FrameHeader::new(Opcode::SendMessage);
        header.set_trip_id(trip_id);
        header.set_sender_id(self.user_id);
        header.set_correlation_id(correlation_id);

        let payload = Payload::SendMessage(SendMessage { body: body.to_string() });
        match payload.into_frame(header) {
            Ok(frame) => vec![ClientAction::Send(frame)],
            Err(e) => {
                vec![ClientAction::Log { message: format!("failed to encode SendMessage: {e}") }]
            },
        }
    }

    /// A fresh nonzero correlation id. Zero is reserved for "absent".
    fn fresh_correlation_id(&self) -> u128 {
        loop {
            let id = self.env.random_u128();
            if id != 0 {
                return id;
            }
        }
    }
}
