//! Conversation room management
//!
//! Maps each conversation to the connections this process holds for it and
//! ties the conversation's bus subscription to room occupancy.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use deskrelay_shared::{ConversationId, SessionId};
use tokio::sync::{mpsc, RwLock};

use super::connection::Connection;
use crate::bus::{BroadcastBus, BusMessage, EnvelopeSink, Subscription};
use crate::envelope::BroadcastEnvelope;

/// Connections sharing a conversation, plus the channel subscription feeding them
struct Room {
    members: HashMap<SessionId, Arc<Connection>>,
    subscription: Subscription,
}

/// Owns every room of this process
///
/// Room and membership changes, including the bus subscribe/unsubscribe they
/// trigger, happen under a single write lock.
pub struct RoomRegistry {
    instance_id: String,
    bus: Arc<dyn BroadcastBus>,
    rooms: RwLock<HashMap<ConversationId, Room>>,
    /// Handed to every subscription; drained by the dispatcher task
    sink: EnvelopeSink,
}

impl RoomRegistry {
    /// Create the registry and start its bus dispatcher
    pub fn new(instance_id: impl Into<String>, bus: Arc<dyn BroadcastBus>) -> Arc<Self> {
        let (sink, inbox) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            instance_id: instance_id.into(),
            bus,
            rooms: RwLock::new(HashMap::new()),
            sink,
        });

        tokio::spawn(dispatch(Arc::downgrade(&registry), inbox));
        registry
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Add a connection to its conversation's room, returning the room size
    pub async fn join(&self, conn: Arc<Connection>) -> usize {
        let conversation_id = conn.conversation_id.clone();
        let mut rooms = self.rooms.write().await;

        let room = rooms.entry(conversation_id.clone()).or_insert_with(|| {
            tracing::debug!(
                conversation_id = %conversation_id,
                transport = self.bus.transport(),
                "Subscribing room to bus"
            );
            Room {
                members: HashMap::new(),
                subscription: self.bus.subscribe(&conversation_id, self.sink.clone()),
            }
        });
        room.members.insert(conn.session_id, Arc::clone(&conn));

        let room_size = room.members.len();
        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = %conn.session_id,
            room_size,
            "Connection joined room"
        );
        room_size
    }

    /// Remove a connection from its room
    ///
    /// Returns `false` when the connection was not a member, so a second leave
    /// for the same connection does nothing.
    pub async fn leave(&self, conn: &Connection) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&conn.conversation_id) else {
            return false;
        };
        if room.members.remove(&conn.session_id).is_none() {
            return false;
        }

        if room.members.is_empty() {
            if let Some(room) = rooms.remove(&conn.conversation_id) {
                room.subscription.unsubscribe();
            }
            tracing::debug!(
                conversation_id = %conn.conversation_id,
                "Removed empty room"
            );
        } else {
            tracing::debug!(
                conversation_id = %conn.conversation_id,
                session_id = %conn.session_id,
                room_size = room.members.len(),
                "Connection left room"
            );
        }
        true
    }

    /// Deliver an envelope to every local member of its room except `exclude`
    ///
    /// Returns the number of connections the frame was queued for. Failed
    /// writes are logged and never stop delivery to the others.
    pub async fn broadcast_local(
        &self,
        envelope: &BroadcastEnvelope,
        exclude: Option<SessionId>,
    ) -> usize {
        let text = match envelope.wire_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, kind = envelope.kind(), "Failed to serialize envelope");
                return 0;
            }
        };

        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(envelope.conversation_id()) else {
            tracing::trace!(
                conversation_id = %envelope.conversation_id(),
                "No local members for conversation"
            );
            return 0;
        };

        let mut delivered = 0;
        let mut failed = 0;
        for conn in room.members.values() {
            if Some(conn.session_id) == exclude {
                continue;
            }
            match conn.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        session_id = %conn.session_id,
                        "Failed to send event to connection (likely closed)"
                    );
                }
            }
        }

        tracing::debug!(
            conversation_id = %envelope.conversation_id(),
            kind = envelope.kind(),
            recipients = delivered,
            failed,
            "Broadcast event to room"
        );
        delivered
    }

    /// Number of local members in a conversation's room
    pub async fn room_size(&self, conversation_id: &ConversationId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(conversation_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// Member count per conversation, ordered by conversation id
    pub async fn room_sizes(&self) -> BTreeMap<String, usize> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .map(|(id, room)| (id.to_string(), room.members.len()))
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().map(|r| r.members.len()).sum()
    }

    /// Snapshot of every local connection
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .flat_map(|r| r.members.values().cloned())
            .collect()
    }

    /// Ask every connection to close; each one leaves as its socket task ends
    pub async fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let connections = self.connections().await;
        for conn in &connections {
            conn.close(code, reason);
        }
        connections.len()
    }
}

/// Deliver bus traffic to local rooms
///
/// Envelopes this instance published were already delivered locally before
/// publishing, so they are dropped here.
async fn dispatch(registry: Weak<RoomRegistry>, mut inbox: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(message) = inbox.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if message.origin == registry.instance_id {
            tracing::trace!(message_id = %message.id, "Skipping self-published envelope");
            continue;
        }
        registry
            .broadcast_local(&message.envelope, message.exclude)
            .await;
    }
}
