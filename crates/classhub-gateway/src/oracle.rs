//! Collaborators the gateway consumes but does not own: who a connection is,
//! who may act in a room, and where room history is persisted.

use std::sync::Mutex;

use uuid::Uuid;

use classhub_types::models::{ChatMessage, Identity, RoomId, Stroke};

/// Turns a bearer token into an already-authenticated identity.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, token: &str) -> Option<Identity>;
}

/// Answers whether a user is the creator or a listed participant of a room.
/// May block; the router calls it from the blocking pool.
pub trait MembershipOracle: Send + Sync {
    fn is_participant(&self, room_id: &str, user_id: Uuid) -> bool;
}

/// One stateful mutation, written through before it is applied in memory.
///
/// Owned so it can be handed to a blocking task.
#[derive(Debug, Clone)]
pub enum HistoryRecord {
    Chat(ChatMessage),
    Stroke {
        room_id: RoomId,
        page_index: u32,
        stroke: Stroke,
    },
    Clear {
        room_id: RoomId,
        page_index: u32,
    },
}

impl HistoryRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat message",
            Self::Stroke { .. } => "stroke",
            Self::Clear { .. } => "page clear",
        }
    }
}

/// Everything a sink hands back at startup.
///
/// `messages` are in creation order within each room, `pages` lists every page
/// ever drawn on or cleared, and `strokes` are in append order within each page.
#[derive(Debug, Default, Clone)]
pub struct StoredHistory {
    pub messages: Vec<ChatMessage>,
    pub pages: Vec<(RoomId, u32)>,
    pub strokes: Vec<(RoomId, u32, Stroke)>,
}

/// Durable home of chat and whiteboard history.
///
/// Calls may block; the store runs them on the blocking pool.
pub trait HistorySink: Send + Sync {
    fn persist(&self, record: &HistoryRecord) -> anyhow::Result<()>;

    fn load(&self) -> anyhow::Result<StoredHistory>;
}

/// Process-lifetime sink for deployments that do not persist history.
#[derive(Default)]
pub struct MemorySink {
    history: Mutex<StoredHistory>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistorySink for MemorySink {
    fn persist(&self, record: &HistoryRecord) -> anyhow::Result<()> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| anyhow::anyhow!("memory sink lock poisoned: {}", e))?;

        match record {
            HistoryRecord::Chat(message) => history.messages.push(message.clone()),
            HistoryRecord::Stroke {
                room_id,
                page_index,
                stroke,
            } => {
                remember_page(&mut history.pages, room_id, *page_index);
                history
                    .strokes
                    .push((room_id.clone(), *page_index, stroke.clone()));
            }
            HistoryRecord::Clear { room_id, page_index } => {
                remember_page(&mut history.pages, room_id, *page_index);
                history
                    .strokes
                    .retain(|(r, p, _)| !(r == room_id && p == page_index));
            }
        }
        Ok(())
    }

    fn load(&self) -> anyhow::Result<StoredHistory> {
        let history = self
            .history
            .lock()
            .map_err(|e| anyhow::anyhow!("memory sink lock poisoned: {}", e))?;
        Ok(history.clone())
    }
}

fn remember_page(pages: &mut Vec<(RoomId, u32)>, room_id: &str, page_index: u32) {
    if !pages.iter().any(|(r, p)| r == room_id && *p == page_index) {
        pages.push((room_id.to_string(), page_index));
    }
}
