//! The SQLite database as membership oracle and history sink.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use classhub_db::Database;
use classhub_db::models::ChatMessageRow;
use classhub_types::models::{ChatMessage, Role};

use crate::oracle::{HistoryRecord, HistorySink, MembershipOracle, StoredHistory};

impl MembershipOracle for Database {
    fn is_participant(&self, room_id: &str, user_id: Uuid) -> bool {
        match Database::is_participant(self, room_id, &user_id.to_string()) {
            Ok(allowed) => allowed,
            Err(e) => {
                // Fail closed
                warn!("Membership lookup failed for {} in {}: {}", user_id, room_id, e);
                false
            }
        }
    }
}

impl HistorySink for Database {
    fn persist(&self, record: &HistoryRecord) -> Result<()> {
        match record {
            HistoryRecord::Chat(message) => self.insert_chat_message(&to_row(message)),
            HistoryRecord::Stroke {
                room_id,
                page_index,
                stroke,
            } => self.insert_stroke(room_id, *page_index, &serde_json::to_string(stroke)?),
            HistoryRecord::Clear { room_id, page_index } => self.clear_page(room_id, *page_index),
        }
    }

    fn load(&self) -> Result<StoredHistory> {
        let mut history = StoredHistory::default();

        for row in self.load_chat_messages()? {
            match from_row(&row) {
                Ok(message) => history.messages.push(message),
                Err(e) => warn!("Skipping unreadable chat message {}: {:#}", row.id, e),
            }
        }

        history.pages = self
            .load_pages()?
            .into_iter()
            .map(|page| (page.room_id, page.page_index))
            .collect();

        for row in self.load_strokes()? {
            match serde_json::from_str(&row.stroke) {
                Ok(stroke) => history.strokes.push((row.room_id, row.page_index, stroke)),
                Err(e) => warn!(
                    "Skipping unreadable stroke in room {} page {}: {}",
                    row.room_id, row.page_index, e
                ),
            }
        }

        Ok(history)
    }
}

fn to_row(message: &ChatMessage) -> ChatMessageRow {
    ChatMessageRow {
        id: message.id.to_string(),
        room_id: message.room_id.clone(),
        user_id: message.user_id.to_string(),
        username: message.username.clone(),
        role: message.role.as_str().to_string(),
        text: message.text.clone(),
        created_at: message.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    }
}

fn from_row(row: &ChatMessageRow) -> Result<ChatMessage> {
    let role = match row.role.as_str() {
        "admin" => Role::Admin,
        "user" => Role::User,
        other => anyhow::bail!("unknown role {:?}", other),
    };

    Ok(ChatMessage {
        id: row.id.parse().context("message id")?,
        room_id: row.room_id.clone(),
        user_id: row.user_id.parse().context("user id")?,
        username: row.username.clone(),
        role,
        text: row.text.clone(),
        timestamp: DateTime::parse_from_rfc3339(&row.created_at)
            .context("created_at")?
            .with_timezone(&Utc),
    })
}
