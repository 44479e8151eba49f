use crate::models::{ChatMessageRow, PageRow, StrokeRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Classrooms --

    pub fn create_classroom(&self, id: &str, name: &str, creator_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO classrooms (id, name, creator_id) VALUES (?1, ?2, ?3)",
                (id, name, creator_id),
            )?;
            Ok(())
        })
    }

    pub fn add_participant(&self, classroom_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO classroom_participants (classroom_id, user_id) VALUES (?1, ?2)",
                (classroom_id, user_id),
            )?;
            Ok(())
        })
    }

    /// True if the user created the classroom or is listed as a participant.
    pub fn is_participant(&self, classroom_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| query_is_participant(conn, classroom_id, user_id))
    }

    // -- Chat --

    pub fn insert_chat_message(&self, row: &ChatMessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, room_id, user_id, username, role, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id,
                    row.room_id,
                    row.user_id,
                    row.username,
                    row.role,
                    row.text,
                    row.created_at
                ],
            )?;
            Ok(())
        })
    }

    /// Every stored chat message, grouped by room, in insertion order.
    pub fn load_chat_messages(&self) -> Result<Vec<ChatMessageRow>> {
        self.with_conn(query_chat_messages)
    }

    // -- Whiteboard --

    pub fn insert_stroke(&self, room_id: &str, page_index: u32, stroke: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO whiteboard_pages (room_id, page_index) VALUES (?1, ?2)",
                rusqlite::params![room_id, page_index],
            )?;
            tx.execute(
                "INSERT INTO whiteboard_strokes (room_id, page_index, stroke) VALUES (?1, ?2, ?3)",
                rusqlite::params![room_id, page_index, stroke],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Drops every stroke on the page but keeps the page itself known.
    pub fn clear_page(&self, room_id: &str, page_index: u32) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO whiteboard_pages (room_id, page_index) VALUES (?1, ?2)",
                rusqlite::params![room_id, page_index],
            )?;
            tx.execute(
                "DELETE FROM whiteboard_strokes WHERE room_id = ?1 AND page_index = ?2",
                rusqlite::params![room_id, page_index],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load_pages(&self) -> Result<Vec<PageRow>> {
        self.with_conn(query_pages)
    }

    /// Every stored stroke in append order within its page.
    pub fn load_strokes(&self) -> Result<Vec<StrokeRow>> {
        self.with_conn(query_strokes)
    }
}

fn query_is_participant(conn: &Connection, classroom_id: &str, user_id: &str) -> Result<bool> {
    let found: i64 = conn.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM classrooms WHERE id = ?1 AND creator_id = ?2
             UNION ALL
             SELECT 1 FROM classroom_participants WHERE classroom_id = ?1 AND user_id = ?2
         )",
        (classroom_id, user_id),
        |row| row.get(0),
    )?;

    Ok(found != 0)
}

fn query_chat_messages(conn: &Connection) -> Result<Vec<ChatMessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, user_id, username, role, text, created_at
         FROM chat_messages
         ORDER BY room_id, seq",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(ChatMessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                user_id: row.get(2)?,
                username: row.get(3)?,
                role: row.get(4)?,
                text: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_pages(conn: &Connection) -> Result<Vec<PageRow>> {
    let mut stmt = conn.prepare(
        "SELECT room_id, page_index FROM whiteboard_pages ORDER BY room_id, page_index",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(PageRow {
                room_id: row.get(0)?,
                page_index: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_strokes(conn: &Connection) -> Result<Vec<StrokeRow>> {
    let mut stmt = conn.prepare(
        "SELECT room_id, page_index, stroke
         FROM whiteboard_strokes
         ORDER BY room_id, page_index, seq",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(StrokeRow {
                room_id: row.get(0)?,
                page_index: row.get(1)?,
                stroke: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
