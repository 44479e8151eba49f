use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS classrooms (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            creator_id  TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS classroom_participants (
            classroom_id    TEXT NOT NULL REFERENCES classrooms(id),
            user_id         TEXT NOT NULL,
            joined_at       TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (classroom_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            room_id     TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            username    TEXT NOT NULL,
            role        TEXT NOT NULL,
            text        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_room
            ON chat_messages(room_id, seq);

        CREATE TABLE IF NOT EXISTS whiteboard_pages (
            room_id     TEXT NOT NULL,
            page_index  INTEGER NOT NULL,
            PRIMARY KEY (room_id, page_index)
        );

        CREATE TABLE IF NOT EXISTS whiteboard_strokes (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id     TEXT NOT NULL,
            page_index  INTEGER NOT NULL,
            stroke      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_whiteboard_strokes_page
            ON whiteboard_strokes(room_id, page_index, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
