use rusqlite::Connection;

use crate::error::Result;

/// Initialise the conversation schema.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// Messages and constraints cascade on session deletion.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS sessions (
            id                     TEXT PRIMARY KEY,
            user_identifier        TEXT NOT NULL,
            clinic_id              TEXT NOT NULL,
            channel                TEXT NOT NULL,
            flow_state             TEXT NOT NULL DEFAULT 'idle',
            turn_status            TEXT NOT NULL DEFAULT 'user_turn',
            pending_action         TEXT,
            pending_since          TEXT,
            control_mode           TEXT NOT NULL DEFAULT 'agent',
            unread_for_human_count INTEGER NOT NULL DEFAULT 0,
            session_language       TEXT,
            scheduled_followup_at  TEXT,
            status                 TEXT NOT NULL DEFAULT 'active',
            summary                TEXT,
            created_at             TEXT NOT NULL,
            updated_at             TEXT NOT NULL,
            ended_at               TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open
            ON sessions(user_identifier, clinic_id, channel)
            WHERE status = 'active';
        CREATE INDEX IF NOT EXISTS idx_sessions_followup
            ON sessions(scheduled_followup_at)
            WHERE scheduled_followup_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS messages (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            phone      TEXT NOT NULL,
            metadata   TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_phone
            ON messages(phone, created_at DESC);

        CREATE TABLE IF NOT EXISTS patients (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            clinic_id           TEXT NOT NULL,
            phone               TEXT NOT NULL,
            profile_name        TEXT,
            first_name          TEXT,
            last_name           TEXT,
            language_preference TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            UNIQUE(clinic_id, phone)
        );

        CREATE TABLE IF NOT EXISTS session_constraints (
            session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
            data       TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
