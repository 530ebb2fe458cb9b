use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use concierge_constraints::ConversationConstraints;
use concierge_core::config::SESSION_CACHE_TTL_SECS;

use crate::cache::{slot_key, InflightLocks, SessionCache};
use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::state::{ControlMode, FlowState, TurnStatus};
use crate::types::{Role, Session, SessionHandle, SessionPatch, StoredMessage};

/// The store seam the pipeline talks to.
///
/// Contract notes:
/// - `get_or_create_session` is race-safe on a single connection (INSERT OR
///   IGNORE + read-back); serializing turns within one conversation is the
///   webhook layer's responsibility.
/// - `store_message` is used fire-and-forget by callers: they spawn it with
///   a soft timeout so the request pipeline never blocks on logging. The
///   returned message id may therefore go unobserved.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create_session(
        &self,
        phone: &str,
        clinic_id: &str,
        channel: &str,
    ) -> Result<SessionHandle>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn store_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        phone: &str,
        metadata: serde_json::Value,
    ) -> Result<i64>;

    async fn get_conversation_history(
        &self,
        phone: &str,
        clinic_id: &str,
        limit: usize,
        include_all_sessions: bool,
    ) -> Result<Vec<StoredMessage>>;

    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<()>;

    /// Atomically bump `unread_for_human_count`, returning the new value.
    async fn increment_unread(&self, session_id: &str) -> Result<u32>;

    async fn get_constraints(&self, session_id: &str) -> Result<ConversationConstraints>;

    async fn save_constraints(
        &self,
        session_id: &str,
        constraints: &ConversationConstraints,
    ) -> Result<()>;

    /// Meta-reset: drop every constraint in a single transaction.
    async fn clear_constraints(&self, session_id: &str) -> Result<()>;

    async fn upsert_patient(
        &self,
        clinic_id: &str,
        phone: &str,
        profile_name: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        language: Option<&str>,
    ) -> Result<()>;

    /// Sessions whose scheduled follow-up is due: `scheduled_followup_at <=
    /// now`, turn status still `agent_action_pending`, not ended.
    async fn due_followups(&self, now: &str) -> Result<Vec<Session>>;
}

/// SQLite-backed store.
///
/// Wraps a single connection in a `Mutex` — sufficient for the single-node
/// target; swap in a pool behind the same trait for larger deployments.
pub struct SqliteStore {
    db: Mutex<Connection>,
    cache: SessionCache,
    inflight: InflightLocks,
}

impl SqliteStore {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cache: SessionCache::new(Duration::from_secs(SESSION_CACHE_TTL_SECS)),
            inflight: InflightLocks::new(),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            rusqlite::params![session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    fn load_open_session(&self, phone: &str, clinic_id: &str, channel: &str) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_identifier = ?1 AND clinic_id = ?2 AND channel = ?3
                   AND status = 'active'"
            ),
            rusqlite::params![phone, clinic_id, channel],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    fn previous_summary(&self, phone: &str, clinic_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT summary FROM sessions
             WHERE user_identifier = ?1 AND clinic_id = ?2
               AND status = 'ended' AND summary IS NOT NULL
             ORDER BY ended_at DESC LIMIT 1",
            rusqlite::params![phone, clinic_id],
            |row| row.get::<_, Option<String>>(0),
        ) {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    #[instrument(skip_all)]
    async fn get_or_create_session(
        &self,
        phone: &str,
        clinic_id: &str,
        channel: &str,
    ) -> Result<SessionHandle> {
        let key = slot_key(phone, clinic_id, channel);

        // Fast path: cached open session.
        if let Some(session_id) = self.cache.get(&key) {
            if let Some(session) = self.load_session(&session_id)? {
                if session.is_open() {
                    debug!("session cache hit");
                    return Ok(SessionHandle {
                        session,
                        is_new: false,
                        previous_session_summary: None,
                    });
                }
            }
            self.cache.invalidate(&key);
        }

        // One upsert per slot at a time; latecomers reuse the winner's row.
        let lock = self.inflight.lock_for(&key);
        let _guard = lock.lock().await;

        let result = (|| -> Result<SessionHandle> {
            if let Some(session) = self.load_open_session(phone, clinic_id, channel)? {
                self.cache.put(&key, &session.id);
                return Ok(SessionHandle {
                    session,
                    is_new: false,
                    previous_session_summary: None,
                });
            }

            let previous_session_summary = self.previous_summary(phone, clinic_id)?;

            let id = Uuid::now_v7().to_string();
            let now = Utc::now().to_rfc3339();
            {
                let db = self.db.lock().unwrap();
                // The partial unique index on active slots makes this
                // race-safe: a concurrent insert leaves exactly one row.
                db.execute(
                    "INSERT OR IGNORE INTO sessions
                     (id, user_identifier, clinic_id, channel, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    rusqlite::params![id, phone, clinic_id, channel, now],
                )?;
            }

            // Read back — handles the race where two tasks insert simultaneously.
            let session = self
                .load_open_session(phone, clinic_id, channel)?
                .ok_or_else(|| StoreError::NotFound { id: key.clone() })?;
            let is_new = session.id == id;

            self.cache.put(&key, &session.id);
            info!(session = %&session.id[..8], is_new, "session resolved");

            Ok(SessionHandle {
                session,
                is_new,
                previous_session_summary,
            })
        })();

        drop(_guard);
        self.inflight.release(&key);
        result
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.load_session(session_id)
    }

    async fn store_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        phone: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (session_id, role, content, phone, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session_id,
                role.as_str(),
                content,
                phone,
                metadata.to_string(),
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    async fn get_conversation_history(
        &self,
        phone: &str,
        clinic_id: &str,
        limit: usize,
        include_all_sessions: bool,
    ) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let sql = if include_all_sessions {
            "SELECT m.id, m.session_id, m.role, m.content, m.phone, m.metadata, m.created_at
             FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.phone = ?1 AND s.clinic_id = ?2
             ORDER BY m.created_at DESC, m.id DESC LIMIT ?3"
        } else {
            "SELECT m.id, m.session_id, m.role, m.content, m.phone, m.metadata, m.created_at
             FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.phone = ?1 AND s.clinic_id = ?2 AND s.status = 'active'
             ORDER BY m.created_at DESC, m.id DESC LIMIT ?3"
        };
        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map(
            rusqlite::params![phone, clinic_id, limit as i64],
            row_to_message,
        )?;
        let mut messages: Vec<StoredMessage> = rows.filter_map(|r| r.ok()).collect();
        // Stored newest-first for the LIMIT; callers want chronological order.
        messages.reverse();
        Ok(messages)
    }

    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();

        // Assemble the SET clause from the populated fields only.
        let mut sets: Vec<String> = vec!["updated_at = ?1".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

        fn push(
            column: &str,
            value: Box<dyn rusqlite::ToSql>,
            params: &mut Vec<Box<dyn rusqlite::ToSql>>,
            sets: &mut Vec<String>,
        ) {
            params.push(value);
            sets.push(format!("{column} = ?{}", params.len()));
        }

        if let Some(v) = patch.flow_state {
            push("flow_state", Box::new(v.as_str().to_string()), &mut params, &mut sets);
        }
        if let Some(v) = patch.turn_status {
            push("turn_status", Box::new(v.as_str().to_string()), &mut params, &mut sets);
        }
        if let Some(v) = patch.pending_action {
            push("pending_action", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.pending_since {
            push("pending_since", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.control_mode {
            push("control_mode", Box::new(v.as_str().to_string()), &mut params, &mut sets);
        }
        if let Some(v) = patch.session_language {
            push("session_language", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.scheduled_followup_at {
            push("scheduled_followup_at", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.status {
            push("status", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.summary {
            push("summary", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.ended_at {
            push("ended_at", Box::new(v), &mut params, &mut sets);
        }

        params.push(Box::new(session_id.to_string()));
        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len()
        );
        let changed = db.execute(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    async fn increment_unread(&self, session_id: &str) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions
             SET unread_for_human_count = unread_for_human_count + 1,
                 updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                id: session_id.to_string(),
            });
        }
        let count = db.query_row(
            "SELECT unread_for_human_count FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as u32)
    }

    async fn get_constraints(&self, session_id: &str) -> Result<ConversationConstraints> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT data FROM session_constraints WHERE session_id = ?1",
            rusqlite::params![session_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(ConversationConstraints::default()),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn save_constraints(
        &self,
        session_id: &str,
        constraints: &ConversationConstraints,
    ) -> Result<()> {
        debug_assert!(constraints.invariant_holds());
        let data = serde_json::to_string(constraints)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO session_constraints (session_id, data, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET data = ?2, updated_at = ?3",
            rusqlite::params![session_id, data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn clear_constraints(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_constraints WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        Ok(())
    }

    async fn upsert_patient(
        &self,
        clinic_id: &str,
        phone: &str,
        profile_name: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        language: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO patients
             (clinic_id, phone, profile_name, first_name, last_name, language_preference,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(clinic_id, phone) DO UPDATE SET
                profile_name        = COALESCE(excluded.profile_name, profile_name),
                first_name          = COALESCE(excluded.first_name, first_name),
                last_name           = COALESCE(excluded.last_name, last_name),
                language_preference = COALESCE(excluded.language_preference, language_preference),
                updated_at          = excluded.updated_at",
            rusqlite::params![
                clinic_id,
                phone,
                profile_name,
                first_name,
                last_name,
                language,
                now
            ],
        )?;
        Ok(())
    }

    async fn due_followups(&self, now: &str) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE scheduled_followup_at IS NOT NULL
               AND scheduled_followup_at <= ?1
               AND turn_status = 'agent_action_pending'
               AND ended_at IS NULL"
        ))?;
        let rows = stmt.query_map(rusqlite::params![now], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

const SESSION_COLUMNS: &str = "id, user_identifier, clinic_id, channel, flow_state, turn_status,
    pending_action, pending_since, control_mode, unread_for_human_count,
    session_language, scheduled_followup_at, status, summary,
    created_at, updated_at, ended_at";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_identifier: row.get(1)?,
        clinic_id: row.get(2)?,
        channel: row.get(3)?,
        flow_state: FlowState::parse(&row.get::<_, String>(4)?),
        turn_status: TurnStatus::parse(&row.get::<_, String>(5)?),
        pending_action: row.get(6)?,
        pending_since: row.get(7)?,
        control_mode: ControlMode::parse(&row.get::<_, String>(8)?),
        unread_for_human_count: row.get::<_, i64>(9)? as u32,
        session_language: row.get(10)?,
        scheduled_followup_at: row.get(11)?,
        status: row.get(12)?,
        summary: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        ended_at: row.get(16)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let metadata: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        phone: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|e| {
            warn!("bad message metadata JSON: {e}");
            serde_json::json!({})
        }),
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().expect("open store")
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_slot() {
        let store = store();
        let a = store
            .get_or_create_session("15551234567", "clinic-1", "whatsapp")
            .await
            .unwrap();
        assert!(a.is_new);

        let b = store
            .get_or_create_session("15551234567", "clinic-1", "whatsapp")
            .await
            .unwrap();
        assert!(!b.is_new);
        assert_eq!(a.session.id, b.session.id);
    }

    #[tokio::test]
    async fn different_channels_get_different_sessions() {
        let store = store();
        let a = store
            .get_or_create_session("15551234567", "clinic-1", "whatsapp")
            .await
            .unwrap();
        let b = store
            .get_or_create_session("15551234567", "clinic-1", "web")
            .await
            .unwrap();
        assert_ne!(a.session.id, b.session.id);
    }

    #[tokio::test]
    async fn ended_session_gives_way_to_a_new_one_with_summary() {
        let store = store();
        let first = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();

        store
            .update_session(
                &first.session.id,
                SessionPatch {
                    status: Some("ended".to_string()),
                    ended_at: Some(Some(Utc::now().to_rfc3339())),
                    summary: Some("Asked about cleaning prices.".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // The cached entry points at the ended session; the next lookup
        // must notice and create a fresh one.
        let second = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();
        assert!(second.is_new);
        assert_ne!(second.session.id, first.session.id);
        assert_eq!(
            second.previous_session_summary.as_deref(),
            Some("Asked about cleaning prices.")
        );
    }

    #[tokio::test]
    async fn history_is_chronological_and_scoped() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();
        let sid = &handle.session.id;

        store
            .store_message(sid, Role::User, "hi", "1555", json!({}))
            .await
            .unwrap();
        store
            .store_message(sid, Role::Assistant, "hello!", "1555", json!({"fast_path": true}))
            .await
            .unwrap();

        let history = store
            .get_conversation_history("1555", "clinic-1", 10, false)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].metadata["fast_path"], json!(true));

        let other = store
            .get_conversation_history("1555", "clinic-2", 10, false)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn unread_increment_is_exact() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();

        assert_eq!(store.increment_unread(&handle.session.id).await.unwrap(), 1);
        assert_eq!(store.increment_unread(&handle.session.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn constraints_roundtrip_and_clear() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();
        let sid = &handle.session.id;

        let mut constraints = ConversationConstraints::default();
        constraints.set_desired_service("cleaning");
        constraints.exclude("whitening");
        store.save_constraints(sid, &constraints).await.unwrap();

        let loaded = store.get_constraints(sid).await.unwrap();
        assert_eq!(loaded, constraints);
        assert!(loaded.invariant_holds());

        store.clear_constraints(sid).await.unwrap();
        assert!(store.get_constraints(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn patch_updates_only_named_fields() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();

        store
            .update_session(
                &handle.session.id,
                SessionPatch::default()
                    .turn_status(TurnStatus::AgentActionPending)
                    .flow_state(FlowState::CollectingSlots),
            )
            .await
            .unwrap();

        let session = store
            .get_session(&handle.session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.turn_status, TurnStatus::AgentActionPending);
        assert_eq!(session.flow_state, FlowState::CollectingSlots);
        assert_eq!(session.control_mode, ControlMode::Agent);
    }

    #[tokio::test]
    async fn due_followups_filters_on_status_and_time() {
        let store = store();
        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();

        store
            .update_session(
                &handle.session.id,
                SessionPatch {
                    turn_status: Some(TurnStatus::AgentActionPending),
                    scheduled_followup_at: Some(Some("2020-01-01T00:00:00+00:00".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let due = store
            .due_followups(&Utc::now().to_rfc3339())
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        // A user_turn session is never due, even with a past schedule.
        store
            .update_session(
                &handle.session.id,
                SessionPatch::default().turn_status(TurnStatus::UserTurn),
            )
            .await
            .unwrap();
        assert!(store
            .due_followups(&Utc::now().to_rfc3339())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn open_creates_the_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("concierge.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();

        let handle = store
            .get_or_create_session("1555", "clinic-1", "whatsapp")
            .await
            .unwrap();
        assert!(handle.is_new);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn patient_upsert_merges_fields() {
        let store = store();
        store
            .upsert_patient("clinic-1", "1555", Some("WhatsApp User"), None, None, None)
            .await
            .unwrap();
        store
            .upsert_patient("clinic-1", "1555", None, Some("Anna"), Some("Ivanova"), Some("ru"))
            .await
            .unwrap();

        let db = store.db.lock().unwrap();
        let (profile, first, lang): (Option<String>, Option<String>, Option<String>) = db
            .query_row(
                "SELECT profile_name, first_name, language_preference
                 FROM patients WHERE clinic_id = 'clinic-1' AND phone = '1555'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(profile.as_deref(), Some("WhatsApp User"));
        assert_eq!(first.as_deref(), Some("Anna"));
        assert_eq!(lang.as_deref(), Some("ru"));
    }
}
