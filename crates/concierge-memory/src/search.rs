use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::instrument;

/// Default lookback window for summary search.
pub const DEFAULT_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone, Serialize)]
pub struct SummaryHit {
    pub session_id: String,
    pub summary: String,
    pub ended_at: Option<String>,
}

/// Searches archived session summaries: only closed sessions that carry a
/// summary, scoped to one user at one clinic, newest first.
pub struct SummarySearch {
    db: Mutex<Connection>,
}

impl SummarySearch {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip_all, fields(limit))]
    pub fn search(
        &self,
        phone: &str,
        clinic_id: &str,
        query: Option<&str>,
        window_days: Option<i64>,
        limit: usize,
    ) -> rusqlite::Result<Vec<SummaryHit>> {
        let cutoff = (Utc::now() - Duration::days(window_days.unwrap_or(DEFAULT_WINDOW_DAYS)))
            .to_rfc3339();
        let like = query.map(|q| format!("%{}%", q.trim()));

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, summary, ended_at FROM sessions
             WHERE user_identifier = ?1 AND clinic_id = ?2
               AND status = 'ended' AND summary IS NOT NULL
               AND ended_at >= ?3
               AND (?4 IS NULL OR summary LIKE ?4)
             ORDER BY ended_at DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![phone, clinic_id, cutoff, like, limit as i64],
            |row| {
                Ok(SummaryHit {
                    session_id: row.get(0)?,
                    summary: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    ended_at: row.get(2)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryHit {
    pub message_id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub hits: Vec<HistoryHit>,
    pub total_count: u64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// Paginated full-text search over all messages in a user's sessions.
///
/// SQLite LIKE stands in for the reference's server-side full-text index;
/// the pagination contract (total + has_more) is what callers depend on.
pub struct HistorySearch {
    db: Mutex<Connection>,
}

impl HistorySearch {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip_all, fields(page, page_size))]
    pub fn search(
        &self,
        phone: &str,
        clinic_id: &str,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> rusqlite::Result<HistoryPage> {
        let like = format!("%{}%", query.trim());
        let db = self.db.lock().unwrap();

        let total_count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.phone = ?1 AND s.clinic_id = ?2 AND m.content LIKE ?3",
            rusqlite::params![phone, clinic_id, like],
            |row| row.get(0),
        )?;

        let offset = page.saturating_mul(page_size);
        let mut stmt = db.prepare(
            "SELECT m.id, m.session_id, m.role, m.content, m.created_at
             FROM messages m
             JOIN sessions s ON s.id = m.session_id
             WHERE m.phone = ?1 AND s.clinic_id = ?2 AND m.content LIKE ?3
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![phone, clinic_id, like, page_size as i64, offset as i64],
            |row| {
                Ok(HistoryHit {
                    message_id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        let hits: Vec<HistoryHit> = rows.filter_map(|r| r.ok()).collect();
        let has_more = (offset + hits.len()) < total_count as usize;

        Ok(HistoryPage {
            hits,
            total_count: total_count as u64,
            page,
            page_size,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        concierge_store::db::init_db(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO sessions (id, user_identifier, clinic_id, channel, status, summary,
                                   created_at, updated_at, ended_at)
             VALUES ('s1', '1555', 'c1', 'whatsapp', 'ended', 'Asked about implants',
                     '2026-07-01T10:00:00+00:00', '2026-07-01T10:00:00+00:00',
                     '2026-07-01T11:00:00+00:00');
             INSERT INTO sessions (id, user_identifier, clinic_id, channel, status,
                                   created_at, updated_at)
             VALUES ('s2', '1555', 'c1', 'whatsapp', 'active',
                     '2026-07-20T10:00:00+00:00', '2026-07-20T10:00:00+00:00');
             INSERT INTO messages (session_id, role, content, phone, created_at)
             VALUES ('s2', 'user', 'how much is a cleaning?', '1555', '2026-07-20T10:00:01+00:00');
             INSERT INTO messages (session_id, role, content, phone, created_at)
             VALUES ('s2', 'assistant', 'A cleaning is $80.', '1555', '2026-07-20T10:00:05+00:00');
             INSERT INTO messages (session_id, role, content, phone, created_at)
             VALUES ('s2', 'user', 'book the cleaning please', '1555', '2026-07-20T10:01:00+00:00');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn summary_search_only_sees_closed_summarized_sessions() {
        let search = SummarySearch::new(seeded());
        let hits = search.search("1555", "c1", None, Some(3650), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "s1");

        let filtered = search
            .search("1555", "c1", Some("implants"), Some(3650), 10)
            .unwrap();
        assert_eq!(filtered.len(), 1);

        let miss = search
            .search("1555", "c1", Some("whitening"), Some(3650), 10)
            .unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn history_search_paginates_with_total_and_has_more() {
        let search = HistorySearch::new(seeded());
        let first = search.search("1555", "c1", "cleaning", 0, 2).unwrap();
        assert_eq!(first.total_count, 3);
        assert_eq!(first.hits.len(), 2);
        assert!(first.has_more);

        let second = search.search("1555", "c1", "cleaning", 1, 2).unwrap();
        assert_eq!(second.hits.len(), 1);
        assert!(!second.has_more);
    }
}
