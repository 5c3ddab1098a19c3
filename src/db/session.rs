//! Session store: sessions and their append-only exchanges
//!
//! Every mutating operation runs inside a single immediate transaction, so a
//! saved exchange and its session's activity bump land together and writers
//! sharing the database file are serialized.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Local, NaiveDate, NaiveTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use rusqlite::{ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use super::{DbConn, DbPool};
use crate::{Error, Result};

/// Opaque JSON metadata attached to sessions and exchanges
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Process-wide suffix so ids minted within the same second stay unique
static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Attempts at minting a fresh id before giving up
const MAX_ID_ATTEMPTS: u32 = 16;

/// A conversation session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: Option<Metadata>,
}

/// One persisted user/assistant pair
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub id: i64,
    pub session_id: String,
    pub user_text: String,
    pub bot_text: String,
    pub created_at: DateTime<Utc>,
    pub audio_path: Option<String>,
    pub metadata: Option<Metadata>,
}

/// History row as consumed by the context builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub user: String,
    pub bot: String,
    pub timestamp: DateTime<Utc>,
}

/// Session listing row
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub last_activity: DateTime<Utc>,
}

/// Aggregate counts across the whole store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_exchanges: usize,
    pub total_sessions: usize,
    pub exchanges_today: usize,
}

/// Session store backed by `SQLite`
#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    /// Create a new session store
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Storage(e.to_string()))
    }

    /// Create a new session
    ///
    /// Without a title one is synthesized from the current local time.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or no unique id could be
    /// minted
    pub fn create_session(&self, title: Option<&str>) -> Result<String> {
        let conn = self.conn()?;
        let now = Utc::now().trunc_subsecs(6);
        let now_str = format_datetime(now);
        let local = now.with_timezone(&Local);

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map_or_else(
                || format!("Conversation {}", local.format("%Y-%m-%d %H:%M")),
                ToString::to_string,
            );

        for _ in 0..MAX_ID_ATTEMPTS {
            let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) % 10_000;
            let id = format!("session_{}_{seq:04}", local.format("%Y%m%d_%H%M%S"));

            let inserted = conn.execute(
                "INSERT INTO sessions (id, title, created_at, last_activity)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![&id, &title, &now_str],
            );

            match inserted {
                Ok(_) => {
                    tracing::info!(session_id = %id, title = %title, "session created");
                    return Ok(id);
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    tracing::debug!(session_id = %id, "session id taken, minting another");
                }
                Err(e) => return Err(Error::Storage(e.to_string())),
            }
        }

        Err(Error::Storage("could not mint a unique session id".to_string()))
    }

    /// Look up a session by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT id, title, created_at, last_activity, metadata
             FROM sessions WHERE id = ?1",
            [session_id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                    last_activity: parse_datetime(&row.get::<_, String>(3)?),
                    metadata: parse_metadata(row.get::<_, Option<String>>(4)?.as_deref()),
                })
            },
        )
        .optional()
        .map_err(|e| Error::Storage(e.to_string()))
    }

    /// Record one exchange and bump the session's last activity
    ///
    /// The exchange timestamp never precedes the session's current last
    /// activity, so timestamps stay monotonic in insertion order even if the
    /// wall clock steps backwards. The activity is set to exactly that
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown session, or a storage error
    /// if the write fails (in which case nothing is written)
    pub fn save_exchange(
        &self,
        session_id: &str,
        user_text: &str,
        bot_text: &str,
        audio_path: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<Exchange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last_activity: Option<String> = tx
            .query_row(
                "SELECT last_activity FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last_activity) = last_activity else {
            return Err(Error::NotFound(format!("session {session_id}")));
        };

        let created_at = Utc::now()
            .trunc_subsecs(6)
            .max(parse_datetime(&last_activity));
        let created_str = format_datetime(created_at);
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;

        tx.execute(
            "INSERT INTO exchanges (session_id, user_text, bot_text, created_at, audio_path, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session_id,
                user_text,
                bot_text,
                &created_str,
                audio_path,
                metadata_json
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
            rusqlite::params![&created_str, session_id],
        )?;

        tx.commit()?;

        tracing::debug!(session_id, exchange_id = id, "exchange saved");

        Ok(Exchange {
            id,
            session_id: session_id.to_string(),
            user_text: user_text.to_string(),
            bot_text: bot_text.to_string(),
            created_at,
            audio_path: audio_path.map(String::from),
            metadata: metadata.cloned(),
        })
    }

    /// Most recent `limit` exchanges of a session, oldest first
    ///
    /// Unknown sessions yield an empty list.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_text, bot_text, created_at
             FROM exchanges WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut entries = stmt
            .query_map(rusqlite::params![session_id, limit], |row| {
                Ok(HistoryEntry {
                    user: row.get(0)?,
                    bot: row.get(1)?,
                    timestamp: parse_datetime(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        entries.reverse();
        Ok(entries)
    }

    /// Full exchange rows of a session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_exchanges(&self, session_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, user_text, bot_text, created_at, audio_path, metadata
             FROM exchanges WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut exchanges = stmt
            .query_map(rusqlite::params![session_id, limit], |row| {
                Ok(Exchange {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    user_text: row.get(2)?,
                    bot_text: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    audio_path: row.get(5)?,
                    metadata: parse_metadata(row.get::<_, Option<String>>(6)?.as_deref()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        exchanges.reverse();
        Ok(exchanges)
    }

    /// Recently active sessions, most recent first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, last_activity
             FROM sessions ORDER BY last_activity DESC, rowid DESC LIMIT ?1",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sessions = stmt
            .query_map([limit], |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    last_activity: parse_datetime(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Delete a session and all its exchanges
    ///
    /// Deleting an unknown session succeeds and removes nothing.
    ///
    /// Returns the number of exchanges removed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exchanges = tx.execute("DELETE FROM exchanges WHERE session_id = ?1", [session_id])?;
        let sessions = tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;

        tx.commit()?;

        if sessions > 0 {
            tracing::info!(session_id, exchanges, "session deleted");
        } else {
            tracing::debug!(session_id, "delete of unknown session ignored");
        }

        Ok(exchanges)
    }

    /// Count exchanges in a session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn exchange_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM exchanges WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Aggregate counts; "today" is the local calendar day
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn stats(&self) -> Result<Stats> {
        let conn = self.conn()?;

        let total_exchanges: i64 =
            conn.query_row("SELECT COUNT(*) FROM exchanges", [], |row| row.get(0))?;
        let total_sessions: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;

        let today = Local::now().date_naive();
        let start = format_datetime(local_midnight(today));
        let end = format_datetime(local_midnight(today.succ_opt().unwrap_or(today)));

        let exchanges_today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM exchanges WHERE created_at >= ?1 AND created_at < ?2",
            [&start, &end],
            |row| row.get(0),
        )?;

        Ok(Stats {
            total_exchanges: usize::try_from(total_exchanges).unwrap_or(0),
            total_sessions: usize::try_from(total_sessions).unwrap_or(0),
            exchanges_today: usize::try_from(exchanges_today).unwrap_or(0),
        })
    }
}

/// Fixed-width UTC form, so lexical order in SQL equals time order
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

fn parse_metadata(raw: Option<&str>) -> Option<Metadata> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

/// Start of a local calendar day, expressed in UTC
fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&naive), |dt| dt.with_timezone(&Utc))
}
