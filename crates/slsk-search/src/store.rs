//! Sqlite persistence for searches.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::err::SearchError;
use crate::lifecycle::{PeerResponse, SearchRecord, SearchState};

/// The schema for the searches table.
const INSTALL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS searches (
    id                TEXT PRIMARY KEY NOT NULL,
    search_text       TEXT NOT NULL,
    token             INTEGER NOT NULL,
    state             TEXT NOT NULL,
    started_at        INTEGER NOT NULL,
    ended_at          INTEGER,
    response_count    INTEGER NOT NULL DEFAULT 0,
    file_count        INTEGER NOT NULL DEFAULT 0,
    locked_file_count INTEGER NOT NULL DEFAULT 0,
    responses         TEXT
);
";

/// Insert one fresh search row.
const INSERT_SEARCH: &str = "
  INSERT INTO searches (id, search_text, token, state, started_at)
  VALUES (?, ?, ?, ?, ?)
";

/// Update a search's state and token.
const UPDATE_STATE: &str = "UPDATE searches SET state = ?, token = ? WHERE id = ?";

/// Update a search's progress counters.
const UPDATE_PROGRESS: &str = "
  UPDATE searches
  SET response_count = ?, file_count = ?, locked_file_count = ?
  WHERE id = ?
";

/// Land a search in a terminal state.  The `responses IS NULL` guard is
/// what makes the responses column write-once.
const FINALIZE_SEARCH: &str = "
  UPDATE searches
  SET state = ?, ended_at = ?,
      response_count = ?, file_count = ?, locked_file_count = ?,
      responses = ?
  WHERE id = ? AND responses IS NULL
";

/// Fetch one search without its responses.
const FIND_SEARCH: &str = "
  SELECT id, search_text, token, state, started_at, ended_at,
         response_count, file_count, locked_file_count
  FROM searches WHERE id = ?
";

/// Fetch one search's responses column.
const FIND_RESPONSES: &str = "SELECT responses FROM searches WHERE id = ?";

/// List all searches, most recent first, without responses.
const LIST_SEARCHES: &str = "
  SELECT id, search_text, token, state, started_at, ended_at,
         response_count, file_count, locked_file_count
  FROM searches ORDER BY started_at DESC, id
";

/// Delete one search.
const DELETE_SEARCH: &str = "DELETE FROM searches WHERE id = ?";

/// Convert a time to the unix-milliseconds representation used on disk.
fn to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// Convert the on-disk representation back to a time.
fn from_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

/// The searches database.
pub struct SearchStore {
    /// The connection.  Sqlite connections are not Sync; everything goes
    /// through this lock.
    conn: Mutex<Connection>,
}

impl SearchStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SearchError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store, for tests and ephemeral use.
    pub fn open_in_memory() -> Result<Self, SearchError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Install the schema on a fresh connection.
    fn from_connection(conn: Connection) -> Result<Self, SearchError> {
        conn.execute_batch(INSTALL_SCHEMA)?;
        Ok(SearchStore {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the connection.
    fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, SearchError>,
    ) -> Result<R, SearchError> {
        let conn = self.conn.lock().map_err(|_| SearchError::Poisoned)?;
        f(&conn)
    }

    /// Insert a fresh record.
    pub fn insert(&self, record: &SearchRecord) -> Result<(), SearchError> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    INSERT_SEARCH,
                    params![
                        record.id.to_string(),
                        record.search_text,
                        record.token,
                        record.state.to_string(),
                        to_millis(record.started_at),
                    ],
                )
                .map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        SearchError::AlreadyExists { id: record.id }
                    }
                    other => other.into(),
                })?;
            debug_assert_eq!(n, 1);
            Ok(())
        })
    }

    /// Record a state transition (and the token, which is assigned when
    /// the search moves to in-progress).
    pub fn set_state(&self, id: Uuid, state: &SearchState, token: u32) -> Result<(), SearchError> {
        self.with_conn(|conn| {
            let n = conn.execute(UPDATE_STATE, params![state.to_string(), token, id.to_string()])?;
            if n == 0 {
                return Err(SearchError::NotFound { id });
            }
            Ok(())
        })
    }

    /// Update progress counters for an in-flight search.
    pub fn update_progress(
        &self,
        id: Uuid,
        response_count: usize,
        file_count: usize,
        locked_file_count: usize,
    ) -> Result<(), SearchError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                UPDATE_PROGRESS,
                params![
                    response_count as i64,
                    file_count as i64,
                    locked_file_count as i64,
                    id.to_string()
                ],
            )?;
            if n == 0 {
                return Err(SearchError::NotFound { id });
            }
            Ok(())
        })
    }

    /// Land a search in a terminal state, writing its response list.
    ///
    /// The responses column is write-once: if it has already been
    /// written, this call changes nothing and returns false.
    pub fn finalize(
        &self,
        id: Uuid,
        state: &SearchState,
        ended_at: SystemTime,
        response_count: usize,
        file_count: usize,
        locked_file_count: usize,
        responses: &[PeerResponse],
    ) -> Result<bool, SearchError> {
        let responses_json =
            serde_json::to_string(responses).map_err(|e| SearchError::MalformedRecord {
                detail: e.to_string(),
            })?;
        self.with_conn(|conn| {
            let n = conn.execute(
                FINALIZE_SEARCH,
                params![
                    state.to_string(),
                    to_millis(ended_at),
                    response_count as i64,
                    file_count as i64,
                    locked_file_count as i64,
                    responses_json,
                    id.to_string(),
                ],
            )?;
            Ok(n == 1)
        })
    }

    /// Fetch one record, optionally with its response list.
    pub fn find(
        &self,
        id: Uuid,
        include_responses: bool,
    ) -> Result<Option<SearchRecord>, SearchError> {
        self.with_conn(|conn| {
            let record = conn
                .query_row(FIND_SEARCH, params![id.to_string()], row_to_record)
                .optional()?;
            let Some(mut record) = record else {
                return Ok(None);
            };
            if include_responses {
                let json: Option<String> = conn
                    .query_row(FIND_RESPONSES, params![id.to_string()], |row| row.get(0))
                    .optional()?
                    .flatten();
                if let Some(json) = json {
                    record.responses = Some(serde_json::from_str(&json).map_err(|e| {
                        SearchError::MalformedRecord {
                            detail: e.to_string(),
                        }
                    })?);
                }
            }
            Ok(Some(record))
        })
    }

    /// List all records, most recent first, without response lists.
    pub fn list(&self) -> Result<Vec<SearchRecord>, SearchError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(LIST_SEARCHES)?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Delete one record.  Returns true if it existed.
    pub fn delete(&self, id: Uuid) -> Result<bool, SearchError> {
        self.with_conn(|conn| Ok(conn.execute(DELETE_SEARCH, params![id.to_string()])? == 1))
    }
}

/// Decode one row of the searches table (without responses).
fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SearchRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let state: String = row.get(3)?;
    let ended_at: Option<i64> = row.get(5)?;
    Ok(SearchRecord {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        search_text: row.get(1)?,
        token: row.get(2)?,
        state: state.parse().map_err(|e: crate::lifecycle::ParseStateError| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        started_at: from_millis(row.get(4)?),
        ended_at: ended_at.map(from_millis),
        response_count: row.get::<_, i64>(6)?.max(0) as usize,
        file_count: row.get::<_, i64>(7)?.max(0) as usize,
        locked_file_count: row.get::<_, i64>(8)?.max(0) as usize,
        responses: None,
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::lifecycle::CompletionReason;

    fn fresh(id: Uuid, text: &str) -> SearchRecord {
        SearchRecord {
            id,
            search_text: text.to_owned(),
            token: 0,
            state: SearchState::Requested,
            started_at: SystemTime::now(),
            ended_at: None,
            response_count: 0,
            file_count: 0,
            locked_file_count: 0,
            responses: None,
        }
    }

    #[test]
    fn insert_find_list_delete() {
        let store = SearchStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.insert(&fresh(id, "beatles")).unwrap();

        let got = store.find(id, false).unwrap().unwrap();
        assert_eq!(got.search_text, "beatles");
        assert_eq!(got.state, SearchState::Requested);
        assert!(got.responses.is_none());

        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.find(id, false).unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let store = SearchStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.insert(&fresh(id, "a")).unwrap();
        assert!(matches!(
            store.insert(&fresh(id, "b")),
            Err(SearchError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn responses_column_is_write_once() {
        let store = SearchStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.insert(&fresh(id, "a")).unwrap();
        store
            .set_state(id, &SearchState::InProgress, 99)
            .unwrap();

        let done = SearchState::Completed(CompletionReason::TimedOut);
        assert!(store
            .finalize(id, &done, SystemTime::now(), 1, 2, 0, &[])
            .unwrap());
        // A second terminal write is refused.
        let again = SearchState::Completed(CompletionReason::Cancelled);
        assert!(!store
            .finalize(id, &again, SystemTime::now(), 9, 9, 9, &[])
            .unwrap());

        let got = store.find(id, true).unwrap().unwrap();
        assert_eq!(got.state, done);
        assert_eq!(got.response_count, 1);
        assert_eq!(got.token, 99);
        assert_eq!(got.responses.as_deref(), Some(&[][..]));
    }

    #[test]
    fn progress_updates_counters_only() {
        let store = SearchStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.insert(&fresh(id, "a")).unwrap();
        store.update_progress(id, 3, 40, 5).unwrap();
        let got = store.find(id, true).unwrap().unwrap();
        assert_eq!(
            (got.response_count, got.file_count, got.locked_file_count),
            (3, 40, 5)
        );
        assert!(got.responses.is_none(), "responses untouched by progress");
    }

    #[test]
    fn unknown_ids_are_reported() {
        let store = SearchStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.set_state(id, &SearchState::InProgress, 1),
            Err(SearchError::NotFound { .. })
        ));
        assert!(matches!(
            store.update_progress(id, 1, 1, 1),
            Err(SearchError::NotFound { .. })
        ));
    }
}
