//! Comment persistence shared by the server (reader) and collectors (writers).
//!
//! The file is opened in WAL mode so a collector process can upsert while the
//! server polls for the latest snapshot.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::Comment;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection poisoned")]
    Poisoned,

    #[error("existing comments table lacks columns {missing:?}; point the store at a new file")]
    Schema { missing: Vec<String> },
}

pub trait CommentStore: Send + Sync {
    /// Most recent `n` comments, newest first.
    fn fetch_latest(&self, n: usize) -> Result<Vec<Comment>, StoreError>;

    /// Insert or overwrite by id. Never fails on an existing id.
    fn upsert(&self, comment: &Comment) -> Result<(), StoreError>;

    fn upsert_all(&self, comments: &[Comment]) -> Result<usize, StoreError> {
        for comment in comments {
            self.upsert(comment)?;
        }
        Ok(comments.len())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS comments (
    id varchar(20) NOT NULL,
    target_id varchar(32) NOT NULL,
    author varchar(64) NOT NULL,
    text varchar(1000),
    created_at varchar(20),
    PRIMARY KEY (id)
);
";

const UPSERT: &str = "
INSERT INTO comments (id, target_id, author, text, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(id) DO UPDATE SET
    target_id = excluded.target_id,
    author = excluded.author,
    text = excluded.text,
    created_at = excluded.created_at
";

const COLUMNS: [&str; 5] = ["id", "target_id", "author", "text", "created_at"];

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        check_columns(&conn)?;
        tracing::debug!("comment store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// `CREATE TABLE IF NOT EXISTS` keeps whatever table is already there.
fn check_columns(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('comments')")?;
    let present = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let missing: Vec<String> = COLUMNS
        .iter()
        .filter(|c| !present.iter().any(|p| p == *c))
        .map(|c| c.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Schema { missing })
    }
}

impl CommentStore for SqliteStore {
    fn fetch_latest(&self, n: usize) -> Result<Vec<Comment>, StoreError> {
        let conn = self.lock()?;
        // Upstream ids are decimal strings; length-then-lexical is numeric order.
        let mut stmt = conn.prepare_cached(
            "SELECT id, target_id, author, text, created_at
             FROM comments
             ORDER BY length(id) DESC, id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(Comment {
                id: row.get(0)?,
                target_id: row.get(1)?,
                author: row.get(2)?,
                text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                created_at: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn upsert(&self, comment: &Comment) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            UPSERT,
            params![
                comment.id,
                comment.target_id,
                comment.author,
                comment.text,
                comment.created_at
            ],
        )?;
        Ok(())
    }

    fn upsert_all(&self, comments: &[Comment]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for c in comments {
                stmt.execute(params![c.id, c.target_id, c.author, c.text, c.created_at])?;
            }
        }
        tx.commit()?;
        Ok(comments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, text: &str) -> Comment {
        Comment::new(id, "4990000000000001", "user", text, "2024-01-01 00:00:00")
    }

    #[test]
    fn upsert_same_id_keeps_latest_payload() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&comment("1", "first")).unwrap();
        store.upsert(&comment("1", "second")).unwrap();

        let latest = store.fetch_latest(10).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].text, "second");
    }

    #[test]
    fn fetch_latest_is_newest_first_and_limited() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch: Vec<_> = ["3", "10", "4", "9"].iter().map(|id| comment(id, id)).collect();
        assert_eq!(store.upsert_all(&batch).unwrap(), 4);

        let ids: Vec<_> = store
            .fetch_latest(3)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["10", "9", "4"]);
    }

    #[test]
    fn empty_store_returns_empty_snapshot() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.fetch_latest(5).unwrap().is_empty());
    }

    #[test]
    fn foreign_comments_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE comments (id varchar(20) PRIMARY KEY, weibo_id varchar(20),
                 user_screen_name varchar(30), text varchar(2000), created_at varchar(20));",
            )
            .unwrap();

        match SqliteStore::open(&path) {
            Err(StoreError::Schema { missing }) => assert_eq!(missing, ["target_id", "author"]),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("legacy table accepted"),
        }
    }

    #[test]
    fn file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("comments.db");
        let writer = SqliteStore::open(&path).unwrap();
        let reader = SqliteStore::open(&path).unwrap();

        writer.upsert(&comment("42", "hello")).unwrap();
        let latest = reader.fetch_latest(1).unwrap();
        assert_eq!(latest[0].id, "42");
    }
}
