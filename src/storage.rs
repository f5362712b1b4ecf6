use std::{fs, path::Path, sync::Arc};

use chrono::Utc;
use rusqlite::{
    params, params_from_iter,
    types::{Type, Value},
    Connection, OptionalExtension, Row,
};

use crate::models::{Account, AccountReport, ErrorStage, MessageRecord, Tag, ThreadRecord};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Message filter; every populated field narrows the result. Newest first.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub account: Option<i64>,
    pub thread: Option<i64>,
    pub tag: Option<String>,
    /// Inclusive lower bound, UTC unix seconds.
    pub since: Option<i64>,
    /// Exclusive upper bound, UTC unix seconds.
    pub until: Option<i64>,
    /// Each term must occur in the lower-cased excerpt.
    pub excerpt_contains: Vec<String>,
    pub limit: Option<usize>,
}

/// Record store handle. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<parking_lot::Mutex<Connection>>,
}

const MESSAGE_COLUMNS: &str = "id, account_id, thread_id, identifier, message_key, sender, \
     recipient, in_reply_to, references_json, subject, date, cc, bcc, excerpt, file_location, \
     error, error_text, error_stage";

const THREAD_COLUMNS: &str = "id, account_id, thread_key, subject, unread, created_at";

const ACCOUNT_COLUMNS: &str =
    "id, address, watermark, last_run_at, last_run_error, last_unread";

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let references_json: String = row.get(8)?;
    let references: Vec<String> = serde_json::from_str(&references_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(err)))?;
    let stage: Option<String> = row.get(17)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        thread_id: row.get(2)?,
        identifier: row.get(3)?,
        message_key: row.get(4)?,
        sender: row.get(5)?,
        recipient: row.get(6)?,
        in_reply_to: row.get(7)?,
        references,
        subject: row.get(9)?,
        date: row.get(10)?,
        cc: row.get(11)?,
        bcc: row.get(12)?,
        excerpt: row.get(13)?,
        file_location: row.get(14)?,
        error: row.get(15)?,
        error_text: row.get(16)?,
        error_stage: stage.as_deref().map(ErrorStage::from_str),
    })
}

fn map_thread(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        thread_key: row.get(2)?,
        subject: row.get(3)?,
        unread: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        address: row.get(1)?,
        watermark: row.get(2)?,
        last_run_at: row.get(3)?,
        last_run_error: row.get(4)?,
        last_unread: row.get(5)?,
    })
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut connection: Connection) -> Result<Self> {
        connection.pragma_update(None, "foreign_keys", "ON")?;
        Self::apply_migrations(&mut connection)?;
        Ok(Self {
            conn: Arc::new(parking_lot::Mutex::new(connection)),
        })
    }

    fn apply_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                watermark TEXT,
                last_run_at INTEGER,
                last_run_error INTEGER NOT NULL DEFAULT 0,
                last_unread INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER REFERENCES accounts(id) ON DELETE SET NULL,
                thread_key TEXT NOT NULL,
                subject TEXT,
                unread INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_threads_account
                ON threads(account_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER REFERENCES accounts(id) ON DELETE SET NULL,
                thread_id INTEGER REFERENCES threads(id) ON DELETE CASCADE,
                identifier TEXT NOT NULL,
                message_key TEXT NOT NULL,
                sender TEXT,
                recipient TEXT,
                in_reply_to TEXT,
                references_json TEXT NOT NULL DEFAULT '[]',
                subject TEXT,
                date INTEGER,
                cc TEXT,
                bcc TEXT,
                excerpt TEXT NOT NULL DEFAULT '',
                file_location TEXT,
                error INTEGER NOT NULL DEFAULT 0,
                error_text TEXT,
                error_stage TEXT,
                UNIQUE(account_id, identifier)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(thread_id);

            CREATE INDEX IF NOT EXISTS idx_messages_account_date
                ON messages(account_id, date DESC);

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS thread_tags (
                thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (thread_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS run_lease (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // Accounts

    pub fn upsert_account(&self, address: &str) -> Result<Account> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (address) VALUES (?) ON CONFLICT(address) DO NOTHING",
            params![address],
        )?;
        let account = conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE address = ?"),
            params![address],
            map_account,
        )?;
        Ok(account)
    }

    pub fn account_by_address(&self, address: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE address = ?"),
                params![address],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"),
                params![id],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn set_watermark(&self, account_id: i64, watermark: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE accounts SET watermark = ? WHERE id = ?",
            params![watermark, account_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    pub fn record_run_summary(&self, account_id: i64, report: &AccountReport) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE accounts
            SET last_run_at = ?, last_run_error = ?, last_unread = ?
            WHERE id = ?
            "#,
            params![
                Utc::now().timestamp(),
                report.error,
                report.unread_remaining as i64,
                account_id
            ],
        )?;
        Ok(())
    }

    pub fn delete_account(&self, account_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM accounts WHERE id = ?", params![account_id])?;
        Ok(())
    }

    // Messages

    /// Returns the record for `(account_id, identifier)` and whether this call
    /// created it. New records start flagged as pending until ingest finishes.
    pub fn get_or_create_message(
        &self,
        account_id: i64,
        identifier: &str,
    ) -> Result<(MessageRecord, bool)> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO messages (
                account_id, identifier, message_key, error, error_stage
            ) VALUES (?, ?, ?, 1, ?)
            "#,
            params![account_id, identifier, identifier, ErrorStage::Pending.as_str()],
        )?;
        let created = conn.changes() > 0;
        let record = conn.query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND identifier = ?"
            ),
            params![account_id, identifier],
            map_message,
        )?;
        Ok((record, created))
    }

    pub fn save_message(&self, record: &MessageRecord) -> Result<()> {
        let references = serde_json::to_string(&record.references)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE messages SET
                thread_id = ?,
                message_key = ?,
                sender = ?,
                recipient = ?,
                in_reply_to = ?,
                references_json = ?,
                subject = ?,
                date = ?,
                cc = ?,
                bcc = ?,
                excerpt = ?,
                file_location = ?,
                error = ?,
                error_text = ?,
                error_stage = ?
            WHERE id = ?
            "#,
            params![
                record.thread_id,
                record.message_key,
                record.sender,
                record.recipient,
                record.in_reply_to,
                references,
                record.subject,
                record.date,
                record.cc,
                record.bcc,
                record.excerpt,
                record.file_location,
                record.error,
                record.error_text,
                record.error_stage.map(|stage| stage.as_str()),
                record.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("message {}", record.id)));
        }
        Ok(())
    }

    pub fn message(&self, id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"),
                params![id],
                map_message,
            )
            .optional()?;
        Ok(record)
    }

    pub fn message_by_identifier(
        &self,
        account_id: i64,
        identifier: &str,
    ) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND identifier = ?"
                ),
                params![account_id, identifier],
                map_message,
            )
            .optional()?;
        Ok(record)
    }

    pub fn mark_message_error(&self, id: i64, stage: ErrorStage, text: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET error = 1, error_stage = ?, error_text = ? WHERE id = ?",
            params![stage.as_str(), text, id],
        )?;
        Ok(())
    }

    /// Records the durable file location. A previous persist failure is
    /// cleared; ingest failures are left in place.
    pub fn mark_persisted(&self, id: i64, location: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE messages SET
                file_location = ?1,
                error = CASE WHEN error_stage = 'persist' THEN 0 ELSE error END,
                error_text = CASE WHEN error_stage = 'persist' THEN NULL ELSE error_text END,
                error_stage = CASE WHEN error_stage = 'persist' THEN NULL ELSE error_stage END
            WHERE id = ?2
            "#,
            params![location, id],
        )?;
        Ok(())
    }

    pub fn delete_message(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM messages WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn messages_for_thread(&self, thread_id: i64) -> Result<Vec<MessageRecord>> {
        self.query_messages(&MessageQuery {
            thread: Some(thread_id),
            ..Default::default()
        })
    }

    pub fn latest_message_in_thread(&self, thread_id: i64) -> Result<Option<MessageRecord>> {
        let mut found = self.query_messages(&MessageQuery {
            thread: Some(thread_id),
            limit: Some(1),
            ..Default::default()
        })?;
        Ok(found.pop())
    }

    /// Messages of an account that no longer belong to any thread.
    pub fn orphan_messages(&self, account_id: i64) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND thread_id IS NULL ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![account_id], map_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_messages_in_thread(&self, thread_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE thread_id = ?",
            params![thread_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_messages(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_error_messages(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ? AND error = 1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn query_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(account) = query.account {
            sql.push_str(" AND account_id = ?");
            values.push(Value::Integer(account));
        }
        if let Some(thread) = query.thread {
            sql.push_str(" AND thread_id = ?");
            values.push(Value::Integer(thread));
        }
        if let Some(tag) = &query.tag {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM thread_tags tt JOIN tags t ON t.id = tt.tag_id \
                 WHERE tt.thread_id = messages.thread_id AND t.name = ?)",
            );
            values.push(Value::Text(tag.clone()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND date >= ?");
            values.push(Value::Integer(since));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND date < ?");
            values.push(Value::Integer(until));
        }
        for term in &query.excerpt_contains {
            sql.push_str(" AND instr(excerpt, ?) > 0");
            values.push(Value::Text(term.to_lowercase()));
        }
        sql.push_str(" ORDER BY date IS NULL, date DESC, id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values), map_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn detach_from_thread(&self, message_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET thread_id = NULL WHERE id = ?",
            params![message_id],
        )?;
        Ok(())
    }

    pub fn detach_thread_messages(&self, thread_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET thread_id = NULL WHERE thread_id = ?",
            params![thread_id],
        )?;
        Ok(changed)
    }

    // Threads

    /// Most recently created thread of the account whose key contains
    /// `candidate`, compared case-insensitively.
    pub fn find_thread_containing(
        &self,
        account_id: i64,
        candidate: &str,
    ) -> Result<Option<ThreadRecord>> {
        let conn = self.conn.lock();
        let thread = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {THREAD_COLUMNS} FROM threads
                    WHERE account_id = ? AND instr(lower(thread_key), lower(?)) > 0
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#
                ),
                params![account_id, candidate],
                map_thread,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn create_thread(
        &self,
        account_id: i64,
        thread_key: &str,
        subject: Option<&str>,
    ) -> Result<ThreadRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO threads (account_id, thread_key, subject, unread, created_at) VALUES (?, ?, ?, 1, ?)",
            params![account_id, thread_key, subject, Utc::now().timestamp()],
        )?;
        let id = conn.last_insert_rowid();
        let thread = conn.query_row(
            &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?"),
            params![id],
            map_thread,
        )?;
        Ok(thread)
    }

    pub fn set_thread_key(&self, thread_id: i64, thread_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE threads SET thread_key = ? WHERE id = ?",
            params![thread_key, thread_id],
        )?;
        Ok(())
    }

    pub fn set_thread_unread(&self, thread_id: i64, unread: bool) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE threads SET unread = ? WHERE id = ?",
            params![unread, thread_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("thread {thread_id}")));
        }
        Ok(())
    }

    pub fn thread(&self, id: i64) -> Result<Option<ThreadRecord>> {
        let conn = self.conn.lock();
        let thread = conn
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?"),
                params![id],
                map_thread,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn threads_for_account(&self, account_id: i64) -> Result<Vec<ThreadRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE account_id = ? ORDER BY created_at DESC, id DESC"
        ))?;
        let threads = stmt
            .query_map(params![account_id], map_thread)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(threads)
    }

    pub fn count_threads(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE account_id = ?",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Deletes the thread; messages still attached to it are deleted with it.
    pub fn delete_thread(&self, thread_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM threads WHERE id = ?", params![thread_id])?;
        Ok(())
    }

    // Tags

    pub fn ensure_tag(&self, name: &str) -> Result<Tag> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let tag = conn.query_row(
            "SELECT id, name FROM tags WHERE name = ?",
            params![name],
            |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )?;
        Ok(tag)
    }

    /// Returns false when the tag was already attached.
    pub fn attach_tag(&self, thread_id: i64, tag_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO thread_tags (thread_id, tag_id) VALUES (?, ?)",
            params![thread_id, tag_id],
        )?;
        Ok(changed > 0)
    }

    pub fn tags_for_thread(&self, thread_id: i64) -> Result<Vec<Tag>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.id, t.name FROM tags t
            JOIN thread_tags tt ON tt.tag_id = t.id
            WHERE tt.thread_id = ?
            ORDER BY t.name
            "#,
        )?;
        let tags = stmt
            .query_map(params![thread_id], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    // Run lease

    /// Claims `name` for `owner` when it is free, expired, or already held by
    /// `owner`. Returns whether the claim succeeded.
    pub fn try_claim_lease(&self, name: &str, owner: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO run_lease (name, owner, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE run_lease.expires_at <= ?4 OR run_lease.owner = excluded.owner
            "#,
            params![name, owner, now + ttl_secs, now],
        )?;
        Ok(conn.changes() > 0)
    }

    pub fn release_lease(&self, name: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM run_lease WHERE name = ? AND owner = ?",
            params![name, owner],
        )?;
        Ok(())
    }
}
