//! Durable relational store for users, sessions, curriculum metadata, and
//! chat history, backed by embedded SQLite behind a bounded connection pool.
//!
//! Adapted from the facade-trait-over-pluggable-backend shape the coordination
//! core uses throughout (one trait, one primary implementation, tests against
//! the trait): here the trait is `MetadataStore` and the shipped
//! implementation is `SqliteMetadataStore`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

use super::models::{Book, ChatEntry, Role, Session, Subject, User, VkpInstallationRecord};

const SCHEMA_VERSION: i64 = 1;
const SPILL_BUFFER_CAPACITY: usize = 10_000;

/// A write that could not reach SQLite and is held for the reconnect worker.
#[derive(Debug, Clone)]
pub enum SpillWrite {
    ChatEntry(ChatEntry),
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_user(
        &self,
        username: &str,
        role: Role,
        display_name: &str,
        password_hash: &str,
    ) -> GatewayResult<User>;

    async fn get_user_by_username(&self, username: &str) -> GatewayResult<Option<User>>;
    async fn get_user(&self, id: Uuid) -> GatewayResult<Option<User>>;

    async fn create_session(&self, user_id: Uuid, ttl: Duration) -> GatewayResult<Session>;
    async fn get_session(&self, token: &str) -> GatewayResult<Option<Session>>;
    async fn delete_sessions_for_user(&self, user_id: Uuid) -> GatewayResult<()>;
    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> GatewayResult<u64>;

    async fn upsert_subject(&self, code: &str, display_name: &str, grade: u8)
        -> GatewayResult<Subject>;
    async fn get_subject_by_code(&self, code: &str, grade: u8) -> GatewayResult<Option<Subject>>;

    async fn upsert_book(
        &self,
        subject_id: Uuid,
        title: &str,
        source_filename: &str,
        installed_vkp_version: &str,
        chunk_count: u32,
    ) -> GatewayResult<Book>;

    /// Records a VKP install and flips the active pointer for (subject,
    /// grade) in a single unit of work.
    async fn record_vkp_installation(
        &self,
        subject_code: &str,
        grade: u8,
        version: &str,
        integrity_hash: &str,
        chunk_count: u32,
    ) -> GatewayResult<VkpInstallationRecord>;

    async fn get_active_vkp(
        &self,
        subject_code: &str,
        grade: u8,
    ) -> GatewayResult<Option<VkpInstallationRecord>>;

    async fn append_chat_entry(&self, entry: ChatEntry) -> GatewayResult<()>;

    /// True once the underlying store has answered a round-trip probe.
    async fn health_check(&self) -> bool;

    /// Number of writes currently held in the spill buffer.
    fn spill_depth(&self) -> usize;

    /// Writes a complete, consistent copy of the store to `dest` (weekly
    /// full snapshot, §4.10).
    async fn backup_full(&self, dest: &Path) -> GatewayResult<()>;

    /// All chat entries recorded strictly after `since` (daily incremental
    /// snapshot, §4.10).
    async fn export_chat_entries_since(&self, since: DateTime<Utc>) -> GatewayResult<Vec<ChatEntry>>;
}

pub struct SqliteMetadataStore {
    pool: Pool<SqliteConnectionManager>,
    spill: Mutex<Vec<SpillWrite>>,
}

impl SqliteMetadataStore {
    pub fn open(db_path: &Path, pool_wait: Duration) -> GatewayResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = Pool::builder()
            .connection_timeout(pool_wait)
            .build(manager)
            .map_err(GatewayError::from)?;

        let store = Self {
            pool,
            spill: Mutex::new(Vec::new()),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> GatewayResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(GatewayError::from)
    }

    fn migrate(&self) -> GatewayResult<()> {
        let conn = self.conn()?;
        let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if current >= SCHEMA_VERSION {
            return Ok(());
        }
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                role TEXT NOT NULL,
                display_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                display_name TEXT NOT NULL,
                grade INTEGER NOT NULL,
                UNIQUE(code, grade)
            );
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL REFERENCES subjects(id),
                title TEXT NOT NULL,
                source_filename TEXT NOT NULL,
                installed_vkp_version TEXT NOT NULL,
                chunk_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS vkp_installations (
                id TEXT PRIMARY KEY,
                subject_code TEXT NOT NULL,
                grade INTEGER NOT NULL,
                version TEXT NOT NULL,
                integrity_hash TEXT NOT NULL,
                installed_at TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                active INTEGER NOT NULL,
                UNIQUE(subject_code, grade, version)
            );
            CREATE TABLE IF NOT EXISTS chat_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                subject_id TEXT,
                question TEXT NOT NULL,
                response TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL,
                partial INTEGER NOT NULL
            );
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn push_spill(&self, write: SpillWrite) -> GatewayResult<()> {
        let mut buf = self.spill.lock();
        if buf.len() >= SPILL_BUFFER_CAPACITY {
            return Err(GatewayError::Degraded(
                "spill buffer overflow".to_string(),
            ));
        }
        buf.push(write);
        Ok(())
    }

    /// Drains the spill buffer into the primary store. Intended to be driven
    /// by a dedicated reconnect worker once connectivity returns.
    pub async fn drain_spill(&self) -> GatewayResult<u64> {
        let pending: Vec<SpillWrite> = {
            let mut buf = self.spill.lock();
            std::mem::take(&mut *buf)
        };
        let mut drained = 0u64;
        for write in pending {
            match write {
                SpillWrite::ChatEntry(entry) => {
                    if self.append_chat_entry(entry.clone()).await.is_err() {
                        self.push_spill(SpillWrite::ChatEntry(entry))?;
                    } else {
                        drained += 1;
                    }
                }
            }
        }
        Ok(drained)
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_user(
        &self,
        username: &str,
        role: Role,
        display_name: &str,
        password_hash: &str,
    ) -> GatewayResult<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role,
            display_name: display_name.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        let pool = self.pool.clone();
        let u = user.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "INSERT INTO users (id, username, role, display_name, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    u.id.to_string(),
                    u.username,
                    u.role.as_str(),
                    u.display_name,
                    u.password_hash,
                    u.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> GatewayResult<Option<User>> {
        let pool = self.pool.clone();
        let username = username.to_string();
        tokio::task::spawn_blocking(move || -> GatewayResult<Option<User>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.query_row(
                "SELECT id, username, role, display_name, password_hash, created_at
                 FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn get_user(&self, id: Uuid) -> GatewayResult<Option<User>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Option<User>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.query_row(
                "SELECT id, username, role, display_name, password_hash, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .optional()
            .map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn create_session(&self, user_id: Uuid, ttl: Duration) -> GatewayResult<Session> {
        let now = Utc::now();
        let session = Session {
            token: crate::auth::generate_token(),
            user_id,
            issued_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1)),
        };
        let pool = self.pool.clone();
        let s = session.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "INSERT INTO sessions (token, user_id, issued_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    s.token,
                    s.user_id.to_string(),
                    s.issued_at.to_rfc3339(),
                    s.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;
        Ok(session)
    }

    async fn get_session(&self, token: &str) -> GatewayResult<Option<Session>> {
        let pool = self.pool.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || -> GatewayResult<Option<Session>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.query_row(
                "SELECT token, user_id, issued_at, expires_at FROM sessions WHERE token = ?1",
                params![token],
                row_to_session,
            )
            .optional()
            .map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn delete_sessions_for_user(&self, user_id: Uuid) -> GatewayResult<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "DELETE FROM sessions WHERE user_id = ?1",
                params![user_id.to_string()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> GatewayResult<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<u64> {
            let conn = pool.get().map_err(GatewayError::from)?;
            let removed = conn.execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![now.to_rfc3339()],
            )?;
            Ok(removed as u64)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn upsert_subject(
        &self,
        code: &str,
        display_name: &str,
        grade: u8,
    ) -> GatewayResult<Subject> {
        let pool = self.pool.clone();
        let code = code.to_string();
        let display_name = display_name.to_string();
        tokio::task::spawn_blocking(move || -> GatewayResult<Subject> {
            let conn = pool.get().map_err(GatewayError::from)?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM subjects WHERE code = ?1 AND grade = ?2",
                    params![code, grade],
                    |r| r.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => Uuid::parse_str(&id).map_err(|e| GatewayError::Storage(e.to_string()))?,
                None => {
                    let id = Uuid::new_v4();
                    conn.execute(
                        "INSERT INTO subjects (id, code, display_name, grade) VALUES (?1, ?2, ?3, ?4)",
                        params![id.to_string(), code, display_name, grade],
                    )?;
                    id
                }
            };
            Ok(Subject {
                id,
                code,
                display_name,
                grade,
            })
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn get_subject_by_code(&self, code: &str, grade: u8) -> GatewayResult<Option<Subject>> {
        let pool = self.pool.clone();
        let code = code.to_string();
        tokio::task::spawn_blocking(move || -> GatewayResult<Option<Subject>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.query_row(
                "SELECT id, code, display_name, grade FROM subjects WHERE code = ?1 AND grade = ?2",
                params![code, grade],
                |r| {
                    let id: String = r.get(0)?;
                    Ok(Subject {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        code: r.get(1)?,
                        display_name: r.get(2)?,
                        grade: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn upsert_book(
        &self,
        subject_id: Uuid,
        title: &str,
        source_filename: &str,
        installed_vkp_version: &str,
        chunk_count: u32,
    ) -> GatewayResult<Book> {
        let book = Book {
            id: Uuid::new_v4(),
            subject_id,
            title: title.to_string(),
            source_filename: source_filename.to_string(),
            installed_vkp_version: installed_vkp_version.to_string(),
            chunk_count,
        };
        let pool = self.pool.clone();
        let b = book.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "INSERT INTO books (id, subject_id, title, source_filename, installed_vkp_version, chunk_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    b.id.to_string(),
                    b.subject_id.to_string(),
                    b.title,
                    b.source_filename,
                    b.installed_vkp_version,
                    b.chunk_count,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;
        Ok(book)
    }

    async fn record_vkp_installation(
        &self,
        subject_code: &str,
        grade: u8,
        version: &str,
        integrity_hash: &str,
        chunk_count: u32,
    ) -> GatewayResult<VkpInstallationRecord> {
        let record = VkpInstallationRecord {
            id: Uuid::new_v4(),
            subject_code: subject_code.to_string(),
            grade,
            version: version.to_string(),
            integrity_hash: integrity_hash.to_string(),
            installed_at: Utc::now(),
            chunk_count,
            active: true,
        };
        let pool = self.pool.clone();
        let r = record.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let mut conn = pool.get().map_err(GatewayError::from)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE vkp_installations SET active = 0 WHERE subject_code = ?1 AND grade = ?2",
                params![r.subject_code, r.grade],
            )?;
            tx.execute(
                "INSERT INTO vkp_installations
                 (id, subject_code, grade, version, integrity_hash, installed_at, chunk_count, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![
                    r.id.to_string(),
                    r.subject_code,
                    r.grade,
                    r.version,
                    r.integrity_hash,
                    r.installed_at.to_rfc3339(),
                    r.chunk_count,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))??;
        Ok(record)
    }

    async fn get_active_vkp(
        &self,
        subject_code: &str,
        grade: u8,
    ) -> GatewayResult<Option<VkpInstallationRecord>> {
        let pool = self.pool.clone();
        let subject_code = subject_code.to_string();
        tokio::task::spawn_blocking(move || -> GatewayResult<Option<VkpInstallationRecord>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.query_row(
                "SELECT id, subject_code, grade, version, integrity_hash, installed_at, chunk_count, active
                 FROM vkp_installations WHERE subject_code = ?1 AND grade = ?2 AND active = 1",
                params![subject_code, grade],
                row_to_vkp,
            )
            .optional()
            .map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn append_chat_entry(&self, entry: ChatEntry) -> GatewayResult<()> {
        let pool = self.pool.clone();
        let e = entry.clone();
        let result = tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "INSERT INTO chat_entries
                 (id, user_id, subject_id, question, response, confidence, created_at, partial)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    e.id.to_string(),
                    e.user_id.to_string(),
                    e.subject_id.map(|s| s.to_string()),
                    e.question,
                    e.response,
                    e.confidence,
                    e.created_at.to_rfc3339(),
                    e.partial as i64,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?;

        match result {
            Ok(()) => Ok(()),
            Err(_) => {
                log::warn!("metadata store unreachable, spilling chat entry write");
                self.push_spill(SpillWrite::ChatEntry(entry))
            }
        }
    }

    async fn health_check(&self) -> bool {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.get()
                .ok()
                .and_then(|conn| conn.query_row("SELECT 1", [], |_| Ok(())).ok())
                .is_some()
        })
        .await
        .unwrap_or(false)
    }

    fn spill_depth(&self) -> usize {
        self.spill.lock().len()
    }

    async fn backup_full(&self, dest: &Path) -> GatewayResult<()> {
        let pool = self.pool.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> GatewayResult<()> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| GatewayError::Storage(e.to_string()))?;
            }
            let conn = pool.get().map_err(GatewayError::from)?;
            conn.execute(
                "VACUUM INTO ?1",
                params![dest.to_string_lossy().to_string()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }

    async fn export_chat_entries_since(&self, since: DateTime<Utc>) -> GatewayResult<Vec<ChatEntry>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> GatewayResult<Vec<ChatEntry>> {
            let conn = pool.get().map_err(GatewayError::from)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, subject_id, question, response, confidence, created_at, partial
                 FROM chat_entries WHERE created_at > ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![since.to_rfc3339()], row_to_chat_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| GatewayError::Storage(e.to_string()))?
    }
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let role: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(User {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        username: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Student),
        display_name: row.get(3)?,
        password_hash: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let user_id: String = row.get(1)?;
    let issued_at: String = row.get(2)?;
    let expires_at: String = row.get(3)?;
    Ok(Session {
        token: row.get(0)?,
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        issued_at: DateTime::parse_from_rfc3339(&issued_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_vkp(row: &rusqlite::Row) -> rusqlite::Result<VkpInstallationRecord> {
    let id: String = row.get(0)?;
    let installed_at: String = row.get(5)?;
    Ok(VkpInstallationRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        subject_code: row.get(1)?,
        grade: row.get(2)?,
        version: row.get(3)?,
        integrity_hash: row.get(4)?,
        installed_at: DateTime::parse_from_rfc3339(&installed_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        chunk_count: row.get(6)?,
        active: {
            let v: i64 = row.get(7)?;
            v != 0
        },
    })
}

fn row_to_chat_entry(row: &rusqlite::Row) -> rusqlite::Result<ChatEntry> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let subject_id: Option<String> = row.get(2)?;
    let created_at: String = row.get(6)?;
    let partial: i64 = row.get(7)?;
    Ok(ChatEntry {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        subject_id: subject_id.and_then(|s| Uuid::parse_str(&s).ok()),
        question: row.get(3)?,
        response: row.get(4)?,
        confidence: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        partial: partial != 0,
    })
}

/// Handle shared across the gateway; `Arc` so background tasks (sweep,
/// reconnect worker) and request handlers observe the same pool and spill
/// buffer.
pub type SharedMetadataStore = Arc<dyn MetadataStore>;
