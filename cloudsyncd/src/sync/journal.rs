use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::item::{Checksum, ItemError, ItemRecord, ItemType, RemotePermissions};
use super::job::FailureKind;
use super::paths;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENTRY_COLUMNS: &str =
    "path, item_type, resource_id, checksum, size, modified, permissions, fingerprint";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error("invalid failure kind: {0}")]
    InvalidFailureKind(String),
}

/// Last synchronized state of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub path: String,
    pub item_type: ItemType,
    pub resource_id: Option<String>,
    pub checksum: Option<Checksum>,
    pub size: u64,
    pub modified: i64,
    pub permissions: Option<RemotePermissions>,
    pub fingerprint: u64,
}

impl JournalEntry {
    /// Entry for an item both sides now agree on. Identity and metadata come
    /// from the remote, the fingerprint from the local file.
    pub fn synced(path: &str, local: Option<&ItemRecord>, remote: &ItemRecord) -> Self {
        Self {
            path: path.to_string(),
            item_type: remote.item_type,
            resource_id: remote.resource_id.clone(),
            checksum: remote
                .checksum
                .clone()
                .or_else(|| local.and_then(|l| l.checksum.clone())),
            size: remote.size,
            modified: remote.modified,
            permissions: remote.permissions.clone(),
            fingerprint: local.map(|l| l.fingerprint).unwrap_or(0),
        }
    }

    pub fn to_record(&self) -> ItemRecord {
        ItemRecord {
            path: self.path.clone(),
            item_type: self.item_type,
            resource_id: self.resource_id.clone(),
            size: self.size,
            modified: self.modified,
            checksum: self.checksum.clone(),
            permissions: self.permissions.clone(),
            read_only: false,
            fingerprint: self.fingerprint,
            placeholder: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.item_type == ItemType::Dir
    }

    pub fn rebased(&self, path: String) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}

/// One step of a job's journal commit.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalUpdate {
    Upsert(JournalEntry),
    /// Removes `path` and every row below it.
    DeleteTree { path: String },
    /// Re-keys `from` and its subtree under `to`, replacing rows already there.
    MoveTree { from: String, to: String },
    ClearUploadSession { path: String },
    RecordConflict {
        path: String,
        kind: String,
        renamed_local: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub path: String,
    pub kind: FailureKind,
    pub reason: String,
    pub retry_count: u32,
    /// `None` means "until the user acts".
    pub next_retry_at: Option<i64>,
    pub first_failure_at: i64,
    pub last_failure_at: i64,
}

impl BlacklistEntry {
    pub fn is_eligible(&self, now: i64) -> bool {
        self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// A failure collected during a run, written at run end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub path: String,
    pub kind: FailureKind,
    pub reason: String,
    pub next_retry_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSessionRecord {
    pub path: String,
    pub session_id: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub acked_offset: u64,
    pub source_checksum: Option<String>,
    pub source_modified: i64,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub path: String,
    pub kind: String,
    pub renamed_local: Option<String>,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorRecord {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
    pub at: i64,
}

pub struct Journal {
    pool: SqlitePool,
}

impl Journal {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, JournalError> {
        let pool = SqlitePool::connect(database_url).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn open(db_path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn init(&self) -> Result<(), JournalError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_entries(&self) -> Result<BTreeMap<String, JournalEntry>, JournalError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal_entries ORDER BY path ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let entry = entry_from_row(&row)?;
            out.insert(entry.path.clone(), entry);
        }
        Ok(out)
    }

    pub async fn get_entry(&self, path: &str) -> Result<Option<JournalEntry>, JournalError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// `path` and every entry below it.
    pub async fn load_subtree(
        &self,
        path: &str,
    ) -> Result<BTreeMap<String, JournalEntry>, JournalError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal_entries
             WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let entry = entry_from_row(&row)?;
            out.insert(entry.path.clone(), entry);
        }
        Ok(out)
    }

    /// Applies one job's updates atomically.
    pub async fn commit(&self, updates: &[JournalUpdate]) -> Result<(), JournalError> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = now_unix();
        let mut tx = self.pool.begin().await?;
        for update in updates {
            apply_update(&mut tx, update, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_blacklist(&self) -> Result<BTreeMap<String, BlacklistEntry>, JournalError> {
        let rows = sqlx::query(
            "SELECT path, kind, reason, retry_count, next_retry_at, first_failure_at, last_failure_at
             FROM blacklist ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            let entry = BlacklistEntry {
                path: row.try_get("path")?,
                kind: parse_failure_kind(&kind)?,
                reason: row.try_get("reason")?,
                retry_count: retry_count.max(0) as u32,
                next_retry_at: row.try_get("next_retry_at")?,
                first_failure_at: row.try_get("first_failure_at")?,
                last_failure_at: row.try_get("last_failure_at")?,
            };
            out.insert(entry.path.clone(), entry);
        }
        Ok(out)
    }

    /// Drops entries that failed too often or too long ago so the item is
    /// retried fresh. Returns the number of removed rows.
    pub async fn prune_blacklist(
        &self,
        now: i64,
        max_attempts: u32,
        max_age_secs: i64,
    ) -> Result<u64, JournalError> {
        let result = sqlx::query(
            "DELETE FROM blacklist WHERE retry_count > ?1 OR first_failure_at <= ?2",
        )
        .bind(i64::from(max_attempts))
        .bind(now.saturating_sub(max_age_secs))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Writes the run's failures in one transaction: blacklist rows are
    /// created or bumped, and the per-item error list is refreshed.
    pub async fn write_run_failures(
        &self,
        failures: &[FailureRecord],
        now: i64,
    ) -> Result<(), JournalError> {
        if failures.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for failure in failures {
            sqlx::query(
                "INSERT INTO blacklist (path, kind, reason, retry_count, next_retry_at, first_failure_at, last_failure_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                    kind = excluded.kind,
                    reason = excluded.reason,
                    retry_count = blacklist.retry_count + 1,
                    next_retry_at = excluded.next_retry_at,
                    last_failure_at = excluded.last_failure_at",
            )
            .bind(&failure.path)
            .bind(failure.kind.as_str())
            .bind(&failure.reason)
            .bind(failure.next_retry_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO sync_errors (path, kind, message, at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                    kind = excluded.kind,
                    message = excluded.message,
                    at = excluded.at",
            )
            .bind(&failure.path)
            .bind(failure.kind.as_str())
            .bind(&failure.reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_upload_session(
        &self,
        path: &str,
    ) -> Result<Option<UploadSessionRecord>, JournalError> {
        let row = sqlx::query(
            "SELECT path, session_id, total_size, chunk_size, acked_offset, source_checksum, source_modified, created
             FROM upload_sessions WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let total_size: i64 = row.try_get("total_size")?;
        let chunk_size: i64 = row.try_get("chunk_size")?;
        let acked_offset: i64 = row.try_get("acked_offset")?;
        Ok(Some(UploadSessionRecord {
            path: row.try_get("path")?,
            session_id: row.try_get("session_id")?,
            total_size: total_size.max(0) as u64,
            chunk_size: chunk_size.max(0) as u64,
            acked_offset: acked_offset.max(0) as u64,
            source_checksum: row.try_get("source_checksum")?,
            source_modified: row.try_get("source_modified")?,
            created: row.try_get("created")?,
        }))
    }

    pub async fn save_upload_session(
        &self,
        session: &UploadSessionRecord,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO upload_sessions (path, session_id, total_size, chunk_size, acked_offset, source_checksum, source_modified, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(path) DO UPDATE SET
                session_id = excluded.session_id,
                total_size = excluded.total_size,
                chunk_size = excluded.chunk_size,
                acked_offset = excluded.acked_offset,
                source_checksum = excluded.source_checksum,
                source_modified = excluded.source_modified,
                created = excluded.created",
        )
        .bind(&session.path)
        .bind(&session.session_id)
        .bind(session.total_size as i64)
        .bind(session.chunk_size as i64)
        .bind(session.acked_offset as i64)
        .bind(&session.source_checksum)
        .bind(session.source_modified)
        .bind(session.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_upload_offset(&self, path: &str, offset: u64) -> Result<(), JournalError> {
        sqlx::query("UPDATE upload_sessions SET acked_offset = ?2 WHERE path = ?1")
            .bind(path)
            .bind(offset as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_upload_session(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM upload_sessions WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pinned(&self, path: &str, pinned: bool) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO pin_states (path, pinned) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET pinned = excluded.pinned",
        )
        .bind(path)
        .bind(pinned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_pin(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM pin_states WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_pins(&self) -> Result<PinStates, JournalError> {
        let rows = sqlx::query("SELECT path, pinned FROM pin_states")
            .fetch_all(&self.pool)
            .await?;
        let mut pins = BTreeMap::new();
        for row in rows {
            pins.insert(row.try_get::<String, _>("path")?, row.try_get::<bool, _>("pinned")?);
        }
        Ok(PinStates(pins))
    }

    /// Replaces the list of remote folders excluded from sync.
    pub async fn set_selective_sync(&self, paths: &[String]) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM selective_sync")
            .execute(&mut *tx)
            .await?;
        for path in paths {
            sqlx::query("INSERT OR IGNORE INTO selective_sync (path) VALUES (?1)")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn selective_sync_list(&self) -> Result<Vec<String>, JournalError> {
        let rows = sqlx::query("SELECT path FROM selective_sync ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("path").map_err(JournalError::from))
            .collect()
    }

    pub async fn record_conflict(
        &self,
        path: &str,
        kind: &str,
        renamed_local: Option<&str>,
        created: i64,
    ) -> Result<i64, JournalError> {
        let result = sqlx::query(
            "INSERT INTO conflicts (path, kind, renamed_local, created) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(path)
        .bind(kind)
        .bind(renamed_local)
        .bind(created)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, JournalError> {
        let rows = sqlx::query(
            "SELECT id, path, kind, renamed_local, created FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConflictRecord {
                id: row.try_get("id")?,
                path: row.try_get("path")?,
                kind: row.try_get("kind")?,
                renamed_local: row.try_get("renamed_local")?,
                created: row.try_get("created")?,
            });
        }
        Ok(out)
    }

    pub async fn list_errors(&self) -> Result<Vec<SyncErrorRecord>, JournalError> {
        let rows = sqlx::query("SELECT path, kind, message, at FROM sync_errors ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            out.push(SyncErrorRecord {
                path: row.try_get("path")?,
                kind: parse_failure_kind(&kind)?,
                message: row.try_get("message")?,
                at: row.try_get("at")?,
            });
        }
        Ok(out)
    }

    /// User acknowledgement: drops the error and lets the item be retried.
    pub async fn dismiss_error(&self, path: &str) -> Result<(), JournalError> {
        let mut tx = self.pool.begin().await?;
        clear_failure(&mut tx, path).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Pin states with inheritance: the nearest explicitly set ancestor wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinStates(pub BTreeMap<String, bool>);

impl PinStates {
    pub fn is_pinned(&self, path: &str) -> bool {
        let mut current = Some(path);
        while let Some(p) = current {
            if let Some(pinned) = self.0.get(p) {
                return *pinned;
            }
            current = paths::parent_path(p);
        }
        false
    }
}

async fn apply_update(
    conn: &mut SqliteConnection,
    update: &JournalUpdate,
    now: i64,
) -> Result<(), JournalError> {
    match update {
        JournalUpdate::Upsert(entry) => {
            upsert_entry(conn, entry).await?;
            clear_failure(conn, &entry.path).await?;
        }
        JournalUpdate::DeleteTree { path } => {
            delete_tree(conn, path).await?;
            clear_failure(conn, path).await?;
        }
        JournalUpdate::MoveTree { from, to } => {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM journal_entries
                 WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'"
            ))
            .bind(from)
            .fetch_all(&mut *conn)
            .await?;
            let mut moved = Vec::with_capacity(rows.len());
            for row in &rows {
                let entry = entry_from_row(row)?;
                if let Some(path) = paths::rebase(&entry.path, from, to) {
                    moved.push(entry.rebased(path));
                }
            }
            delete_tree(conn, from).await?;
            delete_tree(conn, to).await?;
            for entry in &moved {
                upsert_entry(conn, entry).await?;
            }
            sqlx::query("UPDATE upload_sessions SET path = ?2 WHERE path = ?1")
                .bind(from)
                .bind(to)
                .execute(&mut *conn)
                .await?;
            clear_failure(conn, from).await?;
            clear_failure(conn, to).await?;
        }
        JournalUpdate::ClearUploadSession { path } => {
            sqlx::query("DELETE FROM upload_sessions WHERE path = ?1")
                .bind(path)
                .execute(&mut *conn)
                .await?;
        }
        JournalUpdate::RecordConflict {
            path,
            kind,
            renamed_local,
        } => {
            sqlx::query(
                "INSERT INTO conflicts (path, kind, renamed_local, created) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(path)
            .bind(kind)
            .bind(renamed_local)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn upsert_entry(conn: &mut SqliteConnection, entry: &JournalEntry) -> Result<(), JournalError> {
    let parent = paths::parent_path(&entry.path);
    sqlx::query(
        "INSERT INTO journal_entries (path, parent_path, item_type, resource_id, checksum, size, modified, permissions, fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(path) DO UPDATE SET
            parent_path = excluded.parent_path,
            item_type = excluded.item_type,
            resource_id = excluded.resource_id,
            checksum = excluded.checksum,
            size = excluded.size,
            modified = excluded.modified,
            permissions = excluded.permissions,
            fingerprint = excluded.fingerprint",
    )
    .bind(&entry.path)
    .bind(parent)
    .bind(entry.item_type.as_str())
    .bind(&entry.resource_id)
    .bind(entry.checksum.as_ref().map(|c| c.to_string()))
    .bind(entry.size as i64)
    .bind(entry.modified)
    .bind(entry.permissions.as_ref().map(|p| p.as_str().to_string()))
    // Inodes are stored bit-for-bit in a signed column.
    .bind(entry.fingerprint as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_tree(conn: &mut SqliteConnection, path: &str) -> Result<(), JournalError> {
    if path.is_empty() {
        sqlx::query("DELETE FROM journal_entries")
            .execute(&mut *conn)
            .await?;
        return Ok(());
    }
    sqlx::query(
        "DELETE FROM journal_entries
         WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
    )
    .bind(path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn clear_failure(conn: &mut SqliteConnection, path: &str) -> Result<(), JournalError> {
    sqlx::query("DELETE FROM blacklist WHERE path = ?1")
        .bind(path)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM sync_errors WHERE path = ?1")
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn entry_from_row(row: &SqliteRow) -> Result<JournalEntry, JournalError> {
    let item_type: String = row.try_get("item_type")?;
    let checksum: Option<String> = row.try_get("checksum")?;
    let permissions: Option<String> = row.try_get("permissions")?;
    let size: i64 = row.try_get("size")?;
    let fingerprint: i64 = row.try_get("fingerprint")?;
    Ok(JournalEntry {
        path: row.try_get("path")?,
        item_type: ItemType::parse(&item_type)?,
        resource_id: row.try_get("resource_id")?,
        checksum: checksum.as_deref().map(Checksum::parse).transpose()?,
        size: size.max(0) as u64,
        modified: row.try_get("modified")?,
        permissions: permissions.map(RemotePermissions::new),
        fingerprint: fingerprint as u64,
    })
}

fn parse_failure_kind(value: &str) -> Result<FailureKind, JournalError> {
    FailureKind::parse(value).ok_or_else(|| JournalError::InvalidFailureKind(value.to_string()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
