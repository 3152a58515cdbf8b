//! SQLite record store: user profiles, the attendance log and enrollment
//! images on disk. Also serves as the enrollment source for re-embedding.

use attend_core::{EnrollmentSource, Identity, SourceError};
use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Recorded for every attendance row created by identification.
pub const METHOD_FACE_RECOGNITION: &str = "face_recognition";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("user {0} already exists")]
    Duplicate(Identity),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Optional profile fields supplied at enrollment.
#[derive(Debug, Clone, Default)]
pub struct ProfileDetails {
    pub email: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub identity: Identity,
    /// RFC 3339 local time.
    pub registered_at: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
    pub image_path: PathBuf,
}

/// A user plus attendance statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    #[serde(flatten)]
    pub user: UserRecord,
    pub days_present: u32,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub date: NaiveDate,
    pub timestamp: String,
    pub confidence: f32,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    /// The identity already has a record for that calendar day.
    AlreadyMarked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceScope {
    Day(NaiveDate),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedUser {
    pub attendance_removed: usize,
}

pub struct ProfileStore {
    conn: Mutex<Connection>,
    uploads_dir: PathBuf,
}

impl ProfileStore {
    /// Open or create the database at `db_path`; images go under `uploads_dir`.
    pub fn open(db_path: impl AsRef<Path>, uploads_dir: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let uploads_dir = uploads_dir.into();
        std::fs::create_dir_all(&uploads_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(db = %db_path.display(), "record store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            uploads_dir,
        })
    }

    /// Store a new profile and its enrollment image.
    pub fn add_user(
        &self,
        identity: &Identity,
        details: &ProfileDetails,
        image: &[u8],
        extension: &str,
        now: DateTime<Local>,
    ) -> Result<UserRecord> {
        let conn = self.conn.lock();
        if user_exists(&conn, identity)? {
            return Err(StoreError::Duplicate(identity.clone()));
        }

        let image_path = self.uploads_dir.join(format!("{identity}.{extension}"));
        std::fs::write(&image_path, image)?;

        let record = UserRecord {
            identity: identity.clone(),
            registered_at: now.to_rfc3339(),
            email: details.email.clone(),
            department: details.department.clone(),
            role: details.role.clone(),
            image_path,
        };

        let inserted = conn.execute(
            "INSERT INTO users (identity, registered_at, email, department, role, image_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.identity.as_str(),
                record.registered_at,
                record.email,
                record.department,
                record.role,
                record.image_path.to_string_lossy().into_owned(),
            ],
        );
        if let Err(e) = inserted {
            let _ = std::fs::remove_file(&record.image_path);
            return Err(e.into());
        }

        tracing::info!(identity = %identity, "user registered");
        Ok(record)
    }

    pub fn contains(&self, identity: &Identity) -> Result<bool> {
        user_exists(&self.conn.lock(), identity)
    }

    pub fn user(&self, identity: &Identity) -> Result<Option<UserRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT identity, registered_at, email, department, role, image_path
                 FROM users WHERE identity = ?1",
                params![identity.as_str()],
                decode_user_row,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT identity FROM users ORDER BY identity")?;
        let rows = stmt.query_map([], |row| decode_identity(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every user with days present and the latest attendance timestamp.
    pub fn users(&self) -> Result<Vec<UserSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT u.identity, u.registered_at, u.email, u.department, u.role, u.image_path,
                    COUNT(a.date), MAX(a.timestamp)
             FROM users u LEFT JOIN attendance a ON a.identity = u.identity
             GROUP BY u.identity
             ORDER BY u.identity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserSummary {
                user: decode_user_row(row)?,
                days_present: row.get(6)?,
                last_seen: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a profile, its attendance history and its image.
    /// `None` if the identity is not enrolled.
    pub fn remove_user(&self, identity: &Identity) -> Result<Option<RemovedUser>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let image_path: Option<String> = tx
            .query_row(
                "SELECT image_path FROM users WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(image_path) = image_path else {
            return Ok(None);
        };

        let attendance_removed = tx.execute("DELETE FROM attendance WHERE identity = ?1", params![identity.as_str()])?;
        tx.execute("DELETE FROM users WHERE identity = ?1", params![identity.as_str()])?;
        tx.commit()?;

        match std::fs::remove_file(&image_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %image_path, error = %e, "failed to delete enrollment image"),
        }

        tracing::info!(identity = %identity, attendance_removed, "user deleted");
        Ok(Some(RemovedUser { attendance_removed }))
    }

    /// Record attendance unless `identity` already has a record for the
    /// local calendar day of `now`.
    pub fn mark_attendance(&self, identity: &Identity, confidence: f32, now: DateTime<Local>) -> Result<MarkOutcome> {
        let record = AttendanceRecord {
            identity: identity.clone(),
            date: now.date_naive(),
            timestamp: now.to_rfc3339(),
            confidence,
            method: METHOD_FACE_RECOGNITION.to_string(),
        };

        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO attendance (identity, date, timestamp, confidence, method)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.identity.as_str(),
                record.date.format(DATE_FORMAT).to_string(),
                record.timestamp,
                f64::from(record.confidence),
                record.method,
            ],
        )?;

        if inserted == 0 {
            tracing::info!(identity = %identity, date = %record.date, "attendance already marked");
            return Ok(MarkOutcome::AlreadyMarked);
        }
        tracing::info!(identity = %identity, confidence, "attendance marked");
        Ok(MarkOutcome::Marked(record))
    }

    /// Attendance records in time order, optionally restricted to one day.
    pub fn attendance(&self, on: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT identity, date, timestamp, confidence, method
             FROM attendance
             WHERE ?1 IS NULL OR date = ?1
             ORDER BY timestamp, identity",
        )?;
        let day = on.map(|d| d.format(DATE_FORMAT).to_string());
        let rows = stmt.query_map(params![day], decode_attendance_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent attendance records for one identity, newest first.
    pub fn user_attendance(&self, identity: &Identity, limit: usize) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT identity, date, timestamp, confidence, method
             FROM attendance
             WHERE identity = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![identity.as_str(), limit], decode_attendance_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of distinct days `identity` was marked present.
    pub fn attendance_days(&self, identity: &Identity) -> Result<u32> {
        let days = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM attendance WHERE identity = ?1",
            params![identity.as_str()],
            |row| row.get(0),
        )?;
        Ok(days)
    }

    /// Delete attendance records for `identity`; returns how many went.
    pub fn remove_attendance(&self, identity: &Identity, scope: AttendanceScope) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = match scope {
            AttendanceScope::Day(date) => conn.execute(
                "DELETE FROM attendance WHERE identity = ?1 AND date = ?2",
                params![identity.as_str(), date.format(DATE_FORMAT).to_string()],
            )?,
            AttendanceScope::All => {
                conn.execute("DELETE FROM attendance WHERE identity = ?1", params![identity.as_str()])?
            }
        };
        tracing::info!(identity = %identity, ?scope, removed, "attendance removed");
        Ok(removed)
    }

    fn image_path(&self, identity: &Identity) -> Result<Option<PathBuf>> {
        let path: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT image_path FROM users WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }
}

impl EnrollmentSource for ProfileStore {
    fn enrolled_identities(&self) -> std::result::Result<Vec<Identity>, SourceError> {
        self.identities().map_err(SourceError::new)
    }

    fn read_source_image(&self, identity: &Identity) -> std::result::Result<Option<Vec<u8>>, SourceError> {
        let Some(path) = self.image_path(identity).map_err(SourceError::new)? else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceError::new(e)),
        }
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
    identity TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL,
    email TEXT,
    department TEXT,
    role TEXT,
    image_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    identity TEXT NOT NULL,
    date TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    confidence REAL NOT NULL,
    method TEXT NOT NULL,
    PRIMARY KEY(identity, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
";

fn user_exists(conn: &Connection, identity: &Identity) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM users WHERE identity = ?1",
            params![identity.as_str()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn decode_identity(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Identity> {
    let raw: String = row.get(idx)?;
    Identity::parse(&raw).map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn decode_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let image_path: String = row.get(5)?;
    Ok(UserRecord {
        identity: decode_identity(row, 0)?,
        registered_at: row.get(1)?,
        email: row.get(2)?,
        department: row.get(3)?,
        role: row.get(4)?,
        image_path: PathBuf::from(image_path),
    })
}

fn decode_attendance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date_raw: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&date_raw, DATE_FORMAT)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err)))?;
    let confidence: f64 = row.get(3)?;
    Ok(AttendanceRecord {
        identity: decode_identity(row, 0)?,
        date,
        timestamp: row.get(2)?,
        confidence: confidence as f32,
        method: row.get(4)?,
    })
}
