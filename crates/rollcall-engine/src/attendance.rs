//! Attendance store — durable, deduplicated per-day presence records.
//!
//! One row at most per (student, date, class, section) session key,
//! enforced by a UNIQUE constraint. Re-processing the same day updates the
//! existing row; it never duplicates and never downgrades confidence.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance store failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("attendance store is corrupt: {0}")]
    Corrupt(String),
}

/// Presence status for one session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            "Absent" => Ok(AttendanceStatus::Absent),
            other => Err(StoreError::Corrupt(format!("unknown status: {other}"))),
        }
    }
}

/// The tuple identifying one attendance slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub student_id: String,
    pub date: NaiveDate,
    pub class_id: String,
    pub section_id: String,
}

/// One durable attendance row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub date: NaiveDate,
    pub class_id: String,
    pub section_id: String,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

/// Derived statistics for one student; computed on demand, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceStats {
    /// Distinct (date, class, section) sessions recorded across the store.
    pub total_sessions: u64,
    pub present_count: u64,
    /// Present share of sessions, 0–100.
    pub percentage: f64,
}

/// Result of marking attendance for a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Created,
    Updated,
    Unchanged,
}

/// SQLite-backed attendance store.
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                date TEXT NOT NULL,
                class_id TEXT NOT NULL,
                section_id TEXT NOT NULL,
                status TEXT NOT NULL,
                confidence REAL NOT NULL,
                marked_at TEXT NOT NULL,
                UNIQUE(student_id, date, class_id, section_id)
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_student
                ON attendance(student_id, date);",
        )?;
        Ok(Self { conn })
    }

    /// Mark a student present for a session key.
    ///
    /// Unmarked key: a Present row is created. Existing row: updated only
    /// when the new confidence is strictly higher (keep best evidence) or
    /// the row was a materialized Absent; otherwise unchanged.
    pub fn mark_attendance(
        &mut self,
        key: &SessionKey,
        confidence: f32,
    ) -> Result<MarkOutcome, StoreError> {
        let date = key.date.to_string();
        let existing: Option<(String, f64)> = self
            .conn
            .query_row(
                "SELECT status, confidence FROM attendance
                 WHERE student_id = ?1 AND date = ?2 AND class_id = ?3 AND section_id = ?4",
                params![key.student_id, date, key.class_id, key.section_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let now = Utc::now().to_rfc3339();
        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO attendance
                        (student_id, date, class_id, section_id, status, confidence, marked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        key.student_id,
                        date,
                        key.class_id,
                        key.section_id,
                        AttendanceStatus::Present.as_str(),
                        confidence as f64,
                        now,
                    ],
                )?;
                tracing::info!(student_id = %key.student_id, date = %date, confidence, "attendance marked");
                Ok(MarkOutcome::Created)
            }
            Some((status, prior_confidence)) => {
                let was_absent = AttendanceStatus::parse(&status)? == AttendanceStatus::Absent;
                if !was_absent && confidence as f64 <= prior_confidence {
                    return Ok(MarkOutcome::Unchanged);
                }
                self.conn.execute(
                    "UPDATE attendance
                     SET status = ?1, confidence = ?2, marked_at = ?3
                     WHERE student_id = ?4 AND date = ?5 AND class_id = ?6 AND section_id = ?7",
                    params![
                        AttendanceStatus::Present.as_str(),
                        confidence as f64,
                        now,
                        key.student_id,
                        date,
                        key.class_id,
                        key.section_id,
                    ],
                )?;
                tracing::info!(student_id = %key.student_id, date = %date, confidence, "attendance upgraded");
                Ok(MarkOutcome::Updated)
            }
        }
    }

    /// Materialize Absent rows for enrolled students with no record for the
    /// session. Explicit end-of-session operation, never an implicit side
    /// effect of matching; existing rows (Present or Absent) are untouched.
    ///
    /// Returns the number of rows created.
    pub fn sweep_absent(
        &mut self,
        roster_ids: &[String],
        date: NaiveDate,
        class_id: &str,
        section_id: &str,
    ) -> Result<usize, StoreError> {
        let date = date.to_string();
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut created = 0;
        for student_id in roster_ids {
            created += tx.execute(
                "INSERT OR IGNORE INTO attendance
                    (student_id, date, class_id, section_id, status, confidence, marked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0.0, ?6)",
                params![
                    student_id,
                    date,
                    class_id,
                    section_id,
                    AttendanceStatus::Absent.as_str(),
                    now,
                ],
            )?;
        }
        tx.commit()?;
        tracing::info!(date = %date, class_id, section_id, created, "absent sweep");
        Ok(created)
    }

    /// Attendance statistics for one student, computed by scanning records.
    ///
    /// `total_sessions` is derived from the distinct session keys recorded
    /// across any student, so the denominator reflects every session the
    /// store knows about.
    pub fn stats(&self, student_id: &str) -> Result<AttendanceStats, StoreError> {
        let total_sessions: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT date, class_id, section_id FROM attendance)",
            [],
            |row| row.get(0),
        )?;
        let present_count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE student_id = ?1 AND status = 'Present'",
            params![student_id],
            |row| row.get(0),
        )?;
        let percentage = if total_sessions > 0 {
            present_count as f64 / total_sessions as f64 * 100.0
        } else {
            0.0
        };
        Ok(AttendanceStats {
            total_sessions,
            present_count,
            percentage,
        })
    }

    /// Full attendance history for a student, most recent first.
    pub fn history(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, date, class_id, section_id, status, confidence, marked_at
             FROM attendance
             WHERE student_id = ?1
             ORDER BY date DESC, marked_at DESC",
        )?;
        let rows = stmt.query_map(params![student_id], row_to_record)?;
        collect_records(rows)
    }

    /// All records for one calendar day.
    pub fn daily(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, date, class_id, section_id, status, confidence, marked_at
             FROM attendance
             WHERE date = ?1
             ORDER BY marked_at DESC",
        )?;
        let rows = stmt.query_map(params![date.to_string()], row_to_record)?;
        collect_records(rows)
    }

    /// Number of rows stored for a session key. Always 0 or 1.
    pub fn count_for_key(&self, key: &SessionKey) -> Result<u64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM attendance
             WHERE student_id = ?1 AND date = ?2 AND class_id = ?3 AND section_id = ?4",
            params![key.student_id, key.date.to_string(), key.class_id, key.section_id],
            |row| row.get(0),
        )?)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<(String, String, String, String, String, f64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<(String, String, String, String, String, f64, String)>>,
) -> Result<Vec<AttendanceRecord>, StoreError> {
    let mut records = Vec::new();
    for row in rows {
        let (student_id, date, class_id, section_id, status, confidence, marked_at) = row?;
        records.push(AttendanceRecord {
            student_id,
            date: date
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("bad date {date}: {e}")))?,
            class_id,
            section_id,
            status: AttendanceStatus::parse(&status)?,
            confidence: confidence as f32,
            marked_at: DateTime::parse_from_rfc3339(&marked_at)
                .map_err(|e| StoreError::Corrupt(format!("bad timestamp {marked_at}: {e}")))?
                .with_timezone(&Utc),
        });
    }
    Ok(records)
}
