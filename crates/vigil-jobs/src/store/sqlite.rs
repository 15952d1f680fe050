//! SQLite job repository.
//!
//! Records live in `jobs`, messages in `job_messages` keyed by
//! `(job_id, seq)` so an append is a single insert. Timestamps are stored as
//! fixed-width RFC 3339 strings, which sort the same way as the instants.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, params};
use tracing::info;

use super::{JobRepository, ensure_id};
use crate::error::JobsError;
use crate::types::{JOB_DEAD_MESSAGE, JobInfo, JobMessage, JobStatus, Level};

/// How long a statement waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, job_type, hostname, started, last_updated, stopped, status";

/// Job repository persisted in a SQLite database file.
pub struct SqliteJobRepository {
    conn: Mutex<Connection>,
}

/// A `jobs` row before timestamps and status are parsed.
struct JobRow {
    id: String,
    job_type: String,
    hostname: String,
    started: String,
    last_updated: String,
    stopped: Option<String>,
    status: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            hostname: row.get(2)?,
            started: row.get(3)?,
            last_updated: row.get(4)?,
            stopped: row.get(5)?,
            status: row.get(6)?,
        })
    }
}

pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>, JobsError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| JobsError::Store(format!("invalid timestamp '{}': {}", s, e)))
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl SqliteJobRepository {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobsError> {
        let path = path.as_ref();
        let conn = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "job database initialized");
        Self::from_initialized(conn)
    }

    /// A private in-memory database, mostly useful for tests.
    pub fn open_in_memory() -> Result<Self, JobsError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn).and_then(Self::from_initialized)
    }

    fn init(conn: Connection) -> Result<Connection, JobsError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                hostname TEXT NOT NULL,
                started TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                stopped TEXT,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_started ON jobs(started);
            CREATE INDEX IF NOT EXISTS idx_jobs_type_started ON jobs(job_type, started);
            CREATE INDEX IF NOT EXISTS idx_jobs_running ON jobs(stopped, last_updated);

            CREATE TABLE IF NOT EXISTS job_messages (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                level TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (job_id, seq)
            );
            ",
        )?;
        Ok(conn)
    }

    fn from_initialized(conn: Connection) -> Result<Self, JobsError> {
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_messages(conn: &Connection, job_id: &str) -> Result<Vec<JobMessage>, JobsError> {
        let mut stmt = conn.prepare_cached(
            "SELECT level, text, timestamp FROM job_messages WHERE job_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(level, text, timestamp)| {
                Ok(JobMessage {
                    level: level.parse::<Level>().map_err(JobsError::Store)?,
                    text,
                    timestamp: parse_time(&timestamp)?,
                })
            })
            .collect()
    }

    fn decode(conn: &Connection, row: JobRow) -> Result<JobInfo, JobsError> {
        let messages = Self::load_messages(conn, &row.id)?;
        Ok(JobInfo {
            started: parse_time(&row.started)?,
            last_updated: parse_time(&row.last_updated)?,
            stopped: row.stopped.as_deref().map(parse_time).transpose()?,
            status: row.status.parse::<JobStatus>().map_err(JobsError::Store)?,
            id: row.id,
            job_type: row.job_type,
            hostname: row.hostname,
            messages,
        })
    }

    /// Rewrite the message list of `job` inside `tx`.
    fn replace_messages(tx: &Transaction<'_>, job: &JobInfo) -> Result<(), JobsError> {
        tx.execute("DELETE FROM job_messages WHERE job_id = ?1", params![job.id])?;
        let mut insert = tx.prepare_cached(
            "INSERT INTO job_messages (job_id, seq, level, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (seq, message) in job.messages.iter().enumerate() {
            insert.execute(params![
                job.id,
                limit(seq),
                message.level.as_str(),
                message.text,
                format_time(&message.timestamp),
            ])?;
        }
        Ok(())
    }

    /// Run a query selecting [`JOB_COLUMNS`] and decode every row.
    fn query_jobs<P: Params>(&self, sql: &str, params: P) -> Result<Vec<JobInfo>, JobsError> {
        let conn = self.conn.lock();
        let rows = {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.query_map(params, JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter()
            .map(|row| Self::decode(&conn, row))
            .collect()
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, JobsError> {
        ensure_id(&job)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, job_type, hostname, started, last_updated, stopped, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                job_type = excluded.job_type,
                hostname = excluded.hostname,
                started = excluded.started,
                last_updated = excluded.last_updated,
                stopped = excluded.stopped,
                status = excluded.status",
            params![
                job.id,
                job.job_type,
                job.hostname,
                format_time(&job.started),
                format_time(&job.last_updated),
                job.stopped.as_ref().map(format_time),
                job.status.as_str(),
            ],
        )?;
        Self::replace_messages(&tx, &job)?;
        tx.commit()?;
        Ok(job)
    }

    async fn update_if_running(&self, job: JobInfo) -> Result<bool, JobsError> {
        ensure_id(&job)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // The guarded update takes the write lock before anything else is read
        let updated = tx.execute(
            "UPDATE jobs SET hostname = ?2, last_updated = ?3, stopped = ?4, status = ?5
             WHERE id = ?1 AND stopped IS NULL",
            params![
                job.id,
                job.hostname,
                format_time(&job.last_updated),
                job.stopped.as_ref().map(format_time),
                job.status.as_str(),
            ],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        Self::replace_messages(&tx, &job)?;
        tx.commit()?;
        Ok(true)
    }

    async fn mark_dead_if_silent(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>, JobsError> {
        let now = format_time(&now);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // Right-hand sides see the old row, so stopped equals the new last_updated
        let marked = tx.execute(
            "UPDATE jobs
             SET status = ?2,
                 last_updated = max(last_updated, ?3),
                 stopped = max(last_updated, ?3)
             WHERE id = ?1 AND stopped IS NULL AND last_updated < ?4",
            params![id, JobStatus::Dead.as_str(), now, format_time(&cutoff)],
        )?;
        if marked == 0 {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO job_messages (job_id, seq, level, text, timestamp)
             SELECT ?1, COALESCE(MAX(seq), -1) + 1, ?2, ?3, ?4
             FROM job_messages WHERE job_id = ?1",
            params![id, Level::Warning.as_str(), JOB_DEAD_MESSAGE, now],
        )?;
        let row = tx.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            JobRow::from_row,
        )?;
        let job = Self::decode(&tx, row)?;
        tx.commit()?;
        Ok(Some(job))
    }

    async fn find_one(&self, id: &str) -> Result<Option<JobInfo>, JobsError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(|row| Self::decode(&conn, row)).transpose()
    }

    async fn find_all(&self, skip: usize, max_count: usize) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs ORDER BY started DESC, id DESC LIMIT ?1 OFFSET ?2",
                JOB_COLUMNS
            ),
            params![limit(max_count), limit(skip)],
        )
    }

    async fn find_latest_by(
        &self,
        job_type: &str,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE job_type = ?1
                 ORDER BY started DESC, id DESC LIMIT ?2",
                JOB_COLUMNS
            ),
            params![job_type, limit(max_count)],
        )
    }

    async fn find_latest_finished_by(
        &self,
        job_type: &str,
        status: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs
                 WHERE job_type = ?1 AND status = ?2 AND stopped IS NOT NULL
                 ORDER BY started DESC, id DESC LIMIT ?3",
                JOB_COLUMNS
            ),
            params![job_type, status.as_str(), limit(max_count)],
        )
    }

    async fn find_latest_finished_except(
        &self,
        job_type: &str,
        excluded: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs
                 WHERE job_type = ?1 AND status != ?2 AND stopped IS NOT NULL
                 ORDER BY started DESC, id DESC LIMIT ?3",
                JOB_COLUMNS
            ),
            params![job_type, excluded.as_str(), limit(max_count)],
        )
    }

    async fn find_latest_distinct(&self) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs j
                 WHERE j.id = (
                    SELECT latest.id FROM jobs latest
                    WHERE latest.job_type = j.job_type
                    ORDER BY latest.started DESC, latest.id DESC
                    LIMIT 1
                 )
                 ORDER BY started DESC, id DESC",
                JOB_COLUMNS
            ),
            [],
        )
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE job_type = ?1 ORDER BY started DESC, id DESC",
                JOB_COLUMNS
            ),
            params![job_type],
        )
    }

    async fn find_running_without_update_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, JobsError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE stopped IS NULL AND last_updated < ?1
                 ORDER BY started DESC, id DESC",
                JOB_COLUMNS
            ),
            params![format_time(&cutoff)],
        )
    }

    async fn find_status(&self, id: &str) -> Result<Option<JobStatus>, JobsError> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|s| s.parse::<JobStatus>().map_err(JobsError::Store))
            .transpose()
    }

    async fn append_message(&self, id: &str, message: JobMessage) -> Result<(), JobsError> {
        let timestamp = format_time(&message.timestamp);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // Both statements are conditional on the job existing
        tx.execute(
            "INSERT INTO job_messages (job_id, seq, level, text, timestamp)
             SELECT ?1,
                    (SELECT COALESCE(MAX(seq), -1) + 1 FROM job_messages WHERE job_id = ?1),
                    ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1)",
            params![id, message.level.as_str(), message.text, timestamp],
        )?;
        tx.execute(
            "UPDATE jobs SET last_updated = ?2 WHERE id = ?1 AND last_updated < ?2",
            params![id, timestamp],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn remove_if_stopped(&self, id: &str) -> Result<(), JobsError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND stopped IS NOT NULL",
            params![id],
        )?;
        if removed > 0 {
            tx.execute("DELETE FROM job_messages WHERE job_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), JobsError> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM job_messages; DELETE FROM jobs;")?;
        Ok(())
    }

    async fn size(&self) -> Result<usize, JobsError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
