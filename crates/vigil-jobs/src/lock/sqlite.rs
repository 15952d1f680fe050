//! SQLite lock registry.
//!
//! Several processes may open the same database file. A claim is one
//! conditional `INSERT`, so SQLite's write lock makes the check and the
//! write a single atomic step.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use super::{JobLockRepository, blocked_error, disabled_error};
use crate::error::JobsError;

/// How long a statement waits for another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock registry persisted in a SQLite database file.
pub struct SqliteJobLockRepository {
    conn: Mutex<Connection>,
}

impl SqliteJobLockRepository {
    /// Open or create the registry tables in the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobsError> {
        let path = path.as_ref();
        let conn = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "job lock registry initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, JobsError> {
        let conn = Self::init(Connection::open_in_memory()?)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: Connection) -> Result<Connection, JobsError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS running_jobs (
                job_type TEXT PRIMARY KEY,
                job_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS disabled_job_types (
                job_type TEXT PRIMARY KEY,
                comment TEXT
            );
            ",
        )?;
        Ok(conn)
    }

    /// Explain a refused claim. Only called after the insert changed nothing.
    fn refusal(
        conn: &Connection,
        job_type: &str,
        mutex_group: &[&str],
    ) -> Result<JobsError, JobsError> {
        let disabled: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM disabled_job_types WHERE job_type = ?1",
                params![job_type],
                |row| row.get(0),
            )
            .optional()?;
        if disabled.is_some() {
            return Ok(disabled_error(job_type));
        }

        let placeholders = vec!["?"; mutex_group.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT job_type FROM running_jobs WHERE job_type IN ({}) ORDER BY job_type",
            placeholders
        ))?;
        let blockers = stmt
            .query_map(params_from_iter(mutex_group.iter()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocked_error(job_type, &blockers))
    }
}

#[async_trait]
impl JobLockRepository for SqliteJobLockRepository {
    async fn mark_running_if_possible(
        &self,
        job_type: &str,
        job_id: &str,
        mutex_group: &HashSet<String>,
    ) -> Result<(), JobsError> {
        let mut group: Vec<&str> = mutex_group.iter().map(String::as_str).collect();
        if !group.contains(&job_type) {
            group.push(job_type);
        }
        group.sort_unstable();

        // ?1 = job type, ?2 = job id, ?3.. = mutex group
        let placeholders = (0..group.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO running_jobs (job_type, job_id)
             SELECT ?1, ?2
             WHERE NOT EXISTS (SELECT 1 FROM disabled_job_types WHERE job_type = ?1)
               AND NOT EXISTS (SELECT 1 FROM running_jobs WHERE job_type IN ({}))",
            placeholders
        );
        let values = [job_type, job_id]
            .into_iter()
            .chain(group.iter().copied());

        let conn = self.conn.lock();
        let inserted = conn.execute(&sql, params_from_iter(values))?;
        if inserted == 0 {
            return Err(Self::refusal(&conn, job_type, &group)?);
        }
        debug!(job_type, job_id, "marked job type as running");
        Ok(())
    }

    async fn clear_running(&self, job_type: &str) -> Result<(), JobsError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM running_jobs WHERE job_type = ?1",
            params![job_type],
        )?;
        Ok(())
    }

    async fn clear_running_if(&self, job_type: &str, job_id: &str) -> Result<bool, JobsError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM running_jobs WHERE job_type = ?1 AND job_id = ?2",
            params![job_type, job_id],
        )?;
        Ok(removed > 0)
    }

    async fn running_jobs(&self) -> Result<BTreeMap<String, String>, JobsError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT job_type, job_id FROM running_jobs")?;
        let running = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(running)
    }

    async fn disable(&self, job_type: &str, comment: Option<&str>) -> Result<(), JobsError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO disabled_job_types (job_type, comment) VALUES (?1, ?2)
             ON CONFLICT(job_type) DO UPDATE SET comment = excluded.comment",
            params![job_type, comment],
        )?;
        Ok(())
    }

    async fn enable(&self, job_type: &str) -> Result<(), JobsError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM disabled_job_types WHERE job_type = ?1",
            params![job_type],
        )?;
        Ok(())
    }

    async fn find_disabled(&self) -> Result<BTreeSet<String>, JobsError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT job_type FROM disabled_job_types")?;
        let disabled = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(disabled)
    }

    async fn disable_comment(&self, job_type: &str) -> Result<Option<String>, JobsError> {
        let conn = self.conn.lock();
        let comment: Option<Option<String>> = conn
            .query_row(
                "SELECT comment FROM disabled_job_types WHERE job_type = ?1",
                params![job_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(comment.flatten())
    }

    async fn delete_all(&self) -> Result<(), JobsError> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM running_jobs; DELETE FROM disabled_job_types;")?;
        Ok(())
    }

    async fn size(&self) -> Result<usize, JobsError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM running_jobs", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
