//! Job Store: durable job rows and their result payloads.
//!
//! Counts are only ever changed through [`Database::increment_job_counts`],
//! a single relative UPDATE whose WHERE clause keeps
//! `completed + error + cancelled <= task_count`.

use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::jobs::{JobData, JobError, JobResult, JobResultData, JobStatus, TaskId};

/// A job row as stored.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub task_count: u64,
    pub completed_count: u64,
    pub error_count: u64,
    pub cancelled_count: u64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Raw payload; decode with [`Job::data`].
    pub job_data: String,
}

impl Job {
    pub fn processed(&self) -> u64 {
        self.completed_count + self.error_count + self.cancelled_count
    }

    pub fn data(&self) -> JobResult<JobData> {
        Ok(serde_json::from_str(&self.job_data)?)
    }
}

#[derive(Debug, Clone)]
pub struct JobResultRow {
    pub id: i64,
    pub job_id: String,
    pub task_id: TaskId,
    pub result_data: String,
}

impl JobResultRow {
    pub fn data(&self) -> JobResult<JobResultData> {
        Ok(serde_json::from_str(&self.result_data)?)
    }
}

const JOB_COLUMNS: &str = "id, name, status, task_count, completed_count, error_count, \
     cancelled_count, created_at, started_at, completed_at, job_data";

fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status: String = row.get(2)?;
    let status = JobStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status {status:?}").into(),
        )
    })?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        task_count: row.get::<_, i64>(3)?.max(0) as u64,
        completed_count: row.get::<_, i64>(4)?.max(0) as u64,
        error_count: row.get::<_, i64>(5)?.max(0) as u64,
        cancelled_count: row.get::<_, i64>(6)?.max(0) as u64,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        job_data: row.get(10)?,
    })
}

fn to_sql_count(n: u64) -> JobResult<i64> {
    i64::try_from(n).map_err(|_| JobError::Invalid(format!("count {n} out of range")))
}

impl Database {
    /// Insert a new PENDING job and return its id.
    pub fn insert_job(&self, data: &JobData, task_count: u64) -> JobResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(data)?;
        self.conn.execute(
            "INSERT INTO jobs (id, name, status, task_count, job_data) VALUES (?, ?, 'pending', ?, ?)",
            params![id, data.name(), to_sql_count(task_count)?, payload],
        )?;
        Ok(id)
    }

    pub fn get_job(&self, job_id: &str) -> JobResult<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"),
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Current status only; `None` when the job does not exist.
    pub fn job_status(&self, job_id: &str) -> JobResult<Option<JobStatus>> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM jobs WHERE id = ?", [job_id], |row| row.get(0))
            .optional()?;
        Ok(status.and_then(|s| JobStatus::from_str(&s)))
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> JobResult<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?"
        ))?;
        let jobs = stmt
            .query_map([limit as i64], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Jobs still PENDING or RUNNING.
    pub fn unfinished_jobs(&self) -> JobResult<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('pending', 'running') ORDER BY created_at, rowid"
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Add a batch's tallies to the job.
    ///
    /// Moves PENDING to RUNNING and stamps `started_at` in the same statement.
    /// Fails with `NotFound` if the job is gone, and with `Invalid` if the
    /// tallies would push the total past `task_count`.
    pub fn increment_job_counts(
        &self,
        job_id: &str,
        completed: u64,
        errors: u64,
        cancelled: u64,
    ) -> JobResult<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE jobs
            SET completed_count = completed_count + ?1,
                error_count = error_count + ?2,
                cancelled_count = cancelled_count + ?3,
                status = CASE WHEN status = 'pending' THEN 'running' ELSE status END,
                started_at = COALESCE(started_at, CURRENT_TIMESTAMP)
            WHERE id = ?4
              AND completed_count + error_count + cancelled_count + ?1 + ?2 + ?3 <= task_count
            "#,
            params![
                to_sql_count(completed)?,
                to_sql_count(errors)?,
                to_sql_count(cancelled)?,
                job_id
            ],
        )?;

        if updated == 1 {
            return Ok(());
        }
        match self.get_job(job_id)? {
            None => Err(JobError::NotFound(job_id.to_string())),
            Some(job) => Err(JobError::Invalid(format!(
                "adding {completed}/{errors}/{cancelled} to job {job_id} would exceed task_count {} (at {})",
                job.task_count,
                job.processed()
            ))),
        }
    }

    /// Move an active job to a terminal status. Returns `false` if the job was
    /// not PENDING or RUNNING (or does not exist).
    pub fn finish_job(&self, job_id: &str, status: JobStatus) -> JobResult<bool> {
        if !status.is_terminal() {
            return Err(JobError::Invalid(format!(
                "{status} is not a terminal status"
            )));
        }
        let updated = self.conn.execute(
            r#"
            UPDATE jobs
            SET status = ?, completed_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
            params![status.as_str(), job_id],
        )?;
        Ok(updated == 1)
    }

    /// Remove a terminal job and its results.
    pub fn delete_job(&self, job_id: &str) -> JobResult<bool> {
        match self.job_status(job_id)? {
            None => Ok(false),
            Some(status) if !status.is_terminal() => Err(JobError::Invalid(format!(
                "job {job_id} is still {status}"
            ))),
            Some(_) => {
                let deleted = self.conn.execute("DELETE FROM jobs WHERE id = ?", [job_id])?;
                Ok(deleted == 1)
            }
        }
    }

    /// Store a batch result. Returns `false` if a result for `task_id` already
    /// exists, in which case nothing is written.
    pub fn insert_job_result(&self, job_id: &str, task_id: &str, data: &JobResultData) -> JobResult<bool> {
        let payload = serde_json::to_string(data)?;
        let inserted = self.conn.execute(
            r#"
            INSERT INTO job_results (job_id, task_id, result_data)
            VALUES (?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
            params![job_id, task_id, payload],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_job_results(&self, job_id: &str) -> JobResult<Vec<JobResultRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, task_id, result_data FROM job_results WHERE job_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([job_id], |row| {
                Ok(JobResultRow {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    task_id: row.get(2)?,
                    result_data: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::faces::similarity::FaceMatch;
    use std::path::PathBuf;

    fn import_data() -> JobData {
        JobData::ImportPhotos {
            media_dirs: vec![PathBuf::from("/photos")],
        }
    }

    #[test]
    fn test_new_job_is_pending() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 10).unwrap();

        let job = t.db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.name, "import_photos");
        assert_eq!(job.task_count, 10);
        assert_eq!(job.processed(), 0);
        assert!(job.started_at.is_none());
        assert_eq!(job.data().unwrap(), import_data());
    }

    #[test]
    fn test_increment_starts_job_and_accumulates() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 10).unwrap();

        t.db.increment_job_counts(&id, 5, 0, 0).unwrap();
        let other = t.reopen();
        other.increment_job_counts(&id, 3, 2, 0).unwrap();

        let job = t.db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert_eq!((job.completed_count, job.error_count, job.cancelled_count), (8, 2, 0));
    }

    #[test]
    fn test_increment_never_exceeds_task_count() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 4).unwrap();

        t.db.increment_job_counts(&id, 3, 0, 0).unwrap();
        let err = t.db.increment_job_counts(&id, 1, 1, 0).unwrap_err();
        assert!(matches!(err, JobError::Invalid(_)));

        let job = t.db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.processed(), 3);
    }

    #[test]
    fn test_increment_missing_job() {
        let t = TestDb::new();
        let err = t.db.increment_job_counts("nope", 1, 0, 0).unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[test]
    fn test_cancelled_status_survives_increment() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 10).unwrap();
        assert!(t.db.finish_job(&id, JobStatus::Cancelled).unwrap());

        t.db.increment_job_counts(&id, 5, 0, 5).unwrap();
        assert_eq!(t.db.job_status(&id).unwrap(), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_finish_only_from_active_states() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 1).unwrap();

        assert!(t.db.finish_job(&id, JobStatus::Completed).unwrap());
        assert!(!t.db.finish_job(&id, JobStatus::Cancelled).unwrap());
        assert_eq!(t.db.job_status(&id).unwrap(), Some(JobStatus::Completed));
        assert!(t.db.get_job(&id).unwrap().unwrap().completed_at.is_some());

        assert!(matches!(
            t.db.finish_job(&id, JobStatus::Running),
            Err(JobError::Invalid(_))
        ));
    }

    #[test]
    fn test_results_are_idempotent_per_task() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 1).unwrap();
        let data = JobResultData::Matches {
            matches: vec![FaceMatch {
                face_id: 7,
                similarity: 0.97,
            }],
        };

        assert!(t.db.insert_job_result(&id, "task-1", &data).unwrap());
        assert!(!t.db.insert_job_result(&id, "task-1", &data).unwrap());

        let rows = t.db.get_job_results(&id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data().unwrap(), data);
    }

    #[test]
    fn test_delete_requires_terminal_and_cascades() {
        let t = TestDb::new();
        let id = t.db.insert_job(&import_data(), 1).unwrap();
        t.db.insert_job_result(&id, "task-1", &JobResultData::Clusters { clusters: vec![] })
            .unwrap();

        assert!(matches!(t.db.delete_job(&id), Err(JobError::Invalid(_))));

        t.db.finish_job(&id, JobStatus::Completed).unwrap();
        assert!(t.db.delete_job(&id).unwrap());
        assert!(t.db.get_job(&id).unwrap().is_none());
        assert!(t.db.get_job_results(&id).unwrap().is_empty());
        assert!(!t.db.delete_job(&id).unwrap());
    }
}
