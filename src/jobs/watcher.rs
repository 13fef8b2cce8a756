//! Completion watcher: marks a job COMPLETED once its counts add up, or
//! forces it there when the wait runs out.

use anyhow::Result;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::JobStatus;
use crate::config::JobsConfig;
use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    /// Sleep before the first poll.
    pub delay: Duration,
    pub poll_interval: Duration,
    /// How long to poll before forcing completion.
    pub max_wait: Duration,
}

impl WatchSettings {
    pub fn for_job(config: &JobsConfig, task_count: u64) -> Self {
        Self {
            delay: config.watch_delay(),
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait_for(task_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// All work accounted for; the watcher marked the job COMPLETED.
    Completed,
    /// Timed out and marked COMPLETED with whatever counts were persisted.
    Forced,
    Cancelled,
    /// The job was deleted.
    Missing,
    /// Someone else already moved the job to COMPLETED or FAILED.
    AlreadyTerminal,
}

/// Poll `job_id` until it finishes, blocking the calling thread.
pub fn watch(db: &Database, job_id: &str, settings: &WatchSettings) -> WatchOutcome {
    std::thread::sleep(settings.delay);
    let deadline = Instant::now() + settings.max_wait;

    loop {
        match db.get_job(job_id) {
            Ok(None) => return WatchOutcome::Missing,
            Ok(Some(job)) => match job.status {
                JobStatus::Cancelled => return WatchOutcome::Cancelled,
                JobStatus::Completed | JobStatus::Failed => return WatchOutcome::AlreadyTerminal,
                JobStatus::Pending | JobStatus::Running if job.processed() >= job.task_count => {
                    match db.finish_job(job_id, JobStatus::Completed) {
                        Ok(true) => {
                            tracing::info!(
                                job_id,
                                completed = job.completed_count,
                                errors = job.error_count,
                                cancelled = job.cancelled_count,
                                "Job completed"
                            );
                            return WatchOutcome::Completed;
                        }
                        Ok(false) => return settled(db, job_id),
                        Err(e) => tracing::warn!(job_id, error = %e, "Could not mark job completed, retrying"),
                    }
                }
                JobStatus::Pending | JobStatus::Running => {}
            },
            Err(e) => tracing::warn!(job_id, error = %e, "Could not read job"),
        }

        let now = Instant::now();
        if now >= deadline {
            return force_complete(db, job_id, settings.max_wait);
        }
        std::thread::sleep(settings.poll_interval.min(deadline - now));
    }
}

fn force_complete(db: &Database, job_id: &str, waited: Duration) -> WatchOutcome {
    let last = db.get_job(job_id).ok().flatten();
    match db.finish_job(job_id, JobStatus::Completed) {
        Ok(true) => {
            match last {
                Some(job) => tracing::warn!(
                    job_id,
                    waited_secs = waited.as_secs(),
                    task_count = job.task_count,
                    completed = job.completed_count,
                    errors = job.error_count,
                    cancelled = job.cancelled_count,
                    "Job did not finish in time, forcing completion"
                ),
                None => tracing::warn!(job_id, "Job did not finish in time, forcing completion"),
            }
            WatchOutcome::Forced
        }
        Ok(false) => settled(db, job_id),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Could not force job completion");
            WatchOutcome::AlreadyTerminal
        }
    }
}

/// The job left PENDING/RUNNING under our feet; report where it ended up.
fn settled(db: &Database, job_id: &str) -> WatchOutcome {
    match db.job_status(job_id) {
        Ok(None) => WatchOutcome::Missing,
        Ok(Some(JobStatus::Cancelled)) => WatchOutcome::Cancelled,
        _ => WatchOutcome::AlreadyTerminal,
    }
}

/// Run [`watch`] on its own thread with its own store handle.
pub fn spawn_completion_watch(
    db_path: PathBuf,
    job_id: String,
    settings: WatchSettings,
) -> Result<JoinHandle<Result<WatchOutcome>>> {
    let handle = std::thread::Builder::new()
        .name(format!("watch-{}", job_id.get(..8).unwrap_or(&job_id)))
        .spawn(move || {
            let db = Database::open(&db_path)?;
            Ok(watch(&db, &job_id, &settings))
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::jobs::JobData;

    fn settings(max_wait_ms: u64) -> WatchSettings {
        WatchSettings {
            delay: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    fn new_job(db: &Database, task_count: u64) -> String {
        db.insert_job(
            &JobData::DiscoverPeople {
                distance_threshold: 5.0,
                face_ids: Vec::new(),
            },
            task_count,
        )
        .unwrap()
    }

    #[test]
    fn test_completes_when_counts_saturate() {
        let t = TestDb::new();
        let job_id = new_job(&t.db, 3);
        t.db.increment_job_counts(&job_id, 2, 1, 0).unwrap();

        assert_eq!(watch(&t.db, &job_id, &settings(1000)), WatchOutcome::Completed);
        let job = t.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_empty_job_completes_straight_from_pending() {
        let t = TestDb::new();
        let job_id = new_job(&t.db, 0);
        assert_eq!(watch(&t.db, &job_id, &settings(1000)), WatchOutcome::Completed);
    }

    #[test]
    fn test_forces_stuck_job() {
        let t = TestDb::new();
        let job_id = new_job(&t.db, 10);
        t.db.increment_job_counts(&job_id, 4, 0, 0).unwrap();

        assert_eq!(watch(&t.db, &job_id, &settings(50)), WatchOutcome::Forced);
        let job = t.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_count, 4);
    }

    #[test]
    fn test_stops_on_cancel_and_missing() {
        let t = TestDb::new();
        let job_id = new_job(&t.db, 5);
        t.db.finish_job(&job_id, JobStatus::Cancelled).unwrap();
        assert_eq!(watch(&t.db, &job_id, &settings(50)), WatchOutcome::Cancelled);
        assert_eq!(t.db.job_status(&job_id).unwrap(), Some(JobStatus::Cancelled));

        assert_eq!(watch(&t.db, "gone", &settings(50)), WatchOutcome::Missing);
    }

    #[test]
    fn test_completion_from_another_connection() {
        let t = TestDb::new();
        let job_id = new_job(&t.db, 2);

        let handle = spawn_completion_watch(t.path(), job_id.clone(), settings(5000)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        t.db.increment_job_counts(&job_id, 2, 0, 0).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), WatchOutcome::Completed);
    }

    #[test]
    fn test_settings_scale_with_task_count() {
        let config = JobsConfig::default();
        let s = WatchSettings::for_job(&config, 10);
        assert_eq!(s.max_wait, Duration::from_secs(50));
        assert_eq!(s.poll_interval, Duration::from_secs(1));
    }
}
