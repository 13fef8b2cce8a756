//! Durable background jobs.
//!
//! A job is a row in the store with a fixed `task_count`. Work is split into
//! batches that run on a bounded pool; each batch merges its tallies into the
//! row with one conditional relative UPDATE, and a completion watcher moves the
//! job to a terminal state.

pub mod batch;
pub mod error;
pub mod orchestrator;
pub mod tasks;
pub mod watcher;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use batch::{BatchOutcome, BatchWork};
pub use error::{JobError, JobResult};
pub use orchestrator::{Orchestrator, StartedJob};
pub use watcher::{WatchOutcome, WatchSettings};

use crate::db::Job;
use crate::faces::clustering::Cluster;
use crate::faces::similarity::FaceMatch;
use crate::library::{DuplicateGroup, OrganizePattern, RemovalAction};

/// Identifier of a single dispatched batch; doubles as its idempotency key.
pub type TaskId = String;

pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// Job lifecycle: `Pending -> Running -> {Completed, Cancelled, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed job payload. The variant determines the job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobData {
    ImportPhotos {
        media_dirs: Vec<PathBuf>,
    },
    IndexPhotos {
        thumbnail_dir: PathBuf,
    },
    AutoAssignFaces {
        person_id: i64,
        person_name: String,
        similarity_threshold: f32,
        face_ids: Vec<i64>,
    },
    DiscoverPeople {
        distance_threshold: f32,
        face_ids: Vec<i64>,
    },
    FindDuplicates {
        directories: Vec<PathBuf>,
    },
    RemoveDuplicates {
        paths: Vec<PathBuf>,
        action: RemovalAction,
    },
    OrganizePhotos {
        source_dir: PathBuf,
        destination_dir: PathBuf,
        pattern: OrganizePattern,
        keep_original: bool,
    },
}

impl JobData {
    pub fn name(&self) -> &'static str {
        match self {
            JobData::ImportPhotos { .. } => "import_photos",
            JobData::IndexPhotos { .. } => "index_photos",
            JobData::AutoAssignFaces { .. } => "auto_assign_faces",
            JobData::DiscoverPeople { .. } => "discover_people",
            JobData::FindDuplicates { .. } => "find_duplicates",
            JobData::RemoveDuplicates { .. } => "remove_duplicates",
            JobData::OrganizePhotos { .. } => "organize_photos",
        }
    }
}

/// Payload of a job result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResultData {
    Matches { matches: Vec<FaceMatch> },
    Clusters { clusters: Vec<Cluster> },
    Duplicates { groups: Vec<DuplicateGroup> },
}

/// What callers see when they ask about a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub task_count: u64,
    pub completed_count: u64,
    pub error_count: u64,
    pub cancelled_count: u64,
    pub progress_percent: f64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobView {
    pub fn processed(&self) -> u64 {
        self.completed_count + self.error_count + self.cancelled_count
    }

    /// Completed without every unit accounted for, i.e. finalised by the
    /// watcher's timeout.
    pub fn was_forced(&self) -> bool {
        self.status == JobStatus::Completed && self.processed() < self.task_count
    }
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let processed = job.completed_count + job.error_count + job.cancelled_count;
        let progress_percent = if job.task_count == 0 {
            100.0
        } else {
            (processed as f64 / job.task_count as f64 * 100.0).min(100.0)
        };

        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            status: job.status,
            task_count: job.task_count,
            completed_count: job.completed_count,
            error_count: job.error_count,
            cancelled_count: job.cancelled_count,
            progress_percent,
            created_at: job.created_at.clone(),
            started_at: job.started_at.clone(),
            completed_at: job.completed_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_data_is_tagged_by_kind() {
        let data = JobData::DiscoverPeople {
            distance_threshold: 5.0,
            face_ids: vec![1, 2],
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "discover_people");
        assert_eq!(data.name(), "discover_people");

        let back: JobData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_library_job_payloads() {
        let data = JobData::RemoveDuplicates {
            paths: vec![PathBuf::from("/a.jpg")],
            action: RemovalAction::Trash,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "remove_duplicates");
        assert_eq!(json["action"]["type"], "trash");

        let organize = r#"{"kind":"organize_photos","source_dir":"/in","destination_dir":"/out","pattern":"year_month_day","keep_original":true}"#;
        let back: JobData = serde_json::from_str(organize).unwrap();
        assert_eq!(back.name(), "organize_photos");
        assert!(matches!(
            back,
            JobData::OrganizePhotos {
                pattern: OrganizePattern::YearMonthDay,
                keep_original: true,
                ..
            }
        ));
    }

    #[test]
    fn test_payload_of_wrong_shape_is_rejected() {
        let bad = r#"{"kind":"auto_assign_faces","face_ids":[1]}"#;
        assert!(serde_json::from_str::<JobData>(bad).is_err());
    }

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
