//! Job submission, dispatch and control.
//!
//! The orchestrator never processes items itself. It creates the job row,
//! hands batches to a bounded rayon pool, and starts a completion watcher
//! thread. Every batch task opens its own store handle, which is dropped when
//! the task returns. Batches still queued or running are counted, so a caller
//! about to exit can wait for them with [`Orchestrator::wait_idle`].

use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::batch::{run_batch, BatchWork};
use super::tasks::{
    AutoAssignBatch, DiscoverBatch, FindDuplicatesBatch, ImportBatch, IndexBatch, OrganizeBatch, RemoveDuplicatesBatch,
};
use super::watcher::{spawn_completion_watch, WatchOutcome, WatchSettings};
use super::{new_task_id, JobData, JobResultData, JobStatus, JobView, TaskId};
use crate::config::Config;
use crate::db::{Database, PhotoStatus};
use crate::faces::centroids::refresh_person_embeddings;
use crate::faces::worker::Extraction;
use crate::library::{plan_organize, DuplicateGroup, OrganizePattern, RemovalAction};
use crate::scanner::discover_images;

pub type WatchHandle = JoinHandle<Result<WatchOutcome>>;

/// A job that has been created and dispatched.
pub struct StartedJob {
    pub job_id: String,
    pub task_count: u64,
    pub watcher: WatchHandle,
}

/// Number of dispatched batches that have not returned yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(Arc::clone(self))
    }

    fn wait_idle(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _idle = self
            .idle
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Released when the batch closure ends, even by unwinding.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct Orchestrator {
    db_path: PathBuf,
    config: Config,
    pool: rayon::ThreadPool,
    extraction: Extraction,
    in_flight: Arc<InFlight>,
}

impl Orchestrator {
    /// Make sure the store exists and start the worker pool.
    pub fn new(config: Config, extraction: Extraction) -> Result<Self> {
        Database::open_initialized(&config.db_path)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.jobs.workers)
            .thread_name(|i| format!("yearbook-worker-{i}"))
            .panic_handler(|_| tracing::error!("Batch task panicked"))
            .build()
            .context("Failed to start worker pool")?;

        Ok(Self {
            db_path: config.db_path.clone(),
            config,
            pool,
            extraction,
            in_flight: Arc::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh handle on the store for the calling thread.
    pub fn open_db(&self) -> Result<Database> {
        Database::open(&self.db_path)
    }

    pub fn create_job(&self, data: &JobData, task_count: u64) -> Result<String> {
        let job_id = self.open_db()?.insert_job(data, task_count)?;
        tracing::info!(job_id = %job_id, name = data.name(), task_count, "Created job");
        Ok(job_id)
    }

    /// Queue one batch on the worker pool. Returns the task id that keys the
    /// batch's result row.
    pub fn dispatch_batch<W>(&self, job_id: &str, items: Vec<W::Item>, work: W) -> TaskId
    where
        W: BatchWork + 'static,
        W::Item: 'static,
    {
        let task_id = new_task_id();
        let db_path = self.db_path.clone();
        let job_id = job_id.to_string();
        let checkpoint_interval = self.config.jobs.checkpoint_interval;
        let spawned_task_id = task_id.clone();
        let guard = self.in_flight.enter();

        self.pool.spawn(move || {
            let _guard = guard;
            match Database::open(&db_path) {
                Ok(db) => {
                    run_batch(&db, &job_id, &spawned_task_id, items, work, checkpoint_interval);
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %format!("{e:#}"), "Batch could not open the store");
                }
            }
        });

        task_id
    }

    /// Block until every dispatched batch has returned. A job can be terminal
    /// (cancelled, or forced by its watcher) while its batches still run.
    pub fn wait_idle(&self) {
        self.in_flight.wait_idle();
    }

    pub fn schedule_completion_watch(&self, job_id: &str, delay: Duration, max_wait: Duration) -> Result<WatchHandle> {
        let settings = WatchSettings {
            delay,
            poll_interval: self.config.jobs.poll_interval(),
            max_wait,
        };
        spawn_completion_watch(self.db_path.clone(), job_id.to_string(), settings)
    }

    fn watch_for(&self, job_id: &str, task_count: u64) -> Result<WatchHandle> {
        let settings = WatchSettings::for_job(&self.config.jobs, task_count);
        self.schedule_completion_watch(job_id, settings.delay, settings.max_wait)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobView>> {
        Ok(self.open_db()?.get_job(job_id)?.as_ref().map(JobView::from))
    }

    /// Request cancellation. Only PENDING and RUNNING jobs can be cancelled.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancelled = self.open_db()?.finish_job(job_id, JobStatus::Cancelled)?;
        if cancelled {
            tracing::info!(job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Remove a finished job and its results.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.open_db()?.delete_job(job_id)?)
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobView>> {
        Ok(self
            .open_db()?
            .list_jobs(limit)?
            .iter()
            .map(JobView::from)
            .collect())
    }

    pub fn job_results(&self, job_id: &str) -> Result<Vec<JobResultData>> {
        let rows = self.open_db()?.get_job_results(job_id)?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(row.data()?);
        }
        Ok(results)
    }

    fn start<W, F>(&self, data: JobData, items: Vec<W::Item>, batch_size: usize, mut make_work: F) -> Result<StartedJob>
    where
        W: BatchWork + 'static,
        W::Item: 'static,
        F: FnMut() -> W,
    {
        let task_count = items.len() as u64;
        let job_id = self.create_job(&data, task_count)?;

        let mut items = items.into_iter().peekable();
        let mut batches = 0;
        while items.peek().is_some() {
            let batch: Vec<W::Item> = items.by_ref().take(batch_size.max(1)).collect();
            self.dispatch_batch(&job_id, batch, make_work());
            batches += 1;
        }
        tracing::debug!(job_id = %job_id, batches, "Dispatched batches");

        let watcher = self.watch_for(&job_id, task_count)?;
        Ok(StartedJob {
            job_id,
            task_count,
            watcher,
        })
    }

    /// Walk the media directories and import every image found.
    pub fn start_import(&self) -> Result<StartedJob> {
        let media_dirs = self.config.library.media_dirs.clone();
        let files = self.images_under(&media_dirs);
        tracing::info!(files = files.len(), "Discovered images");

        let data = JobData::ImportPhotos { media_dirs };
        self.start(data, files, self.config.jobs.import_batch_size, || ImportBatch)
    }

    /// Extract metadata and faces for every photo still marked imported.
    pub fn start_index(&self) -> Result<StartedJob> {
        let photos = self.open_db()?.photos_with_status(PhotoStatus::Imported)?;
        let thumbnail_dir = self.config.library.thumbnail_dir.clone();
        let item_timeout = self.config.jobs.item_timeout();

        let data = JobData::IndexPhotos {
            thumbnail_dir: thumbnail_dir.clone(),
        };
        self.start(data, photos, self.config.jobs.index_batch_size, || {
            IndexBatch::new(self.extraction.clone(), thumbnail_dir.clone(), item_timeout)
        })
    }

    /// Score every unassigned face against one person.
    pub fn start_auto_assign(&self, person_id: i64, similarity_threshold: Option<f32>) -> Result<StartedJob> {
        let db = self.open_db()?;
        let Some(person) = db.get_person(person_id)? else {
            bail!("Person {person_id} not found");
        };
        let threshold = similarity_threshold.unwrap_or(self.config.faces.similarity_threshold);
        let face_ids: Vec<i64> = db.get_unassigned_faces()?.into_iter().map(|f| f.id).collect();
        drop(db);

        let data = JobData::AutoAssignFaces {
            person_id,
            person_name: person.name,
            similarity_threshold: threshold,
            face_ids: face_ids.clone(),
        };
        self.start(data, face_ids, self.config.jobs.auto_assign_batch_size, || {
            AutoAssignBatch::new(person_id, threshold)
        })
    }

    /// Cluster all unassigned faces in one unit of work.
    pub fn start_discovery(&self, distance_threshold: Option<f32>) -> Result<StartedJob> {
        let face_ids: Vec<i64> = self
            .open_db()?
            .get_unassigned_faces()?
            .into_iter()
            .map(|f| f.id)
            .collect();
        let distance_threshold = distance_threshold.unwrap_or(self.config.faces.distance_threshold);

        let data = JobData::DiscoverPeople {
            distance_threshold,
            face_ids: face_ids.clone(),
        };
        self.start(data, vec![face_ids], 1, || DiscoverBatch { distance_threshold })
    }

    fn images_under(&self, directories: &[PathBuf]) -> Vec<PathBuf> {
        let library = &self.config.library;
        discover_images(directories, &library.image_extensions, Some(&library.thumbnail_dir))
    }

    /// Look for visually identical images under `directories`, or under the
    /// media directories when none are given. Every file goes into a single
    /// batch so all of them are compared.
    pub fn start_find_duplicates(&self, directories: Vec<PathBuf>) -> Result<StartedJob> {
        let directories = if directories.is_empty() {
            self.config.library.media_dirs.clone()
        } else {
            directories
        };
        let files = self.images_under(&directories);
        if files.is_empty() {
            bail!("No images found to compare");
        }
        tracing::info!(files = files.len(), "Searching for duplicates");

        let batch_size = files.len();
        let data = JobData::FindDuplicates { directories };
        self.start(data, files, batch_size, || FindDuplicatesBatch)
    }

    /// The duplicate groups found by a finished search.
    pub fn duplicates_from_job(&self, job_id: &str) -> Result<Vec<DuplicateGroup>> {
        Ok(self
            .job_results(job_id)?
            .into_iter()
            .flat_map(|result| match result {
                JobResultData::Duplicates { groups } => groups,
                _ => Vec::new(),
            })
            .collect())
    }

    /// Trash, delete or move the given files.
    pub fn start_remove_duplicates(&self, paths: Vec<PathBuf>, action: RemovalAction) -> Result<StartedJob> {
        if paths.is_empty() {
            bail!("No files to remove");
        }
        let trash_dir = self.config.library.trash_dir.clone();

        let data = JobData::RemoveDuplicates {
            paths: paths.clone(),
            action: action.clone(),
        };
        self.start(data, paths, self.config.jobs.file_batch_size, || RemoveDuplicatesBatch {
            action: action.clone(),
            trash_dir: trash_dir.clone(),
        })
    }

    /// Sort the images under `source_dir` into dated folders under
    /// `destination_dir`, which defaults to `source_dir` itself.
    pub fn start_organize(
        &self,
        source_dir: &Path,
        destination_dir: Option<&Path>,
        pattern: OrganizePattern,
        keep_original: bool,
    ) -> Result<StartedJob> {
        if !source_dir.is_dir() {
            bail!("Source directory not found: {}", source_dir.display());
        }
        let destination_dir = destination_dir.unwrap_or(source_dir).to_path_buf();
        let source_dir = source_dir.to_path_buf();

        let files = self.images_under(std::slice::from_ref(&source_dir));
        if files.is_empty() {
            bail!("No images found in {}", source_dir.display());
        }
        let operations = plan_organize(&files, &destination_dir, pattern, keep_original);
        if operations.is_empty() {
            bail!("Every image in {} is already organized", source_dir.display());
        }
        tracing::info!(files = files.len(), operations = operations.len(), "Planned organize");

        let data = JobData::OrganizePhotos {
            source_dir: source_dir.clone(),
            destination_dir,
            pattern,
            keep_original,
        };
        self.start(data, operations, self.config.jobs.file_batch_size, || OrganizeBatch {
            source_root: source_dir.clone(),
        })
    }

    /// Startup sweep: give every PENDING or RUNNING job a watcher so jobs left
    /// behind by a crash still reach a terminal state. Jobs whose payload can
    /// no longer be decoded are marked FAILED.
    pub fn recover_unfinished_jobs(&self) -> Result<Vec<(String, WatchHandle)>> {
        let db = self.open_db()?;
        let mut watchers = Vec::new();

        for job in db.unfinished_jobs()? {
            if let Err(e) = job.data() {
                tracing::warn!(job_id = %job.id, error = %e, "Unreadable job payload, marking failed");
                db.finish_job(&job.id, JobStatus::Failed)?;
                continue;
            }
            tracing::info!(job_id = %job.id, name = %job.name, processed = job.processed(), task_count = job.task_count, "Watching unfinished job");
            let handle = self.watch_for(&job.id, job.task_count)?;
            watchers.push((job.id, handle));
        }

        Ok(watchers)
    }

    /// Drop photos whose file is gone, along with their faces and tags.
    pub fn delete_orphaned_photos(&self) -> Result<usize> {
        let db = self.open_db()?;
        db.immediate(|db| {
            let mut affected = BTreeSet::new();
            let mut deleted = 0;
            for (photo_id, path) in db.all_photo_paths()? {
                if path.exists() {
                    continue;
                }
                affected.extend(db.person_ids_for_photo(photo_id)?);
                if db.delete_photo(photo_id)? {
                    tracing::debug!(path = %path.display(), "Removed missing photo");
                    deleted += 1;
                }
            }
            for person_id in affected {
                refresh_person_embeddings(db, person_id)?;
            }
            Ok(deleted)
        })
    }

    /// Remove face thumbnails that no face refers to any more.
    pub fn delete_orphaned_thumbnails(&self) -> Result<usize> {
        let dir = &self.config.library.thumbnail_dir;
        if !dir.is_dir() {
            return Ok(0);
        }
        let referenced: HashSet<PathBuf> = self.open_db()?.thumbnail_paths()?.into_iter().collect();

        let mut deleted = 0;
        for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            let is_thumbnail = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("face_") && n.ends_with(".jpg"))
                .unwrap_or(false);
            if !is_thumbnail || referenced.contains(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove thumbnail"),
            }
        }
        Ok(deleted)
    }
}
