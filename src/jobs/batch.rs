//! The unit-of-work protocol every batch task follows.
//!
//! 1. Skip the batch if the job is gone or already terminal.
//! 2. Process items one by one, re-reading the job status every
//!    `checkpoint_interval` items; once the job is cancelled (or gone) the
//!    rest of the batch is recorded as cancelled.
//! 3. A failed or panicking item is counted as an error and the batch goes on.
//! 4. Results and tallies are committed in one IMMEDIATE transaction, the
//!    tallies through a single relative UPDATE.
//! 5. If that commit fails or panics, everything is rolled back and the whole
//!    batch is charged to `error_count` instead.
//!
//! A panic in `prepare` or `persist` is contained like a panic in `process`,
//! so the job's tallies still add up.

use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::error::JobError;
use crate::db::Database;

/// One kind of batch work.
pub trait BatchWork: Send {
    type Item: Send;
    type Output: Send;

    /// Load whatever the batch needs before the first item. An error here
    /// fails every item of the batch.
    fn prepare(&mut self, _db: &Database, _items: &[Self::Item]) -> Result<()> {
        Ok(())
    }

    /// Handle one item. `None` means the item failed; the failure is expected
    /// to have been logged already.
    fn process(&mut self, db: &Database, item: &Self::Item) -> Option<Self::Output>;

    /// Write the batch's side effects. Runs inside the commit transaction.
    ///
    /// Returns `false` if this task's result is already recorded, in which
    /// case the tallies are not applied a second time.
    fn persist(&mut self, db: &Database, job_id: &str, task_id: &str, outputs: Vec<Self::Output>) -> Result<bool>;
}

/// What happened to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The job was missing or terminal on entry; nothing was processed.
    Skipped,
    Committed {
        completed: u64,
        errors: u64,
        cancelled: u64,
    },
    /// A retry of a task whose result was already stored.
    Duplicate,
    /// The commit failed and was rolled back. `errors` is what could be
    /// charged to the job afterwards (zero if even that failed).
    RolledBack { errors: u64 },
    /// The job disappeared before the commit.
    Abandoned,
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    errors: u64,
    cancelled: u64,
}

fn is_job_not_found(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<JobError>(), Some(JobError::NotFound(_)))
}

/// Run one batch of `work` against `job_id`.
pub fn run_batch<W: BatchWork>(
    db: &Database,
    job_id: &str,
    task_id: &str,
    items: Vec<W::Item>,
    mut work: W,
    checkpoint_interval: usize,
) -> BatchOutcome {
    let batch_size = items.len() as u64;
    let checkpoint_interval = checkpoint_interval.max(1);

    match db.job_status(job_id) {
        Ok(Some(status)) if !status.is_terminal() => {}
        Ok(Some(status)) => {
            tracing::debug!(job_id, %status, "Job already finished, skipping batch");
            return BatchOutcome::Skipped;
        }
        Ok(None) => {
            tracing::debug!(job_id, "Job not found, skipping batch");
            return BatchOutcome::Skipped;
        }
        Err(e) => {
            tracing::error!(job_id, error = %e, "Could not read job status, skipping batch");
            return BatchOutcome::Skipped;
        }
    }

    let mut tally = Tally::default();
    let mut outputs = Vec::with_capacity(items.len());

    let prepared = catch_unwind(AssertUnwindSafe(|| work.prepare(db, &items)))
        .unwrap_or_else(|_| Err(anyhow!("Batch preparation panicked")));

    match prepared {
        Ok(()) => {
            for (index, item) in items.iter().enumerate() {
                if index > 0 && index % checkpoint_interval == 0 && stop_requested(db, job_id) {
                    tally.cancelled = (items.len() - index) as u64;
                    tracing::info!(job_id, remaining = tally.cancelled, "Job cancelled, stopping batch");
                    break;
                }

                match catch_unwind(AssertUnwindSafe(|| work.process(db, item))) {
                    Ok(Some(output)) => {
                        outputs.push(output);
                        tally.completed += 1;
                    }
                    Ok(None) => tally.errors += 1,
                    Err(_) => {
                        tracing::warn!(job_id, index, "Item processing panicked");
                        tally.errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(job_id, error = %format!("{e:#}"), batch_size, "Batch preparation failed");
            tally.errors = batch_size;
        }
    }

    // Unwinding drops the open transaction, which rolls it back
    let committed = catch_unwind(AssertUnwindSafe(|| {
        db.immediate(|db| -> Result<bool> {
            if db.job_status(job_id)?.is_none() {
                return Err(JobError::NotFound(job_id.to_string()).into());
            }
            if !work.persist(db, job_id, task_id, outputs)? {
                return Ok(false);
            }
            db.increment_job_counts(job_id, tally.completed, tally.errors, tally.cancelled)?;
            Ok(true)
        })
    }))
    .unwrap_or_else(|_| Err(anyhow!("Persisting the batch panicked")));

    match committed {
        Ok(true) => {
            tracing::info!(
                job_id,
                task_id,
                completed = tally.completed,
                errors = tally.errors,
                cancelled = tally.cancelled,
                "Batch committed"
            );
            BatchOutcome::Committed {
                completed: tally.completed,
                errors: tally.errors,
                cancelled: tally.cancelled,
            }
        }
        Ok(false) => {
            tracing::info!(job_id, task_id, "Batch result already recorded, not counting again");
            BatchOutcome::Duplicate
        }
        Err(e) if is_job_not_found(&e) => {
            tracing::info!(job_id, "Job deleted while batch was running");
            BatchOutcome::Abandoned
        }
        Err(e) => {
            tracing::error!(job_id, task_id, batch_size, error = %format!("{e:#}"), "Failed to persist batch, rolled back");
            match db.increment_job_counts(job_id, 0, batch_size, 0) {
                Ok(()) => BatchOutcome::RolledBack { errors: batch_size },
                Err(JobError::NotFound(_)) => BatchOutcome::Abandoned,
                Err(e) => {
                    tracing::error!(job_id, batch_size, error = %e, "Could not record batch errors");
                    BatchOutcome::RolledBack { errors: 0 }
                }
            }
        }
    }
}

/// Checkpoint read. Any terminal status, or a missing job, stops the batch.
fn stop_requested(db: &Database, job_id: &str) -> bool {
    match db.job_status(job_id) {
        Ok(Some(status)) => status.is_terminal(),
        Ok(None) => true,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Checkpoint read failed, continuing");
            false
        }
    }
}
