//! Resolution job worker
//!
//! Single polling loop: claim one queued job, resolve it inside its own unit
//! of work, record the terminal status, repeat. Any number of workers may
//! share one job table; claiming skips rows locked by other workers.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::engine::ResolutionEngine;
use crate::error::{ResolutionError, StoreError};
use crate::store::{JobQueue, UnitOfWork};
use crate::types::{ResolutionJob, ResolutionTally};

/// Result of one poll iteration
#[derive(Debug)]
pub enum PollOutcome {
    /// No queued job was available.
    Idle,
    Completed {
        job_id: Uuid,
        tally: ResolutionTally,
    },
    /// The job was claimed but failed; its writes were rolled back.
    Failed { job_id: Uuid, error: String },
}

/// Polls a [`JobQueue`] and runs claimed jobs through the engine
pub struct ResolutionWorker<Q: JobQueue> {
    queue: Q,
    engine: ResolutionEngine,
    config: WorkerConfig,
}

impl<Q: JobQueue> ResolutionWorker<Q> {
    pub fn new(queue: Q, engine: ResolutionEngine, config: WorkerConfig) -> Self {
        Self {
            queue,
            engine,
            config,
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Run the polling loop until `shutdown` carries `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            model = %self.engine.model_name(),
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "Resolution worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.poll_once().await {
                // Processed a job, immediately check for more
                Ok(PollOutcome::Completed { .. }) => continue,
                Ok(PollOutcome::Failed { .. }) => self.config.poll_interval,
                Ok(PollOutcome::Idle) => {
                    self.sweep_stale_jobs().await;
                    self.config.poll_interval
                }
                Err(e) => {
                    error!(error = %e, "Error polling resolution jobs");
                    self.config.error_backoff
                }
            };

            if !sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        info!("Resolution worker shutting down");
    }

    /// Claim and process at most one job.
    ///
    /// Errors from resolving a claimed job are recorded on the job and
    /// reported as [`PollOutcome::Failed`]; only failures of the claim itself
    /// or of recording the failure are returned as `Err`.
    pub async fn poll_once(&self) -> Result<PollOutcome, StoreError> {
        let Some(job) = self.queue.claim_next_job().await? else {
            debug!("No queued resolution jobs");
            return Ok(PollOutcome::Idle);
        };

        info!(job_id = %job.id, name = %job.name, dataset_id = %job.dataset_id, "Claimed job");

        match self.process(&job).await {
            Ok(tally) => {
                info!(job_id = %job.id, total = tally.total(), "Job completed");
                Ok(PollOutcome::Completed {
                    job_id: job.id,
                    tally,
                })
            }
            Err(e) => {
                let exc_info = e.to_string();
                warn!(job_id = %job.id, error = %exc_info, "Job failed");
                if !self.queue.fail_job(job.id, &exc_info).await? {
                    warn!(job_id = %job.id, "Job was no longer running when marking it failed");
                }
                Ok(PollOutcome::Failed {
                    job_id: job.id,
                    error: exc_info,
                })
            }
        }
    }

    async fn process(&self, job: &ResolutionJob) -> Result<ResolutionTally, ResolutionError> {
        let mut work = self.queue.begin_work().await?;
        match self.engine.run(&mut work, job).await {
            Ok(tally) => {
                work.complete_job(job.id, &tally).await?;
                Ok(tally)
            }
            Err(e) => {
                if let Err(rollback_err) = work.rollback().await {
                    error!(job_id = %job.id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn sweep_stale_jobs(&self) {
        let Some(older_than) = self.config.stale_job_after else {
            return;
        };
        match self.queue.fail_stale_jobs(older_than).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "Failed stale running jobs"),
            Err(e) => error!(error = %e, "Stale job sweep failed"),
        }
    }
}

/// Sleep for `pause` unless shutdown is signalled first. Returns `false` on
/// shutdown.
async fn sleep_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => true,
        changed = shutdown.changed() => {
            // A dropped sender also ends the loop
            changed.is_ok() && !*shutdown.borrow()
        }
    }
}
