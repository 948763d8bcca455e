//! Background sweep of due retry tickets.
//!
//! Workers poll the ticket table, claim due rows with `FOR UPDATE SKIP
//! LOCKED`, and drive the next attempt through the pipeline. A claim left
//! behind by a crashed worker becomes reclaimable once it is older than the
//! configured staleness window, so no event is stranded by a dead claimant.

use std::{
    sync::Arc,
    time::Duration,
};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use billhook_core::{Clock, EventStatus, RetryTicket};

use crate::{
    error::{PipelineError, Result},
    pipeline::{AttemptResult, ProcessingPipeline},
    storage::PipelineStorage,
};

/// Tuning knobs for the retry sweep.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent sweep workers.
    pub worker_count: usize,
    /// Maximum tickets claimed per sweep.
    pub batch_size: usize,
    /// How long a worker sleeps when no tickets are due.
    pub poll_interval: Duration,
    /// Age after which another worker may steal an unreleased claim.
    pub claim_staleness: chrono::Duration,
    /// How long shutdown waits for in-flight attempts.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            claim_staleness: chrono::Duration::minutes(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters accumulated across all sweep workers.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    /// Tickets claimed since start.
    pub tickets_claimed: u64,
    /// Attempts that succeeded during a sweep.
    pub retries_succeeded: u64,
    /// Attempts that failed transiently and were rescheduled.
    pub retries_rescheduled: u64,
    /// Events quarantined after exhausting their budget.
    pub dead_lettered: u64,
    /// Orphaned tickets deleted because the event row was gone.
    pub orphaned_tickets: u64,
}

/// Owns the sweep workers and their shared cancellation token.
pub struct RetryScheduler {
    storage: Arc<dyn PipelineStorage>,
    pipeline: Arc<ProcessingPipeline>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<SweepStats>>,
    cancellation_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl RetryScheduler {
    /// Creates a stopped scheduler. Call [`start`](Self::start) to spawn
    /// workers.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        pipeline: Arc<ProcessingPipeline>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            pipeline,
            config,
            clock,
            stats: Arc::new(RwLock::new(SweepStats::default())),
            cancellation_token: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Spawns the configured number of sweep workers.
    pub fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting retry scheduler"
        );

        for worker_id in 0..self.config.worker_count {
            let worker = SweepWorker {
                claimant: format!("sweep-{worker_id}-{}", Uuid::new_v4()),
                storage: self.storage.clone(),
                pipeline: self.pipeline.clone(),
                config: self.config.clone(),
                clock: self.clock.clone(),
                stats: self.stats.clone(),
                cancellation_token: self.cancellation_token.clone(),
            };
            self.workers.push(tokio::spawn(async move { worker.run().await }));
        }
    }

    /// Signals workers to stop and waits up to the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if workers do not drain within the timeout.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        info!(active_workers = self.workers.len(), "shutting down retry scheduler");
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.workers);
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "sweep worker panicked during shutdown");
                }
            }
        };

        tokio::time::timeout(self.config.shutdown_timeout, drain).await.map_err(|_| {
            PipelineError::internal(format!(
                "retry scheduler shutdown timed out after {:?}",
                self.config.shutdown_timeout
            ))
        })?;

        info!("retry scheduler stopped");
        Ok(())
    }

    /// Snapshot of the sweep counters.
    pub async fn stats(&self) -> SweepStats {
        self.stats.read().await.clone()
    }

    /// Claims and processes one batch synchronously, without spawning
    /// workers. Returns the number of tickets claimed.
    ///
    /// # Errors
    ///
    /// Returns storage errors from claiming or from the attempts themselves.
    pub async fn run_sweep_once(&self) -> Result<usize> {
        let worker = SweepWorker {
            claimant: format!("sweep-once-{}", Uuid::new_v4()),
            storage: self.storage.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
        };
        worker.sweep().await
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!(
                active_workers = self.workers.len(),
                "retry scheduler dropped without graceful shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
            for handle in self.workers.drain(..) {
                handle.abort();
            }
        }
    }
}

struct SweepWorker {
    claimant: String,
    storage: Arc<dyn PipelineStorage>,
    pipeline: Arc<ProcessingPipeline>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<SweepStats>>,
    cancellation_token: CancellationToken,
}

impl SweepWorker {
    async fn run(&self) {
        info!(claimant = %self.claimant, "sweep worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.sweep().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(claimed) => {
                    debug!(claimant = %self.claimant, claimed, "sweep batch complete");
                },
                Err(e) => {
                    error!(claimant = %self.claimant, error = %e, "sweep failed");
                    // Back off so a broken database does not spin the loop.
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(claimant = %self.claimant, "sweep worker stopped");
    }

    /// Claims one batch of due tickets and runs an attempt for each.
    async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let tickets = self
            .storage
            .claim_due_tickets(
                self.claimant.clone(),
                self.config.batch_size,
                self.config.claim_staleness,
                now,
            )
            .await?;
        let claimed = tickets.len();

        if claimed > 0 {
            self.stats.write().await.tickets_claimed += claimed as u64;
        }

        for ticket in tickets {
            if self.cancellation_token.is_cancelled() {
                // Release so another worker can pick it up immediately
                // instead of waiting out the staleness window.
                self.storage.release_claim(ticket.event_id, self.claimant.clone()).await?;
                continue;
            }

            if let Err(e) = self.retry_ticket(&ticket).await {
                error!(
                    event_id = %ticket.event_id,
                    error = %e,
                    "retry attempt errored, releasing claim"
                );
                self.storage.release_claim(ticket.event_id, self.claimant.clone()).await?;
            }
        }

        Ok(claimed)
    }

    async fn retry_ticket(&self, ticket: &RetryTicket) -> Result<()> {
        let Some(event) = self.storage.find_event(ticket.event_id).await? else {
            warn!(event_id = %ticket.event_id, "ticket references missing event, deleting");
            self.storage.delete_ticket(ticket.event_id).await?;
            self.stats.write().await.orphaned_tickets += 1;
            return Ok(());
        };

        // Terminal events can retain a ticket only through a crash between
        // the terminal write and the ticket delete. Clean it up here.
        if matches!(event.status, EventStatus::Succeeded | EventStatus::DeadLettered) {
            self.storage.delete_ticket(ticket.event_id).await?;
            return Ok(());
        }

        let attempt_number = ticket.attempts_so_far + 1;
        debug!(
            event_id = %ticket.event_id,
            attempt_number,
            claimant = %self.claimant,
            "retrying event"
        );

        match self.pipeline.execute_attempt(&event, attempt_number).await? {
            AttemptResult::Succeeded => {
                self.stats.write().await.retries_succeeded += 1;
            },
            AttemptResult::RetryScheduled { next_attempt_at } => {
                debug!(event_id = %ticket.event_id, %next_attempt_at, "rescheduled");
                self.stats.write().await.retries_rescheduled += 1;
            },
            AttemptResult::DeadLettered => {
                self.stats.write().await.dead_lettered += 1;
            },
        }
        Ok(())
    }
}
