//! The cron-driven job loop.
//!
//! One job runs at a time: the loop parses the cron expression, sleeps
//! until the next tick, brackets the job with the ongoing/last-execution
//! timestamps, and exits the process on job failure (the supervisor
//! restarts it). The very first run — when the persisted state carries no
//! previous execution — starts immediately instead of waiting for a tick.
//!
//! Shutdown signals are handled by a separate task that flushes the state
//! manager and exits; the state mutex guarantees the flush cannot observe a
//! half-applied mutation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{error, info};

use bluepull_core::cron::CronSchedule;
use bluepull_core::state::StateManager;
use bluepull_core::Config;

use crate::integrations::IntegrationService;

pub struct JobScheduler {
    job_name: String,
    config: Arc<Config>,
    state_manager: Arc<StateManager>,
    service: Arc<dyn IntegrationService>,
}

impl JobScheduler {
    pub fn new(
        job_name: impl Into<String>,
        config: Arc<Config>,
        state_manager: Arc<StateManager>,
        service: Arc<dyn IntegrationService>,
    ) -> Self {
        JobScheduler {
            job_name: job_name.into(),
            config,
            state_manager,
            service,
        }
    }

    /// Runs the scheduling loop forever, or until a fatal error.
    pub async fn run(&self) -> Result<()> {
        info!(job = %self.job_name, "running the job scheduler");
        self.spawn_shutdown_handler();

        loop {
            // Re-parsed every iteration; a bad expression is fatal, not
            // silently skipped.
            let schedule = match CronSchedule::parse(&self.config.common.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(expression = %self.config.common.cron_expression, error = %e, "invalid cron expression");
                    return Err(anyhow!(e).context(format!(
                        "invalid cron expression: {:?}",
                        self.config.common.cron_expression
                    )));
                }
            };

            // First ever run starts immediately; afterwards wait for the
            // next tick.
            if self
                .state_manager
                .snapshot()
                .last_job_execution_end_time
                .is_some()
            {
                let now = Utc::now();
                let next_run = schedule.next_after(now).ok_or_else(|| {
                    anyhow!(
                        "cron expression never fires: {:?}",
                        self.config.common.cron_expression
                    )
                })?;
                info!(next_run = %next_run.to_rfc3339(), "next job scheduled");

                let wait = (next_run - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
            }

            self.state_manager
                .update_ongoing_job_start_time(Utc::now())
                .context("failed to record job start")?;
            info!(job = %self.job_name, "job started");

            let result = self.service.run_job().await;

            self.state_manager
                .update_last_job_execution_time(Utc::now())
                .context("failed to record job completion")?;
            info!(job = %self.job_name, "job completed");

            if let Err(e) = result {
                error!(job = %self.job_name, error = %format!("{e:#}"), "job execution failed");
                return Err(e.context(format!("job execution failed: {}", self.job_name)));
            }
            info!(job = %self.job_name, "job execution completed successfully");
        }
    }

    /// Flushes the persisted state and exits when the process is told to
    /// stop. Exit code 0 on a clean flush, 1 when the save fails.
    fn spawn_shutdown_handler(&self) {
        let state_manager = self.state_manager.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            info!("received shutdown signal, saving state");
            match state_manager.save() {
                Ok(()) => {
                    info!("state saved successfully before shutdown, exiting gracefully");
                    std::process::exit(0);
                }
                Err(e) => {
                    error!(error = %e, "failed to save state before shutdown");
                    std::process::exit(1);
                }
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler, falling back to Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
