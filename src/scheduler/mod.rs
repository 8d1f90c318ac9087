// backupd/src/scheduler/mod.rs
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupOrchestrator, Initiator, RunResult};
use crate::config::SchedulerConfig;

/// Work performed once per scheduler tick.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run_cycle(&self);
}

#[async_trait]
impl ScheduledJob for BackupOrchestrator {
    async fn run_cycle(&self) {
        let outcome = self.backup(Initiator::Automatic).await;
        match &outcome.result {
            RunResult::Completed { message, .. } => {
                tracing::info!(artifact = %outcome.attempt.artifact_name, "scheduled backup completed: {}", message);
            }
            RunResult::Failed { reason, .. } => {
                tracing::error!(
                    artifact = %outcome.attempt.artifact_name,
                    reason = %reason,
                    "scheduled backup failed"
                );
            }
        }
    }
}

/// Fixed-interval driver for automatic backups.
///
/// Each cycle runs on its own task, so a panic that escapes the job surfaces
/// as a `JoinError` here and the loop carries on with the next interval.
/// Missed cycles are not backfilled.
pub struct BackupScheduler;

impl BackupScheduler {
    pub fn spawn<J: ScheduledJob>(
        job: Arc<J>,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !config.enabled || config.interval.is_zero() {
            tracing::info!("automatic backups disabled");
            return None;
        }
        let interval = config.interval;
        tracing::info!(interval_secs = interval.as_secs(), "automatic backups scheduled");
        Some(tokio::spawn(run_loop(job, interval, cancel)))
    }
}

async fn run_loop<J: ScheduledJob>(job: Arc<J>, interval: Duration, cancel: CancellationToken) {
    let mut cycle: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("backup scheduler received cancellation signal");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        cycle += 1;
        tracing::info!(cycle, "starting scheduled backup cycle");
        let job = Arc::clone(&job);
        let handle = tokio::spawn(async move { job.run_cycle().await });
        if let Err(e) = handle.await {
            tracing::error!(
                severity = "critical",
                cycle,
                panicked = e.is_panic(),
                error = %e,
                "scheduled backup cycle aborted unexpectedly"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        panic_on_first: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run_cycle(&self) {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && n == 0 {
                panic!("cycle blew up");
            }
        }
    }

    fn every(ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            interval: Duration::from_millis(ms),
        }
    }

    #[tokio::test]
    async fn test_disabled_scheduler_spawns_nothing() {
        let job = Arc::new(CountingJob::default());
        let config = SchedulerConfig {
            enabled: false,
            interval: Duration::from_secs(3600),
        };
        assert!(BackupScheduler::spawn(job, &config, CancellationToken::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_waits_a_full_interval() {
        let job = Arc::new(CountingJob::default());
        let cancel = CancellationToken::new();
        let handle = BackupScheduler::spawn(job.clone(), &every(1000), cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_does_not_stop_loop() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            panic_on_first: true,
        });
        let cancel = CancellationToken::new();
        let handle = BackupScheduler::spawn(job.clone(), &every(100), cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(job.runs.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop_between_cycles() {
        let job = Arc::new(CountingJob::default());
        let cancel = CancellationToken::new();
        let handle = BackupScheduler::spawn(job.clone(), &every(60_000), cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
