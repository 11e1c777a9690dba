// Scheduled executor for periodic background tasks.
// Tasks may return a new delay to reschedule themselves (the analysis
// pipeline uses this for its adaptive cadence); returning None keeps the
// executor's base interval.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A trait for tasks that run periodically
pub trait ScheduledTask: Send + Sync + 'static {
    /// Execute the task.
    /// Returns Ok(Some(delay)) to override the delay until the next run,
    /// Ok(None) to keep the executor's base interval, Err on failure.
    fn run(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Duration>, anyhow::Error>> + Send + '_>>;

    /// Check if the task should terminate
    /// Default: never terminate (run forever)
    fn should_terminate(&self) -> bool {
        false
    }
}

/// Blanket implementation for Arc<T> where T: ScheduledTask
/// This allows passing Arc-wrapped tasks directly to the executor
impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Duration>, anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }
}

/// Scheduled executor for running periodic tasks
pub struct ScheduledExecutor {
    interval: Duration,
    task_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    /// Create a new scheduled executor
    ///
    /// # Arguments
    /// * `task_name` - Name of the task (for logging)
    /// * `interval` - Base interval between executions
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// Handle that can stop the executor from another task
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Start the scheduled task
    ///
    /// Runs the provided task periodically until `shutdown()` is flagged or
    /// the task's `should_terminate()` returns true. A tick that is still
    /// running when its next deadline passes simply delays the next tick;
    /// ticks never overlap.
    pub async fn start<T>(self, task: T)
    where
        T: ScheduledTask,
    {
        let task_name = self.task_name.clone();
        let base_interval_ms = self.interval.as_millis() as i64;
        let shutdown = self.shutdown;

        tracing::info!(
            "Starting scheduled task '{}' with interval: {:?}",
            task_name,
            self.interval
        );

        let mut next_execution = Utc::now().timestamp_millis() + base_interval_ms;

        loop {
            if shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                tracing::info!("Scheduled task '{}' is shutting down", task_name);
                break;
            }

            let now = Utc::now().timestamp_millis();

            if now >= next_execution {
                tracing::debug!("Executing scheduled task '{}'", task_name);

                let next_delay_ms = match task.run().await {
                    Ok(Some(delay)) => {
                        tracing::debug!(
                            "Scheduled task '{}' rescheduled itself in {:?}",
                            task_name,
                            delay
                        );
                        delay.as_millis() as i64
                    },
                    Ok(None) => base_interval_ms,
                    Err(e) => {
                        tracing::error!("Scheduled task '{}' failed: {}", task_name, e);
                        base_interval_ms
                    },
                };

                next_execution = Utc::now().timestamp_millis() + next_delay_ms;
            }

            let wait_ms = next_execution.saturating_sub(Utc::now().timestamp_millis());
            if wait_ms > 0 {
                // Re-check the shutdown flag at least once a second.
                sleep(Duration::from_millis(wait_ms.min(1000) as u64)).await;
            }
        }

        tracing::info!("Scheduled task '{}' stopped", task_name);
    }
}
