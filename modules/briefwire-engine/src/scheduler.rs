use std::future::Future;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Spawns and owns the recurring jobs. Firings are strictly sequential per
/// job; a firing due while the prior one still runs is skipped, not queued.
/// Cancellation lets in-flight firings finish and stops everything after.
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    /// Run `job` every `interval`. The first firing waits one full interval
    /// after registration.
    pub fn every<F, Fut>(&mut self, job_id: &str, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let cancel = self.cancel.clone();
        let job_id = job_id.to_string();

        let handle = tokio::spawn(async move {
            // First firing waits one full interval after registration.
            let mut next = tokio::time::Instant::now() + interval;

            info!(job = job_id, interval_secs = interval.as_secs(), "Interval job registered");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(job = job_id, "Interval job stopped");
                        break;
                    }
                    _ = tokio::time::sleep_until(next) => {
                        if let Err(e) = job().await {
                            error!(job = job_id, error = %e, "Job firing failed");
                        }
                        // Firings due while the job ran are dropped, not
                        // replayed: advance to the first deadline in the
                        // future.
                        let now = tokio::time::Instant::now();
                        while next <= now {
                            next += interval;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Run `job` at each wall-clock time in `times` (minute resolution),
    /// interpreted in `tz`.
    pub fn daily_at<F, Fut>(&mut self, job_id: &str, times: Vec<NaiveTime>, tz: Tz, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        if times.is_empty() {
            return;
        }
        let cancel = self.cancel.clone();
        let job_id = job_id.to_string();

        let handle = tokio::spawn(async move {
            info!(job = job_id, times = times.len(), tz = %tz, "Wall-clock job registered");
            loop {
                let wait = next_wall_clock_delay(&times, tz);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(job = job_id, "Wall-clock job stopped");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = job().await {
                            error!(job = job_id, error = %e, "Job firing failed");
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Wait for every job task to wind down. Meaningful after cancellation.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Time until the next configured wall-clock firing in `tz`. Always at
/// least one minute, so a firing never double-triggers within its minute.
fn next_wall_clock_delay(times: &[NaiveTime], tz: Tz) -> Duration {
    let now = Utc::now().with_timezone(&tz);
    let today = now.date_naive();

    let mut best: Option<chrono::DateTime<Tz>> = None;
    for time in times {
        for day_offset in 0..2 {
            let date = today + chrono::Duration::days(day_offset);
            // Skipped local times (DST gaps) resolve to the next valid instant.
            if let Some(candidate) = date.and_time(*time).and_local_timezone(tz).earliest() {
                if candidate > now && best.map(|b| candidate < b).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }
    }

    let delay = best
        .map(|b| (b - now).to_std().unwrap_or(Duration::from_secs(60)))
        .unwrap_or(Duration::from_secs(24 * 3600));
    delay.max(Duration::from_secs(60))
}
