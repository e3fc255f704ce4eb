//! Self-poller: a node triggers its own poll endpoint on a fixed interval
//!
//! Going through HTTP instead of calling the scheduler directly keeps one
//! trigger path for both the built-in timer and external cron callers.

use std::time::Duration;

use reqwest::Client;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic POST to `{base_url}/poll`
#[derive(Debug, Clone)]
pub struct SelfPoller {
    poll_url: String,
    interval: Duration,
    http: Client,
}

impl SelfPoller {
    /// `base_url` is the trigger endpoint root, e.g. `http://127.0.0.1:8080/taskscheduler`
    pub fn new(base_url: &str, interval: Duration) -> Self {
        let http = Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_default();

        Self {
            poll_url: format!("{}/poll", base_url.trim_end_matches('/')),
            interval,
            http,
        }
    }

    pub fn poll_url(&self) -> &str {
        &self.poll_url
    }

    /// Poll until `shutdown` fires. The first poll happens one interval in.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(url = %self.poll_url, interval_secs = self.interval.as_secs(), "Starting self-poller");

        let period = self.interval.max(Duration::from_millis(100));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }

        info!("Self-poller stopped");
    }

    async fn poll_once(&self) {
        match self.http.post(&self.poll_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(status = %response.status(), "Self-poll completed");
            }
            Ok(response) => {
                warn!(status = %response.status(), url = %self.poll_url, "Self-poll rejected");
            }
            Err(e) => {
                warn!(error = %e, url = %self.poll_url, "Self-poll failed");
            }
        }
    }
}
