//! Long-poll loop against the control plane.
//!
//! The poller is the only component that talks to `GET /deliveries`. It is
//! resilient by construction: transport errors back off and retry, a full
//! queue pauses consumption for one interval, and only cancellation ends
//! the loop.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rec_common::config::PollerConfig;

use crate::api::{ApiClient, Reporter};
use crate::metrics;
use crate::model::delivery::Delivery;
use crate::pipeline::backoff::Backoff;
use crate::pipeline::pool::WorkerPool;

/// Base delay for the failure backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct Poller {
    client: Arc<ApiClient>,
    reporter: Arc<Reporter>,
    pool: Arc<WorkerPool>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        client: Arc<ApiClient>,
        reporter: Arc<Reporter>,
        pool: Arc<WorkerPool>,
        config: PollerConfig,
    ) -> Self {
        Self {
            client,
            reporter,
            pool,
            config,
        }
    }

    /// Poll until cancelled. Never returns early on errors.
    pub async fn run(&self, token: CancellationToken) {
        let interval = Duration::from_millis(self.config.polling_wait_interval_ms);
        let mut backoff = Backoff::new(self.config.retry_backoff, BACKOFF_BASE);
        info!(
            max = self.config.max_number_of_messages,
            interval_ms = self.config.polling_wait_interval_ms,
            "Poller started"
        );

        loop {
            let fetched = tokio::select! {
                _ = token.cancelled() => break,
                fetched = self.client.fetch_deliveries(self.config.max_number_of_messages) => fetched,
            };

            match fetched {
                Ok(events) => {
                    backoff.reset();
                    if !events.is_empty() {
                        metrics::deliveries_received(events.len());
                        debug!(count = events.len(), "Claimed deliveries");
                    }
                    self.dispatch(events).await;
                }
                Err(err) => {
                    metrics::poll_error();
                    warn!(error = %err, "Delivery poll failed");
                    if self.config.retry_on_error {
                        // After max_retries consecutive failures the window
                        // restarts; the loop itself never gives up.
                        if backoff.failures() >= self.config.max_retries {
                            backoff.reset();
                        }
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Poller stopped");
    }

    /// Mark each claimed delivery running and hand it to the pool. A full
    /// queue abandons the rest of the batch; the control plane re-delivers
    /// them after the visibility window.
    async fn dispatch(&self, events: Vec<serde_json::Value>) {
        let visibility_deadline =
            Utc::now() + chrono::Duration::seconds(self.config.visibility_timeout_sec as i64);

        for value in events {
            let delivery = match Delivery::from_api_event(value, visibility_deadline) {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %err, "Skipping malformed delivery");
                    continue;
                }
            };

            if let Err(err) = self.reporter.mark_running(&delivery.delivery_id).await {
                warn!(
                    delivery_id = %delivery.delivery_id,
                    error = %err,
                    "Could not mark delivery running"
                );
            }

            let delivery_id = delivery.delivery_id.clone();
            if !self.pool.submit(delivery) {
                debug!(
                    delivery_id = %delivery_id,
                    "Queue full, abandoning rest of batch"
                );
                break;
            }
        }
    }
}
