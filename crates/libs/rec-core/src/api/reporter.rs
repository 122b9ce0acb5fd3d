//! Two-phase status reporting.
//!
//! Every execution gets a best-effort `running` patch before it starts and
//! exactly one terminal patch (`completed` xor `failed`) when it ends. The
//! control plane treats patches as idempotent per delivery id, so a re-sent
//! terminal status is harmless; the executor never sends two.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::api::client::{ApiClient, DeliveryPatch};
use crate::error::Result;
use crate::metrics;
use crate::model::execution::{ExecutionResult, ExecutionStatus};

pub struct Reporter {
    client: Arc<ApiClient>,
}

impl Reporter {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Tell the control plane execution is about to begin. Failure here is
    /// logged by the caller and never blocks execution.
    pub async fn mark_running(&self, delivery_id: &str) -> Result<()> {
        let patch = DeliveryPatch {
            execution_status: ExecutionStatus::Running.as_str().to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        self.client.patch_delivery(delivery_id, &patch).await?;
        metrics::report("running");
        debug!(delivery_id, "Marked running");
        Ok(())
    }

    /// Report a successful execution.
    pub async fn complete(&self, result: &ExecutionResult) -> Result<()> {
        debug_assert_eq!(result.status, ExecutionStatus::Completed);
        self.report(result).await
    }

    /// Report a failed execution.
    pub async fn fail(&self, result: &ExecutionResult) -> Result<()> {
        debug_assert_eq!(result.status, ExecutionStatus::Failed);
        self.report(result).await
    }

    /// Send the terminal patch for a finished execution.
    async fn report(&self, result: &ExecutionResult) -> Result<()> {
        let patch = DeliveryPatch {
            execution_status: result.status.as_str().to_string(),
            execution_action_name: result.action_name.clone(),
            execution_action_id: result.action_slug.clone(),
            execution_exit_code: Some(result.exit_code),
            execution_stdout: result.stdout.clone(),
            execution_stderr: result.stderr.clone(),
            started_at: Some(result.started_at),
            completed_at: result.completed_at,
            failed_at: result.failed_at,
        };
        self.client
            .patch_delivery(&result.delivery_id, &patch)
            .await?;
        metrics::report(result.status.as_str());
        debug!(
            delivery_id = %result.delivery_id,
            action = %result.action_slug,
            status = result.status.as_str(),
            exit_code = result.exit_code,
            "Reported execution result"
        );
        Ok(())
    }
}
