//! Executor glue: match, render, run, report.
//!
//! One call to [`Executor::handle`] fully disposes of a delivery: every
//! matched action executes and gets exactly one terminal report, and a
//! delivery no action matches gets the synthetic "no action configured"
//! failure so the control plane knows it was observed.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::Reporter;
use crate::exec::http::HttpRunner;
use crate::exec::matcher::matching_actions;
use crate::exec::script::ScriptRunner;
use crate::metrics;
use crate::model::action::{Action, ActionKind};
use crate::model::catalog::ActionCatalog;
use crate::model::delivery::Delivery;
use crate::model::execution::ExecutionResult;
use crate::render;

pub struct Executor {
    catalog: ActionCatalog,
    scripts: ScriptRunner,
    https: HttpRunner,
    reporter: Arc<Reporter>,
}

impl Executor {
    pub fn new(
        catalog: ActionCatalog,
        scripts: ScriptRunner,
        https: HttpRunner,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            catalog,
            scripts,
            https,
            reporter,
        }
    }

    /// Execute every action matching the delivery's event and report each
    /// outcome. Never fails; per-action errors become `failed` reports.
    pub async fn handle(&self, delivery: &Delivery, token: &CancellationToken) {
        if delivery.is_past_visibility(Utc::now()) {
            // The control plane has likely re-issued this delivery already;
            // it deduplicates by final status, so we still run and report.
            metrics::delivery_late();
            warn!(
                delivery_id = %delivery.delivery_id,
                deadline = %delivery.visibility_deadline,
                "Delivery dequeued past its visibility deadline"
            );
        }

        let matched = matching_actions(&self.catalog, &delivery.event);
        if matched.is_empty() {
            info!(
                delivery_id = %delivery.delivery_id,
                event_type = %delivery.event.event_type,
                "No matching action"
            );
            let result = ExecutionResult::no_matching_action(
                &delivery.delivery_id,
                &delivery.event.event_type,
            );
            self.send_report(&result).await;
            return;
        }

        for action in matched {
            let started = Instant::now();
            let result = self.execute(delivery, &action, token).await;
            metrics::execution_duration(action.kind.as_str(), started.elapsed().as_secs_f64());
            metrics::execution(action.kind.as_str(), result.status.as_str());
            self.send_report(&result).await;
        }
    }

    async fn execute(
        &self,
        delivery: &Delivery,
        action: &Action,
        token: &CancellationToken,
    ) -> ExecutionResult {
        match action.kind {
            ActionKind::Script => {
                match render::render_all(&action.parameters, &delivery.event) {
                    Ok(params) => {
                        self.scripts
                            .run(&delivery.delivery_id, action, &params, token)
                            .await
                    }
                    Err(err) => {
                        ExecutionResult::started(
                            &delivery.delivery_id,
                            &action.id,
                            action.display_name(),
                        )
                        .fail_with(1, err.to_string())
                    }
                }
            }
            ActionKind::Http => {
                let Some(spec) = action.http.as_ref() else {
                    return ExecutionResult::started(
                        &delivery.delivery_id,
                        &action.id,
                        action.display_name(),
                    )
                    .fail_with(1, format!("action '{}' has no http spec", action.id));
                };
                let body = match &spec.body {
                    Some(template) => match render::render(template, &delivery.event) {
                        Ok(body) => Some(body),
                        Err(err) => {
                            return ExecutionResult::started(
                                &delivery.delivery_id,
                                &action.id,
                                action.display_name(),
                            )
                            .fail_with(1, err.to_string());
                        }
                    },
                    None => None,
                };
                self.https
                    .run(&delivery.delivery_id, action, spec, body, token)
                    .await
            }
        }
    }

    async fn send_report(&self, result: &ExecutionResult) {
        let sent = if result.is_success() {
            self.reporter.complete(result).await
        } else {
            self.reporter.fail(result).await
        };
        if let Err(err) = sent {
            warn!(
                delivery_id = %result.delivery_id,
                action = %result.action_slug,
                error = %err,
                "Failed to report execution result"
            );
        }
    }
}
