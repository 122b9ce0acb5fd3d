use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cap on captured stdout/stderr and HTTP response bodies. The agent never
/// buffers an unbounded child stream.
pub const OUTPUT_CAP: usize = 64 * 1024;

/// Marker appended when captured output hits [`OUTPUT_CAP`].
pub const TRUNCATION_SENTINEL: &str = "\n[output truncated]";

/// Exit code reported for a script killed on deadline (shell convention).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// Outcome of one action execution for one delivery.
///
/// `exit_code` is the child's exit code for script actions and the HTTP
/// status for http actions; transport failures keep 0 with the error text in
/// `stderr`. Exactly one of `completed_at` / `failed_at` is set once the
/// result is terminal.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub delivery_id: String,
    /// Empty for "no matching action" synthetic failures.
    pub action_slug: String,
    pub action_name: String,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// Begin a result for an execution that is about to run.
    pub fn started(delivery_id: &str, action_slug: &str, action_name: &str) -> Self {
        Self {
            delivery_id: delivery_id.to_string(),
            action_slug: action_slug.to_string(),
            action_name: action_name.to_string(),
            status: ExecutionStatus::Running,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }

    /// Finalize with the captured outcome. Success ⇔ `exit_code == 0` for
    /// scripts; http runners decide success before calling this.
    pub fn finish(mut self, success: bool, exit_code: i32, stdout: String, stderr: String) -> Self {
        self.exit_code = exit_code;
        self.stdout = bound_output(stdout);
        self.stderr = bound_output(stderr);
        if success {
            self.status = ExecutionStatus::Completed;
            self.completed_at = Some(Utc::now());
        } else {
            self.status = ExecutionStatus::Failed;
            self.failed_at = Some(Utc::now());
        }
        self
    }

    /// Fail with an error message in stderr, leaving stdout empty.
    pub fn fail_with(self, exit_code: i32, stderr: impl Into<String>) -> Self {
        self.finish(false, exit_code, String::new(), stderr.into())
    }

    /// Synthetic failure telling the control plane the delivery was observed
    /// but no configured action matched its event type.
    pub fn no_matching_action(delivery_id: &str, event_type: &str) -> Self {
        Self::started(delivery_id, "", "").fail_with(
            1,
            format!("No action configured for event type {event_type}"),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Truncate to [`OUTPUT_CAP`] bytes on a char boundary, marking the cut.
pub fn bound_output(mut output: String) -> String {
    if output.len() <= OUTPUT_CAP {
        return output;
    }
    let mut cut = OUTPUT_CAP;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_SENTINEL);
    output
}
