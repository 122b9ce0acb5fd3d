//! # rec-core: Event Pipeline for the Rootly Edge Connector
//!
//! `rec-core` contains the delivery pipeline that makes the edge connector
//! tick: the long-poll loop claiming deliveries from the control plane, the
//! bounded worker pool dispatching them, the action matcher, the script and
//! HTTP runners, the git-backed script source, and the result reporter.
//!
//! ## Architecture
//!
//! ```text
//! Poller ─▶ WorkerPool ─▶ Executor ─▶ { Matcher, ScriptRunner | HttpRunner, Reporter }
//!                                        │
//!                                        └─▶ GitSourceManager (script checkouts)
//! ```
//!
//! Everything is cancellable through a single [`tokio_util::sync::CancellationToken`]
//! threaded from the binary down to the runners. A single bad delivery,
//! action misconfiguration, or network blip never kills the agent.

/// Control-plane API client and result reporter.
pub mod api;

/// Error types and Result alias for rec-core operations.
pub mod error;

/// Script and HTTP execution, action matching, and the executor glue.
pub mod exec;

/// Metric names and registration helpers.
pub mod metrics;

/// Data models: deliveries, events, actions, execution results.
pub mod model;

/// Poller loop and worker pool.
pub mod pipeline;

/// Template rendering over delivery events.
pub mod render;

/// Git-backed script sources.
pub mod source;

// Re-export core types
pub use error::{Error, Result};
pub use model::action::{Action, ActionKind, SourceType};
pub use model::catalog::ActionCatalog;
pub use model::delivery::{Delivery, Event};
pub use model::execution::{ExecutionResult, ExecutionStatus};
