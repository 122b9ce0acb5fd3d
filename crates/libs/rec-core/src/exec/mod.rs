//! Execution layer.
//!
//! The [`executor::Executor`] is the glue: it matches an event to actions,
//! renders their templates, routes to the script or HTTP runner, and hands
//! each result to the reporter. The runners own the timeout and cancellation
//! discipline for their medium.

pub mod executor;
pub mod http;
pub mod matcher;
pub mod script;

pub use executor::Executor;
pub use http::HttpRunner;
pub use script::ScriptRunner;
