//! # Model Layer
//!
//! Data structures flowing through the pipeline:
//!
//! - [`delivery::Delivery`] / [`delivery::Event`] — one control-plane-issued
//!   unit of work and its semantic payload
//! - [`action::Action`] — a statically-configured executable unit
//! - [`catalog::ActionCatalog`] — the validated, immutable set of actions
//!   loaded from the actions file at startup
//! - [`execution::ExecutionResult`] — the outcome reported back to the
//!   control plane
//!
//! The catalog is loaded once and never mutated; every other type is built
//! per delivery and dropped once its terminal report is out.

pub mod action;
pub mod catalog;
pub mod delivery;
pub mod execution;
