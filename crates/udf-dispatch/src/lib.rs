//! Table-driven dispatch of UDF runs.
//!
//! A [`RunRequest`] is normalized into one reference, one shape and one engine; together with the
//! mode these form a [`udf_core::DispatchKey`] which [`select_strategy`] maps to exactly one
//! [`StrategyId`]. Selection is pure and fails before any network call. [`DispatchRouter`] then
//! invokes the strategy: a realtime HTTP call through [`RealtimeClient`], a batch submission, or
//! the local [`udf_sandbox::Sandbox`].

pub mod client;
pub mod config;
pub mod console;
pub mod constants;
pub mod decode;
pub mod reference;
pub mod router;
pub mod select;

pub use client::RealtimeClient;
pub use config::RouterConfig;
pub use console::{CapturedConsole, ConsoleSink, StdConsole};
pub use decode::{DefaultDecoder, PayloadDecoder};
pub use reference::{RunRequest, UdfRef};
pub use router::{DispatchRouter, PendingRun, Run, RunOutcome};
pub use select::{resolve_shape, select_strategy, StrategyId};

/// Record a user-facing warning and log it.
pub(crate) fn warn(warnings: &mut Vec<String>, message: &str) {
    tracing::warn!(event = "udf.dispatch.warning", message);
    warnings.push(message.to_string());
}
