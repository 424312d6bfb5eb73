//! browserflow host library
//!
//! Wires the policy center, scheduler and flow interpreter together behind
//! [`Engine`], and carries the process plumbing shared by the CLI and the
//! integration tests: tracing setup and policy discovery.

pub mod engine;
pub mod errors;
pub mod settings;
pub mod telemetry;

pub use engine::Engine;
pub use errors::EngineError;
pub use settings::{load_policy, policy_search_paths};
pub use telemetry::{init_tracing, TelemetryOptions};
