//! Per-task execution log.
//!
//! Entries go to a bounded in-memory window (with per-step sub-windows) and,
//! when the mirror is enabled, to a JSON Lines file that keeps every entry.

pub mod config;
pub mod errors;
pub mod hot;
pub mod logger;
pub mod mirror;
pub mod model;

pub use config::{LoggerConfig, MirrorConfig};
pub use errors::LogError;
pub use logger::ExecutionLogger;
pub use mirror::read_mirror;
pub use model::{LogEntry, LogLevel, LogSummary, MirrorLine, TimerStats};
