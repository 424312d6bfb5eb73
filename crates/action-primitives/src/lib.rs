//! Actuator contract - the boundary between the flow engine and a browser
//!
//! This crate defines what the engine needs from a concrete automation binding:
//! - element location by css/xpath/text with an order index
//! - element actions (click, type, select, read) behind one `act` entry point
//! - navigation, script evaluation, screenshots and cookies
//! - page-level commands (tabs, history, scrolling) with defaulted support
//!
//! It also ships [`ScriptedActuator`], an in-memory page model that the engine's
//! tests and the CLI dry-run mode drive instead of a real browser.

pub mod actuator;
pub mod errors;
pub mod scripted;
pub mod types;

pub use actuator::*;
pub use errors::*;
pub use scripted::*;
pub use types::*;
