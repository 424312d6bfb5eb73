//! Scoped variable storage for flow execution.
//!
//! Four scopes are visible to a running flow. Lookups resolve
//! loop > environment > custom > system; writes always land in the scope
//! the caller names.

pub mod errors;
pub mod store;
pub mod template;
pub mod value;

pub use errors::VariableError;
pub use store::{Scope, VariableChange, VariableLimits, VariableStore};
pub use value::{VarValue, TRUNCATION_MARKER};
