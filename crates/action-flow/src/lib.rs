//! Flow Orchestration Layer
//!
//! Flow documents, the static operation dispatch table, and the interpreter
//! that walks a flow's steps against an actuator with scoped variables,
//! recovery planning and a per-task execution log.

pub mod blocks;
pub mod condition;
pub mod errors;
pub mod handlers;
pub mod interpreter;
pub mod model;
pub mod operation;
pub mod result;

pub use blocks::BlockMap;
pub use errors::FlowError;
pub use handlers::{HandlerContext, StepOutput};
pub use interpreter::{FlowInterpreter, InterpreterLimits, Progress, ProgressCallback};
pub use model::{Condition, ConditionOperator, Flow, LoopConfig, Step};
pub use operation::{Operation, OperationKind};
pub use result::{ExecutionResult, StepResult, StepStatus};
