//! Flow interpreter
//!
//! Walks a flow's flat step list with a program counter. Ordinary steps go
//! through the dispatch table inside the recovery loop; block markers are
//! resolved against the compiled [`BlockMap`] and a stack of loop frames.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use action_primitives::{Actuator, ElementHandle};
use browserflow_core_types::{StepId, TaskId};
use browserflow_execution_log::{ExecutionLogger, LogLevel};
use browserflow_policy_center::InterpreterPolicy;
use browserflow_variables::{Scope, VarValue, VariableStore};
use exception_policy::{AttemptContext, ErrorRecord, ExceptionPolicy, RecoveryOutcome, RecoveryReport};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocks::BlockMap;
use crate::condition::evaluate;
use crate::errors::FlowError;
use crate::handlers::{self, requested_wait, HandlerContext, Params, StepOutput};
use crate::model::{Condition, Flow, Step};
use crate::operation::OperationKind;
use crate::result::{ExecutionResult, StepResult, StepStatus};

/// Interpreter limits taken from the `interpreter` policy section.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterLimits {
    pub default_step_timeout: Duration,
    pub max_while_iterations: u32,
    pub max_element_loop: usize,
}

impl Default for InterpreterLimits {
    fn default() -> Self {
        Self::from(&browserflow_policy_center::default_snapshot().interpreter)
    }
}

impl From<&InterpreterPolicy> for InterpreterLimits {
    fn from(policy: &InterpreterPolicy) -> Self {
        Self {
            default_step_timeout: Duration::from_millis(policy.default_step_timeout_ms.max(1)),
            max_while_iterations: policy.max_while_iterations,
            max_element_loop: policy.max_element_loop.max(1),
        }
    }
}

/// Reported before each step starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub step_index: usize,
    pub total_steps: usize,
    /// 0-100
    pub percent: u8,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Where the program counter goes next
enum Flowing {
    Next,
    Jump(usize),
    Halt,
}

enum LoopSource {
    Elements(Vec<ElementHandle>),
    Count(u64),
    Data(Vec<Value>),
    While { condition: Condition, max_iterations: u32 },
}

struct LoopFrame {
    start: usize,
    end: usize,
    iteration: usize,
    item_variable: String,
    index_variable: String,
    source: LoopSource,
}

impl LoopFrame {
    /// Iterations known up front; `None` for while loops.
    fn bound(&self) -> Option<usize> {
        match &self.source {
            LoopSource::Elements(handles) => Some(handles.len()),
            LoopSource::Count(count) => Some(*count as usize),
            LoopSource::Data(items) => Some(items.len()),
            LoopSource::While { .. } => None,
        }
    }

    fn item(&self) -> Value {
        match &self.source {
            LoopSource::Elements(handles) => handles
                .get(self.iteration)
                .map(|handle| Value::String(handle.id.clone()))
                .unwrap_or(Value::Null),
            LoopSource::Data(items) => items.get(self.iteration).cloned().unwrap_or(Value::Null),
            LoopSource::Count(_) | LoopSource::While { .. } => Value::from(self.iteration + 1),
        }
    }

    fn current_element(&self) -> Option<&ElementHandle> {
        match &self.source {
            LoopSource::Elements(handles) => handles.get(self.iteration),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RunState {
    frames: Vec<LoopFrame>,
    results: Vec<StepResult>,
    errors: Vec<ErrorRecord>,
    stopped_by_step: bool,
    failure: Option<String>,
}

impl RunState {
    fn current_element(&self) -> Option<ElementHandle> {
        self.frames
            .iter()
            .rev()
            .find_map(LoopFrame::current_element)
            .cloned()
    }
}

/// Runs flows against one actuator, variable store, recovery policy and log.
///
/// Each task owns its own interpreter; none of these parts are shared
/// between tasks.
pub struct FlowInterpreter {
    actuator: Arc<dyn Actuator>,
    variables: Arc<VariableStore>,
    recovery: Arc<ExceptionPolicy>,
    logger: Arc<ExecutionLogger>,
    limits: InterpreterLimits,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl FlowInterpreter {
    /// Interpreter with default limits, an in-memory log and a fresh store.
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            variables: Arc::new(VariableStore::default()),
            recovery: Arc::new(ExceptionPolicy::default()),
            logger: Arc::new(ExecutionLogger::in_memory(TaskId::new())),
            limits: InterpreterLimits::default(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_variables(mut self, variables: Arc<VariableStore>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<ExceptionPolicy>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_logger(mut self, logger: Arc<ExecutionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_limits(mut self, limits: InterpreterLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    pub fn recovery(&self) -> &Arc<ExceptionPolicy> {
        &self.recovery
    }

    pub fn logger(&self) -> &Arc<ExecutionLogger> {
        &self.logger
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `flow` to completion, cancellation or a stopping failure.
    ///
    /// Only a structurally invalid flow or a rejected declared variable is
    /// returned as `Err`; every step fault ends up in the result.
    pub async fn run(&self, flow: &Flow) -> Result<ExecutionResult, FlowError> {
        let blocks = flow.validate()?;
        let started = Instant::now();
        let total = flow.steps.len();
        let execution = self.variables.begin_execution();
        for (name, value) in &flow.variables {
            self.variables.set(name, value.clone(), Scope::Custom)?;
        }

        info!(
            task_id = %self.logger.task_id(),
            flow = %flow.name,
            steps = total,
            execution,
            "flow started"
        );
        self.note(
            LogLevel::Info,
            format!("flow '{}' started", flow.name),
            None,
            json!({ "steps": total, "execution": execution }),
        );
        if let Err(err) = self.logger.start_timer("flow") {
            warn!(error = %err, "flow timer not started");
        }

        let mut state = RunState::default();
        let mut cancelled = false;
        let mut last_step_index = None;
        let mut pc = 0;

        while pc < total {
            if self.cancel.is_cancelled() {
                cancelled = true;
                info!(task_id = %self.logger.task_id(), step = pc, "flow cancelled between steps");
                self.note(LogLevel::Warn, "flow cancelled", None, json!({ "next_step": pc }));
                break;
            }

            let step = &flow.steps[pc];
            last_step_index = Some(pc);
            self.report_progress(pc, total);

            let flowing = match step.kind() {
                Some(kind) if kind.is_control() => {
                    self.run_control(&mut state, &flow.steps, &blocks, pc, kind).await
                }
                kind => self.run_action(&mut state, pc, step, kind).await,
            };
            match flowing {
                Flowing::Next => pc += 1,
                Flowing::Jump(target) => pc = target,
                Flowing::Halt => break,
            }
        }

        // frames left open by a stop or cancellation
        while state.frames.pop().is_some() {
            self.variables.pop_loop_layer();
        }

        if let Err(err) = self.logger.stop_timer("flow") {
            debug!(error = %err, "flow timer not running");
        }

        let success = !cancelled && state.failure.is_none();
        let completed_step_count = state
            .results
            .iter()
            .filter(|result| matches!(result.status, StepStatus::Succeeded | StepStatus::Handled))
            .count();
        let error = state
            .failure
            .clone()
            .or_else(|| cancelled.then(|| "cancelled".to_string()));

        self.note(
            if success { LogLevel::Info } else { LogLevel::Warn },
            format!("flow '{}' finished", flow.name),
            None,
            json!({
                "success": success,
                "cancelled": cancelled,
                "completed_steps": completed_step_count,
                "errors": state.errors.len(),
            }),
        );
        info!(
            task_id = %self.logger.task_id(),
            flow = %flow.name,
            success,
            cancelled,
            completed = completed_step_count,
            "flow finished"
        );

        Ok(ExecutionResult {
            flow_name: flow.name.clone(),
            success,
            cancelled,
            stopped_by_step: state.stopped_by_step,
            completed_step_count,
            total_steps: total,
            last_step_index,
            variables: self
                .variables
                .snapshot()
                .into_iter()
                .map(|(name, value)| (name, value.to_json()))
                .collect(),
            log_summary: Some(self.logger.summary()),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            step_results: state.results,
            errors: state.errors,
        })
    }

    fn report_progress(&self, index: usize, total: usize) {
        if let Some(callback) = &self.progress {
            let percent = if total == 0 { 100 } else { (index * 100 / total) as u8 };
            callback(Progress {
                step_index: index,
                total_steps: total,
                percent,
            });
        }
    }

    fn note(&self, level: LogLevel, message: impl Into<String>, step_id: Option<&StepId>, data: Value) {
        if let Err(err) = self.logger.log(level, message, step_id, Some(data)) {
            warn!(task_id = %self.logger.task_id(), error = %err, "execution log rejected entry");
        }
    }

    /// Run `operation` under the step's recovery preference, restarting the
    /// actuator first when the previous plan asked for it.
    async fn attempt<T, F, Fut>(&self, step: &Step, mut operation: F) -> RecoveryReport<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        let actuator = &*self.actuator;
        let step_id = step.step_id();
        self.recovery
            .execute_with_recovery(&step_id, step.on_error, step.retry_count, |context| {
                let pending = operation(context);
                let step_id = &step_id;
                async move {
                    if context.attempt > 1 {
                        debug!(step = %step_id, attempt = context.attempt, "retrying step");
                    }
                    if context.restart_requested {
                        info!(step = %step_id, "restarting actuator before retry");
                        actuator.restart().await?;
                    }
                    pending.await
                }
            })
            .await
    }

    /// Turn a recovery report into a step result; errors are kept on the run.
    fn settle<T>(
        &self,
        state: &mut RunState,
        index: usize,
        step: &Step,
        report: RecoveryReport<T>,
        started: Instant,
    ) -> (StepResult, Option<T>) {
        let RecoveryReport {
            outcome,
            attempts,
            errors,
        } = report;
        state.errors.extend(errors);

        let (status, value, error) = match outcome {
            RecoveryOutcome::Success(value) => (StepStatus::Succeeded, Some(value), None),
            RecoveryOutcome::FailedSkipped(record) => (StepStatus::FailedSkipped, None, Some(record)),
            RecoveryOutcome::FailedContinued(record) => (StepStatus::FailedContinued, None, Some(record)),
            RecoveryOutcome::FailedStopped(record) => (StepStatus::FailedStopped, None, Some(record)),
        };

        let mut result = StepResult::new(&step.id, index, step.operation.name(), status);
        result.attempts = attempts;
        result.duration_ms = started.elapsed().as_millis() as u64;
        if let Some(record) = &error {
            result.message = record.message.clone();
            if status == StepStatus::FailedStopped {
                state.failure = Some(format!("step '{}' failed: {}", step.id, record.message));
            }
        }
        result.error = error;
        (result, value)
    }

    fn record(&self, state: &mut RunState, result: StepResult) {
        let level = match result.status {
            StepStatus::Succeeded | StepStatus::ConditionFalse | StepStatus::Handled => LogLevel::Info,
            StepStatus::FailedSkipped | StepStatus::FailedContinued => LogLevel::Warn,
            StepStatus::FailedStopped => LogLevel::Error,
        };
        let step_id = StepId::from(result.step_id.as_str());
        self.note(
            level,
            format!("{} [{}]: {}", result.step_id, result.operation, result.message),
            Some(&step_id),
            json!({
                "status": result.status,
                "attempts": result.attempts,
                "duration_ms": result.duration_ms,
                "data": result.data,
            }),
        );
        state.results.push(result);
    }

    /// Status to control flow for a step that is not a block marker.
    fn after(status: StepStatus) -> Flowing {
        if status.is_tolerated() {
            Flowing::Next
        } else {
            Flowing::Halt
        }
    }

    async fn run_action(
        &self,
        state: &mut RunState,
        index: usize,
        step: &Step,
        kind: Option<OperationKind>,
    ) -> Flowing {
        let started = Instant::now();
        let element = state.current_element();
        let element = element.as_ref();
        let report = self
            .attempt(step, move |_| self.perform(step, kind, element))
            .await;

        let (mut result, output) = self.settle(state, index, step, report, started);
        match output {
            Some(Some(output)) => {
                result.message = output.message;
                result.data = output.data;
                if output.stop {
                    state.stopped_by_step = true;
                    self.record(state, result);
                    return Flowing::Halt;
                }
            }
            Some(None) => {
                result.status = StepStatus::ConditionFalse;
                result.message = "condition not met, step skipped".to_string();
            }
            None => {}
        }
        let flowing = Self::after(result.status);
        self.record(state, result);
        flowing
    }

    /// One attempt of an ordinary step. `Ok(None)` means its guard was false.
    async fn perform(
        &self,
        step: &Step,
        kind: Option<OperationKind>,
        element: Option<&ElementHandle>,
    ) -> Result<Option<StepOutput>, FlowError> {
        if let Some(condition) = &step.condition {
            if !evaluate(condition, &self.variables)? {
                return Ok(None);
            }
        }
        let handler = kind
            .and_then(handlers::lookup)
            .ok_or_else(|| FlowError::UnsupportedOperation(step.operation.name().to_string()))?;

        let params = self.variables.resolve_params(&step.parameters);
        let timeout = self.step_timeout(step, kind, &params);
        let ctx = HandlerContext {
            step,
            params: &params,
            actuator: &*self.actuator,
            variables: &self.variables,
            logger: &self.logger,
            limits: &self.limits,
            current_element: element,
            timeout,
        };

        let output = match tokio::time::timeout(timeout, handler(&ctx)).await {
            Ok(output) => output?,
            Err(_) => return Err(FlowError::Timeout(timeout.as_millis() as u64)),
        };

        if let Some(name) = Params::new(&params).text(&["output_variable", "outputVariable", "save_to"]) {
            if let Some(data) = &output.data {
                self.variables.set(&name, data.clone(), Scope::Custom)?;
            }
        }
        Ok(Some(output))
    }

    /// The step's own timeout, or the default; a `wait_time` gets its pause on top.
    fn step_timeout(
        &self,
        step: &Step,
        kind: Option<OperationKind>,
        params: &serde_json::Map<String, Value>,
    ) -> Duration {
        let base = step
            .timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.limits.default_step_timeout);
        if kind == Some(OperationKind::WaitTime) {
            if let Ok(wait) = requested_wait(params) {
                return base.saturating_add(wait);
            }
        }
        base
    }

    async fn run_control(
        &self,
        state: &mut RunState,
        steps: &[Step],
        blocks: &BlockMap,
        index: usize,
        kind: OperationKind,
    ) -> Flowing {
        let step = &steps[index];
        let after_block = |at: usize| blocks.end_of(at).map_or(index + 1, |end| end + 1);

        match kind {
            OperationKind::If => self.run_if(state, blocks, index, step).await,
            // reached only by falling out of the then-branch
            OperationKind::Else => Flowing::Jump(after_block(index)),
            OperationKind::EndIf => Flowing::Next,
            OperationKind::EndLoop => self.end_loop(state, steps, index).await,
            OperationKind::BreakLoop => self.break_loop(state, index, step).await,
            _ => {
                let end = blocks.end_of(index).unwrap_or(index);
                self.open_loop(state, index, end, step, kind).await
            }
        }
    }

    async fn run_if(&self, state: &mut RunState, blocks: &BlockMap, index: usize, step: &Step) -> Flowing {
        let started = Instant::now();
        let report = self
            .attempt(step, move |_| async move {
                let condition = step.control_condition().ok_or_else(|| {
                    FlowError::InvalidStructure(format!("if step '{}' has no condition", step.id))
                })?;
                evaluate(&condition, &self.variables)
            })
            .await;
        let (mut result, outcome) = self.settle(state, index, step, report, started);
        let end = blocks.end_of(index).unwrap_or(index);

        let flowing = match outcome {
            Some(true) => {
                result.message = "condition true".to_string();
                Flowing::Next
            }
            Some(false) => {
                result.message = "condition false".to_string();
                Flowing::Jump(blocks.else_of(index).unwrap_or(end) + 1)
            }
            // a tolerated failure skips the whole block
            None if result.status.is_tolerated() => Flowing::Jump(end + 1),
            None => Flowing::Halt,
        };
        result.data = outcome.map(Value::Bool);
        self.record(state, result);
        flowing
    }

    async fn open_loop(
        &self,
        state: &mut RunState,
        index: usize,
        end: usize,
        step: &Step,
        kind: OperationKind,
    ) -> Flowing {
        let started = Instant::now();
        let report = self
            .attempt(step, move |_| self.timed_frame(index, end, step, kind))
            .await;
        let (mut result, frame) = self.settle(state, index, step, report, started);

        let Some(frame) = frame else {
            let flowing = if result.status.is_tolerated() {
                Flowing::Jump(end + 1)
            } else {
                Flowing::Halt
            };
            self.record(state, result);
            return flowing;
        };

        let has_first = match frame.bound() {
            Some(bound) => bound > 0,
            None => match &frame.source {
                LoopSource::While { max_iterations, .. } => *max_iterations > 0,
                _ => true,
            },
        };
        if !has_first {
            result.message = "loop has no iterations".to_string();
            result.data = Some(Value::from(0));
            self.record(state, result);
            return Flowing::Jump(end + 1);
        }

        self.variables.push_loop_layer();
        self.bind_iteration(&frame);
        result.message = match frame.bound() {
            Some(bound) => format!("loop started, {bound} iterations"),
            None => "while loop started".to_string(),
        };
        result.data = frame.bound().map(Value::from);
        self.record(state, result);
        state.frames.push(frame);
        Flowing::Next
    }

    /// [`Self::build_frame`] bounded by the opener step's timeout.
    async fn timed_frame(
        &self,
        index: usize,
        end: usize,
        step: &Step,
        kind: OperationKind,
    ) -> Result<LoopFrame, FlowError> {
        let params = self.variables.resolve_params(&step.parameters);
        let timeout = self.step_timeout(step, Some(kind), &params);
        match tokio::time::timeout(timeout, self.build_frame(index, end, step, kind)).await {
            Ok(frame) => frame,
            Err(_) => Err(FlowError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Resolve a loop's iteration source. A while loop whose condition is
    /// already false gets a zero bound.
    async fn build_frame(
        &self,
        index: usize,
        end: usize,
        step: &Step,
        kind: OperationKind,
    ) -> Result<LoopFrame, FlowError> {
        let config = step.loop_config.clone().unwrap_or_default();
        if config.item_variable.trim().is_empty() || config.index_variable.trim().is_empty() {
            return Err(FlowError::InvalidStructure(format!(
                "loop '{}' needs item and index variable names",
                step.id
            )));
        }
        let params = self.variables.resolve_params(&step.parameters);
        let params = Params::new(&params);
        let cap = config.max_iterations.map(|max| max as usize);

        let source = match kind {
            OperationKind::LoopElements => {
                let selector = match &config.selector {
                    Some(selector) => self.variables.resolve_text(selector),
                    None => params.require_text(&["selector", "css", "xpath"])?,
                };
                let limit = cap
                    .unwrap_or(self.limits.max_element_loop)
                    .min(self.limits.max_element_loop);
                let handles = self
                    .actuator
                    .locate_all(&selector, config.selector_kind, limit)
                    .await?;
                LoopSource::Elements(handles)
            }
            OperationKind::LoopCount => {
                let raw = match &config.count {
                    Some(count) => self.variables.resolve_value(count),
                    None => params
                        .value(&["count", "times", "iterations"])
                        .cloned()
                        .ok_or_else(|| FlowError::MissingParameter("count".to_string()))?,
                };
                let count = count_of(&raw)?;
                LoopSource::Count(cap.map_or(count, |cap| count.min(cap as u64)))
            }
            OperationKind::LoopData => {
                let raw = if let Some(data) = &config.data {
                    self.variables.resolve_value(data)
                } else {
                    let source = config
                        .source_variable
                        .clone()
                        .or_else(|| params.text(&["source_variable", "sourceVariable", "variable"]))
                        .ok_or_else(|| FlowError::MissingParameter("source_variable".to_string()))?;
                    self.variables
                        .resolve_reference(source.trim_start_matches("${").trim_end_matches('}'))
                        .map(|value| value.to_json())
                        .unwrap_or(Value::Null)
                };
                let mut items = items_of(raw)?;
                if let Some(cap) = cap {
                    items.truncate(cap);
                }
                LoopSource::Data(items)
            }
            OperationKind::While => {
                let condition = step.control_condition().ok_or_else(|| {
                    FlowError::InvalidStructure(format!("while loop '{}' has no condition", step.id))
                })?;
                let max_iterations = config
                    .max_iterations
                    .or(params.unsigned(&["max_iterations", "maxIterations"])?.map(|max| max as u32))
                    .unwrap_or(self.limits.max_while_iterations);
                let max_iterations = if evaluate(&condition, &self.variables)? {
                    max_iterations
                } else {
                    0
                };
                LoopSource::While {
                    condition,
                    max_iterations,
                }
            }
            other => {
                return Err(FlowError::InvalidStructure(format!("{other} does not open a loop")))
            }
        };

        Ok(LoopFrame {
            start: index,
            end,
            iteration: 0,
            item_variable: config.item_variable,
            index_variable: config.index_variable,
            source,
        })
    }

    fn bind_iteration(&self, frame: &LoopFrame) {
        let bindings = [
            (&frame.item_variable, VarValue::from_json(frame.item())),
            (&frame.index_variable, VarValue::from(frame.iteration)),
        ];
        for (name, value) in bindings {
            if let Err(err) = self.variables.set(name, value, Scope::Loop) {
                warn!(variable = %name, error = %err, "loop variable not bound");
            }
        }
    }

    async fn end_loop(&self, state: &mut RunState, steps: &[Step], index: usize) -> Flowing {
        let Some(frame) = state.frames.last_mut() else {
            return Flowing::Next;
        };
        if frame.end != index {
            warn!(step = index, frame_end = frame.end, "end_loop does not close the innermost loop");
        }
        frame.iteration += 1;
        let iteration = frame.iteration;
        let start = frame.start;

        let proceed = match &frame.source {
            LoopSource::While {
                condition,
                max_iterations,
            } => {
                if iteration >= *max_iterations as usize {
                    info!(step = %steps[start].id, iterations = iteration, "while loop reached its iteration limit");
                    self.note(
                        LogLevel::Info,
                        format!("while loop '{}' stopped after {iteration} iterations", steps[start].id),
                        Some(&steps[start].step_id()),
                        json!({ "iterations": iteration, "limit_reached": true }),
                    );
                    false
                } else {
                    let condition = condition.clone();
                    let opener = &steps[start];
                    let started = Instant::now();
                    let report = self
                        .attempt(opener, |_| {
                            let condition = &condition;
                            async move { evaluate(condition, &self.variables) }
                        })
                        .await;
                    let (result, holds) = self.settle(state, start, opener, report, started);
                    match holds {
                        Some(holds) => holds,
                        None => {
                            let tolerated = result.status.is_tolerated();
                            self.record(state, result);
                            self.close_frame(state);
                            return if tolerated { Flowing::Next } else { Flowing::Halt };
                        }
                    }
                }
            }
            _ => frame.bound().is_some_and(|bound| iteration < bound),
        };

        if proceed {
            if let Some(frame) = state.frames.last() {
                self.bind_iteration(frame);
            }
            Flowing::Jump(start + 1)
        } else {
            debug!(step = %steps[start].id, iterations = iteration, "loop finished");
            self.close_frame(state);
            Flowing::Next
        }
    }

    fn close_frame(&self, state: &mut RunState) -> Option<LoopFrame> {
        let frame = state.frames.pop()?;
        self.variables.pop_loop_layer();
        Some(frame)
    }

    /// Leaves the innermost loop. Outside any loop this is a handled no-op.
    async fn break_loop(&self, state: &mut RunState, index: usize, step: &Step) -> Flowing {
        let started = Instant::now();
        let report = self
            .attempt(step, move |_| async move {
                match &step.condition {
                    Some(condition) => evaluate(condition, &self.variables),
                    None => Ok(true),
                }
            })
            .await;
        let (mut result, fire) = self.settle(state, index, step, report, started);

        let flowing = match fire {
            Some(false) => {
                result.status = StepStatus::ConditionFalse;
                result.message = "condition not met, loop continues".to_string();
                Flowing::Next
            }
            Some(true) => match self.close_frame(state) {
                Some(frame) => {
                    result.message = format!("left loop at iteration {}", frame.iteration + 1);
                    result.data = Some(Value::from(frame.iteration));
                    Flowing::Jump(frame.end + 1)
                }
                None => {
                    result.status = StepStatus::Handled;
                    result.message = "no active loop".to_string();
                    Flowing::Next
                }
            },
            None => Self::after(result.status),
        };
        self.record(state, result);
        flowing
    }
}

fn count_of(raw: &Value) -> Result<u64, FlowError> {
    let count = match raw {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match count {
        Some(count) if count >= 0.0 && count.fract() == 0.0 => Ok(count as u64),
        _ => Err(FlowError::invalid("count", format!("'{raw}' is not a non-negative integer"))),
    }
}

/// Items of a data loop: a JSON array, a JSON array in text form, or lines
/// of plain text.
fn items_of(raw: Value) -> Result<Vec<Value>, FlowError> {
    match raw {
        Value::Array(items) => Ok(items),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Ok(text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| Value::String(line.to_string()))
                .collect()),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(FlowError::Logic(format!("cannot iterate over {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConditionOperator, LoopConfig};
    use action_primitives::{ActuatorFault, ScriptedActuator, ScriptedElement};
    use browserflow_core_types::ErrorKind;
    use exception_policy::OnError;
    use parking_lot::Mutex;

    fn setup() -> (Arc<ScriptedActuator>, FlowInterpreter) {
        let actuator = Arc::new(ScriptedActuator::new());
        let interpreter = FlowInterpreter::new(actuator.clone());
        (actuator, interpreter)
    }

    fn step(id: &str, kind: OperationKind) -> Step {
        Step::new(id, kind)
    }

    #[tokio::test]
    async fn test_three_step_flow_completes() {
        let (actuator, interpreter) = setup();
        actuator.add_element("#go", ScriptedElement::default());
        actuator.add_element("h1", ScriptedElement::with_text("  Welcome  "));

        let flow = Flow::new("basic")
            .with_step(step("open", OperationKind::Navigate).with_param("url", "https://example.test"))
            .with_step(step("press", OperationKind::Click).with_param("selector", "#go"))
            .with_step(
                step("read", OperationKind::ExtractText)
                    .with_param("selector", "h1")
                    .with_param("output_variable", "heading"),
            );

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed_step_count, 3);
        assert_eq!(result.last_step_index, Some(2));
        assert_eq!(result.variables.get("heading"), Some(&json!("Welcome")));
        assert_eq!(actuator.call_count("navigate"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_element_found_on_second_attempt() {
        let (actuator, interpreter) = setup();
        actuator.add_element("#late", ScriptedElement::default());
        actuator.appear_after("#late", 1);

        let flow = Flow::new("late").with_step(step("press", OperationKind::Click).with_param("selector", "#late"));
        let result = interpreter.run(&flow).await.unwrap();

        assert!(result.success);
        let press: Vec<_> = result.results_for("press").collect();
        assert_eq!(press.len(), 1);
        assert_eq!(press[0].attempts, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::ElementNotFound);
    }

    #[tokio::test]
    async fn test_while_loop_stops_at_iteration_limit() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("spin")
            .with_variable("running", "yes")
            .with_step(step("loop", OperationKind::While).with_loop(LoopConfig::while_true(
                Condition::new("running", ConditionOperator::Exists, Value::Null),
                5,
            )))
            .with_step(step("tick", OperationKind::IncrementVariable).with_param("name", "ticks"))
            .with_step(step("end", OperationKind::EndLoop));

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert!(result.errors.is_empty());
        assert_eq!(result.results_for("tick").count(), 5);
        assert_eq!(result.variables.get("ticks"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_while_loop_ends_when_condition_turns_false() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("countdown")
            .with_variable("n", 0)
            .with_step(step("loop", OperationKind::While).with_condition(Condition::new(
                "n",
                ConditionOperator::Less,
                3,
            )))
            .with_step(step("inc", OperationKind::IncrementVariable).with_param("name", "n"))
            .with_step(step("end", OperationKind::EndLoop));

        let result = interpreter.run(&flow).await.unwrap();
        assert_eq!(result.results_for("inc").count(), 3);
        assert_eq!(result.variables.get("n"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_count_loop_binds_and_releases_loop_variables() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("count")
            .with_step(step("loop", OperationKind::LoopCount).with_loop(LoopConfig::count(3)))
            .with_step(
                step("sum", OperationKind::MathOperation)
                    .with_param("left", "${total}")
                    .with_param("operator", "+")
                    .with_param("right", "${loop_item}")
                    .with_param("output_variable", "total"),
            )
            .with_step(step("end", OperationKind::EndLoop))
            .with_variable("total", 0);

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.variables.get("total"), Some(&json!(6)));
        assert!(!result.variables.contains_key("loop_item"));
        assert_eq!(interpreter.variables().loop_depth(), 0);
    }

    #[tokio::test]
    async fn test_data_loop_walks_items() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("data")
            .with_step(step("loop", OperationKind::LoopData).with_loop(LoopConfig::data(json!(["a", "b"]))))
            .with_step(
                step("echo", OperationKind::SetVariable)
                    .with_param("name", "last")
                    .with_param("value", "${loop_index}:${loop_item}"),
            )
            .with_step(step("end", OperationKind::EndLoop));

        let result = interpreter.run(&flow).await.unwrap();
        let echoed: Vec<_> = result.results_for("echo").map(|echo| echo.data.clone()).collect();
        assert_eq!(echoed, vec![Some(json!("0:a")), Some(json!("1:b"))]);
    }

    #[tokio::test]
    async fn test_element_loop_targets_each_element() {
        let (actuator, interpreter) = setup();
        for label in ["one", "two", "three"] {
            actuator.add_element(".row", ScriptedElement::with_text(label));
        }
        let flow = Flow::new("rows")
            .with_step(step("rows", OperationKind::LoopElements).with_loop(LoopConfig::elements(".row")))
            .with_step(step("read", OperationKind::ExtractText))
            .with_step(step("end", OperationKind::EndLoop));

        let result = interpreter.run(&flow).await.unwrap();
        let texts: Vec<_> = result
            .results_for("read")
            .map(|read| read.data.clone().unwrap_or(Value::Null))
            .collect();
        assert_eq!(texts, vec![json!("one"), json!("two"), json!("three")]);
    }

    #[tokio::test]
    async fn test_if_else_branches() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("branch")
            .with_variable("mode", "fast")
            .with_step(step("check", OperationKind::If).with_condition(Condition::new(
                "mode",
                ConditionOperator::Equals,
                "slow",
            )))
            .with_step(step("slow", OperationKind::SetVariable).with_param("name", "path").with_param("value", "slow"))
            .with_step(step("else", OperationKind::Else))
            .with_step(step("fast", OperationKind::SetVariable).with_param("name", "path").with_param("value", "fast"))
            .with_step(step("done", OperationKind::EndIf));

        let result = interpreter.run(&flow).await.unwrap();
        assert_eq!(result.variables.get("path"), Some(&json!("fast")));
        assert_eq!(result.results_for("slow").count(), 0);
    }

    #[tokio::test]
    async fn test_numeric_condition_on_text_is_a_step_error() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("bad-if")
            .with_variable("label", "n/a")
            .with_step(step("check", OperationKind::If).with_condition(Condition::new(
                "label",
                ConditionOperator::Greater,
                1,
            )))
            .with_step(step("inner", OperationKind::LogMessage).with_param("message", "inside"))
            .with_step(step("done", OperationKind::EndIf))
            .with_step(step("after", OperationKind::LogMessage).with_param("message", "after"));

        let result = interpreter.run(&flow).await.unwrap();
        let check: Vec<_> = result.results_for("check").collect();
        assert_eq!(check[0].status, StepStatus::FailedSkipped);
        assert_eq!(result.results_for("inner").count(), 0);
        assert_eq!(result.results_for("after").count(), 1);
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_break_outside_loop_is_handled() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("stray").with_step(step("brk", OperationKind::BreakLoop));
        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::Handled);
        assert_eq!(result.step_results[0].message, "no active loop");
    }

    #[tokio::test]
    async fn test_break_leaves_innermost_loop() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("early")
            .with_step(step("loop", OperationKind::LoopCount).with_loop(LoopConfig::count(10)))
            .with_step(step("inc", OperationKind::IncrementVariable).with_param("name", "n"))
            .with_step(step("brk", OperationKind::BreakLoop).with_condition(Condition::new(
                "n",
                ConditionOperator::GreaterOrEqual,
                2,
            )))
            .with_step(step("end", OperationKind::EndLoop))
            .with_step(step("after", OperationKind::SetVariable).with_param("name", "after").with_param("value", true));

        let result = interpreter.run(&flow).await.unwrap();
        assert_eq!(result.variables.get("n"), Some(&json!(2)));
        assert_eq!(result.variables.get("after"), Some(&json!(true)));
        assert_eq!(interpreter.variables().loop_depth(), 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_fails_closed() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("unknown")
            .with_step(step("warp", OperationKind::Refresh))
            .with_step(Step::new("teleport", "teleport"))
            .with_step(step("never", OperationKind::Refresh));
        let result = interpreter.run(&flow).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.last_step_index, Some(1));
        assert!(result.error.as_deref().unwrap_or_default().contains("unsupported operation"));
        assert_eq!(result.results_for("never").count(), 0);
    }

    #[tokio::test]
    async fn test_missing_parameter_stops_without_retry() {
        let (actuator, interpreter) = setup();
        let flow = Flow::new("no-url")
            .with_step(step("open", OperationKind::Navigate).with_on_error(OnError::Retry));
        let result = interpreter.run(&flow).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.step_results[0].status, StepStatus::FailedStopped);
        assert_eq!(result.step_results[0].attempts, 1);
        assert_eq!(actuator.call_count("navigate"), 0);
    }

    #[tokio::test]
    async fn test_skip_preference_keeps_flow_successful() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("skip")
            .with_step(
                step("press", OperationKind::Click)
                    .with_param("selector", "#missing")
                    .with_on_error(OnError::Skip)
                    .with_retry_count(0),
            )
            .with_step(step("next", OperationKind::LogMessage).with_param("message", "still here"));

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::FailedSkipped);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.completed_step_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_becomes_timeout_fault() {
        let (actuator, interpreter) = setup();
        actuator.set_latency(Duration::from_secs(5));
        let flow = Flow::new("slow").with_step(
            step("open", OperationKind::Navigate)
                .with_param("url", "https://slow.test")
                .with_timeout(100)
                .with_on_error(OnError::Continue)
                .with_retry_count(0),
        );

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::FailedContinued);
        assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_opener_respects_step_timeout() {
        let (actuator, interpreter) = setup();
        actuator.add_element("li", ScriptedElement::with_text("row"));
        actuator.set_latency(Duration::from_secs(600));
        let flow = Flow::new("slow-rows")
            .with_step(
                step("rows", OperationKind::LoopElements)
                    .with_loop(LoopConfig::elements("li"))
                    .with_timeout(100)
                    .with_on_error(OnError::Continue)
                    .with_retry_count(0),
            )
            .with_step(step("tick", OperationKind::IncrementVariable).with_param("name", "ticks"))
            .with_step(step("end", OperationKind::EndLoop));

        let started = tokio::time::Instant::now();
        let result = interpreter.run(&flow).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(600));
        assert_eq!(result.step_results[0].status, StepStatus::FailedContinued);
        assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
        assert_eq!(result.results_for("tick").count(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_wait_is_a_validation_fault() {
        let (_actuator, interpreter) = setup();
        for seconds in ["NaN", "inf", "1e300"] {
            let flow = Flow::new("bad-wait")
                .with_step(step("pause", OperationKind::WaitTime).with_param("seconds", seconds));
            let result = interpreter.run(&flow).await.unwrap();
            assert!(!result.success);
            assert_eq!(result.step_results[0].status, StepStatus::FailedStopped);
            assert_eq!(result.errors[0].kind, ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_extreme_scroll_amount_saturates() {
        let (actuator, interpreter) = setup();
        let flow = Flow::new("scroll").with_step(
            step("up", OperationKind::ScrollPage)
                .with_param("direction", "up")
                .with_param("amount", i64::MIN),
        );
        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(actuator.call_count("page_command"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fault_restarts_actuator() {
        let (actuator, interpreter) = setup();
        actuator.fail_next("navigate", ActuatorFault::classified(ErrorKind::ActuatorFatal, "browser crashed"));
        let flow = Flow::new("crash").with_step(step("open", OperationKind::Navigate).with_param("url", "https://a.test"));

        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(actuator.restarts(), 1);
        assert_eq!(result.step_results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_guard_condition_skips_step() {
        let (actuator, interpreter) = setup();
        let flow = Flow::new("guarded").with_step(
            step("open", OperationKind::Navigate)
                .with_param("url", "https://a.test")
                .with_condition(Condition::new("enabled", ConditionOperator::Exists, Value::Null)),
        );
        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::ConditionFalse);
        assert_eq!(actuator.call_count("navigate"), 0);
    }

    #[tokio::test]
    async fn test_stop_flow_ends_run() {
        let (_actuator, interpreter) = setup();
        let flow = Flow::new("stop")
            .with_step(step("halt", OperationKind::StopFlow).with_param("reason", "enough"))
            .with_step(step("never", OperationKind::Refresh));
        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.success);
        assert!(result.stopped_by_step);
        assert_eq!(result.step_results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let (actuator, interpreter) = setup();
        interpreter.cancel_token().cancel();
        let flow = Flow::new("cancel").with_step(step("open", OperationKind::Navigate).with_param("url", "https://a.test"));
        let result = interpreter.run(&flow).await.unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(result.step_results.is_empty());
        assert_eq!(actuator.call_count("navigate"), 0);
    }

    #[tokio::test]
    async fn test_unbalanced_flow_is_rejected_before_running() {
        let (actuator, interpreter) = setup();
        let flow = Flow::new("broken")
            .with_step(step("open", OperationKind::Navigate).with_param("url", "https://a.test"))
            .with_step(step("loop", OperationKind::LoopCount).with_loop(LoopConfig::count(2)));
        assert!(matches!(interpreter.run(&flow).await, Err(FlowError::InvalidStructure(_))));
        assert!(actuator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reported_per_step() {
        let actuator = Arc::new(ScriptedActuator::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let interpreter = FlowInterpreter::new(actuator).on_progress(Arc::new(move |progress| {
            sink.lock().push(progress.percent);
        }));
        let flow = Flow::new("progress")
            .with_step(step("a", OperationKind::Refresh))
            .with_step(step("b", OperationKind::Refresh));
        interpreter.run(&flow).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 50]);
    }
}
