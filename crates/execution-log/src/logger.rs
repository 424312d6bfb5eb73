use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use browserflow_core_types::{StepId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::LoggerConfig;
use crate::errors::LogError;
use crate::hot::{EntryWindow, StepRings};
use crate::mirror::MirrorWriter;
use crate::model::{LogEntry, LogLevel, LogSummary, MirrorLine, TimerStats};

struct LoggerState {
    window: EntryWindow,
    buffer: Vec<LogEntry>,
    mirror: Option<MirrorWriter>,
    running_timers: HashMap<String, Instant>,
    timers: BTreeMap<String, TimerStats>,
    closed: bool,
    finished_at: Option<DateTime<Utc>>,
}

/// Structured log for one task.
///
/// Writes after [`ExecutionLogger::finalize`] are rejected with
/// [`LogError::Closed`].
pub struct ExecutionLogger {
    task_id: TaskId,
    cfg: LoggerConfig,
    started_at: DateTime<Utc>,
    started: Instant,
    steps: StepRings,
    state: Mutex<LoggerState>,
}

impl ExecutionLogger {
    /// Create a logger; opens the mirror file when enabled.
    pub fn new(task_id: TaskId, cfg: LoggerConfig) -> Result<Self, LogError> {
        let mirror = if cfg.mirror.enabled {
            Some(MirrorWriter::open(&cfg.mirror, &task_id)?)
        } else {
            None
        };
        Ok(Self::build(task_id, cfg, mirror))
    }

    /// In-memory logger with default limits and no mirror.
    pub fn in_memory(task_id: TaskId) -> Self {
        Self::build(task_id, LoggerConfig::default(), None)
    }

    fn build(task_id: TaskId, cfg: LoggerConfig, mirror: Option<MirrorWriter>) -> Self {
        Self {
            steps: StepRings::new(cfg.step_window),
            state: Mutex::new(LoggerState {
                window: EntryWindow::new(cfg.window_capacity),
                buffer: Vec::new(),
                mirror,
                running_timers: HashMap::new(),
                timers: BTreeMap::new(),
                closed: false,
                finished_at: None,
            }),
            task_id,
            cfg,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .mirror
            .as_ref()
            .map(|mirror| mirror.path().to_path_buf())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        step_id: Option<&StepId>,
        data: Option<Value>,
    ) -> Result<(), LogError> {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            at: Utc::now(),
            level,
            message: message.into(),
            task_id: self.task_id.clone(),
            step_id: step_id.cloned(),
            data: data.unwrap_or(Value::Null),
        };

        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        forward(&entry);
        if let Some(step_id) = step_id {
            self.steps.push(step_id, entry.clone());
        }
        if state.mirror.is_some() {
            state.buffer.push(entry.clone());
        }
        state.window.push(entry);
        if state.buffer.len() >= self.cfg.flush_threshold {
            drain_buffer(&mut state)?;
        }
        Ok(())
    }

    pub fn info(&self, message: impl Into<String>) -> Result<(), LogError> {
        self.log(LogLevel::Info, message, None, None)
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<(), LogError> {
        self.log(LogLevel::Warn, message, None, None)
    }

    pub fn error(&self, message: impl Into<String>) -> Result<(), LogError> {
        self.log(LogLevel::Error, message, None, None)
    }

    /// Log against a step with structured data.
    pub fn step(
        &self,
        step_id: &StepId,
        level: LogLevel,
        message: impl Into<String>,
        data: Value,
    ) -> Result<(), LogError> {
        self.log(level, message, Some(step_id), Some(data))
    }

    pub fn start_timer(&self, name: impl Into<String>) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        state.running_timers.insert(name.into(), Instant::now());
        Ok(())
    }

    pub fn stop_timer(&self, name: &str) -> Result<Duration, LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        let started = state
            .running_timers
            .remove(name)
            .ok_or_else(|| LogError::TimerNotStarted(name.to_string()))?;
        let elapsed = started.elapsed();
        let millis = elapsed.as_millis() as u64;
        let stats = state.timers.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.total_ms += millis;
        stats.last_ms = millis;
        Ok(elapsed)
    }

    /// Write buffered entries to the mirror.
    pub fn flush(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        drain_buffer(&mut state)?;
        if let Some(mirror) = state.mirror.as_mut() {
            mirror.flush()?;
        }
        Ok(())
    }

    /// Flush, append the summary trailer, and close the logger.
    pub fn finalize(&self) -> Result<LogSummary, LogError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogError::Closed);
        }
        state.finished_at = Some(Utc::now());
        let summary = self.summarize(&state);
        drain_buffer(&mut state)?;
        if let Some(mirror) = state.mirror.as_mut() {
            mirror.write_line(&MirrorLine::Summary(summary.clone()))?;
            mirror.finish()?;
        }
        state.closed = true;
        debug!(task_id = %self.task_id, entries = summary.total_entries, "execution log finalized");
        Ok(summary)
    }

    /// Computed from the current window and the eviction ledger.
    pub fn summary(&self) -> LogSummary {
        let state = self.state.lock();
        self.summarize(&state)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().window.iter().cloned().collect()
    }

    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        self.state.lock().window.tail(limit)
    }

    pub fn step_entries(&self, step_id: &StepId) -> Vec<LogEntry> {
        self.steps.snapshot(step_id)
    }

    fn summarize(&self, state: &LoggerState) -> LogSummary {
        let ledger = state.window.ledger();
        let mut counts: BTreeMap<String, u64> = LogLevel::ALL
            .into_iter()
            .map(|level| {
                (
                    level.as_str().to_string(),
                    ledger.levels.get(&level).copied().unwrap_or(0),
                )
            })
            .collect();
        let mut steps: HashSet<&StepId> = ledger.steps.iter().collect();
        for entry in state.window.iter() {
            *counts.entry(entry.level.as_str().to_string()).or_insert(0) += 1;
            if let Some(step_id) = &entry.step_id {
                steps.insert(step_id);
            }
        }

        let duration = match state.finished_at {
            Some(finished) => (finished - self.started_at).num_milliseconds().max(0) as u64,
            None => self.started.elapsed().as_millis() as u64,
        };
        LogSummary {
            task_id: self.task_id.clone(),
            started_at: self.started_at,
            duration_ms: duration,
            total_entries: ledger.evicted + state.window.len() as u64,
            counts,
            step_count: steps.len(),
            timers: state.timers.clone(),
            evicted: ledger.evicted,
        }
    }
}

fn drain_buffer(state: &mut LoggerState) -> Result<(), LogError> {
    if state.buffer.is_empty() {
        return Ok(());
    }
    let Some(mirror) = state.mirror.as_mut() else {
        state.buffer.clear();
        return Ok(());
    };
    // Entries leave the buffer only once written; a failed line is retried
    // on the next drain.
    let mut written = 0;
    let result = state.buffer.iter().try_for_each(|entry| {
        mirror.write_line(&MirrorLine::Entry(entry.clone()))?;
        written += 1;
        Ok::<(), LogError>(())
    });
    state.buffer.drain(..written);
    result
}

fn forward(entry: &LogEntry) {
    let step = entry.step_id.as_ref().map(StepId::as_str).unwrap_or("-");
    match entry.level {
        LogLevel::Trace => trace!(task_id = %entry.task_id, step_id = step, "{}", entry.message),
        LogLevel::Debug => debug!(task_id = %entry.task_id, step_id = step, "{}", entry.message),
        LogLevel::Info => info!(task_id = %entry.task_id, step_id = step, "{}", entry.message),
        LogLevel::Warn => warn!(task_id = %entry.task_id, step_id = step, "{}", entry.message),
        LogLevel::Error => error!(task_id = %entry.task_id, step_id = step, "{}", entry.message),
    }
}
