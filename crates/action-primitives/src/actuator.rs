//! The actuator trait
//!
//! Every call is awaited end to end by the interpreter; an actuator never sees
//! two concurrent calls from the same task.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::errors::ActuatorFault;
use crate::types::{
    ActParams, ActResult, Cookie, ElementHandle, ElementAction, PageCommand, ScreenshotOptions,
    SelectorKind,
};

/// Upper bound for [`Actuator::locate_all`] when the caller passes no limit.
pub const DEFAULT_LOCATE_ALL_LIMIT: usize = 500;

/// Concrete browser binding driven by the flow interpreter.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Locate the `order`-th match of `selector`, or `None` when absent.
    async fn locate(
        &self,
        selector: &str,
        kind: SelectorKind,
        order: usize,
    ) -> Result<Option<ElementHandle>, ActuatorFault>;

    /// Locate every match, stopping at `limit`.
    ///
    /// The default walks `locate` with increasing order until it comes back empty.
    async fn locate_all(
        &self,
        selector: &str,
        kind: SelectorKind,
        limit: usize,
    ) -> Result<Vec<ElementHandle>, ActuatorFault> {
        let limit = if limit == 0 {
            DEFAULT_LOCATE_ALL_LIMIT
        } else {
            limit
        };
        let mut handles = Vec::new();
        while handles.len() < limit {
            match self.locate(selector, kind, handles.len()).await? {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        Ok(handles)
    }

    /// Perform an element action
    async fn act(
        &self,
        handle: &ElementHandle,
        action: ElementAction,
        params: &ActParams,
    ) -> Result<ActResult, ActuatorFault>;

    /// Navigate the current tab and wait for load, up to `timeout`
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), ActuatorFault>;

    /// Evaluate a script with `injected` values exposed to it
    async fn evaluate_script(
        &self,
        code: &str,
        injected: &Map<String, Value>,
    ) -> Result<Value, ActuatorFault>;

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, ActuatorFault>;

    async fn read_cookies(&self) -> Result<Vec<Cookie>, ActuatorFault>;

    async fn clear_cookies(&self) -> Result<(), ActuatorFault>;

    async fn current_url(&self) -> Result<String, ActuatorFault>;

    /// Page-level command (tabs, history, scrolling). Bindings that do not
    /// support a command report it as unsupported.
    async fn page_command(&self, command: PageCommand) -> Result<Value, ActuatorFault> {
        Err(ActuatorFault::unsupported(command.name()))
    }

    /// Tear down and re-create the underlying browser connection.
    async fn restart(&self) -> Result<(), ActuatorFault> {
        Ok(())
    }
}
