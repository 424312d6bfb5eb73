//! In-memory actuator backed by a scripted page model
//!
//! Selectors are matched literally against registered elements; the selector
//! kind is recorded but not interpreted. Faults can be queued per call name so
//! tests can reproduce transient failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::trace;

use crate::actuator::Actuator;
use crate::errors::ActuatorFault;
use crate::types::{
    ActParams, ActResult, Cookie, ElementAction, ElementHandle, PageCommand, ScreenshotOptions,
    SelectorKind,
};

/// One element of the scripted page
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScriptedElement {
    pub text: String,
    pub html: String,
    pub value: String,
    pub attributes: HashMap<String, String>,
    pub checked: bool,
}

impl ScriptedElement {
    pub fn with_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            html: format!("<span>{text}</span>"),
            text,
            ..Self::default()
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// A call observed by the scripted actuator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActuatorCall {
    pub name: String,
    pub detail: String,
}

#[derive(Default)]
struct PageState {
    url: String,
    title: String,
    elements: HashMap<String, Vec<ScriptedElement>>,
    misses: HashMap<String, usize>,
    faults: HashMap<String, VecDeque<ActuatorFault>>,
    script_results: HashMap<String, Value>,
    cookies: Vec<Cookie>,
    tabs: Vec<String>,
    active_tab: usize,
    back: Vec<String>,
    forward: Vec<String>,
    calls: Vec<ActuatorCall>,
    restarts: usize,
}

impl PageState {
    fn record(&mut self, name: &str, detail: impl Into<String>) {
        let detail = detail.into();
        trace!(call = name, %detail, "scripted actuator call");
        self.calls.push(ActuatorCall {
            name: name.to_string(),
            detail,
        });
    }

    fn take_fault(&mut self, name: &str) -> Option<ActuatorFault> {
        self.faults.get_mut(name).and_then(VecDeque::pop_front)
    }
}

/// Scripted stand-in for a browser binding
pub struct ScriptedActuator {
    state: Mutex<PageState>,
    /// Every selector matches one synthetic element when set
    permissive: bool,
    latency: Mutex<Option<Duration>>,
}

impl Default for ScriptedActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedActuator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PageState {
                url: "about:blank".into(),
                tabs: vec!["about:blank".into()],
                ..PageState::default()
            }),
            permissive: false,
            latency: Mutex::new(None),
        }
    }

    /// Actuator where any selector resolves to a single empty element.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::new()
        }
    }

    pub fn add_element(&self, selector: impl Into<String>, element: ScriptedElement) {
        self.state
            .lock()
            .elements
            .entry(selector.into())
            .or_default()
            .push(element);
    }

    pub fn remove_elements(&self, selector: &str) {
        self.state.lock().elements.remove(selector);
    }

    /// The next `misses` lookups of `selector` report it absent.
    pub fn appear_after(&self, selector: impl Into<String>, misses: usize) {
        self.state.lock().misses.insert(selector.into(), misses);
    }

    /// Queue a fault for the next call named `call` (`locate`, `act`, `navigate`, ...).
    pub fn fail_next(&self, call: impl Into<String>, fault: ActuatorFault) {
        self.state
            .lock()
            .faults
            .entry(call.into())
            .or_default()
            .push_back(fault);
    }

    pub fn set_script_result(&self, code: impl Into<String>, value: Value) {
        self.state.lock().script_results.insert(code.into(), value);
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.state.lock().title = title.into();
    }

    pub fn add_cookie(&self, cookie: Cookie) {
        self.state.lock().cookies.push(cookie);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.name == name)
            .count()
    }

    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    /// Current value of the `order`-th element matching `selector`
    pub fn element(&self, selector: &str, order: usize) -> Option<ScriptedElement> {
        self.state
            .lock()
            .elements
            .get(selector)
            .and_then(|elements| elements.get(order))
            .cloned()
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn begin(&self, name: &str, detail: impl Into<String>) -> Result<(), ActuatorFault> {
        let mut state = self.state.lock();
        state.record(name, detail);
        match state.take_fault(name) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn locate(
        &self,
        selector: &str,
        kind: SelectorKind,
        order: usize,
    ) -> Result<Option<ElementHandle>, ActuatorFault> {
        self.pause().await;
        self.begin("locate", format!("{kind}:{selector}[{order}]"))?;
        let mut state = self.state.lock();
        if let Some(remaining) = state.misses.get_mut(selector) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        let present = match state.elements.get(selector) {
            Some(elements) => order < elements.len(),
            None => self.permissive && order == 0,
        };
        Ok(present.then(|| ElementHandle {
            id: format!("{selector}#{order}"),
            selector: selector.to_string(),
            kind,
            order,
        }))
    }

    async fn act(
        &self,
        handle: &ElementHandle,
        action: ElementAction,
        params: &ActParams,
    ) -> Result<ActResult, ActuatorFault> {
        self.pause().await;
        self.begin("act", format!("{action:?}:{}", handle.id))?;
        let mut state = self.state.lock();
        let permissive = self.permissive;
        let element = match state
            .elements
            .get_mut(&handle.selector)
            .and_then(|elements| elements.get_mut(handle.order))
        {
            Some(element) => element,
            None if permissive => return Ok(synthetic_result(action)),
            None => return Err(ActuatorFault::element_not_found(&handle.selector)),
        };

        let text_param = |key: &str| {
            params
                .get(key)
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };

        let result = match action {
            ElementAction::Type => {
                let clear = params.get("clear").and_then(Value::as_bool).unwrap_or(false);
                if clear {
                    element.value.clear();
                }
                element.value.push_str(&text_param("text"));
                ActResult::done()
            }
            ElementAction::Clear => {
                element.value.clear();
                ActResult::done()
            }
            ElementAction::SelectOption => {
                let choice = ["value", "label", "index"]
                    .into_iter()
                    .map(text_param)
                    .find(|choice| !choice.is_empty())
                    .unwrap_or_default();
                element.value = choice;
                ActResult::done()
            }
            ElementAction::Check => {
                element.checked = true;
                ActResult::done()
            }
            ElementAction::Uncheck => {
                element.checked = false;
                ActResult::done()
            }
            ElementAction::UploadFile => {
                element.value = text_param("path");
                ActResult::done()
            }
            ElementAction::ReadText => ActResult::with_value(element.text.clone()),
            ElementAction::ReadHtml => ActResult::with_value(element.html.clone()),
            ElementAction::ReadValue => ActResult::with_value(element.value.clone()),
            ElementAction::ReadAttribute => {
                let name = text_param("attribute");
                match element.attributes.get(&name) {
                    Some(value) => ActResult::with_value(value.clone()),
                    None => ActResult::with_value(Value::Null),
                }
            }
            ElementAction::Click
            | ElementAction::DoubleClick
            | ElementAction::RightClick
            | ElementAction::Hover
            | ElementAction::Focus
            | ElementAction::ScrollIntoView
            | ElementAction::PressKey => ActResult::done(),
        };
        Ok(result)
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), ActuatorFault> {
        self.pause().await;
        self.begin("navigate", url)?;
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.url, url.to_string());
        state.back.push(previous);
        state.forward.clear();
        let active = state.active_tab;
        if let Some(tab) = state.tabs.get_mut(active) {
            *tab = url.to_string();
        }
        Ok(())
    }

    async fn evaluate_script(
        &self,
        code: &str,
        injected: &Map<String, Value>,
    ) -> Result<Value, ActuatorFault> {
        self.pause().await;
        self.begin("evaluate_script", code)?;
        let state = self.state.lock();
        if let Some(value) = state.script_results.get(code) {
            return Ok(value.clone());
        }
        if let Some(name) = code.trim().strip_prefix("return ") {
            if let Some(value) = injected.get(name.trim_end_matches(';').trim()) {
                return Ok(value.clone());
            }
        }
        Ok(Value::Null)
    }

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, ActuatorFault> {
        self.pause().await;
        self.begin("screenshot", format!("full_page={}", options.full_page))?;
        // PNG signature so callers can sniff the format
        Ok(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
    }

    async fn read_cookies(&self) -> Result<Vec<Cookie>, ActuatorFault> {
        self.begin("read_cookies", "")?;
        Ok(self.state.lock().cookies.clone())
    }

    async fn clear_cookies(&self) -> Result<(), ActuatorFault> {
        self.begin("clear_cookies", "")?;
        self.state.lock().cookies.clear();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, ActuatorFault> {
        self.begin("current_url", "")?;
        Ok(self.state.lock().url.clone())
    }

    async fn page_command(&self, command: PageCommand) -> Result<Value, ActuatorFault> {
        self.pause().await;
        self.begin("page_command", command.name())?;
        let mut state = self.state.lock();
        match command {
            PageCommand::Refresh | PageCommand::ScrollBy { .. } | PageCommand::PressKey { .. } => {}
            PageCommand::GoBack => {
                if let Some(previous) = state.back.pop() {
                    let current = std::mem::replace(&mut state.url, previous);
                    state.forward.push(current);
                }
            }
            PageCommand::GoForward => {
                if let Some(next) = state.forward.pop() {
                    let current = std::mem::replace(&mut state.url, next);
                    state.back.push(current);
                }
            }
            PageCommand::NewTab { url } => {
                let url = url.unwrap_or_else(|| "about:blank".into());
                state.tabs.push(url.clone());
                state.active_tab = state.tabs.len() - 1;
                state.url = url;
            }
            PageCommand::CloseTab => {
                if state.tabs.len() > 1 {
                    let active = state.active_tab;
                    state.tabs.remove(active);
                    state.active_tab = active.min(state.tabs.len() - 1);
                    state.url = state.tabs[state.active_tab].clone();
                }
            }
            PageCommand::SwitchTab { index } => {
                let Some(url) = state.tabs.get(index).cloned() else {
                    return Err(ActuatorFault::classified(
                        browserflow_core_types::ErrorKind::Validation,
                        format!("no tab at index {index}"),
                    ));
                };
                state.active_tab = index;
                state.url = url;
            }
            PageCommand::Title => return Ok(Value::String(state.title.clone())),
        }
        Ok(Value::Null)
    }

    async fn restart(&self) -> Result<(), ActuatorFault> {
        self.begin("restart", "")?;
        self.state.lock().restarts += 1;
        Ok(())
    }
}

fn synthetic_result(action: ElementAction) -> ActResult {
    if action.is_read() {
        ActResult::with_value("")
    } else {
        ActResult::done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locate_all_walks_matches() {
        let actuator = ScriptedActuator::new();
        for label in ["a", "b", "c"] {
            actuator.add_element("li", ScriptedElement::with_text(label));
        }
        let handles = actuator
            .locate_all("li", SelectorKind::Css, 0)
            .await
            .unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[2].order, 2);

        let capped = actuator
            .locate_all("li", SelectorKind::Css, 2)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn element_appears_after_misses() {
        let actuator = ScriptedActuator::new();
        actuator.add_element("#go", ScriptedElement::default());
        actuator.appear_after("#go", 1);
        assert!(actuator
            .locate("#go", SelectorKind::Css, 0)
            .await
            .unwrap()
            .is_none());
        assert!(actuator
            .locate("#go", SelectorKind::Css, 0)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn queued_fault_fires_once() {
        let actuator = ScriptedActuator::new();
        actuator.fail_next("navigate", ActuatorFault::raw("connection reset"));
        assert!(actuator
            .navigate("https://example.com", Duration::from_secs(1))
            .await
            .is_err());
        actuator
            .navigate("https://example.com", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(actuator.current_url().await.unwrap(), "https://example.com");
        assert_eq!(actuator.call_count("navigate"), 2);
    }

    #[tokio::test]
    async fn typing_updates_value() {
        let actuator = ScriptedActuator::new();
        actuator.add_element("input", ScriptedElement::default());
        let handle = actuator
            .locate("input", SelectorKind::Css, 0)
            .await
            .unwrap()
            .unwrap();
        let mut params = ActParams::new();
        params.insert("text".into(), Value::String("hello".into()));
        actuator
            .act(&handle, ElementAction::Type, &params)
            .await
            .unwrap();
        let read = actuator
            .act(&handle, ElementAction::ReadValue, &ActParams::new())
            .await
            .unwrap();
        assert_eq!(read.value, Some(Value::String("hello".into())));
    }

    #[test]
    fn history_commands_move_between_pages() {
        tokio_test::block_on(async {
            let actuator = ScriptedActuator::new();
            actuator
                .navigate("https://a.test", Duration::from_secs(1))
                .await
                .unwrap();
            actuator
                .navigate("https://b.test", Duration::from_secs(1))
                .await
                .unwrap();
            actuator.page_command(PageCommand::GoBack).await.unwrap();
            assert_eq!(actuator.current_url().await.unwrap(), "https://a.test");
            actuator.page_command(PageCommand::GoForward).await.unwrap();
            assert_eq!(actuator.current_url().await.unwrap(), "https://b.test");
        });
    }
}
