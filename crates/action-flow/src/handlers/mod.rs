//! Step handlers and the static dispatch table
//!
//! Every non-control operation maps to one async handler. The table is built
//! once; operations without an entry fail closed at dispatch.

mod browser;
mod data;
mod element;
mod extract;
mod page;
mod params;

use std::collections::HashMap;
use std::time::Duration;

use action_primitives::{Actuator, ElementHandle};
use browserflow_execution_log::ExecutionLogger;
use browserflow_variables::VariableStore;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::errors::FlowError;
use crate::interpreter::InterpreterLimits;
use crate::model::Step;
use crate::operation::OperationKind;

pub(crate) use page::requested_wait;
pub(crate) use params::Params;

/// Everything a handler may touch while running one step.
pub struct HandlerContext<'a> {
    pub step: &'a Step,
    /// Parameters with `${name}` references already resolved
    pub params: &'a Map<String, Value>,
    pub actuator: &'a dyn Actuator,
    pub variables: &'a VariableStore,
    pub logger: &'a ExecutionLogger,
    pub limits: &'a InterpreterLimits,
    /// Element bound by the innermost element loop
    pub current_element: Option<&'a ElementHandle>,
    /// Time budget of this attempt
    pub timeout: Duration,
}

impl HandlerContext<'_> {
    pub(crate) fn params(&self) -> Params<'_> {
        Params::new(self.params)
    }
}

/// What a successful handler hands back to the interpreter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub message: String,
    /// Written to `output_variable` when the step names one
    pub data: Option<Value>,
    /// End the run after this step
    pub stop: bool,
}

impl StepOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<StepOutput, FlowError>>;
pub type HandlerFn = for<'a> fn(&'a HandlerContext<'a>) -> HandlerFuture<'a>;

macro_rules! handler {
    ($func:path) => {{
        fn boxed<'a>(ctx: &'a HandlerContext<'a>) -> HandlerFuture<'a> {
            Box::pin($func(ctx))
        }
        boxed as HandlerFn
    }};
}

static HANDLERS: Lazy<HashMap<OperationKind, HandlerFn>> = Lazy::new(|| {
    use OperationKind::*;

    let mut table: HashMap<OperationKind, HandlerFn> = HashMap::new();

    table.insert(Navigate, handler!(page::navigate));
    table.insert(Refresh, handler!(page::refresh));
    table.insert(GoBack, handler!(page::go_back));
    table.insert(GoForward, handler!(page::go_forward));
    table.insert(NewTab, handler!(page::new_tab));
    table.insert(CloseTab, handler!(page::close_tab));
    table.insert(SwitchTab, handler!(page::switch_tab));
    table.insert(GetCurrentUrl, handler!(page::get_current_url));
    table.insert(ScrollPage, handler!(page::scroll_page));
    table.insert(WaitTime, handler!(page::wait_time));
    table.insert(WaitForElement, handler!(page::wait_for_element));
    table.insert(WaitForUrl, handler!(page::wait_for_url));

    table.insert(Click, handler!(element::click));
    table.insert(DoubleClick, handler!(element::double_click));
    table.insert(RightClick, handler!(element::right_click));
    table.insert(Hover, handler!(element::hover));
    table.insert(TypeText, handler!(element::type_text));
    table.insert(ClearInput, handler!(element::clear_input));
    table.insert(SelectOption, handler!(element::select_option));
    table.insert(Check, handler!(element::check));
    table.insert(Uncheck, handler!(element::uncheck));
    table.insert(Focus, handler!(element::focus));
    table.insert(UploadFile, handler!(element::upload_file));
    table.insert(ScrollToElement, handler!(element::scroll_to_element));
    table.insert(PressKey, handler!(element::press_key));

    table.insert(ExtractText, handler!(extract::extract_text));
    table.insert(ExtractAttribute, handler!(extract::extract_attribute));
    table.insert(ExtractHtml, handler!(extract::extract_html));
    table.insert(ExtractValue, handler!(extract::extract_value));
    table.insert(ExtractTitle, handler!(extract::extract_title));
    table.insert(ElementCount, handler!(extract::element_count));
    table.insert(ElementExists, handler!(extract::element_exists));

    table.insert(ExecuteScript, handler!(browser::execute_script));
    table.insert(Screenshot, handler!(browser::screenshot));
    table.insert(GetCookies, handler!(browser::get_cookies));
    table.insert(ClearCookies, handler!(browser::clear_cookies));

    table.insert(SetVariable, handler!(data::set_variable));
    table.insert(IncrementVariable, handler!(data::increment_variable));
    table.insert(RandomNumber, handler!(data::random_number));
    table.insert(MathOperation, handler!(data::math_operation));
    table.insert(TextReplace, handler!(data::text_replace));
    table.insert(TextSplit, handler!(data::text_split));
    table.insert(JsonExtract, handler!(data::json_extract));
    table.insert(LogMessage, handler!(data::log_message));
    table.insert(StopFlow, handler!(data::stop_flow));

    table
});

/// Handler for `kind`, if it has one. Control operations never do.
pub fn lookup(kind: OperationKind) -> Option<HandlerFn> {
    HANDLERS.get(&kind).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_non_control_operation_has_a_handler() {
        for kind in OperationKind::ALL {
            assert_eq!(
                lookup(*kind).is_some(),
                !kind.is_control(),
                "dispatch entry mismatch for {kind}"
            );
        }
    }
}
