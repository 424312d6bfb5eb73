//! Reading data out of the page

use action_primitives::{ActParams, ElementAction, PageCommand};
use serde_json::Value;

use super::element::{act, selector_kind, target};
use super::{HandlerContext, StepOutput};
use crate::errors::FlowError;

async fn read(ctx: &HandlerContext<'_>, action: ElementAction, params: &ActParams) -> Result<StepOutput, FlowError> {
    let handle = target(ctx).await?;
    let value = act(ctx, &handle, action, params).await?.unwrap_or(Value::Null);
    let value = match value {
        Value::String(text) if ctx.params().flag(&["trim"], true) => Value::String(text.trim().to_string()),
        other => other,
    };
    Ok(StepOutput::message(format!("read {action:?} from {}", handle.selector)).with_data(value))
}

pub(super) async fn extract_text(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    read(ctx, ElementAction::ReadText, ctx.params).await
}

pub(super) async fn extract_html(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    read(ctx, ElementAction::ReadHtml, ctx.params).await
}

pub(super) async fn extract_value(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    read(ctx, ElementAction::ReadValue, ctx.params).await
}

pub(super) async fn extract_attribute(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let attribute = ctx.params().require_text(&["attribute", "attr", "name"])?;
    let mut params = ctx.params.clone();
    params.insert("attribute".to_string(), Value::String(attribute));
    read(ctx, ElementAction::ReadAttribute, &params).await
}

pub(super) async fn extract_title(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let title = ctx.actuator.page_command(PageCommand::Title).await?;
    Ok(StepOutput::message("read page title").with_data(title))
}

pub(super) async fn element_count(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let selector = ctx.params().require_text(&["selector", "css", "xpath"])?;
    let kind = selector_kind(ctx)?;
    let handles = ctx
        .actuator
        .locate_all(&selector, kind, ctx.limits.max_element_loop)
        .await?;
    Ok(StepOutput::message(format!("{} matches for {selector}", handles.len())).with_data(handles.len()))
}

/// Absence is a `false` result, not a failure.
pub(super) async fn element_exists(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let selector = ctx.params().require_text(&["selector", "css", "xpath"])?;
    let kind = selector_kind(ctx)?;
    let exists = ctx.actuator.locate(&selector, kind, 0).await?.is_some();
    Ok(StepOutput::message(format!("{selector} exists: {exists}")).with_data(exists))
}
