//! Element interaction handlers

use action_primitives::{ActParams, ActuatorFault, ElementAction, ElementHandle, PageCommand, SelectorKind};
use serde_json::Value;
use tracing::debug;

use super::{HandlerContext, StepOutput};
use crate::errors::FlowError;

const SELECTOR: &[&str] = &["selector", "css", "xpath", "element"];

/// Element the step addresses: its own selector, or the element bound by the
/// enclosing element loop.
pub(super) async fn target(ctx: &HandlerContext<'_>) -> Result<ElementHandle, FlowError> {
    let params = ctx.params();
    let Some(selector) = params.text(SELECTOR) else {
        return ctx
            .current_element
            .cloned()
            .ok_or_else(|| FlowError::MissingParameter("selector".to_string()));
    };
    let kind = selector_kind(ctx)?;
    let order = params.unsigned(&["index", "order"])?.unwrap_or(0) as usize;

    let located = ctx.actuator.locate(&selector, kind, order).await?;
    located.ok_or(FlowError::ElementNotFound(selector))
}

pub(super) fn selector_kind(ctx: &HandlerContext<'_>) -> Result<SelectorKind, FlowError> {
    let params = ctx.params();
    if let Some(kind) = params.text(&["selector_kind", "selectorKind", "by"]) {
        return Ok(kind.parse::<SelectorKind>()?);
    }
    // `xpath` given as the selector parameter name implies the kind
    if params.text(&["selector", "css"]).is_none() && params.text(&["xpath"]).is_some() {
        return Ok(SelectorKind::Xpath);
    }
    Ok(SelectorKind::Css)
}

/// Run `action` on `handle`; a refused action becomes an unclassified fault.
pub(super) async fn act(
    ctx: &HandlerContext<'_>,
    handle: &ElementHandle,
    action: ElementAction,
    params: &ActParams,
) -> Result<Option<Value>, FlowError> {
    debug!(step = %ctx.step.id, element = %handle.id, ?action, "element action");
    let result = ctx.actuator.act(handle, action, params).await?;
    if !result.ok {
        let message = result
            .message
            .unwrap_or_else(|| format!("{action:?} on {} was refused", handle.selector));
        return Err(ActuatorFault::raw(message).into());
    }
    Ok(result.value)
}

async fn interact(ctx: &HandlerContext<'_>, action: ElementAction) -> Result<StepOutput, FlowError> {
    let handle = target(ctx).await?;
    act(ctx, &handle, action, ctx.params).await?;
    Ok(StepOutput::message(format!("{action:?} on {}", handle.selector)).with_data(handle.id))
}

pub(super) async fn click(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Click).await
}

pub(super) async fn double_click(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::DoubleClick).await
}

pub(super) async fn right_click(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::RightClick).await
}

pub(super) async fn hover(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Hover).await
}

pub(super) async fn focus(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Focus).await
}

pub(super) async fn check(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Check).await
}

pub(super) async fn uncheck(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Uncheck).await
}

pub(super) async fn clear_input(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::Clear).await
}

pub(super) async fn scroll_to_element(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    interact(ctx, ElementAction::ScrollIntoView).await
}

pub(super) async fn type_text(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let text = params
        .raw_text(&["text", "value", "content"])
        .ok_or_else(|| FlowError::MissingParameter("text".to_string()))?;
    let handle = target(ctx).await?;

    if params.flag(&["clear_first", "clearFirst", "clear"], true) {
        act(ctx, &handle, ElementAction::Clear, &ActParams::new()).await?;
    }
    let mut act_params = ctx.params.clone();
    act_params.insert("text".to_string(), Value::String(text.clone()));
    act(ctx, &handle, ElementAction::Type, &act_params).await?;

    Ok(StepOutput::message(format!(
        "typed {} chars into {}",
        text.chars().count(),
        handle.selector
    )))
}

pub(super) async fn select_option(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let option = ctx.params().require_text(&["option", "value", "label"])?;
    let handle = target(ctx).await?;
    let mut act_params = ctx.params.clone();
    act_params.insert("value".to_string(), Value::String(option.clone()));
    act(ctx, &handle, ElementAction::SelectOption, &act_params).await?;
    Ok(StepOutput::message(format!("selected '{option}' in {}", handle.selector)).with_data(option))
}

pub(super) async fn upload_file(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let file = ctx.params().require_text(&["file", "path", "file_path"])?;
    let handle = target(ctx).await?;
    let mut act_params = ctx.params.clone();
    act_params.insert("path".to_string(), Value::String(file.clone()));
    act(ctx, &handle, ElementAction::UploadFile, &act_params).await?;
    Ok(StepOutput::message(format!("uploaded {file}")))
}

/// With a selector the key goes to that element; otherwise to the page.
pub(super) async fn press_key(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let key = params.require_text(&["key", "keys"])?;

    if params.text(SELECTOR).is_some() || ctx.current_element.is_some() {
        let handle = target(ctx).await?;
        let mut act_params = ctx.params.clone();
        act_params.insert("key".to_string(), Value::String(key.clone()));
        act(ctx, &handle, ElementAction::PressKey, &act_params).await?;
        return Ok(StepOutput::message(format!("pressed {key} on {}", handle.selector)));
    }

    ctx.actuator
        .page_command(PageCommand::PressKey { key: key.clone() })
        .await?;
    Ok(StepOutput::message(format!("pressed {key}")))
}
