//! Scripts, screenshots and cookies

use action_primitives::{ImageFormat, ScreenshotOptions};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use super::element::target;
use super::{HandlerContext, StepOutput};
use crate::errors::FlowError;

/// Runs `script` with the visible variables injected, plus any `args` object.
pub(super) async fn execute_script(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let code = params.require_text(&["script", "code", "javascript"])?;

    let mut injected: Map<String, Value> = ctx
        .variables
        .snapshot()
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect();
    if let Some(Value::Object(args)) = params.value(&["args", "arguments"]) {
        injected.extend(args.clone());
    }

    let value = ctx.actuator.evaluate_script(&code, &injected).await?;
    Ok(StepOutput::message("script evaluated").with_data(value))
}

/// Captured bytes go to `path` when given; otherwise the data is base64 text.
pub(super) async fn screenshot(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let format = match params.text(&["format", "type"]).as_deref() {
        None | Some("png") => ImageFormat::Png,
        Some("jpeg" | "jpg") => ImageFormat::Jpeg,
        Some(other) => return Err(FlowError::invalid("format", format!("unsupported image format '{other}'"))),
    };
    let element = if params.text(&["selector", "css", "xpath"]).is_some() {
        Some(target(ctx).await?)
    } else {
        None
    };
    let options = ScreenshotOptions {
        full_page: params.flag(&["full_page", "fullPage"], false),
        element,
        format,
    };

    let bytes = ctx.actuator.screenshot(&options).await?;
    match params.text(&["path", "file", "save_path"]) {
        Some(path) => {
            let save_failed = |err: std::io::Error| FlowError::Logic(format!("saving screenshot to {path}: {err}"));
            if let Some(parent) = std::path::Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(save_failed)?;
                }
            }
            tokio::fs::write(&path, &bytes).await.map_err(save_failed)?;
            Ok(StepOutput::message(format!("screenshot saved to {path}"))
                .with_data(json!({ "path": path, "bytes": bytes.len() })))
        }
        None => Ok(StepOutput::message(format!("screenshot captured ({} bytes)", bytes.len()))
            .with_data(STANDARD.encode(&bytes))),
    }
}

pub(super) async fn get_cookies(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let cookies = ctx.actuator.read_cookies().await?;
    let count = cookies.len();
    let data = serde_json::to_value(cookies)?;
    Ok(StepOutput::message(format!("read {count} cookies")).with_data(data))
}

pub(super) async fn clear_cookies(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    ctx.actuator.clear_cookies().await?;
    Ok(StepOutput::message("cookies cleared"))
}
