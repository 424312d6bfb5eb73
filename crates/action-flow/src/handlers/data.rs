//! Variable and text manipulation

use browserflow_execution_log::LogLevel;
use browserflow_variables::{Scope, VarValue};
use rand::Rng;
use regex::Regex;
use serde_json::Value;

use super::{HandlerContext, StepOutput};
use crate::errors::FlowError;

const NAME: &[&str] = &["name", "variable", "variable_name", "variableName"];

fn scope(ctx: &HandlerContext<'_>) -> Result<Scope, FlowError> {
    match ctx.params().text(&["scope"]) {
        Some(raw) => Ok(raw.parse::<Scope>()?),
        None => Ok(Scope::Custom),
    }
}

pub(super) async fn set_variable(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let name = ctx.params().require_text(NAME)?;
    let value = ctx.params().value(&["value"]).cloned().unwrap_or(Value::Null);
    let scope = scope(ctx)?;
    ctx.variables.set(&name, value.clone(), scope)?;
    Ok(StepOutput::message(format!("set {name} in {scope} scope")).with_data(value))
}

/// Adds `by` (default 1) to a numeric variable; a missing variable counts as 0.
pub(super) async fn increment_variable(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let name = params.require_text(NAME)?;
    let by = params.number(&["by", "step", "amount", "value"])?.unwrap_or(1.0);
    let current = match ctx.variables.get(&name) {
        None => 0.0,
        Some(value) if value.is_empty() => 0.0,
        Some(value) => value
            .as_number()
            .ok_or_else(|| FlowError::Logic(format!("variable '{name}' = '{value}' is not a number")))?,
    };
    let next = current + by;
    ctx.variables.set(&name, next, scope(ctx)?)?;
    Ok(StepOutput::message(format!("{name} = {}", VarValue::Number(next))).with_data(VarValue::Number(next).to_json()))
}

pub(super) async fn random_number(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let min = params.number(&["min", "from"])?.unwrap_or(0.0);
    let max = params.number(&["max", "to"])?.unwrap_or(100.0);
    if min > max {
        return Err(FlowError::invalid("min", format!("{min} is greater than max {max}")));
    }
    let decimals = params.unsigned(&["decimals", "precision"])?.unwrap_or(0);
    if decimals > 0 && !(max - min).is_finite() {
        return Err(FlowError::invalid("max", format!("range {min}..{max} is too wide")));
    }

    let (low, high) = (min.ceil() as i64, max.floor() as i64);
    if decimals == 0 && low > high {
        return Err(FlowError::invalid("min", format!("no integer between {min} and {max}")));
    }

    let value = {
        let mut rng = rand::thread_rng();
        if decimals == 0 {
            rng.gen_range(low..=high) as f64
        } else {
            round_to(rng.gen_range(min..=max), decimals)
        }
    };
    Ok(StepOutput::message(format!("random {}", VarValue::Number(value)))
        .with_data(VarValue::Number(value).to_json()))
}

/// `left <operator> right`. Symbols and names are both accepted.
pub(super) async fn math_operation(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let left = params.require_number(&["left", "a", "value1", "first"])?;
    let operator = params.require_text(&["operator", "operation", "op"])?;
    let unary = matches!(operator.as_str(), "abs" | "round" | "floor" | "ceil" | "sqrt");
    let right = if unary {
        0.0
    } else {
        params.require_number(&["right", "b", "value2", "second"])?
    };

    let result = match operator.to_ascii_lowercase().as_str() {
        "+" | "add" | "plus" => left + right,
        "-" | "subtract" | "sub" | "minus" => left - right,
        "*" | "multiply" | "mul" | "times" => left * right,
        "/" | "divide" | "div" => {
            if right == 0.0 {
                return Err(FlowError::Logic("division by zero".to_string()));
            }
            left / right
        }
        "%" | "mod" | "modulo" => {
            if right == 0.0 {
                return Err(FlowError::Logic("modulo by zero".to_string()));
            }
            left % right
        }
        "^" | "**" | "pow" | "power" => left.powf(right),
        "min" => left.min(right),
        "max" => left.max(right),
        "abs" => left.abs(),
        "round" => left.round(),
        "floor" => left.floor(),
        "ceil" => left.ceil(),
        "sqrt" if left < 0.0 => {
            return Err(FlowError::Logic(format!("square root of negative {left}")))
        }
        "sqrt" => left.sqrt(),
        other => return Err(FlowError::invalid("operator", format!("unknown operator '{other}'"))),
    };
    if !result.is_finite() {
        return Err(FlowError::Logic(format!("{left} {operator} {right} is not finite")));
    }
    let result = match params.unsigned(&["precision", "decimals"])? {
        Some(decimals) => round_to(result, decimals),
        None => result,
    };
    let value = VarValue::Number(result);
    Ok(StepOutput::message(format!("{left} {operator} {right} = {value}")).with_data(value.to_json()))
}

fn round_to(value: f64, decimals: u64) -> f64 {
    let factor = 10f64.powi(decimals.min(12) as i32);
    (value * factor).round() / factor
}

pub(super) async fn text_replace(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let text = params.raw_text(&["text", "source", "input"]).unwrap_or_default();
    let find = params.require_text(&["find", "search", "pattern", "old"])?;
    let replacement = params.raw_text(&["replace", "replacement", "new"]).unwrap_or_default();

    let replaced = if params.flag(&["regex", "use_regex"], false) {
        let pattern = Regex::new(&find).map_err(|err| FlowError::invalid("find", err.to_string()))?;
        pattern.replace_all(&text, replacement.as_str()).into_owned()
    } else {
        text.replace(&find, &replacement)
    };
    Ok(StepOutput::message("text replaced").with_data(replaced))
}

/// Splits into an array; with `index` only that piece is produced.
pub(super) async fn text_split(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let text = params.raw_text(&["text", "source", "input"]).unwrap_or_default();
    let separator = params.raw_text(&["separator", "delimiter"]).unwrap_or_else(|| ",".to_string());
    let trim = params.flag(&["trim"], true);

    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(separator.as_str())
            .map(|piece| if trim { piece.trim() } else { piece })
            .filter(|piece| !(trim && piece.is_empty()))
            .map(str::to_string)
            .collect()
    };

    match params.integer(&["index"])? {
        Some(index) => {
            let position = if index < 0 { pieces.len() as i64 + index } else { index };
            let piece = usize::try_from(position)
                .ok()
                .and_then(|position| pieces.get(position))
                .ok_or_else(|| FlowError::Logic(format!("index {index} out of range for {} pieces", pieces.len())))?;
            Ok(StepOutput::message(format!("piece {index} of {}", pieces.len())).with_data(piece.clone()))
        }
        None => Ok(StepOutput::message(format!("split into {} pieces", pieces.len())).with_data(pieces)),
    }
}

/// Walks a dotted path (`items.0.name`) into a JSON value or JSON text.
pub(super) async fn json_extract(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let source = params
        .value(&["source", "json", "data", "text"])
        .ok_or_else(|| FlowError::MissingParameter("source".to_string()))?;
    let document = match source {
        Value::String(text) => serde_json::from_str::<Value>(text)
            .map_err(|err| FlowError::Logic(format!("source is not JSON: {err}")))?,
        other => other.clone(),
    };
    let path = params.text(&["path", "key", "field"]).unwrap_or_default();

    let mut cursor = &document;
    for segment in path.trim_start_matches('$').split('.').filter(|s| !s.is_empty()) {
        cursor = match cursor {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
            Value::Object(map) => map.get(segment),
            _ => None,
        }
        .ok_or_else(|| FlowError::Logic(format!("path '{path}' not found at '{segment}'")))?;
    }
    Ok(StepOutput::message(format!("extracted '{path}'")).with_data(cursor.clone()))
}

pub(super) async fn log_message(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let message = params.raw_text(&["message", "text"]).unwrap_or_default();
    let level = params
        .text(&["level"])
        .map(|raw| raw.parse::<LogLevel>())
        .transpose()
        .map_err(|_| FlowError::invalid("level", "expected trace, debug, info, warn or error"))?
        .unwrap_or(LogLevel::Info);
    ctx.logger
        .step(&ctx.step.step_id(), level, message.clone(), Value::Null)?;
    Ok(StepOutput::message(message))
}

pub(super) async fn stop_flow(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let reason = ctx
        .params()
        .text(&["reason", "message"])
        .unwrap_or_else(|| "flow stopped by step".to_string());
    Ok(StepOutput {
        message: reason,
        data: None,
        stop: true,
    })
}
