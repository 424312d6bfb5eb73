//! Navigation, page commands and waiting

use std::time::Duration;

use action_primitives::PageCommand;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};

use super::element::selector_kind;
use super::{HandlerContext, Params, StepOutput};
use crate::errors::FlowError;

const POLL_INTERVAL_MS: u64 = 250;

pub(super) async fn navigate(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let url = ctx.params().require_text(&["url", "href"])?;
    ctx.actuator.navigate(&url, ctx.timeout).await?;
    Ok(StepOutput::message(format!("navigated to {url}")).with_data(url))
}

async fn command(ctx: &HandlerContext<'_>, command: PageCommand) -> Result<Value, FlowError> {
    Ok(ctx.actuator.page_command(command).await?)
}

pub(super) async fn refresh(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    command(ctx, PageCommand::Refresh).await?;
    Ok(StepOutput::message("page refreshed"))
}

pub(super) async fn go_back(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    command(ctx, PageCommand::GoBack).await?;
    Ok(StepOutput::message("went back"))
}

pub(super) async fn go_forward(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    command(ctx, PageCommand::GoForward).await?;
    Ok(StepOutput::message("went forward"))
}

pub(super) async fn new_tab(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let url = ctx.params().text(&["url"]);
    let opened = command(ctx, PageCommand::NewTab { url: url.clone() }).await?;
    let message = match url {
        Some(url) => format!("opened tab at {url}"),
        None => "opened blank tab".to_string(),
    };
    Ok(StepOutput::message(message).with_data(opened))
}

pub(super) async fn close_tab(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    command(ctx, PageCommand::CloseTab).await?;
    Ok(StepOutput::message("closed tab"))
}

pub(super) async fn switch_tab(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let index = ctx
        .params()
        .unsigned(&["index", "tab", "tab_index"])?
        .ok_or_else(|| FlowError::MissingParameter("index".to_string()))? as usize;
    command(ctx, PageCommand::SwitchTab { index }).await?;
    Ok(StepOutput::message(format!("switched to tab {index}")).with_data(index))
}

pub(super) async fn get_current_url(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let url = ctx.actuator.current_url().await?;
    Ok(StepOutput::message(format!("current url {url}")).with_data(url))
}

/// Scroll by `x`/`y`, or by `amount` in a `direction`.
pub(super) async fn scroll_page(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let amount = params.integer(&["amount", "distance"])?.unwrap_or(500);
    let back = amount.saturating_neg();
    let (mut x, mut y) = match params.text(&["direction"]).as_deref() {
        None | Some("down") => (0, amount),
        Some("up") => (0, back),
        Some("right") => (amount, 0),
        Some("left") => (back, 0),
        Some("top") => (0, i64::MIN / 2),
        Some("bottom") => (0, i64::MAX / 2),
        Some(other) => {
            return Err(FlowError::invalid("direction", format!("unknown direction '{other}'")))
        }
    };
    if let Some(dx) = params.integer(&["x"])? {
        x = dx;
    }
    if let Some(dy) = params.integer(&["y"])? {
        y = dy;
    }
    command(ctx, PageCommand::ScrollBy { x, y }).await?;
    Ok(StepOutput::message(format!("scrolled by ({x}, {y})")))
}

/// Requested pause, from `duration`/`ms` in milliseconds or `seconds`.
pub(crate) fn requested_wait(params: &Map<String, Value>) -> Result<Duration, FlowError> {
    let params = Params::new(params);
    if let Some(seconds) = params.number(&["seconds"])? {
        if seconds < 0.0 {
            return Err(FlowError::invalid("seconds", "must not be negative"));
        }
        return Duration::try_from_secs_f64(seconds)
            .map_err(|err| FlowError::invalid("seconds", err.to_string()));
    }
    let millis = params
        .unsigned(&["duration", "ms", "time", "wait"])?
        .ok_or_else(|| FlowError::MissingParameter("duration".to_string()))?;
    Ok(Duration::from_millis(millis))
}

pub(super) async fn wait_time(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let duration = requested_wait(ctx.params)?;
    sleep(duration).await;
    Ok(StepOutput::message(format!("waited {}ms", duration.as_millis())))
}

fn poll_budget(ctx: &HandlerContext<'_>) -> Result<(Duration, Duration), FlowError> {
    let params = ctx.params();
    let budget = params
        .unsigned(&["wait_timeout", "waitTimeout"])?
        .map(Duration::from_millis)
        .unwrap_or(ctx.timeout)
        .min(ctx.timeout);
    let interval = params
        .unsigned(&["interval", "poll_interval"])?
        .unwrap_or(POLL_INTERVAL_MS)
        .max(10);
    Ok((budget, Duration::from_millis(interval)))
}

/// Poll until the element is present, or absent with `state: "hidden"`.
pub(super) async fn wait_for_element(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let selector = params.require_text(&["selector", "css", "xpath"])?;
    let kind = selector_kind(ctx)?;
    let want_present = !matches!(
        params.text(&["state"]).as_deref(),
        Some("hidden" | "absent" | "detached" | "gone")
    );
    let (budget, interval) = poll_budget(ctx)?;
    let deadline = Instant::now() + budget;

    loop {
        let found = ctx.actuator.locate(&selector, kind, 0).await?;
        if found.is_some() == want_present {
            let message = if want_present {
                format!("{selector} appeared")
            } else {
                format!("{selector} is gone")
            };
            return Ok(StepOutput::message(message).with_data(want_present));
        }
        if Instant::now() + interval > deadline {
            return if want_present {
                Err(FlowError::ElementNotFound(selector))
            } else {
                Err(FlowError::Timeout(budget.as_millis() as u64))
            };
        }
        sleep(interval).await;
    }
}

/// Poll the current url for a substring (`url`) or a regex (`pattern`).
pub(super) async fn wait_for_url(ctx: &HandlerContext<'_>) -> Result<StepOutput, FlowError> {
    let params = ctx.params();
    let matcher = match params.text(&["pattern", "regex"]) {
        Some(pattern) => UrlMatcher::Pattern(
            Regex::new(&pattern).map_err(|err| FlowError::invalid("pattern", err.to_string()))?,
        ),
        None => UrlMatcher::Contains(params.require_text(&["url", "contains"])?),
    };
    let (budget, interval) = poll_budget(ctx)?;
    let deadline = Instant::now() + budget;

    loop {
        let current = ctx.actuator.current_url().await?;
        if matcher.matches(&current) {
            return Ok(StepOutput::message(format!("url is now {current}")).with_data(current));
        }
        if Instant::now() + interval > deadline {
            return Err(FlowError::Timeout(budget.as_millis() as u64));
        }
        sleep(interval).await;
    }
}

enum UrlMatcher {
    Contains(String),
    Pattern(Regex),
}

impl UrlMatcher {
    fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Contains(fragment) => url.contains(fragment.as_str()),
            UrlMatcher::Pattern(pattern) => pattern.is_match(url),
        }
    }
}
