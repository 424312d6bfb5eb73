//! Core data types exchanged with an actuator

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::errors::ActuatorFault;

/// Free-form parameters passed along with an element action.
pub type ActParams = Map<String, Value>;

/// How a selector string should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Css,
    Xpath,
    Text,
}

impl SelectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectorKind::Css => "css",
            SelectorKind::Xpath => "xpath",
            SelectorKind::Text => "text",
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectorKind {
    type Err = ActuatorFault;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "css" | "selector" => Ok(SelectorKind::Css),
            "xpath" => Ok(SelectorKind::Xpath),
            "text" => Ok(SelectorKind::Text),
            other => Err(ActuatorFault::classified(
                browserflow_core_types::ErrorKind::Validation,
                format!("unknown selector kind '{other}'"),
            )),
        }
    }
}

/// Opaque reference to a located element.
///
/// `id` is assigned by the actuator and stays meaningful only for the
/// session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    pub selector: String,
    pub kind: SelectorKind,
    /// 0-based position among the matches of `selector`
    pub order: usize,
}

/// Element-level actions routed through [`crate::Actuator::act`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementAction {
    Click,
    DoubleClick,
    RightClick,
    Hover,
    /// params: `text`, optional `clear` (bool)
    Type,
    Clear,
    /// params: `value` | `label` | `index`
    SelectOption,
    Check,
    Uncheck,
    Focus,
    /// params: `path`
    UploadFile,
    ScrollIntoView,
    /// params: `key`
    PressKey,
    ReadText,
    /// params: `attribute`
    ReadAttribute,
    ReadHtml,
    ReadValue,
}

impl ElementAction {
    /// Actions that only read from the page.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            ElementAction::ReadText
                | ElementAction::ReadAttribute
                | ElementAction::ReadHtml
                | ElementAction::ReadValue
        )
    }
}

/// Result of an element action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActResult {
    pub ok: bool,
    /// Value produced by read actions
    pub value: Option<Value>,
    pub message: Option<String>,
}

impl ActResult {
    pub fn done() -> Self {
        Self {
            ok: true,
            value: None,
            message: None,
        }
    }

    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            ok: true,
            value: Some(value.into()),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScreenshotOptions {
    pub full_page: bool,
    /// Capture only this element when set
    pub element: Option<ElementHandle>,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

/// Page-level commands that do not target an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PageCommand {
    Refresh,
    GoBack,
    GoForward,
    NewTab { url: Option<String> },
    CloseTab,
    SwitchTab { index: usize },
    ScrollBy { x: i64, y: i64 },
    PressKey { key: String },
    Title,
}

impl PageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PageCommand::Refresh => "refresh",
            PageCommand::GoBack => "go_back",
            PageCommand::GoForward => "go_forward",
            PageCommand::NewTab { .. } => "new_tab",
            PageCommand::CloseTab => "close_tab",
            PageCommand::SwitchTab { .. } => "switch_tab",
            PageCommand::ScrollBy { .. } => "scroll_by",
            PageCommand::PressKey { .. } => "press_key",
            PageCommand::Title => "title",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_kind_parses_loosely() {
        assert_eq!("XPath".parse::<SelectorKind>().unwrap(), SelectorKind::Xpath);
        assert_eq!("".parse::<SelectorKind>().unwrap(), SelectorKind::Css);
        assert!("regex".parse::<SelectorKind>().is_err());
    }

    #[test]
    fn page_command_serializes_with_tag() {
        let json = serde_json::to_value(PageCommand::SwitchTab { index: 2 }).unwrap();
        assert_eq!(json["command"], "switch_tab");
        assert_eq!(json["index"], 2);
    }
}
