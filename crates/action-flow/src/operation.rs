//! Operation names and their classification

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! operation_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Every operation the interpreter understands
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OperationKind {
            $($variant),+
        }

        impl OperationKind {
            pub const ALL: &'static [OperationKind] = &[$(OperationKind::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(OperationKind::$variant => $name),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(OperationKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

operation_kinds! {
    // navigation and page
    Navigate => "navigate",
    Refresh => "refresh",
    GoBack => "go_back",
    GoForward => "go_forward",
    NewTab => "new_tab",
    CloseTab => "close_tab",
    SwitchTab => "switch_tab",
    GetCurrentUrl => "get_current_url",
    ScrollPage => "scroll_page",
    // element interaction
    Click => "click",
    DoubleClick => "double_click",
    RightClick => "right_click",
    Hover => "hover",
    TypeText => "type_text",
    ClearInput => "clear_input",
    SelectOption => "select_option",
    Check => "check",
    Uncheck => "uncheck",
    Focus => "focus",
    UploadFile => "upload_file",
    ScrollToElement => "scroll_to_element",
    PressKey => "press_key",
    // waiting
    WaitTime => "wait_time",
    WaitForElement => "wait_for_element",
    WaitForUrl => "wait_for_url",
    // extraction
    ExtractText => "extract_text",
    ExtractAttribute => "extract_attribute",
    ExtractHtml => "extract_html",
    ExtractValue => "extract_value",
    ExtractTitle => "extract_title",
    ElementCount => "element_count",
    ElementExists => "element_exists",
    // browser data
    ExecuteScript => "execute_script",
    Screenshot => "screenshot",
    GetCookies => "get_cookies",
    ClearCookies => "clear_cookies",
    // data and variables
    SetVariable => "set_variable",
    IncrementVariable => "increment_variable",
    RandomNumber => "random_number",
    MathOperation => "math_operation",
    TextReplace => "text_replace",
    TextSplit => "text_split",
    JsonExtract => "json_extract",
    LogMessage => "log_message",
    StopFlow => "stop_flow",
    // control flow
    If => "if",
    Else => "else",
    EndIf => "end_if",
    LoopElements => "loop_elements",
    LoopCount => "loop_count",
    LoopData => "loop_data",
    While => "while",
    EndLoop => "end_loop",
    BreakLoop => "break_loop",
}

impl OperationKind {
    /// Handled by the interpreter itself rather than the dispatch table.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            OperationKind::If
                | OperationKind::Else
                | OperationKind::EndIf
                | OperationKind::LoopElements
                | OperationKind::LoopCount
                | OperationKind::LoopData
                | OperationKind::While
                | OperationKind::EndLoop
                | OperationKind::BreakLoop
        )
    }

    pub fn opens_loop(self) -> bool {
        matches!(
            self,
            OperationKind::LoopElements
                | OperationKind::LoopCount
                | OperationKind::LoopData
                | OperationKind::While
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation named by a step. Unknown names are kept so they can be written
/// back unchanged and rejected at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Known(OperationKind),
    Unknown(String),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Known(kind) => kind.as_str(),
            Operation::Unknown(name) => name,
        }
    }

    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            Operation::Known(kind) => Some(*kind),
            Operation::Unknown(_) => None,
        }
    }
}

impl From<OperationKind> for Operation {
    fn from(kind: OperationKind) -> Self {
        Operation::Known(kind)
    }
}

impl From<String> for Operation {
    fn from(name: String) -> Self {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        match OperationKind::from_name(&normalized) {
            Some(kind) => Operation::Known(kind),
            None => Operation::Unknown(name),
        }
    }
}

impl From<&str> for Operation {
    fn from(name: &str) -> Self {
        Operation::from(name.to_string())
    }
}

impl From<Operation> for String {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Known(kind) => kind.as_str().to_string(),
            Operation::Unknown(name) => name,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_name(kind.as_str()), Some(*kind));
        }
        assert_eq!(OperationKind::ALL.len(), 54);
    }

    #[test]
    fn unknown_names_are_preserved() {
        let op = Operation::from("Teleport");
        assert_eq!(op, Operation::Unknown("Teleport".into()));
        assert_eq!(String::from(op), "Teleport");
        assert_eq!(Operation::from("Type-Text"), Operation::Known(OperationKind::TypeText));
    }
}
