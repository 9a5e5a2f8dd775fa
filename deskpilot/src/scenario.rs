//! Scenario documents: loading, schema validation, variables and typed steps.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::AutomationError;
use crate::object_map::Locator;
use crate::platforms::{ConnectParams, SelectOption, WaitState};

/// The schema every scenario is checked against unless another is supplied.
pub const SCENARIO_SCHEMA: &str = include_str!("../schema/scenario.schema.json");

static VAR_TOKEN: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}"));

fn var_token() -> Result<&'static Regex, AutomationError> {
    VAR_TOKEN
        .as_ref()
        .map_err(|e| AutomationError::Internal(format!("variable token pattern does not compile: {e}")))
}

/// A compiled Draft 7 scenario schema.
pub struct ScenarioSchema {
    compiled: JSONSchema,
}

impl fmt::Debug for ScenarioSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioSchema").finish_non_exhaustive()
    }
}

impl ScenarioSchema {
    pub fn builtin() -> Result<Self, AutomationError> {
        let schema: Value = serde_json::from_str(SCENARIO_SCHEMA)
            .map_err(|e| AutomationError::Internal(format!("built-in scenario schema is not JSON: {e}")))?;
        Self::compile(&schema)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AutomationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AutomationError::Config(format!("Cannot read schema '{}': {e}", path.display())))?;
        let schema: Value = serde_json::from_str(&text)
            .map_err(|e| AutomationError::Config(format!("Schema '{}' is not valid JSON: {e}", path.display())))?;
        Self::compile(&schema)
    }

    pub fn compile(schema: &Value) -> Result<Self, AutomationError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| AutomationError::Config(format!("Scenario schema does not compile: {e}")))?;
        Ok(Self { compiled })
    }

    /// Checks `document`, reporting every violation with its instance path.
    pub fn validate(&self, document: &Value) -> Result<(), AutomationError> {
        if let Err(errors) = self.compiled.validate(document) {
            let mut problems: Vec<String> = errors
                .map(|err| {
                    let path = err.instance_path.to_string();
                    let path = if path.is_empty() { "/".to_string() } else { path };
                    format!("{path}: {err}")
                })
                .collect();
            problems.sort();
            return Err(AutomationError::Config(format!(
                "Scenario schema validation failed:\n  - {}",
                problems.join("\n  - ")
            )));
        }
        Ok(())
    }
}

/// One `{keyword: args}` entry of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub keyword: String,
    /// Always an object; a null argument block becomes an empty one.
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: Option<String>,
    pub vars: Map<String, Value>,
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Reads a YAML (or JSON) scenario file into an untyped document.
    pub fn read_document(path: impl AsRef<Path>) -> Result<Value, AutomationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AutomationError::Config(format!("Cannot read scenario '{}': {e}", path.display())))?;
        Self::parse_document(&text)
    }

    pub fn parse_document(text: &str) -> Result<Value, AutomationError> {
        serde_yaml::from_str(text).map_err(|e| AutomationError::Config(format!("Scenario is not valid YAML: {e}")))
    }

    /// Builds a scenario from a document that already passed the schema.
    pub fn from_document(document: &Value) -> Result<Self, AutomationError> {
        let root = document
            .as_object()
            .ok_or_else(|| AutomationError::Config("Scenario root must be a mapping".to_string()))?;
        let name = root.get("name").and_then(Value::as_str).map(str::to_string);
        let vars = match root.get("vars") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(vars)) => vars.clone(),
            Some(_) => return Err(AutomationError::Config("'vars' must be a mapping".to_string())),
        };

        let raw_steps = match root.get("steps") {
            Some(Value::Array(steps)) => steps,
            _ => return Err(AutomationError::Config("'steps' must be a list".to_string())),
        };
        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            let entry = raw.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
                AutomationError::Config(format!("Invalid step format at index {}: {raw}", index + 1))
            })?;
            for (keyword, args) in entry {
                let args = match args {
                    Value::Null => Value::Object(Map::new()),
                    Value::Object(_) => args.clone(),
                    _ => {
                        return Err(AutomationError::Config(format!(
                            "Step args must be a mapping at index {}: {raw}",
                            index + 1
                        )))
                    }
                };
                steps.push(Step {
                    keyword: keyword.clone(),
                    args,
                });
            }
        }

        Ok(Self { name, vars, steps })
    }

    /// Scenario variables overlaid with `external`, which wins on conflicts.
    pub fn merged_vars(&self, external: &Map<String, Value>) -> Map<String, Value> {
        let mut vars = self.vars.clone();
        for (key, value) in external {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }

    /// Substitutes variables into every step's arguments.
    pub fn resolve_vars(&mut self, vars: &Map<String, Value>) -> Result<(), AutomationError> {
        let token = var_token()?;
        for step in &mut self.steps {
            substitute(&mut step.args, vars, token);
        }
        Ok(())
    }
}

/// Replaces `${NAME}` tokens in every string of `value`.
///
/// A string that is exactly one token takes the variable's value as is, so
/// numbers and booleans keep their type. Inside longer strings the value is
/// rendered as text. Unknown names are left untouched.
pub fn substitute_variables(value: &mut Value, vars: &Map<String, Value>) -> Result<(), AutomationError> {
    substitute(value, vars, var_token()?);
    Ok(())
}

fn substitute(value: &mut Value, vars: &Map<String, Value>, token: &Regex) {
    match value {
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, vars, token);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                substitute(item, vars, token);
            }
        }
        Value::String(s) => {
            let whole = token
                .captures(s)
                .filter(|caps| caps.get(0).is_some_and(|m| m.as_str().len() == s.len()))
                .and_then(|caps| vars.get(&caps[1]));
            if let Some(replacement) = whole {
                debug!(token = %s, "whole-string variable substituted");
                *value = replacement.clone();
                return;
            }
            let replaced = token
                .replace_all(s, |caps: &Captures| match vars.get(&caps[1]) {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                })
                .into_owned();
            *s = replaced;
        }
        _ => {}
    }
}

/// Every keyword a step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    OpenApp,
    Connect,
    Click,
    DoubleClick,
    RightClick,
    Hover,
    Hotkey,
    Type,
    ClickAndType,
    Wait,
    WaitForGone,
    WaitForAny,
    Assert,
    AssertTextEquals,
    AssertTextContains,
    SetCheckbox,
    AssertCheckboxState,
    SelectCombobox,
    SelectComboboxItem,
    SelectListItem,
    AssertCount,
    CloseWindow,
    KillApp,
    ClickIfExists,
}

impl Keyword {
    pub const ALL: &'static [Keyword] = &[
        Keyword::OpenApp,
        Keyword::Connect,
        Keyword::Click,
        Keyword::DoubleClick,
        Keyword::RightClick,
        Keyword::Hover,
        Keyword::Hotkey,
        Keyword::Type,
        Keyword::ClickAndType,
        Keyword::Wait,
        Keyword::WaitForGone,
        Keyword::WaitForAny,
        Keyword::Assert,
        Keyword::AssertTextEquals,
        Keyword::AssertTextContains,
        Keyword::SetCheckbox,
        Keyword::AssertCheckboxState,
        Keyword::SelectCombobox,
        Keyword::SelectComboboxItem,
        Keyword::SelectListItem,
        Keyword::AssertCount,
        Keyword::CloseWindow,
        Keyword::KillApp,
        Keyword::ClickIfExists,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::OpenApp => "open_app",
            Keyword::Connect => "connect",
            Keyword::Click => "click",
            Keyword::DoubleClick => "double_click",
            Keyword::RightClick => "right_click",
            Keyword::Hover => "hover",
            Keyword::Hotkey => "hotkey",
            Keyword::Type => "type",
            Keyword::ClickAndType => "click_and_type",
            Keyword::Wait => "wait",
            Keyword::WaitForGone => "wait_for_gone",
            Keyword::WaitForAny => "wait_for_any",
            Keyword::Assert => "assert",
            Keyword::AssertTextEquals => "assert_text_equals",
            Keyword::AssertTextContains => "assert_text_contains",
            Keyword::SetCheckbox => "set_checkbox",
            Keyword::AssertCheckboxState => "assert_checkbox_state",
            Keyword::SelectCombobox => "select_combobox",
            Keyword::SelectComboboxItem => "select_combobox_item",
            Keyword::SelectListItem => "select_list_item",
            Keyword::AssertCount => "assert_count",
            Keyword::CloseWindow => "close_window",
            Keyword::KillApp => "kill_app",
            Keyword::ClickIfExists => "click_if_exists",
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Keyword {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Keyword::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| AutomationError::Config(format!("Unknown keyword: {s}")))
    }
}

/// Accepts a string, number or boolean and renders it as text, so a
/// whole-token variable holding a number can still be typed.
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!("expected text, got {other}"))),
    }
}

fn default_true() -> bool {
    true
}

fn default_visible() -> WaitState {
    WaitState::Visible
}

/// Converts an optional seconds value into a duration.
fn seconds(value: Option<f64>) -> Result<Option<Duration>, AutomationError> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| AutomationError::InvalidArgument(format!("timeout must be a non-negative number, got {secs}")))
        })
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAppArgs {
    pub path: String,
    #[serde(default)]
    pub wait_for_idle: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementArgs {
    pub element: String,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotkeyArgs {
    #[serde(deserialize_with = "scalar_text")]
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeArgs {
    pub element: String,
    #[serde(deserialize_with = "scalar_text")]
    pub text: String,
    #[serde(default = "default_true")]
    pub clear: bool,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitArgs {
    pub element: String,
    #[serde(default = "default_visible")]
    pub state: WaitState,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoneArgs {
    pub element: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnyArgs {
    pub elements: Vec<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertArgs {
    pub element: String,
    #[serde(default = "default_visible")]
    pub state: WaitState,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextEqualsArgs {
    pub element: String,
    #[serde(deserialize_with = "scalar_text")]
    pub expected: String,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextContainsArgs {
    pub element: String,
    #[serde(deserialize_with = "scalar_text")]
    pub substring: String,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckboxArgs {
    pub element: String,
    pub checked: bool,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

/// A combo box option as written in a step: text or a bare index.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Index(usize),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComboArgs {
    pub element: String,
    pub option: OptionValue,
    #[serde(default)]
    pub by_index: bool,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

impl ComboArgs {
    pub fn select_option(&self) -> Result<SelectOption, AutomationError> {
        match &self.option {
            OptionValue::Index(index) => Ok(SelectOption::Index(*index)),
            OptionValue::Text(text) if self.by_index => text
                .trim()
                .parse()
                .map(SelectOption::Index)
                .map_err(|_| AutomationError::InvalidArgument(format!("option '{text}' is not an index"))),
            OptionValue::Text(text) => Ok(SelectOption::Text(text.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComboItemArgs {
    pub combobox: String,
    pub item: String,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListItemArgs {
    pub element: String,
    #[serde(default)]
    pub item_text: Option<String>,
    #[serde(default)]
    pub item_index: Option<usize>,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountArgs {
    pub element: String,
    pub expected: usize,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowArgs {
    pub window: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExistsArgs {
    pub element: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub overrides: Option<Locator>,
}

/// A step with its keyword looked up and its arguments typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenApp(OpenAppArgs),
    Connect(ConnectParams),
    Click(ElementArgs),
    DoubleClick(ElementArgs),
    RightClick(ElementArgs),
    Hover(ElementArgs),
    Hotkey(HotkeyArgs),
    Type(TypeArgs),
    ClickAndType(TypeArgs),
    Wait(WaitArgs),
    WaitForGone(GoneArgs),
    WaitForAny(AnyArgs),
    Assert(AssertArgs),
    AssertTextEquals(TextEqualsArgs),
    AssertTextContains(TextContainsArgs),
    SetCheckbox(CheckboxArgs),
    AssertCheckboxState(CheckboxArgs),
    SelectCombobox(ComboArgs),
    SelectComboboxItem(ComboItemArgs),
    SelectListItem(ListItemArgs),
    AssertCount(CountArgs),
    CloseWindow(WindowArgs),
    KillApp,
    ClickIfExists(ExistsArgs),
}

fn args<T: DeserializeOwned>(keyword: Keyword, value: &Value) -> Result<T, AutomationError> {
    T::deserialize(value).map_err(|e| AutomationError::InvalidArgument(format!("{keyword}: {e}")))
}

impl Command {
    /// Looks up the keyword and deserializes its arguments.
    /// Unknown keywords are configuration errors.
    pub fn parse(step: &Step) -> Result<Self, AutomationError> {
        Self::parse_with(step, true)
    }

    /// Like [`Command::parse`]; `strict_keys` decides whether unknown keys in
    /// an `overrides` locator are rejected. An override that matches on
    /// nothing is rejected either way.
    pub fn parse_with(step: &Step, strict_keys: bool) -> Result<Self, AutomationError> {
        let keyword: Keyword = step.keyword.parse()?;
        let a = &step.args;
        if let Some(overrides) = a.get("overrides").filter(|v| !v.is_null()) {
            let element = a.get("element").and_then(Value::as_str).unwrap_or("step");
            Locator::from_json(overrides, strict_keys, &format!("{element} overrides"))?;
        }
        Ok(match keyword {
            Keyword::OpenApp => Command::OpenApp(args(keyword, a)?),
            Keyword::Connect => Command::Connect(args(keyword, a)?),
            Keyword::Click => Command::Click(args(keyword, a)?),
            Keyword::DoubleClick => Command::DoubleClick(args(keyword, a)?),
            Keyword::RightClick => Command::RightClick(args(keyword, a)?),
            Keyword::Hover => Command::Hover(args(keyword, a)?),
            Keyword::Hotkey => Command::Hotkey(args(keyword, a)?),
            Keyword::Type => Command::Type(args(keyword, a)?),
            Keyword::ClickAndType => Command::ClickAndType(args(keyword, a)?),
            Keyword::Wait => Command::Wait(args(keyword, a)?),
            Keyword::WaitForGone => Command::WaitForGone(args(keyword, a)?),
            Keyword::WaitForAny => Command::WaitForAny(args(keyword, a)?),
            Keyword::Assert => Command::Assert(args(keyword, a)?),
            Keyword::AssertTextEquals => Command::AssertTextEquals(args(keyword, a)?),
            Keyword::AssertTextContains => Command::AssertTextContains(args(keyword, a)?),
            Keyword::SetCheckbox => Command::SetCheckbox(args(keyword, a)?),
            Keyword::AssertCheckboxState => Command::AssertCheckboxState(args(keyword, a)?),
            Keyword::SelectCombobox => Command::SelectCombobox(args(keyword, a)?),
            Keyword::SelectComboboxItem => Command::SelectComboboxItem(args(keyword, a)?),
            Keyword::SelectListItem => Command::SelectListItem(args(keyword, a)?),
            Keyword::AssertCount => Command::AssertCount(args(keyword, a)?),
            Keyword::CloseWindow => Command::CloseWindow(args(keyword, a)?),
            Keyword::KillApp => Command::KillApp,
            Keyword::ClickIfExists => Command::ClickIfExists(args(keyword, a)?),
        })
    }

    pub fn keyword(&self) -> Keyword {
        match self {
            Command::OpenApp(_) => Keyword::OpenApp,
            Command::Connect(_) => Keyword::Connect,
            Command::Click(_) => Keyword::Click,
            Command::DoubleClick(_) => Keyword::DoubleClick,
            Command::RightClick(_) => Keyword::RightClick,
            Command::Hover(_) => Keyword::Hover,
            Command::Hotkey(_) => Keyword::Hotkey,
            Command::Type(_) => Keyword::Type,
            Command::ClickAndType(_) => Keyword::ClickAndType,
            Command::Wait(_) => Keyword::Wait,
            Command::WaitForGone(_) => Keyword::WaitForGone,
            Command::WaitForAny(_) => Keyword::WaitForAny,
            Command::Assert(_) => Keyword::Assert,
            Command::AssertTextEquals(_) => Keyword::AssertTextEquals,
            Command::AssertTextContains(_) => Keyword::AssertTextContains,
            Command::SetCheckbox(_) => Keyword::SetCheckbox,
            Command::AssertCheckboxState(_) => Keyword::AssertCheckboxState,
            Command::SelectCombobox(_) => Keyword::SelectCombobox,
            Command::SelectComboboxItem(_) => Keyword::SelectComboboxItem,
            Command::SelectListItem(_) => Keyword::SelectListItem,
            Command::AssertCount(_) => Keyword::AssertCount,
            Command::CloseWindow(_) => Keyword::CloseWindow,
            Command::KillApp => Keyword::KillApp,
            Command::ClickIfExists(_) => Keyword::ClickIfExists,
        }
    }

    /// Timeout of the keywords that take one, as a duration.
    pub fn timeout(&self) -> Result<Option<Duration>, AutomationError> {
        match self {
            Command::Wait(a) => seconds(a.timeout),
            Command::WaitForGone(a) => seconds(a.timeout),
            Command::WaitForAny(a) => seconds(a.timeout),
            Command::ClickIfExists(a) => seconds(a.timeout),
            Command::Connect(a) => seconds(a.timeout),
            _ => Ok(None),
        }
    }
}
