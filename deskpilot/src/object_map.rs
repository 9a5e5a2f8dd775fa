//! The object map: semantic window/element names mapped to ordered locator
//! candidates, plus application-level defaults.
//!
//! ```yaml
//! app:
//!   backend: uia
//!   default_timeout: 10
//! windows:
//!   main:
//!     locators:
//!       - title_re: "^My App"
//! elements:
//!   login_button:
//!     window: main
//!     locators:
//!       - name: Login
//!       - auto_id: btnLogin
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use tracing::debug;

use crate::errors::AutomationError;

/// Keys a locator may carry.
pub const LOCATOR_KEYS: &[&str] = &[
    "auto_id",
    "name",
    "name_re",
    "title",
    "title_re",
    "control_type",
    "class_name",
    "found_index",
    "best_match",
    "backend",
    "process",
    "handle",
];

/// Match criteria for one window or element candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Locator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_id: Option<String>,
    /// Exact accessible name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Accessible-name pattern, matched anywhere in the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_re: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_re: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Zero-based pick among the ordered matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
}

impl Locator {
    /// Name-based locators are matched by enumerating descendants.
    pub fn is_name_based(&self) -> bool {
        self.name.is_some() || self.name_re.is_some()
    }

    pub fn name_pattern(&self) -> Result<Option<Regex>, AutomationError> {
        compile(self.name_re.as_deref(), "name_re")
    }

    pub fn title_pattern(&self) -> Result<Option<Regex>, AutomationError> {
        compile(self.title_re.as_deref(), "title_re")
    }

    /// Whether any field picks out a control. `found_index` and `backend`
    /// only steer the search.
    pub fn has_criteria(&self) -> bool {
        self.auto_id.is_some()
            || self.name.is_some()
            || self.name_re.is_some()
            || self.title.is_some()
            || self.title_re.is_some()
            || self.control_type.is_some()
            || self.class_name.is_some()
            || self.best_match.is_some()
            || self.process.is_some()
            || self.handle.is_some()
    }

    /// Rejects locators with nothing to match on and patterns that do not compile.
    pub fn check(&self, owner: &str) -> Result<(), AutomationError> {
        if !self.has_criteria() {
            return Err(AutomationError::Config(format!(
                "Locator for '{owner}' has no match criteria ({self})"
            )));
        }
        self.name_pattern()?;
        self.title_pattern()?;
        Ok(())
    }

    /// Parses one locator mapping, rejecting unknown keys when `strict`.
    pub fn from_yaml(value: &YamlValue, strict: bool, owner: &str) -> Result<Self, AutomationError> {
        let mapping = value.as_mapping().ok_or_else(|| {
            AutomationError::Config(format!("Locator for '{owner}' must be a mapping"))
        })?;
        if strict {
            check_keys(mapping.keys().map(|k| k.as_str().unwrap_or("<non-string>")), owner)?;
        }
        let locator: Locator = serde_yaml::from_value(value.clone())
            .map_err(|e| AutomationError::Config(format!("Invalid locator for '{owner}': {e}")))?;
        locator.check(owner)?;
        Ok(locator)
    }

    /// Same as [`Locator::from_yaml`] for a locator embedded in a scenario step.
    pub fn from_json(value: &serde_json::Value, strict: bool, owner: &str) -> Result<Self, AutomationError> {
        let mapping = value.as_object().ok_or_else(|| {
            AutomationError::Config(format!("Locator for '{owner}' must be a mapping"))
        })?;
        if strict {
            check_keys(mapping.keys().map(String::as_str), owner)?;
        }
        let locator: Locator = serde_json::from_value(value.clone())
            .map_err(|e| AutomationError::Config(format!("Invalid locator for '{owner}': {e}")))?;
        locator.check(owner)?;
        Ok(locator)
    }

    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut text = |key: &'static str, value: &Option<String>| {
            if let Some(v) = value {
                out.push((key, format!("'{v}'")));
            }
        };
        text("auto_id", &self.auto_id);
        text("name", &self.name);
        text("name_re", &self.name_re);
        text("title", &self.title);
        text("title_re", &self.title_re);
        text("control_type", &self.control_type);
        text("class_name", &self.class_name);
        text("best_match", &self.best_match);
        text("backend", &self.backend);
        if let Some(i) = self.found_index {
            out.push(("found_index", i.to_string()));
        }
        if let Some(p) = self.process {
            out.push(("process", p.to_string()));
        }
        if let Some(h) = self.handle {
            out.push(("handle", h.to_string()));
        }
        out
    }
}

fn check_keys<'a>(keys: impl IntoIterator<Item = &'a str>, owner: &str) -> Result<(), AutomationError> {
    for key in keys {
        if !LOCATOR_KEYS.contains(&key) {
            return Err(AutomationError::Config(format!(
                "Unknown locator key '{key}' for '{owner}' (allowed: {})",
                LOCATOR_KEYS.join(", ")
            )));
        }
    }
    Ok(())
}

fn compile(pattern: Option<&str>, field: &str) -> Result<Option<Regex>, AutomationError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| AutomationError::Config(format!("Invalid {field} pattern '{p}': {e}")))
        })
        .transpose()
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self.pairs();
        if pairs.is_empty() {
            return f.write_str("<empty>");
        }
        let joined: Vec<String> = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&joined.join(", "))
    }
}

fn default_backend() -> String {
    "uia".to_string()
}

fn default_timeout() -> f64 {
    10.0
}

fn default_interval() -> f64 {
    0.2
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn enabled() -> bool {
    true
}

/// Application-level settings from the `app` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AppDefaults {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Seconds.
    #[serde(default = "default_timeout")]
    pub default_timeout: f64,
    /// Seconds.
    #[serde(default = "default_interval")]
    pub polling_interval: f64,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "enabled")]
    pub strict_locator_keys: bool,
    /// Drop title-bar Close/Minimize/Maximize buttons from name matches.
    #[serde(default = "enabled")]
    pub ignore_titlebar_buttons: bool,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            default_timeout: default_timeout(),
            polling_interval: default_interval(),
            artifacts_dir: default_artifacts_dir(),
            strict_locator_keys: true,
            ignore_titlebar_buttons: true,
        }
    }
}

impl AppDefaults {
    pub fn timing(&self) -> (Duration, Duration) {
        (
            Duration::from_secs_f64(self.default_timeout.max(0.0)),
            Duration::from_secs_f64(self.polling_interval.max(0.0)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct WindowSpec {
    pub locators: Vec<Locator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct ElementSpec {
    pub window: String,
    pub locators: Vec<Locator>,
}

/// Shape of an object-map file, used to publish its JSON schema.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ObjectMapDocument {
    pub app: Option<AppDefaults>,
    pub windows: BTreeMap<String, WindowSpec>,
    pub elements: BTreeMap<String, ElementSpec>,
}

/// Validated object map.
#[derive(Debug, Clone, Default)]
pub struct ObjectMap {
    app: AppDefaults,
    windows: BTreeMap<String, WindowSpec>,
    elements: BTreeMap<String, ElementSpec>,
}

impl ObjectMap {
    pub fn new(
        app: AppDefaults,
        windows: BTreeMap<String, WindowSpec>,
        elements: BTreeMap<String, ElementSpec>,
    ) -> Result<Self, AutomationError> {
        let map = Self {
            app,
            windows,
            elements,
        };
        map.validate()?;
        Ok(map)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AutomationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AutomationError::Config(format!("Cannot read object map '{}': {e}", path.display()))
        })?;
        let map = Self::from_yaml_str(&text)?;
        debug!(
            path = %path.display(),
            windows = map.windows.len(),
            elements = map.elements.len(),
            "object map loaded"
        );
        Ok(map)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AutomationError> {
        let root: YamlValue = serde_yaml::from_str(text)
            .map_err(|e| AutomationError::Config(format!("Object map is not valid YAML: {e}")))?;
        let root = root
            .as_mapping()
            .ok_or_else(|| AutomationError::Config("Object map root must be a mapping".to_string()))?;

        let app: AppDefaults = match root.get("app") {
            None | Some(YamlValue::Null) => AppDefaults::default(),
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| AutomationError::Config(format!("Invalid app section: {e}")))?,
        };
        let strict = app.strict_locator_keys;

        let mut windows = BTreeMap::new();
        for (name, body) in section(root, "windows")? {
            let locators = locator_list(body, strict, &name)?;
            windows.insert(name, WindowSpec { locators });
        }

        let mut elements = BTreeMap::new();
        for (name, body) in section(root, "elements")? {
            let window = body
                .get("window")
                .and_then(YamlValue::as_str)
                .ok_or_else(|| AutomationError::Config(format!("Element '{name}' is missing 'window'")))?
                .to_string();
            let locators = locator_list(body, strict, &name)?;
            elements.insert(name, ElementSpec { window, locators });
        }

        Self::new(app, windows, elements)
    }

    /// Checks the cross-references and non-empty locator lists.
    pub fn validate(&self) -> Result<(), AutomationError> {
        for (name, spec) in &self.windows {
            if spec.locators.is_empty() {
                return Err(AutomationError::Config(format!("Window '{name}' needs at least one locator")));
            }
        }
        for (name, spec) in &self.elements {
            if spec.locators.is_empty() {
                return Err(AutomationError::Config(format!("Element '{name}' needs at least one locator")));
            }
            if !self.windows.contains_key(&spec.window) {
                return Err(AutomationError::Config(format!(
                    "Element '{name}' references unknown window '{}'",
                    spec.window
                )));
            }
        }
        Ok(())
    }

    pub fn app(&self) -> &AppDefaults {
        &self.app
    }

    pub fn window_spec(&self, name: &str) -> Result<&WindowSpec, AutomationError> {
        self.windows
            .get(name)
            .ok_or_else(|| AutomationError::Config(format!("Unknown window: {name}")))
    }

    pub fn element_spec(&self, name: &str) -> Result<&ElementSpec, AutomationError> {
        self.elements
            .get(name)
            .ok_or_else(|| AutomationError::Config(format!("Unknown element: {name}")))
    }

    pub fn window_names(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    pub fn element_names(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }
}

fn section(root: &serde_yaml::Mapping, key: &str) -> Result<Vec<(String, YamlValue)>, AutomationError> {
    match root.get(key) {
        None | Some(YamlValue::Null) => Ok(Vec::new()),
        Some(YamlValue::Mapping(entries)) => entries
            .iter()
            .map(|(k, v)| {
                k.as_str()
                    .map(|name| (name.to_string(), v.clone()))
                    .ok_or_else(|| AutomationError::Config(format!("Names in '{key}' must be strings")))
            })
            .collect(),
        Some(_) => Err(AutomationError::Config(format!("'{key}' must be a mapping"))),
    }
}

fn locator_list(body: YamlValue, strict: bool, owner: &str) -> Result<Vec<Locator>, AutomationError> {
    match body.get("locators") {
        Some(YamlValue::Sequence(items)) => items
            .iter()
            .map(|item| Locator::from_yaml(item, strict, owner))
            .collect(),
        // a single mapping is shorthand for a one-element list
        Some(single @ YamlValue::Mapping(_)) => Ok(vec![Locator::from_yaml(single, strict, owner)?]),
        _ => Err(AutomationError::Config(format!(
            "'{owner}' needs a non-empty 'locators' list"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"
app:
  default_timeout: 4
windows:
  main:
    locators:
      - title_re: "^Demo"
elements:
  login_button:
    window: main
    locators:
      - name: Login
      - control_type: Button
        found_index: 0
  status:
    window: main
    locators:
      auto_id: lblStatus
"#;

    #[test]
    fn test_load_object_map() {
        let map = ObjectMap::from_yaml_str(MAP).unwrap();
        assert_eq!(map.app().default_timeout, 4.0);
        assert_eq!(map.app().backend, "uia");
        let spec = map.element_spec("login_button").unwrap();
        assert_eq!(spec.window, "main");
        assert_eq!(spec.locators.len(), 2);
        assert!(spec.locators[0].is_name_based());
        assert_eq!(spec.locators[1].found_index, Some(0));
        // single mapping accepted as a list
        assert_eq!(map.element_spec("status").unwrap().locators.len(), 1);
    }

    #[test]
    fn test_unknown_names_are_config_errors() {
        let map = ObjectMap::from_yaml_str(MAP).unwrap();
        let err = map.element_spec("nope").unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Unknown element: nope");
        assert!(map.window_spec("other").is_err());
    }

    #[test]
    fn test_strict_keys_reject_unknown_locator_field() {
        let text = r#"
windows:
  main:
    locators:
      - titel: Typo
        title: Main
"#;
        let err = ObjectMap::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("Unknown locator key 'titel'"));

        let lenient = format!("app:\n  strict_locator_keys: false\n{text}");
        assert!(ObjectMap::from_yaml_str(&lenient).is_ok());
    }

    #[test]
    fn test_element_must_reference_known_window() {
        let text = r#"
windows:
  main:
    locators:
      - title: Main
elements:
  ok_button:
    window: dialog
    locators:
      - name: OK
"#;
        let err = ObjectMap::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("unknown window 'dialog'"));
    }

    #[test]
    fn test_empty_locator_list_rejected() {
        let text = "windows:\n  main:\n    locators: []\n";
        assert!(ObjectMap::from_yaml_str(text).is_err());
    }

    #[test]
    fn test_locator_without_criteria_rejected() {
        let text = "windows:\n  main:\n    locators:\n      - found_index: 0\n";
        let err = ObjectMap::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("no match criteria"), "{err}");

        let bare = serde_json::json!({"backend": "uia"});
        assert!(Locator::from_json(&bare, true, "login_button").is_err());
        let typo = serde_json::json!({"nam": "Login"});
        let err = Locator::from_json(&typo, true, "login_button").unwrap_err();
        assert!(err.to_string().contains("Unknown locator key 'nam'"), "{err}");
        // without strict keys the typo is dropped and nothing is left to match on
        let err = Locator::from_json(&typo, false, "login_button").unwrap_err();
        assert!(err.to_string().contains("no match criteria"), "{err}");
    }

    #[test]
    fn test_invalid_pattern_rejected_at_load() {
        let text = "windows:\n  main:\n    locators:\n      - title_re: \"(unclosed\"\n";
        let err = ObjectMap::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("Invalid title_re pattern"));
    }

    #[test]
    fn test_locator_display() {
        let locator = Locator {
            name: Some("Login".into()),
            control_type: Some("Button".into()),
            found_index: Some(1),
            ..Default::default()
        };
        assert_eq!(locator.to_string(), "name='Login', control_type='Button', found_index=1");
        assert_eq!(Locator::default().to_string(), "<empty>");
    }
}
