use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AutomationError;
use crate::object_map::Locator;
use crate::waits::{wait_until, Wait};

pub mod memory;

/// Element state a caller can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    Exists,
    Visible,
    Enabled,
}

impl fmt::Display for WaitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitState::Exists => f.write_str("exists"),
            WaitState::Visible => f.write_str("visible"),
            WaitState::Enabled => f.write_str("enabled"),
        }
    }
}

impl std::str::FromStr for WaitState {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exists" => Ok(WaitState::Exists),
            "visible" => Ok(WaitState::Visible),
            "enabled" => Ok(WaitState::Enabled),
            other => Err(AutomationError::InvalidArgument(format!(
                "Unknown state '{other}' (expected exists, visible or enabled)"
            ))),
        }
    }
}

/// Toggle pattern state of a checkbox-like control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleState {
    Checked,
    Unchecked,
    Indeterminate,
    Unknown,
}

impl fmt::Display for ToggleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToggleState::Checked => f.write_str("checked"),
            ToggleState::Unchecked => f.write_str("unchecked"),
            ToggleState::Indeterminate => f.write_str("indeterminate"),
            ToggleState::Unknown => f.write_str("unknown"),
        }
    }
}

/// How an item of a list or combo box is picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOption {
    Text(String),
    Index(usize),
}

impl fmt::Display for SelectOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectOption::Text(text) => write!(f, "'{text}'"),
            SelectOption::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// Arguments of the `connect` keyword.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectParams {
    #[serde(default)]
    pub process: Option<u32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_re: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// The element capability a backend hands out.
///
/// Every operation is explicit. A backend that cannot perform one returns
/// [`AutomationError::UnsupportedOperation`] rather than guessing.
pub trait UiElement: Send + Sync + fmt::Debug {
    /// Identity that changes when the underlying UI object is recreated.
    fn runtime_id(&self) -> Result<String, AutomationError>;

    /// Accessible name.
    fn name(&self) -> Result<String, AutomationError>;
    /// Window text.
    fn title(&self) -> Result<String, AutomationError>;
    fn control_type(&self) -> Result<String, AutomationError>;
    fn class_name(&self) -> Result<String, AutomationError>;
    fn automation_id(&self) -> Result<String, AutomationError>;

    fn exists(&self) -> Result<bool, AutomationError>;
    fn is_visible(&self) -> Result<bool, AutomationError>;
    fn is_enabled(&self) -> Result<bool, AutomationError>;

    fn click(&self) -> Result<(), AutomationError>;
    fn double_click(&self) -> Result<(), AutomationError>;
    fn right_click(&self) -> Result<(), AutomationError>;
    fn hover(&self) -> Result<(), AutomationError>;
    fn focus(&self) -> Result<(), AutomationError>;
    fn set_text(&self, text: &str, clear_first: bool) -> Result<(), AutomationError>;
    fn type_keys(&self, keys: &str) -> Result<(), AutomationError>;
    fn get_text(&self) -> Result<String, AutomationError>;
    fn clear(&self) -> Result<(), AutomationError>;
    fn close(&self) -> Result<(), AutomationError>;

    fn toggle_state(&self) -> Result<ToggleState, AutomationError>;
    fn toggle(&self) -> Result<(), AutomationError>;
    fn select(&self, option: &SelectOption) -> Result<(), AutomationError>;
    fn item_count(&self) -> Result<usize, AutomationError>;

    /// All descendants in tree order, optionally limited to one control type.
    fn descendants(&self, control_type: Option<&str>) -> Result<Vec<Box<dyn UiElement>>, AutomationError>;

    /// Fast scoped lookup of one descendant by its structural locator fields.
    fn child(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError>;

    fn clone_box(&self) -> Box<dyn UiElement>;

    /// Polls until the element reaches `state`.
    fn wait(&self, state: WaitState, timeout: Duration, interval: Duration) -> Result<(), AutomationError> {
        let wait = Wait::new(timeout, interval).describe(format!("element to be {state}"));
        wait_until(&wait, || match state {
            WaitState::Exists => self.exists(),
            WaitState::Visible => Ok(self.exists()? && self.is_visible()?),
            WaitState::Enabled => Ok(self.exists()? && self.is_enabled()?),
        })
        .map(|_| ())
    }
}

impl Clone for Box<dyn UiElement> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// One attached automation session.
pub trait Session: Send + Sync {
    /// Launches the application under test and returns its process id.
    fn start(&self, path: &str, wait_for_idle: bool) -> Result<u32, AutomationError>;

    fn connect(&self, params: &ConnectParams) -> Result<(), AutomationError>;

    /// Whether an application was started or connected.
    fn has_application(&self) -> bool;

    /// Top-level window search across the whole desktop.
    fn desktop_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError>;

    /// Top-level window search limited to the application under test.
    fn app_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError>;

    fn close_main_windows(&self, timeout: Duration) -> Result<(), AutomationError>;

    fn kill(&self) -> Result<(), AutomationError>;

    /// Sends a global key sequence to whatever has focus.
    fn send_keys(&self, keys: &str) -> Result<(), AutomationError>;
}

/// Produces best-effort diagnostics when resolution gives up.
pub trait ArtifactCollector: Send + Sync {
    fn collect(&self, label: &str, window: Option<&dyn UiElement>, dir: &Path) -> BTreeMap<String, PathBuf>;
}

/// Collector that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArtifacts;

impl ArtifactCollector for NoArtifacts {
    fn collect(&self, _label: &str, _window: Option<&dyn UiElement>, _dir: &Path) -> BTreeMap<String, PathBuf> {
        BTreeMap::new()
    }
}

/// Creates the session for a backend id from the object map.
///
/// `memory` is built in and may be seeded from a YAML or JSON tree fixture.
/// Live desktop backends are provided by separate crates.
pub fn create_session(backend: &str, fixture: Option<&Path>) -> Result<Arc<dyn Session>, AutomationError> {
    match backend {
        "memory" => {
            let desktop = match fixture {
                Some(path) => memory::MemoryDesktop::from_fixture(path)?,
                None => memory::MemoryDesktop::new(),
            };
            Ok(Arc::new(memory::MemorySession::new(desktop)))
        }
        other => Err(AutomationError::UnsupportedPlatform(format!(
            "backend '{other}' is not compiled into this build"
        ))),
    }
}
