//! Per-operation timeout and polling settings.
//!
//! There is one process-wide default [`TimeConfig`]. On top of it each
//! thread keeps a stack of scoped overrides; [`TimeConfig::current`] reads
//! the top of the calling thread's stack, or the default when the stack is
//! empty. Override guards pop on drop, so a scope is unwound on every exit
//! path.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AutomationError;

/// Named timing categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ElementWait,
    WindowWait,
    ActionTimeout,
    VisibilityWait,
    EnabledWait,
    DisappearWait,
    StalenessRetry,
    ResolveWindow,
    ResolveElement,
    ChildWindowQuick,
    ExistsWait,
    WaitForAny,
    AppStart,
    AppConnect,
    WindowClose,
    ClickAction,
    DoubleClickAction,
    RightClickAction,
    HoverAction,
    SetTextAction,
    GetTextAction,
    CheckAction,
    UncheckAction,
    SelectAction,
    SelectItemAction,
    KeySendAction,
}

impl Operation {
    pub const ALL: &'static [Operation] = &[
        Operation::ElementWait,
        Operation::WindowWait,
        Operation::ActionTimeout,
        Operation::VisibilityWait,
        Operation::EnabledWait,
        Operation::DisappearWait,
        Operation::StalenessRetry,
        Operation::ResolveWindow,
        Operation::ResolveElement,
        Operation::ChildWindowQuick,
        Operation::ExistsWait,
        Operation::WaitForAny,
        Operation::AppStart,
        Operation::AppConnect,
        Operation::WindowClose,
        Operation::ClickAction,
        Operation::DoubleClickAction,
        Operation::RightClickAction,
        Operation::HoverAction,
        Operation::SetTextAction,
        Operation::GetTextAction,
        Operation::CheckAction,
        Operation::UncheckAction,
        Operation::SelectAction,
        Operation::SelectItemAction,
        Operation::KeySendAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ElementWait => "element_wait",
            Operation::WindowWait => "window_wait",
            Operation::ActionTimeout => "action_timeout",
            Operation::VisibilityWait => "visibility_wait",
            Operation::EnabledWait => "enabled_wait",
            Operation::DisappearWait => "disappear_wait",
            Operation::StalenessRetry => "staleness_retry",
            Operation::ResolveWindow => "resolve_window",
            Operation::ResolveElement => "resolve_element",
            Operation::ChildWindowQuick => "child_window_quick",
            Operation::ExistsWait => "exists_wait",
            Operation::WaitForAny => "wait_for_any",
            Operation::AppStart => "app_start",
            Operation::AppConnect => "app_connect",
            Operation::WindowClose => "window_close",
            Operation::ClickAction => "click_action",
            Operation::DoubleClickAction => "double_click_action",
            Operation::RightClickAction => "right_click_action",
            Operation::HoverAction => "hover_action",
            Operation::SetTextAction => "set_text_action",
            Operation::GetTextAction => "get_text_action",
            Operation::CheckAction => "check_action",
            Operation::UncheckAction => "uncheck_action",
            Operation::SelectAction => "select_action",
            Operation::SelectItemAction => "select_item_action",
            Operation::KeySendAction => "key_send_action",
        }
    }

    /// Per-action categories, the ones a preset's `action_timeout` rewrites.
    pub fn is_action(&self) -> bool {
        self.as_str().ends_with("_action")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| AutomationError::Config(format!("Unknown timing setting '{s}'")))
    }
}

/// Timeout and polling interval of one category, plus an attempt count for
/// categories that retry by count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl TimeoutSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            retry_count: None,
        }
    }

    pub fn from_secs(timeout: f64, interval: f64, retry_count: Option<u32>) -> Self {
        Self {
            timeout: Duration::from_secs_f64(timeout.max(0.0)),
            interval: Duration::from_secs_f64(interval.max(0.0)),
            retry_count,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

type Row = (Operation, f64, f64, Option<u32>);

const BASE: &[Row] = &[
    (Operation::ElementWait, 10.0, 0.2, None),
    (Operation::WindowWait, 30.0, 0.5, None),
    (Operation::ActionTimeout, 5.0, 0.2, Some(3)),
    (Operation::VisibilityWait, 10.0, 0.2, None),
    (Operation::EnabledWait, 5.0, 0.2, None),
    (Operation::DisappearWait, 60.0, 0.5, None),
    (Operation::StalenessRetry, 5.0, 0.3, Some(3)),
    (Operation::ResolveWindow, 10.0, 0.2, None),
    (Operation::ResolveElement, 10.0, 0.2, None),
    (Operation::ChildWindowQuick, 1.5, 0.2, None),
    (Operation::ExistsWait, 2.0, 0.1, None),
    (Operation::WaitForAny, 10.0, 0.2, None),
    (Operation::AppStart, 30.0, 0.5, None),
    (Operation::AppConnect, 10.0, 0.2, None),
    (Operation::WindowClose, 5.0, 0.2, None),
    (Operation::ClickAction, 5.0, 0.2, Some(3)),
    (Operation::DoubleClickAction, 5.0, 0.2, Some(3)),
    (Operation::RightClickAction, 5.0, 0.2, Some(3)),
    (Operation::HoverAction, 3.0, 0.2, Some(2)),
    (Operation::SetTextAction, 5.0, 0.2, Some(3)),
    (Operation::GetTextAction, 3.0, 0.2, Some(2)),
    (Operation::CheckAction, 3.0, 0.2, Some(2)),
    (Operation::UncheckAction, 3.0, 0.2, Some(2)),
    (Operation::SelectAction, 5.0, 0.2, Some(2)),
    (Operation::SelectItemAction, 5.0, 0.2, Some(2)),
    (Operation::KeySendAction, 2.0, 0.1, Some(2)),
];

const FAST: &[Row] = &[
    (Operation::ElementWait, 5.0, 0.1, None),
    (Operation::WindowWait, 15.0, 0.3, None),
    (Operation::ActionTimeout, 3.0, 0.1, Some(2)),
    (Operation::VisibilityWait, 6.0, 0.1, None),
    (Operation::EnabledWait, 3.0, 0.1, None),
    (Operation::DisappearWait, 30.0, 0.3, None),
    (Operation::StalenessRetry, 3.0, 0.2, Some(2)),
    (Operation::ChildWindowQuick, 1.0, 0.1, None),
    (Operation::ExistsWait, 1.0, 0.05, None),
    (Operation::WaitForAny, 6.0, 0.1, None),
    (Operation::AppStart, 20.0, 0.4, None),
    (Operation::WindowClose, 3.0, 0.1, None),
];

const SLOW: &[Row] = &[
    (Operation::ElementWait, 20.0, 0.3, None),
    (Operation::WindowWait, 60.0, 0.6, None),
    (Operation::ActionTimeout, 8.0, 0.3, Some(4)),
    (Operation::VisibilityWait, 20.0, 0.3, None),
    (Operation::EnabledWait, 10.0, 0.3, None),
    (Operation::DisappearWait, 90.0, 0.7, None),
    (Operation::StalenessRetry, 8.0, 0.4, Some(4)),
    (Operation::ExistsWait, 4.0, 0.2, None),
    (Operation::WaitForAny, 15.0, 0.3, None),
    (Operation::AppStart, 45.0, 0.8, None),
    (Operation::WindowClose, 8.0, 0.3, None),
];

const CI: &[Row] = &[
    (Operation::ElementWait, 20.0, 0.3, None),
    (Operation::WindowWait, 60.0, 1.0, None),
    (Operation::ActionTimeout, 10.0, 0.3, Some(5)),
    (Operation::VisibilityWait, 20.0, 0.3, None),
    (Operation::EnabledWait, 10.0, 0.3, None),
    (Operation::DisappearWait, 120.0, 1.0, None),
    (Operation::StalenessRetry, 10.0, 0.4, Some(5)),
    (Operation::ExistsWait, 5.0, 0.3, None),
    (Operation::WaitForAny, 20.0, 0.4, None),
    (Operation::AppStart, 60.0, 1.0, None),
    (Operation::WindowClose, 10.0, 0.5, None),
];

/// Bulk replacement of categories tuned for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Default,
    Fast,
    Slow,
    Ci,
}

impl Preset {
    pub const ALL: &'static [Preset] = &[Preset::Default, Preset::Fast, Preset::Slow, Preset::Ci];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Default => "default",
            Preset::Fast => "fast",
            Preset::Slow => "slow",
            Preset::Ci => "ci",
        }
    }

    fn rows(&self) -> &'static [Row] {
        match self {
            Preset::Default => &[],
            Preset::Fast => FAST,
            Preset::Slow => SLOW,
            Preset::Ci => CI,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Preset::Default),
            "fast" => Ok(Preset::Fast),
            "slow" => Ok(Preset::Slow),
            "ci" => Ok(Preset::Ci),
            other => Err(AutomationError::Config(format!(
                "Unknown timing preset '{other}' (expected default, fast, slow or ci)"
            ))),
        }
    }
}

/// A partial change to one category, as given on a command line:
/// `click_action=3`, `click_action=3,0.1` or `click_action=3,0.1,2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingOverride {
    pub operation: Operation,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub retry_count: Option<u32>,
}

impl TimingOverride {
    fn apply(&self, config: &mut TimeConfig) {
        let mut settings = config.get(self.operation);
        if let Some(timeout) = self.timeout {
            settings.timeout = timeout;
        }
        if let Some(interval) = self.interval {
            settings.interval = interval;
        }
        if self.retry_count.is_some() {
            settings.retry_count = self.retry_count;
        }
        config.set(self.operation, settings);
    }
}

impl FromStr for TimingOverride {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, values) = s.split_once('=').ok_or_else(|| {
            AutomationError::Config(format!("Timing override '{s}' must look like name=timeout[,interval[,retries]]"))
        })?;
        let operation: Operation = name.trim().parse()?;
        let mut parts = values.split(',').map(str::trim);

        let seconds = |part: Option<&str>| -> Result<Option<Duration>, AutomationError> {
            match part {
                None | Some("") => Ok(None),
                Some(raw) => {
                    let secs: f64 = raw.parse().map_err(|_| {
                        AutomationError::Config(format!("Invalid seconds '{raw}' in timing override '{s}'"))
                    })?;
                    if !secs.is_finite() || secs < 0.0 {
                        return Err(AutomationError::Config(format!(
                            "Seconds must be non-negative in timing override '{s}'"
                        )));
                    }
                    Ok(Some(Duration::from_secs_f64(secs)))
                }
            }
        };

        let timeout = seconds(parts.next())?;
        let interval = seconds(parts.next())?;
        let retry_count = match parts.next() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                AutomationError::Config(format!("Invalid retry count '{raw}' in timing override '{s}'"))
            })?),
        };
        Ok(TimingOverride {
            operation,
            timeout,
            interval,
            retry_count,
        })
    }
}

/// A complete set of timing categories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeConfig {
    settings: BTreeMap<Operation, TimeoutSettings>,
}

static DEFAULT_CONFIG: Lazy<RwLock<TimeConfig>> = Lazy::new(|| RwLock::new(TimeConfig::base()));

thread_local! {
    static OVERRIDES: RefCell<Vec<TimeConfig>> = const { RefCell::new(Vec::new()) };
}

fn table(rows: &[Row]) -> impl Iterator<Item = (Operation, TimeoutSettings)> + '_ {
    rows.iter()
        .map(|&(op, timeout, interval, retries)| (op, TimeoutSettings::from_secs(timeout, interval, retries)))
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl TimeConfig {
    /// The built-in defaults, independent of any global state.
    pub fn base() -> Self {
        Self {
            settings: table(BASE).collect(),
        }
    }

    /// Base defaults with `preset` applied.
    pub fn preset(preset: Preset) -> Self {
        let mut config = Self::base();
        config.apply_preset_rows(preset);
        config
    }

    /// Deterministic run snapshot: base, then preset, then the application's
    /// default timing (only under the default preset), then explicit overrides.
    pub fn build(
        preset: Preset,
        app_defaults: Option<(Duration, Duration)>,
        overrides: &[TimingOverride],
    ) -> Self {
        let mut config = Self::preset(preset);
        if preset == Preset::Default {
            if let Some((timeout, interval)) = app_defaults {
                config.apply_app_defaults(timeout, interval);
            }
        }
        for o in overrides {
            o.apply(&mut config);
        }
        config
    }

    fn apply_preset_rows(&mut self, preset: Preset) {
        for (op, settings) in table(preset.rows()) {
            self.settings.insert(op, settings);
            if op == Operation::ActionTimeout {
                for action in Operation::ALL.iter().filter(|o| o.is_action()) {
                    self.settings.insert(*action, settings);
                }
            }
        }
    }

    /// Rewrites the element-level categories from an application's
    /// `default_timeout` / `polling_interval`.
    pub fn apply_app_defaults(&mut self, timeout: Duration, interval: Duration) {
        let shared = TimeoutSettings::new(timeout, interval);
        for op in [
            Operation::ElementWait,
            Operation::VisibilityWait,
            Operation::EnabledWait,
            Operation::ResolveWindow,
            Operation::ResolveElement,
            Operation::WaitForAny,
        ] {
            self.settings.insert(op, shared);
        }
        let exists = (timeout / 5).max(interval);
        self.settings
            .insert(Operation::ExistsWait, TimeoutSettings::new(exists, interval));
    }

    pub fn get(&self, operation: Operation) -> TimeoutSettings {
        match self.settings.get(&operation) {
            Some(settings) => *settings,
            None => table(BASE)
                .find(|(op, _)| *op == operation)
                .map(|(_, s)| s)
                .unwrap_or(TimeoutSettings::from_secs(5.0, 0.2, None)),
        }
    }

    pub fn set(&mut self, operation: Operation, settings: TimeoutSettings) {
        self.settings.insert(operation, settings);
    }

    /// Settings for an element action name such as `click`, falling back to
    /// `action_timeout` when the action has no category of its own.
    pub fn action_settings(&self, action: &str) -> TimeoutSettings {
        format!("{action}_action")
            .parse::<Operation>()
            .map(|op| self.get(op))
            .unwrap_or_else(|_| self.get(Operation::ActionTimeout))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Operation, TimeoutSettings)> + '_ {
        self.settings.iter().map(|(op, s)| (*op, *s))
    }

    /// The effective configuration for this thread.
    pub fn current() -> TimeConfig {
        OVERRIDES
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(Self::default_config)
    }

    /// One category of the effective configuration, without cloning the set.
    pub fn effective(operation: Operation) -> TimeoutSettings {
        let top = OVERRIDES.with(|stack| stack.borrow().last().map(|c| c.get(operation)));
        match top {
            Some(settings) => settings,
            None => read_default(|c| c.get(operation)),
        }
    }

    /// Copies the effective configuration, replaces the given categories
    /// and installs the result until the guard is dropped.
    pub fn push_override<I>(changes: I) -> OverrideGuard
    where
        I: IntoIterator<Item = (Operation, TimeoutSettings)>,
    {
        let mut config = Self::current();
        for (op, settings) in changes {
            config.settings.insert(op, settings);
        }
        Self::scoped(config)
    }

    /// Installs a whole configuration until the guard is dropped.
    pub fn scoped(config: TimeConfig) -> OverrideGuard {
        let depth = OVERRIDES.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(config);
            stack.len()
        });
        debug!(depth, "timing override pushed");
        OverrideGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    pub fn override_depth() -> usize {
        OVERRIDES.with(|stack| stack.borrow().len())
    }

    pub fn default_config() -> TimeConfig {
        read_default(|c| c.clone())
    }

    pub fn set_default(config: TimeConfig) {
        let mut guard = DEFAULT_CONFIG.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
    }

    /// Applies a preset to the process-wide default. The override stack is
    /// left alone.
    pub fn apply_preset(preset: Preset) {
        let mut guard = DEFAULT_CONFIG.write().unwrap_or_else(|e| e.into_inner());
        guard.apply_preset_rows(preset);
        debug!(%preset, "timing preset applied to default configuration");
    }

    /// Restores the built-in default and clears this thread's overrides.
    pub fn reset_to_defaults() {
        Self::set_default(Self::base());
        OVERRIDES.with(|stack| stack.borrow_mut().clear());
    }
}

fn read_default<T>(f: impl FnOnce(&TimeConfig) -> T) -> T {
    let guard = DEFAULT_CONFIG.read().unwrap_or_else(|e| e.into_inner());
    f(&guard)
}

/// Pops its override scope when dropped. Tied to the thread that created it.
#[must_use = "the override is removed as soon as the guard is dropped"]
pub struct OverrideGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        let _ = OVERRIDES.try_with(|stack| {
            stack.borrow_mut().truncate(self.depth.saturating_sub(1));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_base_defaults() {
        let config = TimeConfig::base();
        let click = config.get(Operation::ClickAction);
        assert_eq!(click.timeout, secs(5.0));
        assert_eq!(click.retry_count, Some(3));
        assert_eq!(config.get(Operation::StalenessRetry).interval, secs(0.3));
        assert_eq!(config.iter().count(), Operation::ALL.len());
    }

    #[test]
    fn test_override_scope_restores_on_drop() {
        let before = TimeConfig::effective(Operation::ResolveElement);
        {
            let _outer = TimeConfig::push_override([(
                Operation::ResolveElement,
                TimeoutSettings::from_secs(1.0, 0.05, None),
            )]);
            assert_eq!(TimeConfig::effective(Operation::ResolveElement).timeout, secs(1.0));
            {
                let _inner = TimeConfig::push_override([(
                    Operation::ClickAction,
                    TimeoutSettings::from_secs(0.5, 0.05, Some(1)),
                )]);
                // inner scope inherits the outer replacement
                assert_eq!(TimeConfig::effective(Operation::ResolveElement).timeout, secs(1.0));
                assert_eq!(TimeConfig::effective(Operation::ClickAction).retry_count, Some(1));
            }
            assert_eq!(TimeConfig::effective(Operation::ClickAction).retry_count, Some(3));
        }
        assert_eq!(TimeConfig::effective(Operation::ResolveElement), before);
        assert_eq!(TimeConfig::override_depth(), 0);
    }

    #[test]
    fn test_override_pops_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = TimeConfig::push_override([(
                Operation::ExistsWait,
                TimeoutSettings::from_secs(9.0, 0.1, None),
            )]);
            panic!("step blew up");
        });
        assert!(result.is_err());
        assert_eq!(TimeConfig::override_depth(), 0);
    }

    #[test]
    fn test_fast_preset_propagates_action_timeout() {
        let config = TimeConfig::preset(Preset::Fast);
        let click = config.get(Operation::ClickAction);
        assert_eq!(click.timeout, secs(3.0));
        assert_eq!(click.retry_count, Some(2));
        assert_eq!(config.get(Operation::KeySendAction).timeout, secs(3.0));
        // untouched by the preset
        assert_eq!(config.get(Operation::ResolveElement).timeout, secs(10.0));
    }

    #[test]
    fn test_unknown_preset_is_config_error() {
        let err = "turbo".parse::<Preset>().unwrap_err();
        assert!(matches!(err, AutomationError::Config(_)));
        assert_eq!("CI".parse::<Preset>().unwrap(), Preset::Ci);
    }

    #[test]
    fn test_app_defaults_only_under_default_preset() {
        let app = Some((secs(4.0), secs(0.1)));
        let config = TimeConfig::build(Preset::Default, app, &[]);
        assert_eq!(config.get(Operation::ResolveElement).timeout, secs(4.0));
        assert_eq!(config.get(Operation::ExistsWait).timeout, secs(0.8));

        let slow = TimeConfig::build(Preset::Slow, app, &[]);
        assert_eq!(slow.get(Operation::ElementWait).timeout, secs(20.0));
        assert_eq!(slow.get(Operation::ResolveElement).timeout, secs(10.0));
    }

    #[test]
    fn test_explicit_override_wins_over_app_defaults() {
        let o: TimingOverride = "resolve_element=2.5,0.05".parse().unwrap();
        let config = TimeConfig::build(Preset::Default, Some((secs(4.0), secs(0.1))), &[o]);
        let resolved = config.get(Operation::ResolveElement);
        assert_eq!(resolved.timeout, secs(2.5));
        assert_eq!(resolved.interval, secs(0.05));
    }

    #[test]
    fn test_timing_override_parsing() {
        let o: TimingOverride = "click_action=3,0.1,2".parse().unwrap();
        assert_eq!(o.operation, Operation::ClickAction);
        assert_eq!(o.retry_count, Some(2));
        assert!("bogus=1".parse::<TimingOverride>().is_err());
        assert!("click_action".parse::<TimingOverride>().is_err());
        assert!("click_action=-1".parse::<TimingOverride>().is_err());
    }

    #[test]
    fn test_action_settings_fallback() {
        let config = TimeConfig::base();
        assert_eq!(config.action_settings("hover").timeout, secs(3.0));
        assert_eq!(config.action_settings("drag"), config.get(Operation::ActionTimeout));
    }
}
