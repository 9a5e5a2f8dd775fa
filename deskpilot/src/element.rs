use std::fmt;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::context::ActionContext;
use crate::errors::{AutomationError, ErrorKind, Stage};
use crate::object_map::Locator;
use crate::platforms::{SelectOption, ToggleState, UiElement, WaitState};
use crate::resolver::{ElementMeta, ResolvedHandle, Resolver};
use crate::timings::{Operation, TimeConfig};
use crate::waits::{retry, wait_until, wait_until_not, wait_until_passes, Retry, Wait};

/// Actions a [`ResilientElement`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementAction {
    Click,
    DoubleClick,
    RightClick,
    Hover,
    Focus,
    SetText,
    TypeKeys,
    GetText,
    Clear,
    Check,
    Uncheck,
    Select,
    SelectItem,
    Close,
}

/// State an element must be in before an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preconditions {
    pub visible: bool,
    pub enabled: bool,
}

const fn needs(visible: bool, enabled: bool) -> Preconditions {
    Preconditions { visible, enabled }
}

const POLICY: &[(ElementAction, Preconditions)] = &[
    (ElementAction::Click, needs(true, true)),
    (ElementAction::DoubleClick, needs(true, true)),
    (ElementAction::RightClick, needs(true, true)),
    (ElementAction::Hover, needs(true, false)),
    (ElementAction::Focus, needs(true, true)),
    (ElementAction::SetText, needs(true, true)),
    (ElementAction::TypeKeys, needs(true, true)),
    (ElementAction::GetText, needs(true, false)),
    (ElementAction::Clear, needs(true, true)),
    (ElementAction::Check, needs(true, true)),
    (ElementAction::Uncheck, needs(true, true)),
    (ElementAction::Select, needs(true, true)),
    (ElementAction::SelectItem, needs(true, false)),
    (ElementAction::Close, needs(false, false)),
];

impl ElementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementAction::Click => "click",
            ElementAction::DoubleClick => "double_click",
            ElementAction::RightClick => "right_click",
            ElementAction::Hover => "hover",
            ElementAction::Focus => "focus",
            ElementAction::SetText => "set_text",
            ElementAction::TypeKeys => "type_keys",
            ElementAction::GetText => "get_text",
            ElementAction::Clear => "clear",
            ElementAction::Check => "check",
            ElementAction::Uncheck => "uncheck",
            ElementAction::Select => "select",
            ElementAction::SelectItem => "select_item",
            ElementAction::Close => "close",
        }
    }

    pub fn preconditions(&self) -> Preconditions {
        POLICY
            .iter()
            .find(|(action, _)| action == self)
            .map(|(_, pre)| *pre)
            .unwrap_or(needs(false, false))
    }

    /// Timing category the action retries under.
    pub fn operation(&self) -> Operation {
        match self {
            ElementAction::Click => Operation::ClickAction,
            ElementAction::DoubleClick => Operation::DoubleClickAction,
            ElementAction::RightClick => Operation::RightClickAction,
            ElementAction::Hover => Operation::HoverAction,
            ElementAction::SetText => Operation::SetTextAction,
            ElementAction::TypeKeys => Operation::KeySendAction,
            ElementAction::GetText => Operation::GetTextAction,
            ElementAction::Check => Operation::CheckAction,
            ElementAction::Uncheck => Operation::UncheckAction,
            ElementAction::Select => Operation::SelectAction,
            ElementAction::SelectItem => Operation::SelectItemAction,
            ElementAction::Focus | ElementAction::Clear | ElementAction::Close => Operation::ActionTimeout,
        }
    }
}

impl fmt::Display for ElementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved element that heals itself.
///
/// Before every action the handle is checked for staleness and re-resolved
/// if needed, then visibility and enablement are awaited as the action's
/// policy requires. The action itself runs under its timing category's
/// retry budget.
pub struct ResilientElement<'r> {
    resolver: &'r Resolver,
    handle: ResolvedHandle,
    overrides: Option<Locator>,
}

impl fmt::Debug for ResilientElement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientElement")
            .field("meta", &self.handle.meta)
            .finish()
    }
}

impl<'r> ResilientElement<'r> {
    pub fn new(resolver: &'r Resolver, handle: ResolvedHandle, overrides: Option<Locator>) -> Self {
        Self {
            resolver,
            handle,
            overrides,
        }
    }

    pub fn meta(&self) -> &ElementMeta {
        &self.handle.meta
    }

    pub fn name(&self) -> &str {
        &self.handle.meta.name
    }

    /// The current backend handle. Replaced whenever the element heals.
    pub fn handle(&self) -> &dyn UiElement {
        self.handle.element.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.handle.element.exists().unwrap_or(false)
    }

    pub fn is_visible(&self) -> bool {
        self.exists() && self.handle.element.is_visible().unwrap_or(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.exists() && self.handle.element.is_enabled().unwrap_or(false)
    }

    pub fn is_stale(&self) -> bool {
        !self.exists()
    }

    /// Re-resolves a stale handle, bypassing the cache, under the
    /// `staleness_retry` budget.
    pub fn ensure_fresh(&mut self) -> Result<(), AutomationError> {
        if !self.is_stale() {
            return Ok(());
        }
        let name = self.handle.meta.name.clone();
        warn!(element = %name, "stale handle, re-resolving");

        let settings = TimeConfig::effective(Operation::StalenessRetry);
        let wait = Wait::from_settings(&settings)
            .describe(format!("fresh handle for '{name}'"))
            .at_stage(Stage::Resolve);
        let resolver = self.resolver;
        let overrides = self.overrides.as_ref();
        let healed = wait_until_passes(&wait, ErrorKind::TRANSIENT, || {
            let fresh = resolver.resolve_fresh(&name, overrides, Some(settings.timeout))?;
            if fresh.element.exists()? {
                Ok(fresh)
            } else {
                Err(AutomationError::StaleElement {
                    element: name.clone(),
                    message: "re-resolved handle vanished".to_string(),
                })
            }
        });

        match healed {
            Ok(fresh) => {
                debug!(element = %name, attempts = fresh.attempts, "handle refreshed");
                self.handle = fresh.value;
                Ok(())
            }
            Err(err) => Err(AutomationError::StaleElement {
                element: name,
                message: err.to_string(),
            }),
        }
    }

    pub fn ensure_visible(&mut self) -> Result<(), AutomationError> {
        if self.is_visible() {
            return Ok(());
        }
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::VisibilityWait))
            .describe(format!("'{}' to be visible", self.name()))
            .at_stage(Stage::Precondition);
        let element = self.handle.element.as_ref();
        wait_until(&wait, || element.is_visible())
            .map(|_| ())
            .map_err(|err| AutomationError::ElementNotVisible {
                element: self.handle.meta.name.clone(),
                message: err.to_string(),
            })
    }

    pub fn ensure_enabled(&mut self) -> Result<(), AutomationError> {
        if self.is_enabled() {
            return Ok(());
        }
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::EnabledWait))
            .describe(format!("'{}' to be enabled", self.name()))
            .at_stage(Stage::Precondition);
        let element = self.handle.element.as_ref();
        wait_until(&wait, || element.is_enabled())
            .map(|_| ())
            .map_err(|err| AutomationError::ElementNotEnabled {
                element: self.handle.meta.name.clone(),
                message: err.to_string(),
            })
    }

    fn prepare(&mut self, action: ElementAction) -> Result<(), AutomationError> {
        let pre = action.preconditions();
        self.ensure_fresh()?;
        if pre.visible {
            self.ensure_visible()?;
        }
        if pre.enabled {
            self.ensure_enabled()?;
        }
        Ok(())
    }

    /// Runs one action with freshness, preconditions and retry around it.
    /// Failures of the action itself come back as [`AutomationError::Action`].
    #[instrument(level = "debug", skip(self, op), fields(element = %self.handle.meta.name))]
    fn execute<T, F>(&mut self, action: ElementAction, mut op: F) -> Result<T, AutomationError>
    where
        F: FnMut(&dyn UiElement) -> Result<T, AutomationError>,
    {
        let _scope = ActionContext::enter(
            action.as_str(),
            Some(&self.handle.meta.name),
            Some(&self.handle.meta.window),
        );
        self.prepare(action)?;

        let settings = TimeConfig::effective(action.operation());
        let label = format!("{action} on '{}'", self.handle.meta.name);
        let element = self.handle.element.as_ref();
        let outcome = match settings.retry_count {
            Some(attempts) => retry(
                &Retry::new(attempts, settings.interval)
                    .describe(label)
                    .at_stage(Stage::Execute),
                ErrorKind::TRANSIENT,
                || op(element),
            ),
            None => wait_until_passes(
                &Wait::from_settings(&settings)
                    .describe(label)
                    .at_stage(Stage::Execute),
                ErrorKind::TRANSIENT,
                || op(element),
            ),
        };

        outcome
            .map(|done| done.value)
            .map_err(|err| AutomationError::action(action.as_str(), Some(&self.handle.meta.name), err))
    }

    pub fn click(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Click, |el| el.click())
    }

    pub fn double_click(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::DoubleClick, |el| el.double_click())
    }

    pub fn right_click(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::RightClick, |el| el.right_click())
    }

    pub fn hover(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Hover, |el| el.hover())
    }

    pub fn focus(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Focus, |el| el.focus())
    }

    pub fn set_text(&mut self, text: &str, clear_first: bool) -> Result<(), AutomationError> {
        self.execute(ElementAction::SetText, |el| el.set_text(text, clear_first))
    }

    pub fn type_keys(&mut self, keys: &str) -> Result<(), AutomationError> {
        self.execute(ElementAction::TypeKeys, |el| el.type_keys(keys))
    }

    pub fn get_text(&mut self) -> Result<String, AutomationError> {
        self.execute(ElementAction::GetText, |el| el.get_text())
    }

    pub fn clear(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Clear, |el| el.clear())
    }

    /// Reads the text without waiting on any precondition.
    pub fn text(&mut self) -> Result<String, AutomationError> {
        self.ensure_fresh()?;
        self.handle.element.get_text()
    }

    pub fn close(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Close, |el| el.close())
    }

    pub fn check(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Check, |el| set_toggle(el, ToggleState::Checked))
    }

    pub fn uncheck(&mut self) -> Result<(), AutomationError> {
        self.execute(ElementAction::Uncheck, |el| set_toggle(el, ToggleState::Unchecked))
    }

    /// Current toggle state; `Unknown` when it cannot be read.
    pub fn checkbox_state(&mut self) -> ToggleState {
        if self.ensure_fresh().is_err() {
            return ToggleState::Unknown;
        }
        self.handle
            .element
            .toggle_state()
            .unwrap_or(ToggleState::Unknown)
    }

    /// Picks an option of a combo box.
    pub fn select(&mut self, option: &SelectOption) -> Result<(), AutomationError> {
        self.execute(ElementAction::Select, |el| el.select(option))
    }

    /// Picks an item of a list.
    pub fn select_item(&mut self, option: &SelectOption) -> Result<(), AutomationError> {
        self.execute(ElementAction::SelectItem, |el| el.select(option))
    }

    pub fn item_count(&mut self) -> Result<usize, AutomationError> {
        self.ensure_fresh()?;
        self.handle.element.item_count()
    }

    /// Waits for `state`, re-resolving the element while it is missing.
    pub fn wait(&mut self, state: WaitState, timeout: Option<Duration>) -> Result<(), AutomationError> {
        let operation = match state {
            WaitState::Exists => Operation::ElementWait,
            WaitState::Visible => Operation::VisibilityWait,
            WaitState::Enabled => Operation::EnabledWait,
        };
        let wait = Wait::from_settings(&TimeConfig::effective(operation))
            .with_timeout(timeout)
            .describe(format!("'{}' to be {state}", self.handle.meta.name));
        let resolver = self.resolver;
        let name = self.handle.meta.name.clone();
        let overrides = self.overrides.as_ref();
        let handle = &mut self.handle;

        wait_until(&wait, || {
            if !handle.element.exists().unwrap_or(false) {
                *handle = resolver.try_resolve_now(&name, overrides)?;
            }
            match state {
                WaitState::Exists => handle.element.exists(),
                WaitState::Visible => handle.element.is_visible(),
                WaitState::Enabled => handle.element.is_enabled(),
            }
        })
        .map(|_| ())
    }

    /// Waits until this handle no longer exists, within `disappear_wait`.
    pub fn wait_until_gone(&self, timeout: Option<Duration>) -> Result<(), AutomationError> {
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::DisappearWait))
            .with_timeout(timeout)
            .describe(format!("'{}' to disappear", self.handle.meta.name));
        wait_until_not(&wait, || Ok(self.exists()))
    }
}

fn set_toggle(el: &dyn UiElement, target: ToggleState) -> Result<(), AutomationError> {
    if el.toggle_state()? == target {
        return Ok(());
    }
    el.toggle()?;
    match el.toggle_state()? {
        state if state == target => Ok(()),
        state => Err(AutomationError::Platform(format!(
            "toggle left the control {state:?} instead of {target:?}"
        ))),
    }
}
