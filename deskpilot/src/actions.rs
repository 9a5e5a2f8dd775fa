//! Keyword-level operations a scenario step dispatches to.
//!
//! Each keyword opens its own action context and reports any failure as an
//! [`AutomationError::Action`] naming the keyword and its target, with the
//! underlying error kept as the cause.

use std::time::Duration;

use tracing::{debug, info};

use crate::context::ActionContext;
use crate::errors::{ActionFailure, AutomationError};
use crate::object_map::Locator;
use crate::platforms::{ConnectParams, SelectOption, ToggleState, WaitState};
use crate::resolver::Resolver;

pub struct Actions<'r> {
    resolver: &'r Resolver,
}

fn keyword_failure(keyword: &str, target: Option<&str>, details: Option<String>, err: AutomationError) -> AutomationError {
    let already_named = matches!(&err, AutomationError::Action(a) if a.action == keyword);
    if already_named {
        return err;
    }
    let mut failure = ActionFailure::new(keyword, target);
    if let Some(details) = details {
        failure = failure.with_details(details);
    }
    AutomationError::Action(Box::new(failure.with_cause(err)))
}

impl<'r> Actions<'r> {
    pub fn new(resolver: &'r Resolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &'r Resolver {
        self.resolver
    }

    fn run<T>(
        &self,
        keyword: &str,
        target: Option<&str>,
        details: Option<String>,
        f: impl FnOnce() -> Result<T, AutomationError>,
    ) -> Result<T, AutomationError> {
        let _scope = ActionContext::enter(keyword, target, None);
        debug!(keyword, element = ?target, "keyword started");
        f().map_err(|err| keyword_failure(keyword, target, details, err))
    }

    pub fn click(&self, element: &str, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("click", Some(element), None, || self.resolver.element(element, overrides)?.click())
    }

    pub fn double_click(&self, element: &str, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("double_click", Some(element), None, || {
            self.resolver.element(element, overrides)?.double_click()
        })
    }

    pub fn right_click(&self, element: &str, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("right_click", Some(element), None, || {
            self.resolver.element(element, overrides)?.right_click()
        })
    }

    pub fn hover(&self, element: &str, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("hover", Some(element), None, || self.resolver.element(element, overrides)?.hover())
    }

    /// The `type` keyword: replaces (or appends to) the element's text.
    pub fn type_text(
        &self,
        element: &str,
        text: &str,
        clear: bool,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("type", Some(element), None, || {
            self.resolver.element(element, overrides)?.set_text(text, clear)
        })
    }

    pub fn click_and_type(
        &self,
        element: &str,
        text: &str,
        clear: bool,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("click_and_type", Some(element), None, || {
            let mut el = self.resolver.element(element, overrides)?;
            el.click()?;
            el.set_text(text, clear)
        })
    }

    /// The `wait` keyword.
    pub fn wait_for(
        &self,
        element: &str,
        state: WaitState,
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("wait", Some(element), Some(format!("state={state}")), || {
            self.resolver
                .wait_for_element(element, state, timeout, overrides)
                .map(|_| ())
        })
    }

    pub fn wait_for_gone(
        &self,
        element: &str,
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("wait_for_gone", Some(element), None, || {
            self.resolver.wait_for_element_gone(element, timeout, overrides)
        })
    }

    /// Returns the index of the first element that appeared.
    pub fn wait_for_any(
        &self,
        elements: &[String],
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<usize, AutomationError> {
        let details = format!("elements=[{}]", elements.join(", "));
        self.run("wait_for_any", None, Some(details), || {
            let index = self.resolver.wait_for_any(elements, timeout, overrides)?;
            info!(winner = %elements[index], "wait_for_any satisfied");
            Ok(index)
        })
    }

    /// The `assert` keyword: checks the state once the element resolves.
    pub fn assert_state(
        &self,
        element: &str,
        state: WaitState,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("assert", Some(element), Some(format!("state={state}")), || {
            let el = self.resolver.element(element, overrides)?;
            let holds = match state {
                WaitState::Exists => el.exists(),
                WaitState::Visible => el.is_visible(),
                WaitState::Enabled => el.is_visible() && el.is_enabled(),
            };
            if holds {
                Ok(())
            } else {
                Err(AutomationError::Assertion(format!("Expected {state}, but it is not")))
            }
        })
    }

    pub fn assert_text_equals(
        &self,
        element: &str,
        expected: &str,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("assert_text_equals", Some(element), None, || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Visible, None)?;
            let actual = el.get_text()?;
            if actual == expected {
                Ok(())
            } else {
                Err(AutomationError::Assertion(format!("Expected '{expected}', got '{actual}'")))
            }
        })
    }

    pub fn assert_text_contains(
        &self,
        element: &str,
        substring: &str,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("assert_text_contains", Some(element), None, || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Visible, None)?;
            let actual = el.get_text()?;
            if actual.contains(substring) {
                Ok(())
            } else {
                Err(AutomationError::Assertion(format!("Expected '{substring}' in '{actual}'")))
            }
        })
    }

    pub fn set_checkbox(&self, element: &str, checked: bool, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("set_checkbox", Some(element), Some(format!("checked={checked}")), || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Enabled, None)?;
            if checked {
                el.check()
            } else {
                el.uncheck()
            }
        })
    }

    pub fn assert_checkbox_state(
        &self,
        element: &str,
        checked: bool,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("assert_checkbox_state", Some(element), None, || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Visible, None)?;
            let expected = if checked {
                ToggleState::Checked
            } else {
                ToggleState::Unchecked
            };
            match el.checkbox_state() {
                state if state == expected => Ok(()),
                state => Err(AutomationError::Assertion(format!("Expected {expected}, got {state}"))),
            }
        })
    }

    pub fn select_combobox(
        &self,
        element: &str,
        option: &SelectOption,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("select_combobox", Some(element), Some(format!("option={option}")), || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Enabled, None)?;
            el.select(option)
        })
    }

    /// Opens a combo box and clicks one of its items, both named in the
    /// object map. For drop-downs whose items are separate elements.
    pub fn select_combobox_item(
        &self,
        combobox: &str,
        item: &str,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("select_combobox_item", Some(combobox), Some(format!("item={item}")), || {
            self.resolver.element(combobox, None)?.click()?;
            self.resolver.element(item, overrides)?.click()
        })
    }

    /// Selects a list item by text or by index. Exactly one must be given.
    pub fn select_list_item(
        &self,
        element: &str,
        item_text: Option<&str>,
        item_index: Option<usize>,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        self.run("select_list_item", Some(element), None, || {
            let option = match (item_text, item_index) {
                (Some(text), None) => SelectOption::Text(text.to_string()),
                (None, Some(index)) => SelectOption::Index(index),
                _ => {
                    return Err(AutomationError::InvalidArgument(
                        "select_list_item needs exactly one of item_text or item_index".to_string(),
                    ))
                }
            };
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Visible, None)?;
            el.select_item(&option)
        })
    }

    pub fn assert_count(&self, element: &str, expected: usize, overrides: Option<&Locator>) -> Result<(), AutomationError> {
        self.run("assert_count", Some(element), None, || {
            let mut el = self.resolver.element(element, overrides)?;
            el.wait(WaitState::Visible, None)?;
            let actual = el.item_count()?;
            if actual == expected {
                Ok(())
            } else {
                Err(AutomationError::Assertion(format!("Expected {expected} items, got {actual}")))
            }
        })
    }

    pub fn close_window(&self, window: &str) -> Result<(), AutomationError> {
        self.run("close_window", Some(window), None, || {
            self.resolver.resolve_window(window, None)?.close()
        })
    }

    /// Sends a global key combination such as `^l`.
    pub fn hotkey(&self, keys: &str) -> Result<(), AutomationError> {
        self.run("hotkey", None, Some(format!("keys={keys}")), || self.resolver.session().send_keys(keys))
    }

    /// Clicks the element if it shows up within `timeout` (default
    /// `exists_wait`). Absence is not a failure.
    pub fn click_if_exists(
        &self,
        element: &str,
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<bool, AutomationError> {
        self.run("click_if_exists", Some(element), None, || {
            if !self.resolver.exists(element, timeout, overrides) {
                debug!(element, "absent, skipping click");
                return Ok(false);
            }
            self.resolver.element(element, overrides)?.click()?;
            Ok(true)
        })
    }

    pub fn open_app(&self, path: &str, wait_for_idle: bool) -> Result<u32, AutomationError> {
        self.run("open_app", None, Some(format!("path={path}")), || {
            let pid = self.resolver.session().start(path, wait_for_idle)?;
            info!(path, pid, "application started");
            Ok(pid)
        })
    }

    pub fn connect(&self, params: &ConnectParams) -> Result<(), AutomationError> {
        self.run("connect", None, None, || self.resolver.session().connect(params))
    }

    pub fn kill_app(&self) -> Result<(), AutomationError> {
        self.run("kill_app", None, None, || self.resolver.session().kill())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::object_map::ObjectMap;
    use crate::platforms::memory::{MemoryDesktop, MemoryNode, MemorySession};
    use crate::timings::{Operation, TimeConfig, TimeoutSettings};
    use std::sync::Arc;

    const MAP: &str = r#"
windows:
  login:
    locators:
      - title: Sign in
elements:
  user:
    window: login
    locators:
      - auto_id: user
  remember:
    window: login
    locators:
      - name: Remember me
  country:
    window: login
    locators:
      - auto_id: country
  ghost:
    window: login
    locators:
      - auto_id: ghost
"#;

    fn fixture() -> (MemoryDesktop, Resolver) {
        let desktop = MemoryDesktop::new();
        desktop.add_window(
            MemoryNode::window("Sign in")
                .child(MemoryNode::new("Edit").auto_id("user").text("old"))
                .child(MemoryNode::new("CheckBox").name("Remember me").checked(false))
                .child(MemoryNode::new("ComboBox").auto_id("country").items(&["NL", "DE", "FR"])),
        );
        let session = Arc::new(MemorySession::new(desktop.clone()));
        let map = Arc::new(ObjectMap::from_yaml_str(MAP).unwrap());
        (desktop, Resolver::new(session, map))
    }

    fn quick() -> crate::timings::OverrideGuard {
        TimeConfig::push_override(
            Operation::ALL
                .iter()
                .map(|op| (*op, TimeoutSettings::from_secs(0.2, 0.02, None))),
        )
    }

    #[test]
    fn test_type_replaces_text() {
        let (desktop, resolver) = fixture();
        let actions = Actions::new(&resolver);
        actions.type_text("user", "alice", true, None).unwrap();
        assert_eq!(desktop.text_of(2).as_deref(), Some("alice"));
        actions.type_text("user", "!", false, None).unwrap();
        assert_eq!(desktop.text_of(2).as_deref(), Some("alice!"));
    }

    #[test]
    fn test_failed_assertion_names_keyword_and_cause() {
        let (_desktop, resolver) = fixture();
        let err = Actions::new(&resolver)
            .assert_text_equals("user", "bob", None)
            .unwrap_err();
        match &err {
            AutomationError::Action(failure) => {
                assert_eq!(failure.action, "assert_text_equals");
                assert_eq!(failure.element.as_deref(), Some("user"));
            }
            other => panic!("expected action failure, got {other}"),
        }
        assert_eq!(err.root_cause().kind(), ErrorKind::Assertion);
        assert!(err.to_string().contains("Expected 'bob', got 'old'"));
        assert!(err.action_trace().is_some_and(|t| t.contains("assert_text_equals")));
    }

    #[test]
    fn test_set_checkbox_is_idempotent() {
        let (desktop, resolver) = fixture();
        let actions = Actions::new(&resolver);
        actions.set_checkbox("remember", true, None).unwrap();
        actions.set_checkbox("remember", true, None).unwrap();
        assert_eq!(desktop.checked_of(3), Some(true));
        assert_eq!(desktop.count_calls("toggle:"), 1);
        actions.assert_checkbox_state("remember", true, None).unwrap();
        assert!(actions.assert_checkbox_state("remember", false, None).is_err());
    }

    #[test]
    fn test_select_combobox_and_count() {
        let (desktop, resolver) = fixture();
        let actions = Actions::new(&resolver);
        actions
            .select_combobox("country", &SelectOption::Text("DE".into()), None)
            .unwrap();
        assert_eq!(desktop.selected_of(4), Some(1));
        actions.select_combobox("country", &SelectOption::Index(2), None).unwrap();
        assert_eq!(desktop.text_of(4).as_deref(), Some("FR"));
        actions.assert_count("country", 3, None).unwrap();
    }

    #[test]
    fn test_select_list_item_needs_one_selector() {
        let (_desktop, resolver) = fixture();
        let err = Actions::new(&resolver)
            .select_list_item("country", Some("NL"), Some(0), None)
            .unwrap_err();
        assert_eq!(err.root_cause().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_click_if_exists_skips_missing_element() {
        let (desktop, resolver) = fixture();
        let _quick = quick();
        let clicked = Actions::new(&resolver)
            .click_if_exists("ghost", Some(Duration::from_millis(50)), None)
            .unwrap();
        assert!(!clicked);
        assert_eq!(desktop.count_calls("click:"), 0);
    }

    #[test]
    fn test_hotkey_and_close_window() {
        let (desktop, resolver) = fixture();
        let actions = Actions::new(&resolver);
        actions.hotkey("^s").unwrap();
        actions.close_window("login").unwrap();
        assert!(desktop.calls().contains(&"send_keys:^s".to_string()));
        assert!(!desktop.is_alive(1));
    }
}
