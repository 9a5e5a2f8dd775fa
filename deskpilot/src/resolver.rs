//! Turns semantic window/element names into live handles.
//!
//! Each name maps to ordered locator candidates. Candidates are tried in
//! order and every failure is recorded, so an exhausted resolution reports
//! exactly what was tried and why each candidate failed.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::ActionContext;
use crate::element::ResilientElement;
use crate::errors::{
    AttemptTarget, AutomationError, ErrorKind, IndexOutOfRange, LocatorAttempt, ResolutionFailure, Stage,
};
use crate::object_map::{Locator, ObjectMap};
use crate::platforms::{ArtifactCollector, NoArtifacts, Session, UiElement, WaitState};
use crate::timings::{Operation, TimeConfig, TimeoutSettings};
use crate::waits::{wait_until, wait_until_not, wait_until_passes, Candidate, Wait};

/// Title-bar chrome that name matching skips when the app policy asks for it.
const TITLEBAR_BUTTONS: &[&str] = &["Close", "Minimize", "Maximize"];

/// Which lookup produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    NameMatch,
    ScopedChild,
    DescendantScan,
}

/// How an element was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementMeta {
    pub name: String,
    pub window: String,
    pub locator: Locator,
    pub found_via_name: bool,
    pub strategy: Strategy,
    /// Position of the chosen element among the ordered matches.
    pub candidate_index: usize,
}

/// A live handle plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedHandle {
    pub element: Box<dyn UiElement>,
    pub meta: ElementMeta,
}

#[derive(Debug)]
struct CacheEntry {
    element: Box<dyn UiElement>,
    window: Box<dyn UiElement>,
    window_runtime_id: String,
    meta: ElementMeta,
}

/// Resolves object-map names against one session.
///
/// Confined to the thread that created it; the handle cache is not shared.
pub struct Resolver {
    session: Arc<dyn Session>,
    map: Arc<ObjectMap>,
    artifacts: Arc<dyn ArtifactCollector>,
    cache: RefCell<HashMap<(String, String), CacheEntry>>,
    window_ids: RefCell<HashMap<String, String>>,
    cache_enabled: Cell<bool>,
}

impl Resolver {
    pub fn new(session: Arc<dyn Session>, map: Arc<ObjectMap>) -> Self {
        Self {
            session,
            map,
            artifacts: Arc::new(NoArtifacts),
            cache: RefCell::new(HashMap::new()),
            window_ids: RefCell::new(HashMap::new()),
            cache_enabled: Cell::new(true),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactCollector>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn object_map(&self) -> &ObjectMap {
        &self.map
    }

    pub fn enable_cache(&self, enabled: bool) {
        self.cache_enabled.set(enabled);
        if !enabled {
            self.clear_cache();
        }
    }

    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Finds a top-level window, trying each configured locator in turn and
    /// waiting up to `timeout` per locator for it to exist and be visible.
    #[instrument(level = "debug", skip(self, timeout))]
    pub fn resolve_window(&self, name: &str, timeout: Option<Duration>) -> Result<Box<dyn UiElement>, AutomationError> {
        let spec = self.map.window_spec(name)?;
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::ResolveWindow))
            .with_timeout(timeout)
            .describe(format!("window '{name}'"))
            .at_stage(Stage::Resolve);

        let mut attempts = Vec::new();
        let mut last_error = None;
        for locator in &spec.locators {
            let found = wait_until(&wait, || {
                let window = self.top_level(locator)?;
                Ok((window.exists()? && window.is_visible()?).then_some(window))
            });
            match found {
                Ok(window) => {
                    self.note_window(name, window.as_ref());
                    debug!(window = name, %locator, "window resolved");
                    return Ok(window);
                }
                Err(err) => {
                    let message = err.to_string();
                    attempts.push(LocatorAttempt {
                        target: AttemptTarget::Window,
                        locator: locator.clone(),
                        error: message.clone(),
                    });
                    last_error = Some(message);
                }
            }
        }

        let artifacts = self
            .artifacts
            .collect(name, None, &self.map.app().artifacts_dir);
        warn!(window = name, attempts = attempts.len(), "window not found");
        Err(AutomationError::WindowNotFound(Box::new(ResolutionFailure {
            name: name.to_string(),
            window: None,
            attempts,
            timeout: wait.timeout,
            last_error,
            artifacts,
        })))
    }

    /// Single resolution pass over `[overrides] ++ configured locators`.
    /// A cached handle is served when it still validates.
    #[instrument(level = "debug", skip(self, overrides, timeout))]
    pub fn resolve(
        &self,
        name: &str,
        overrides: Option<&Locator>,
        timeout: Option<Duration>,
    ) -> Result<ResolvedHandle, AutomationError> {
        self.resolve_with(name, overrides, timeout, true)
    }

    /// Like [`Resolver::resolve`] but always searches the live tree.
    pub fn resolve_fresh(
        &self,
        name: &str,
        overrides: Option<&Locator>,
        timeout: Option<Duration>,
    ) -> Result<ResolvedHandle, AutomationError> {
        self.resolve_with(name, overrides, timeout, false)
    }

    /// Resolves `name` into a [`ResilientElement`], polling while the element
    /// is not there yet, within the `resolve_element` budget.
    pub fn element(&self, name: &str, overrides: Option<&Locator>) -> Result<ResilientElement<'_>, AutomationError> {
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::ResolveElement))
            .describe(format!("element '{name}'"))
            .at_stage(Stage::Resolve);
        match wait_until_passes(&wait, &[ErrorKind::ElementNotFound], || self.resolve(name, overrides, None)) {
            Ok(resolved) => Ok(ResilientElement::new(self, resolved.value, overrides.cloned())),
            Err(AutomationError::Timeout(timeout)) => {
                let timeout = *timeout;
                match timeout.last_error {
                    Some(last) => Err(*last),
                    None => Err(AutomationError::Timeout(Box::new(timeout))),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Whether `name` can be resolved within `timeout` (default `exists_wait`).
    /// Never fails.
    pub fn exists(&self, name: &str, timeout: Option<Duration>, overrides: Option<&Locator>) -> bool {
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::ExistsWait))
            .with_timeout(timeout)
            .describe(format!("element '{name}' to exist"));
        wait_until(&wait, || Ok(self.exists_now(name, overrides))).is_ok()
    }

    /// Waits until `name` resolves and reaches `state`.
    pub fn wait_for_element(
        &self,
        name: &str,
        state: WaitState,
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<ResilientElement<'_>, AutomationError> {
        let mut element = self.element(name, overrides)?;
        element.wait(state, timeout)?;
        Ok(element)
    }

    /// Waits until `name` no longer resolves, within `disappear_wait`.
    pub fn wait_for_element_gone(
        &self,
        name: &str,
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<(), AutomationError> {
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::DisappearWait))
            .with_timeout(timeout)
            .describe(format!("element '{name}' to disappear"));
        wait_until_not(&wait, || Ok(self.exists_now(name, overrides)))
    }

    /// Races several elements and returns the index of the first one found.
    pub fn wait_for_any(
        &self,
        names: &[String],
        timeout: Option<Duration>,
        overrides: Option<&Locator>,
    ) -> Result<usize, AutomationError> {
        let wait = Wait::from_settings(&TimeConfig::effective(Operation::WaitForAny)).with_timeout(timeout);
        let mut candidates: Vec<Candidate<'_>> = names
            .iter()
            .map(|name| Candidate::new(name.clone(), move || Ok(self.exists_now(name, overrides))))
            .collect();
        crate::waits::wait_for_any(&wait, &mut candidates)
    }

    /// One immediate, uncached resolution attempt with every internal wait
    /// collapsed to a single check.
    pub(crate) fn try_resolve_now(
        &self,
        name: &str,
        overrides: Option<&Locator>,
    ) -> Result<ResolvedHandle, AutomationError> {
        let now = |op: Operation| {
            let interval = TimeConfig::effective(op).interval;
            (op, TimeoutSettings::new(Duration::ZERO, interval))
        };
        let _instant = TimeConfig::push_override([now(Operation::ResolveWindow), now(Operation::ChildWindowQuick)]);
        self.resolve_fresh(name, overrides, Some(Duration::ZERO))
    }

    fn exists_now(&self, name: &str, overrides: Option<&Locator>) -> bool {
        self.try_resolve_now(name, overrides)
            .and_then(|handle| handle.element.exists())
            .unwrap_or(false)
    }

    fn resolve_with(
        &self,
        name: &str,
        overrides: Option<&Locator>,
        timeout: Option<Duration>,
        use_cache: bool,
    ) -> Result<ResolvedHandle, AutomationError> {
        let spec = self.map.element_spec(name)?;
        let window_name = spec.window.as_str();
        if let Some(locator) = overrides {
            locator.check(&format!("{name} overrides"))?;
        }

        if use_cache && self.cache_enabled.get() && overrides.is_none() {
            if let Some(hit) = self.cached(name, window_name) {
                debug!(element = name, "served from cache");
                return Ok(hit);
            }
        }

        let _scope = ActionContext::enter("resolve", Some(name), Some(window_name));
        let settings = TimeConfig::effective(Operation::ResolveElement);
        let timeout = timeout.unwrap_or(settings.timeout);
        let window = self.resolve_window(window_name, None)?;

        let candidates: Vec<&Locator> = overrides.into_iter().chain(spec.locators.iter()).collect();
        let mut attempts = Vec::new();
        let mut last_error = None;
        let mut out_of_range = None;

        for locator in candidates {
            let located = self.locate(window.as_ref(), locator, name, window_name).and_then(|found| {
                if locator.is_name_based() {
                    return Ok(found);
                }
                let wait = Wait::new(timeout, settings.interval)
                    .describe(format!("element '{name}' to exist"))
                    .at_stage(Stage::Resolve);
                wait_until(&wait, || found.0.exists())?;
                Ok(found)
            });

            match located {
                Ok((element, strategy, candidate_index)) => {
                    let meta = ElementMeta {
                        name: name.to_string(),
                        window: window_name.to_string(),
                        locator: locator.clone(),
                        found_via_name: locator.is_name_based(),
                        strategy,
                        candidate_index,
                    };
                    info!(element = name, window = window_name, %locator, ?strategy, "element resolved");
                    if self.cache_enabled.get() && overrides.is_none() {
                        self.store(&meta, element.as_ref(), window.as_ref());
                    }
                    return Ok(ResolvedHandle { element, meta });
                }
                Err(err) => {
                    debug!(element = name, %locator, error = %err, "locator failed");
                    if let AutomationError::IndexOutOfRange(oor) = &err {
                        out_of_range = Some((oor.index, oor.match_count));
                    }
                    let message = err.to_string();
                    attempts.push(LocatorAttempt {
                        target: AttemptTarget::Element,
                        locator: locator.clone(),
                        error: message.clone(),
                    });
                    last_error = Some(message);
                }
            }
        }

        warn!(element = name, window = window_name, attempts = attempts.len(), "element not found");
        let artifacts = self
            .artifacts
            .collect(name, Some(window.as_ref()), &self.map.app().artifacts_dir);
        if let Some((index, match_count)) = out_of_range {
            return Err(AutomationError::IndexOutOfRange(Box::new(IndexOutOfRange {
                element: name.to_string(),
                window: window_name.to_string(),
                index,
                match_count,
                attempts,
                artifacts,
            })));
        }
        Err(AutomationError::ElementNotFound(Box::new(ResolutionFailure {
            name: name.to_string(),
            window: Some(window_name.to_string()),
            attempts,
            timeout,
            last_error,
            artifacts,
        })))
    }

    fn top_level(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        if self.session.has_application() {
            self.session
                .app_window(locator)
                .or_else(|_| self.session.desktop_window(locator))
        } else {
            self.session.desktop_window(locator)
        }
    }

    /// Applies one locator inside `window`.
    fn locate(
        &self,
        window: &dyn UiElement,
        locator: &Locator,
        element: &str,
        window_name: &str,
    ) -> Result<(Box<dyn UiElement>, Strategy, usize), AutomationError> {
        if locator.is_name_based() {
            let name_re = locator.name_pattern()?;
            let matches: Vec<Box<dyn UiElement>> = window
                .descendants(locator.control_type.as_deref())?
                .into_iter()
                .filter(|el| {
                    let name = el.name().unwrap_or_default();
                    locator.name.as_ref().map_or(true, |want| *want == name)
                        && name_re.as_ref().map_or(true, |re| re.is_match(&name))
                })
                .collect();
            let matches = self.without_chrome(matches);
            if matches.is_empty() {
                return Err(AutomationError::NoMatch(format!(
                    "no element matching {locator} in window '{window_name}'"
                )));
            }
            let (el, index) = pick(matches, locator.found_index, element, window_name)?;
            return Ok((el, Strategy::NameMatch, index));
        }

        let quick = Wait::from_settings(&TimeConfig::effective(Operation::ChildWindowQuick))
            .describe(format!("scoped lookup {locator}"))
            .at_stage(Stage::Resolve);
        let direct = wait_until(&quick, || {
            let el = window.child(locator)?;
            Ok(el.exists()?.then_some(el))
        });
        let direct_error = match direct {
            Ok(el) => return Ok((el, Strategy::ScopedChild, locator.found_index.unwrap_or(0))),
            Err(err) => err,
        };

        let title_re = locator.title_pattern()?;
        let eq = |want: &Option<String>, have: Result<String, AutomationError>| {
            want.as_ref().map_or(true, |w| have.map(|h| *w == h).unwrap_or(false))
        };
        let matches: Vec<Box<dyn UiElement>> = window
            .descendants(locator.control_type.as_deref())?
            .into_iter()
            .filter(|el| {
                eq(&locator.title, el.title())
                    && eq(&locator.auto_id, el.automation_id())
                    && eq(&locator.class_name, el.class_name())
                    && title_re
                        .as_ref()
                        .map_or(true, |re| re.is_match(&el.title().unwrap_or_default()))
            })
            .collect();
        let matches = self.without_chrome(matches);
        if matches.is_empty() {
            return Err(AutomationError::NoMatch(format!(
                "no element matching {locator} in window '{window_name}' ({direct_error})"
            )));
        }
        let (el, index) = pick(matches, locator.found_index, element, window_name)?;
        Ok((el, Strategy::DescendantScan, index))
    }

    fn without_chrome(&self, matches: Vec<Box<dyn UiElement>>) -> Vec<Box<dyn UiElement>> {
        if !self.map.app().ignore_titlebar_buttons {
            return matches;
        }
        matches
            .into_iter()
            .filter(|el| {
                let is_button = el.control_type().map(|ct| ct == "Button").unwrap_or(false);
                let label = el.title().or_else(|_| el.name()).unwrap_or_default();
                !(is_button && TITLEBAR_BUTTONS.contains(&label.as_str()))
            })
            .collect()
    }

    fn note_window(&self, name: &str, window: &dyn UiElement) {
        let Ok(runtime_id) = window.runtime_id() else {
            return;
        };
        let previous = self
            .window_ids
            .borrow_mut()
            .insert(name.to_string(), runtime_id.clone());
        if previous.is_some_and(|p| p != runtime_id) {
            debug!(window = name, "window identity changed, dropping cached elements");
            self.cache.borrow_mut().retain(|(w, _), _| w != name);
        }
    }

    fn cached(&self, name: &str, window: &str) -> Option<ResolvedHandle> {
        let key = (window.to_string(), name.to_string());
        let hit = {
            let cache = self.cache.borrow();
            let entry = cache.get(&key)?;
            let same_window = self.window_ids.borrow().get(window) == Some(&entry.window_runtime_id);
            let valid = same_window
                && entry.window.exists().unwrap_or(false)
                && entry.element.exists().unwrap_or(false);
            valid.then(|| ResolvedHandle {
                element: entry.element.clone_box(),
                meta: entry.meta.clone(),
            })
        };
        if hit.is_none() {
            self.cache.borrow_mut().remove(&key);
        }
        hit
    }

    fn store(&self, meta: &ElementMeta, element: &dyn UiElement, window: &dyn UiElement) {
        let Ok(window_runtime_id) = window.runtime_id() else {
            return;
        };
        self.cache.borrow_mut().insert(
            (meta.window.clone(), meta.name.clone()),
            CacheEntry {
                element: element.clone_box(),
                window: window.clone_box(),
                window_runtime_id,
                meta: meta.clone(),
            },
        );
    }
}

/// Orders matches visible-first (stable, so tree order breaks ties) and
/// takes the explicit index or the first one.
fn pick(
    matches: Vec<Box<dyn UiElement>>,
    found_index: Option<usize>,
    element: &str,
    window: &str,
) -> Result<(Box<dyn UiElement>, usize), AutomationError> {
    let mut ranked: Vec<(bool, Box<dyn UiElement>)> = matches
        .into_iter()
        .map(|el| (el.is_visible().unwrap_or(false), el))
        .collect();
    ranked.sort_by_key(|(visible, _)| !*visible);

    let index = found_index.unwrap_or(0);
    let match_count = ranked.len();
    if index >= match_count {
        return Err(AutomationError::IndexOutOfRange(Box::new(IndexOutOfRange {
            element: element.to_string(),
            window: window.to_string(),
            index,
            match_count,
            attempts: Vec::new(),
            artifacts: BTreeMap::new(),
        })));
    }
    let (_, el) = ranked.swap_remove(index);
    Ok((el, index))
}
