//! An in-memory desktop: a mutable UI tree behind the [`Session`] and
//! [`UiElement`] capabilities. Used for tests and for dry runs seeded from a
//! tree fixture.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ConnectParams, SelectOption, Session, ToggleState, UiElement};
use crate::errors::AutomationError;
use crate::object_map::Locator;

pub type NodeId = u64;

const DEFAULT_PID: u32 = 4242;

/// Declarative description of a node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryNode {
    pub control_type: String,
    pub name: String,
    pub title: String,
    pub auto_id: String,
    pub class_name: String,
    pub visible: bool,
    pub enabled: bool,
    pub text: String,
    pub checked: Option<bool>,
    pub items: Vec<String>,
    pub selected: Option<usize>,
    pub children: Vec<MemoryNode>,
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self {
            control_type: "Pane".to_string(),
            name: String::new(),
            title: String::new(),
            auto_id: String::new(),
            class_name: String::new(),
            visible: true,
            enabled: true,
            text: String::new(),
            checked: None,
            items: Vec::new(),
            selected: None,
            children: Vec::new(),
        }
    }
}

impl MemoryNode {
    pub fn new(control_type: &str) -> Self {
        Self {
            control_type: control_type.to_string(),
            ..Default::default()
        }
    }

    pub fn window(title: &str) -> Self {
        Self::new("Window").title(title)
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn auto_id(mut self, auto_id: &str) -> Self {
        self.auto_id = auto_id.to_string();
        self
    }

    pub fn class_name(mut self, class_name: &str) -> Self {
        self.class_name = class_name.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn checked(mut self, checked: bool) -> Self {
        self.checked = Some(checked);
        self
    }

    pub fn items(mut self, items: &[&str]) -> Self {
        self.items = items.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn child(mut self, child: MemoryNode) -> Self {
        self.children.push(child);
        self
    }

    /// Window text: the title when set, the accessible name otherwise.
    fn window_text(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

/// Tree fixture: the windows present at start plus windows that appear when
/// a given application path is launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryFixture {
    pub windows: Vec<MemoryNode>,
    pub launches: BTreeMap<String, Vec<MemoryNode>>,
}

#[derive(Debug)]
struct NodeState {
    props: MemoryNode,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    alive: bool,
}

#[derive(Debug, Default)]
struct DesktopState {
    next_id: NodeId,
    nodes: HashMap<NodeId, NodeState>,
    roots: Vec<NodeId>,
    launches: BTreeMap<String, Vec<MemoryNode>>,
    failures: HashMap<(NodeId, String), u32>,
    calls: Vec<String>,
}

impl DesktopState {
    fn insert(&mut self, parent: Option<NodeId>, mut node: MemoryNode) -> NodeId {
        self.next_id += 1;
        let id = self.next_id;
        let children = std::mem::take(&mut node.children);
        self.nodes.insert(
            id,
            NodeState {
                props: node,
                parent,
                children: Vec::new(),
                alive: true,
            },
        );
        match parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        for child in children {
            self.insert(Some(id), child);
        }
        id
    }

    fn kill_subtree(&mut self, id: NodeId) {
        let children = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.alive = false;
                node.children.clone()
            }
            None => return,
        };
        for child in children {
            self.kill_subtree(child);
        }
    }

    fn remove(&mut self, id: NodeId) {
        self.kill_subtree(id);
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        match parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }

    fn live(&self, id: NodeId) -> Result<&NodeState, AutomationError> {
        match self.nodes.get(&id) {
            Some(node) if node.alive => Ok(node),
            _ => Err(AutomationError::Platform(format!("element mem-{id} no longer exists"))),
        }
    }

    fn live_mut(&mut self, id: NodeId) -> Result<&mut NodeState, AutomationError> {
        match self.nodes.get_mut(&id) {
            Some(node) if node.alive => Ok(node),
            _ => Err(AutomationError::Platform(format!("element mem-{id} no longer exists"))),
        }
    }

    fn descendants(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.nodes.get(&id) {
            for child in &node.children {
                if self.nodes.get(child).is_some_and(|c| c.alive) {
                    out.push(*child);
                    self.descendants(*child, out);
                }
            }
        }
    }

    fn take_failure(&mut self, id: NodeId, operation: &str) -> Result<(), AutomationError> {
        let key = (id, operation.to_string());
        if let Some(remaining) = self.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AutomationError::Platform(format!("injected {operation} failure on mem-{id}")));
            }
        }
        Ok(())
    }
}

struct Criteria<'a> {
    locator: &'a Locator,
    name_re: Option<Regex>,
    title_re: Option<Regex>,
}

impl<'a> Criteria<'a> {
    fn new(locator: &'a Locator) -> Result<Self, AutomationError> {
        Ok(Self {
            locator,
            name_re: locator.name_pattern()?,
            title_re: locator.title_pattern()?,
        })
    }

    fn matches(&self, node: &MemoryNode) -> bool {
        let l = self.locator;
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&l.auto_id, &node.auto_id)
            && eq(&l.name, &node.name)
            && eq(&l.title, node.window_text())
            && eq(&l.control_type, &node.control_type)
            && eq(&l.class_name, &node.class_name)
            && self.name_re.as_ref().map_or(true, |re| re.is_match(&node.name))
            && self.title_re.as_ref().map_or(true, |re| re.is_match(node.window_text()))
    }
}

/// Shared, mutable in-memory desktop. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryDesktop {
    state: Arc<Mutex<DesktopState>>,
}

impl MemoryDesktop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(path: &Path) -> Result<Self, AutomationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AutomationError::Config(format!("Cannot read tree fixture '{}': {e}", path.display()))
        })?;
        // YAML is a superset of JSON, so one parser covers both fixture formats
        let fixture: MemoryFixture = serde_yaml::from_str(&text).map_err(|e| {
            AutomationError::Config(format!("Invalid tree fixture '{}': {e}", path.display()))
        })?;
        Ok(Self::from(fixture))
    }

    fn lock(&self) -> MutexGuard<'_, DesktopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_window(&self, node: MemoryNode) -> NodeId {
        self.lock().insert(None, node)
    }

    pub fn add_child(&self, parent: NodeId, node: MemoryNode) -> NodeId {
        self.lock().insert(Some(parent), node)
    }

    /// Windows that appear when `path` is started.
    pub fn on_launch(&self, path: &str, windows: Vec<MemoryNode>) {
        self.lock().launches.insert(path.to_string(), windows);
    }

    /// Detaches a node and its subtree; handles to it become stale.
    pub fn remove(&self, id: NodeId) {
        self.lock().remove(id);
    }

    pub fn set_visible(&self, id: NodeId, visible: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.props.visible = visible;
        }
    }

    pub fn set_enabled(&self, id: NodeId, enabled: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.props.enabled = enabled;
        }
    }

    pub fn text_of(&self, id: NodeId) -> Option<String> {
        self.lock().nodes.get(&id).map(|n| n.props.text.clone())
    }

    pub fn checked_of(&self, id: NodeId) -> Option<bool> {
        self.lock().nodes.get(&id).and_then(|n| n.props.checked)
    }

    pub fn selected_of(&self, id: NodeId) -> Option<usize> {
        self.lock().nodes.get(&id).and_then(|n| n.props.selected)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.lock().nodes.get(&id).is_some_and(|n| n.alive)
    }

    /// Makes the next `times` calls of `operation` on `id` fail with a
    /// platform error.
    pub fn fail_next(&self, id: NodeId, operation: &str, times: u32) {
        self.lock().failures.insert((id, operation.to_string()), times);
    }

    /// Log of backend calls, e.g. `click:3` or `send_keys:^s`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn element(&self, id: NodeId) -> MemoryElement {
        MemoryElement {
            desktop: self.clone(),
            id,
        }
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn find_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        let criteria = Criteria::new(locator)?;
        let matches: Vec<NodeId> = {
            let state = self.lock();
            state
                .roots
                .iter()
                .filter(|id| {
                    state
                        .nodes
                        .get(*id)
                        .is_some_and(|n| n.alive && criteria.matches(&n.props))
                })
                .copied()
                .collect()
        };
        let index = locator.found_index.unwrap_or(0);
        matches
            .get(index)
            .map(|id| Box::new(self.element(*id)) as Box<dyn UiElement>)
            .ok_or_else(|| AutomationError::NoMatch(format!("no top-level window matches {locator}")))
    }
}

impl From<MemoryFixture> for MemoryDesktop {
    fn from(fixture: MemoryFixture) -> Self {
        let desktop = MemoryDesktop::new();
        {
            let mut state = desktop.lock();
            for window in fixture.windows {
                state.insert(None, window);
            }
            state.launches = fixture.launches;
        }
        desktop
    }
}

/// Handle to one node of a [`MemoryDesktop`].
#[derive(Debug, Clone)]
pub struct MemoryElement {
    desktop: MemoryDesktop,
    id: NodeId,
}

impl MemoryElement {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryNode) -> T) -> Result<T, AutomationError> {
        let state = self.desktop.lock();
        state.live(self.id).map(|n| f(&n.props))
    }

    /// Runs a mutating operation, honouring injected failures and logging it.
    fn act<T>(&self, operation: &str, f: impl FnOnce(&mut MemoryNode) -> Result<T, AutomationError>) -> Result<T, AutomationError> {
        let mut state = self.desktop.lock();
        state.live(self.id)?;
        state.take_failure(self.id, operation)?;
        state.calls.push(format!("{operation}:{}", self.id));
        let node = state.live_mut(self.id)?;
        f(&mut node.props)
    }
}

impl UiElement for MemoryElement {
    fn runtime_id(&self) -> Result<String, AutomationError> {
        Ok(format!("mem-{}", self.id))
    }

    fn name(&self) -> Result<String, AutomationError> {
        self.read(|n| n.name.clone())
    }

    fn title(&self) -> Result<String, AutomationError> {
        self.read(|n| n.window_text().to_string())
    }

    fn control_type(&self) -> Result<String, AutomationError> {
        self.read(|n| n.control_type.clone())
    }

    fn class_name(&self) -> Result<String, AutomationError> {
        self.read(|n| n.class_name.clone())
    }

    fn automation_id(&self) -> Result<String, AutomationError> {
        self.read(|n| n.auto_id.clone())
    }

    fn exists(&self) -> Result<bool, AutomationError> {
        Ok(self.desktop.is_alive(self.id))
    }

    fn is_visible(&self) -> Result<bool, AutomationError> {
        self.read(|n| n.visible)
    }

    fn is_enabled(&self) -> Result<bool, AutomationError> {
        self.read(|n| n.enabled)
    }

    fn click(&self) -> Result<(), AutomationError> {
        self.act("click", |_| Ok(()))
    }

    fn double_click(&self) -> Result<(), AutomationError> {
        self.act("double_click", |_| Ok(()))
    }

    fn right_click(&self) -> Result<(), AutomationError> {
        self.act("right_click", |_| Ok(()))
    }

    fn hover(&self) -> Result<(), AutomationError> {
        self.act("hover", |_| Ok(()))
    }

    fn focus(&self) -> Result<(), AutomationError> {
        self.act("focus", |_| Ok(()))
    }

    fn set_text(&self, text: &str, clear_first: bool) -> Result<(), AutomationError> {
        self.act("set_text", |n| {
            if clear_first {
                n.text = text.to_string();
            } else {
                n.text.push_str(text);
            }
            Ok(())
        })
    }

    fn type_keys(&self, keys: &str) -> Result<(), AutomationError> {
        self.act("type_keys", |n| {
            n.text.push_str(keys);
            Ok(())
        })
    }

    fn get_text(&self) -> Result<String, AutomationError> {
        self.act("get_text", |n| Ok(n.text.clone()))
    }

    fn clear(&self) -> Result<(), AutomationError> {
        self.act("clear", |n| {
            n.text.clear();
            Ok(())
        })
    }

    fn close(&self) -> Result<(), AutomationError> {
        self.act("close", |_| Ok(()))?;
        self.desktop.remove(self.id);
        Ok(())
    }

    fn toggle_state(&self) -> Result<ToggleState, AutomationError> {
        self.read(|n| match n.checked {
            Some(true) => ToggleState::Checked,
            Some(false) => ToggleState::Unchecked,
            None => ToggleState::Unknown,
        })
    }

    fn toggle(&self) -> Result<(), AutomationError> {
        self.act("toggle", |n| match n.checked {
            Some(checked) => {
                n.checked = Some(!checked);
                Ok(())
            }
            None => Err(AutomationError::UnsupportedOperation(format!(
                "{} does not support toggling",
                n.control_type
            ))),
        })
    }

    fn select(&self, option: &SelectOption) -> Result<(), AutomationError> {
        self.act("select", |n| {
            let index = match option {
                SelectOption::Index(i) => *i,
                SelectOption::Text(text) => n
                    .items
                    .iter()
                    .position(|item| item == text)
                    .ok_or_else(|| AutomationError::Platform(format!("item '{text}' not found")))?,
            };
            let item = n.items.get(index).cloned().ok_or_else(|| {
                AutomationError::Platform(format!("item index {index} out of range ({} items)", n.items.len()))
            })?;
            n.selected = Some(index);
            n.text = item;
            Ok(())
        })
    }

    fn item_count(&self) -> Result<usize, AutomationError> {
        self.read(|n| n.items.len())
    }

    fn descendants(&self, control_type: Option<&str>) -> Result<Vec<Box<dyn UiElement>>, AutomationError> {
        let ids = {
            let state = self.desktop.lock();
            state.live(self.id)?;
            let mut ids = Vec::new();
            state.descendants(self.id, &mut ids);
            ids.retain(|id| {
                control_type.map_or(true, |ct| {
                    state.nodes.get(id).is_some_and(|n| n.props.control_type == ct)
                })
            });
            ids
        };
        Ok(ids
            .into_iter()
            .map(|id| Box::new(self.desktop.element(id)) as Box<dyn UiElement>)
            .collect())
    }

    fn child(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        let criteria = Criteria::new(locator)?;
        let matches: Vec<NodeId> = {
            let mut state = self.desktop.lock();
            state.live(self.id)?;
            state.calls.push(format!("child:{}", self.id));
            let mut ids = Vec::new();
            state.descendants(self.id, &mut ids);
            ids.into_iter()
                .filter(|id| state.nodes.get(id).is_some_and(|n| criteria.matches(&n.props)))
                .collect()
        };
        let index = locator.found_index.unwrap_or(0);
        matches
            .get(index)
            .map(|id| Box::new(self.desktop.element(*id)) as Box<dyn UiElement>)
            .ok_or_else(|| AutomationError::NoMatch(format!("no descendant matches {locator}")))
    }

    fn clone_box(&self) -> Box<dyn UiElement> {
        Box::new(self.clone())
    }
}

/// [`Session`] over a [`MemoryDesktop`].
#[derive(Debug)]
pub struct MemorySession {
    desktop: MemoryDesktop,
    pid: Mutex<Option<u32>>,
}

impl MemorySession {
    pub fn new(desktop: MemoryDesktop) -> Self {
        Self {
            desktop,
            pid: Mutex::new(None),
        }
    }

    pub fn desktop(&self) -> &MemoryDesktop {
        &self.desktop
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    fn close_all(&self) {
        let mut state = self.desktop.lock();
        let roots = state.roots.clone();
        for id in roots {
            state.remove(id);
        }
    }
}

impl Session for MemorySession {
    fn start(&self, path: &str, wait_for_idle: bool) -> Result<u32, AutomationError> {
        debug!(path, wait_for_idle, "starting in-memory application");
        let windows = {
            let mut state = self.desktop.lock();
            state.calls.push(format!("start:{path}"));
            state.launches.get(path).cloned().unwrap_or_default()
        };
        for window in windows {
            self.desktop.add_window(window);
        }
        self.set_pid(Some(DEFAULT_PID));
        Ok(DEFAULT_PID)
    }

    fn connect(&self, params: &ConnectParams) -> Result<(), AutomationError> {
        self.desktop.record(format!("connect:{}", params.process.unwrap_or(DEFAULT_PID)));
        if params.title.is_some() || params.title_re.is_some() {
            let locator = Locator {
                title: params.title.clone(),
                title_re: params.title_re.clone(),
                ..Default::default()
            };
            self.desktop.find_window(&locator)?;
        }
        self.set_pid(Some(params.process.unwrap_or(DEFAULT_PID)));
        Ok(())
    }

    fn has_application(&self) -> bool {
        self.pid.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn desktop_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        self.desktop.find_window(locator)
    }

    fn app_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        if !self.has_application() {
            return Err(AutomationError::Platform("no application attached".to_string()));
        }
        self.desktop.record("app_window".to_string());
        self.desktop.find_window(locator)
    }

    fn close_main_windows(&self, timeout: Duration) -> Result<(), AutomationError> {
        debug!(?timeout, "closing in-memory windows");
        self.desktop.record("close_main_windows".to_string());
        self.close_all();
        Ok(())
    }

    fn kill(&self) -> Result<(), AutomationError> {
        self.desktop.record("kill".to_string());
        self.close_all();
        self.set_pid(None);
        Ok(())
    }

    fn send_keys(&self, keys: &str) -> Result<(), AutomationError> {
        self.desktop.record(format!("send_keys:{keys}"));
        Ok(())
    }
}
