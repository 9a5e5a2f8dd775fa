use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::span::EnteredSpan;
use tracing::info_span;

thread_local! {
    static STACK: RefCell<Vec<Rc<ActionContext>>> = const { RefCell::new(Vec::new()) };
}

/// One in-flight logical action. Contexts nest: the innermost action is the
/// top of the calling thread's stack and points at its parent.
#[derive(Debug)]
pub struct ActionContext {
    pub id: String,
    pub action: String,
    pub element: Option<String>,
    pub window: Option<String>,
    pub started_at: DateTime<Utc>,
    pub parent: Option<Rc<ActionContext>>,
    started: Instant,
    metadata: RefCell<Map<String, Value>>,
}

impl ActionContext {
    /// Pushes a new context and returns the guard that pops it.
    pub fn enter(action: &str, element: Option<&str>, window: Option<&str>) -> ActionScope {
        let parent = Self::current();
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let span = info_span!(
            "action",
            id = %id,
            action,
            element = element.unwrap_or(""),
            window = window.unwrap_or("")
        )
        .entered();

        let context = Rc::new(ActionContext {
            id,
            action: action.to_string(),
            element: element.map(str::to_string),
            window: window.map(str::to_string),
            started_at: Utc::now(),
            parent,
            started: Instant::now(),
            metadata: RefCell::new(Map::new()),
        });
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(context.clone());
            stack.len()
        });

        ActionScope {
            context,
            depth,
            _span: span,
        }
    }

    pub fn current() -> Option<Rc<ActionContext>> {
        STACK.with(|stack| stack.borrow().last().cloned())
    }

    pub fn depth() -> usize {
        STACK.with(|stack| stack.borrow().len())
    }

    /// Active contexts, innermost first.
    pub fn trace() -> Vec<Rc<ActionContext>> {
        STACK.with(|stack| stack.borrow().iter().rev().cloned().collect())
    }

    /// Human-readable trace of the active contexts, or `None` when the stack is empty.
    pub fn format_trace() -> Option<String> {
        let trace = Self::trace();
        if trace.is_empty() {
            return None;
        }
        let mut out = String::from("Action trace (most recent first):");
        for (i, ctx) in trace.iter().enumerate() {
            let marker = if i == 0 { "X" } else { "->" };
            out.push_str(&format!(
                "\n  {marker} {} [{:.2}s]",
                ctx.description(),
                ctx.elapsed().as_secs_f64()
            ));
        }
        Some(out)
    }

    pub fn current_description() -> Option<String> {
        Self::current().map(|ctx| ctx.description())
    }

    /// Drops every context of this thread. Guards still alive become no-ops.
    pub fn clear() {
        STACK.with(|stack| stack.borrow_mut().clear());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn description(&self) -> String {
        let mut out = self.action.clone();
        if let Some(element) = &self.element {
            out.push_str(&format!(" on '{element}'"));
        }
        if let Some(window) = &self.window {
            out.push_str(&format!(" in window '{window}'"));
        }
        out
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.metadata.borrow().clone()
    }

    pub fn set_metadata(&self, key: &str, value: impl Into<Value>) {
        self.metadata.borrow_mut().insert(key.to_string(), value.into());
    }
}

/// Keeps an [`ActionContext`] on the stack and its tracing span entered.
#[must_use = "the action context is popped as soon as the scope is dropped"]
pub struct ActionScope {
    context: Rc<ActionContext>,
    depth: usize,
    _span: EnteredSpan,
}

impl ActionScope {
    pub fn context(&self) -> &Rc<ActionContext> {
        &self.context
    }

    pub fn set_metadata(&self, key: &str, value: impl Into<Value>) {
        self.context.set_metadata(key, value);
    }
}

impl Drop for ActionScope {
    fn drop(&mut self) {
        let _ = STACK.try_with(|stack| {
            stack.borrow_mut().truncate(self.depth.saturating_sub(1));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_contexts_link_parents() {
        let outer = ActionContext::enter("step 1: click", None, None);
        let inner = ActionContext::enter("click", Some("login_button"), Some("main"));
        assert_eq!(ActionContext::depth(), 2);
        let parent = inner.context().parent.as_ref().unwrap();
        assert_eq!(parent.id, outer.context().id);
        assert_eq!(inner.context().id.len(), 8);
        drop(inner);
        assert_eq!(ActionContext::current().unwrap().id, outer.context().id);
        drop(outer);
        assert!(ActionContext::current().is_none());
    }

    #[test]
    fn test_format_trace_is_innermost_first() {
        let _outer = ActionContext::enter("step 2: type", None, None);
        let _inner = ActionContext::enter("set_text", Some("username"), Some("login"));
        let trace = ActionContext::format_trace().unwrap();
        let mut lines = trace.lines();
        assert_eq!(lines.next(), Some("Action trace (most recent first):"));
        assert!(lines.next().unwrap().starts_with("  X set_text on 'username' in window 'login' ["));
        assert!(lines.next().unwrap().starts_with("  -> step 2: type ["));
    }

    #[test]
    fn test_scope_pops_on_error_path() {
        fn failing() -> Result<(), String> {
            let _scope = ActionContext::enter("hover", Some("menu"), None);
            Err("boom".into())
        }
        assert!(failing().is_err());
        assert_eq!(ActionContext::depth(), 0);
    }

    #[test]
    fn test_clear_makes_live_guards_harmless() {
        let scope = ActionContext::enter("click", None, None);
        scope.set_metadata("attempt", 2);
        assert_eq!(scope.context().metadata()["attempt"], 2);
        ActionContext::clear();
        assert!(ActionContext::format_trace().is_none());
        drop(scope);
        assert_eq!(ActionContext::depth(), 0);
    }
}
