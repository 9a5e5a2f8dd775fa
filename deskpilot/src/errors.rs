use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::object_map::Locator;

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Window not found: {0}")]
    WindowNotFound(Box<ResolutionFailure>),

    #[error("Element not found: {0}")]
    ElementNotFound(Box<ResolutionFailure>),

    #[error("No match: {0}")]
    NoMatch(String),

    #[error("Index out of range: {0}")]
    IndexOutOfRange(Box<IndexOutOfRange>),

    #[error("Element '{element}' is not visible: {message}")]
    ElementNotVisible { element: String, message: String },

    #[error("Element '{element}' is not enabled: {message}")]
    ElementNotEnabled { element: String, message: String },

    #[error("Element '{element}' is stale: {message}")]
    StaleElement { element: String, message: String },

    #[error(transparent)]
    Action(Box<ActionFailure>),

    #[error(transparent)]
    Timeout(Box<TimeoutError>),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Platform-specific error: {0}")]
    Platform(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fieldless tag for [`AutomationError`] variants, used to select which
/// failures a retry loop may swallow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    WindowNotFound,
    ElementNotFound,
    NoMatch,
    IndexOutOfRange,
    ElementNotVisible,
    ElementNotEnabled,
    StaleElement,
    Action,
    Timeout,
    Assertion,
    Platform,
    UnsupportedOperation,
    UnsupportedPlatform,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    /// Every kind. Passing this to a retry primitive retries on any failure.
    pub const ANY: &'static [ErrorKind] = &[
        ErrorKind::Config,
        ErrorKind::WindowNotFound,
        ErrorKind::ElementNotFound,
        ErrorKind::NoMatch,
        ErrorKind::IndexOutOfRange,
        ErrorKind::ElementNotVisible,
        ErrorKind::ElementNotEnabled,
        ErrorKind::StaleElement,
        ErrorKind::Action,
        ErrorKind::Timeout,
        ErrorKind::Assertion,
        ErrorKind::Platform,
        ErrorKind::UnsupportedOperation,
        ErrorKind::UnsupportedPlatform,
        ErrorKind::InvalidArgument,
        ErrorKind::Internal,
    ];

    /// Failures a live UI produces while it is still settling.
    pub const TRANSIENT: &'static [ErrorKind] = &[
        ErrorKind::WindowNotFound,
        ErrorKind::ElementNotFound,
        ErrorKind::NoMatch,
        ErrorKind::ElementNotVisible,
        ErrorKind::ElementNotEnabled,
        ErrorKind::StaleElement,
        ErrorKind::Timeout,
        ErrorKind::Platform,
    ];
}

impl AutomationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutomationError::Config(_) => ErrorKind::Config,
            AutomationError::WindowNotFound(_) => ErrorKind::WindowNotFound,
            AutomationError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            AutomationError::NoMatch(_) => ErrorKind::NoMatch,
            AutomationError::IndexOutOfRange(_) => ErrorKind::IndexOutOfRange,
            AutomationError::ElementNotVisible { .. } => ErrorKind::ElementNotVisible,
            AutomationError::ElementNotEnabled { .. } => ErrorKind::ElementNotEnabled,
            AutomationError::StaleElement { .. } => ErrorKind::StaleElement,
            AutomationError::Action(_) => ErrorKind::Action,
            AutomationError::Timeout(_) => ErrorKind::Timeout,
            AutomationError::Assertion(_) => ErrorKind::Assertion,
            AutomationError::Platform(_) => ErrorKind::Platform,
            AutomationError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            AutomationError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            AutomationError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AutomationError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        ErrorKind::TRANSIENT.contains(&self.kind())
    }

    /// Wraps `cause` into an [`AutomationError::Action`] unless it already is one.
    pub fn action(action: &str, element: Option<&str>, cause: AutomationError) -> Self {
        if let AutomationError::Action(_) = cause {
            return cause;
        }
        AutomationError::Action(Box::new(ActionFailure::new(action, element).with_cause(cause)))
    }

    /// Walks nested timeout and action causes down to the innermost error.
    pub fn root_cause(&self) -> &AutomationError {
        let mut current = self;
        loop {
            let next = match current {
                AutomationError::Timeout(t) => t.last_error.as_deref(),
                AutomationError::Action(a) => a.cause.as_deref(),
                _ => None,
            };
            match next {
                Some(inner) => current = inner,
                None => return current,
            }
        }
    }

    /// The innermost recorded action trace carried by this error, if any.
    pub fn action_trace(&self) -> Option<&str> {
        let mut current = self;
        let mut found = None;
        loop {
            match current {
                AutomationError::Action(a) => {
                    if a.trace.is_some() {
                        found = a.trace.as_deref();
                    }
                    match a.cause.as_deref() {
                        Some(inner) => current = inner,
                        None => return found,
                    }
                }
                AutomationError::Timeout(t) => match t.last_error.as_deref() {
                    Some(inner) => current = inner,
                    None => return found,
                },
                _ => return found,
            }
        }
    }
}

/// Phase of work a timeout was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolve,
    Precondition,
    Execute,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Resolve => "resolve",
            Stage::Precondition => "precondition",
            Stage::Execute => "execute",
            Stage::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptTarget {
    Window,
    Element,
}

impl fmt::Display for AttemptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptTarget::Window => f.write_str("window"),
            AttemptTarget::Element => f.write_str("element"),
        }
    }
}

/// One locator that was tried during resolution and why it failed.
#[derive(Debug, Clone, Serialize)]
pub struct LocatorAttempt {
    pub target: AttemptTarget,
    pub locator: Locator,
    pub error: String,
}

impl fmt::Display for LocatorAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} err={}", self.target, self.locator, self.error)
    }
}

fn write_attempts(f: &mut fmt::Formatter<'_>, attempts: &[LocatorAttempt]) -> fmt::Result {
    if attempts.is_empty() {
        return Ok(());
    }
    write!(f, "\nAttempts:")?;
    for (i, attempt) in attempts.iter().enumerate() {
        write!(f, "\n  {}. {}", i + 1, attempt)?;
    }
    Ok(())
}

/// Exhausted window or element resolution.
#[derive(Debug, Clone)]
pub struct ResolutionFailure {
    pub name: String,
    pub window: Option<String>,
    pub attempts: Vec<LocatorAttempt>,
    pub timeout: Duration,
    pub last_error: Option<String>,
    pub artifacts: BTreeMap<String, PathBuf>,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.name)?;
        if let Some(window) = &self.window {
            write!(f, " in window '{window}'")?;
        }
        write!(
            f,
            " after {} attempt(s) (timeout {:.1}s)",
            self.attempts.len(),
            self.timeout.as_secs_f64()
        )?;
        write_attempts(f, &self.attempts)?;
        if let Some(last) = &self.last_error {
            write!(f, "\nLast error: {last}")?;
        }
        write_artifacts(f, &self.artifacts)
    }
}

fn write_artifacts(f: &mut fmt::Formatter<'_>, artifacts: &BTreeMap<String, PathBuf>) -> fmt::Result {
    if !artifacts.is_empty() {
        write!(f, "\nArtifacts:")?;
        for (label, path) in artifacts {
            write!(f, "\n  {label}: {}", path.display())?;
        }
    }
    Ok(())
}

/// An explicit `found_index` that does not fit the match count.
#[derive(Debug, Clone)]
pub struct IndexOutOfRange {
    pub element: String,
    pub window: String,
    pub index: usize,
    pub match_count: usize,
    pub attempts: Vec<LocatorAttempt>,
    pub artifacts: BTreeMap<String, PathBuf>,
}

impl fmt::Display for IndexOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found_index {} for '{}' in window '{}' but only {} match(es)",
            self.index, self.element, self.window, self.match_count
        )?;
        write_attempts(f, &self.attempts)?;
        write_artifacts(f, &self.artifacts)
    }
}

/// Last-error summary of one `wait_for_any` candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateOutcome {
    pub description: String,
    pub last_error: Option<String>,
}

/// Budget exhaustion of a wait or retry primitive.
#[derive(Debug)]
pub struct TimeoutError {
    pub description: String,
    pub timeout: Duration,
    pub attempts: u32,
    pub elapsed: Duration,
    pub stage: Option<Stage>,
    /// True when the budget was a number of attempts rather than wall time.
    pub attempt_bounded: bool,
    pub last_error: Option<Box<AutomationError>>,
    pub candidates: Vec<CandidateOutcome>,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempt_bounded {
            write!(
                f,
                "Failed {} after {} attempts",
                self.description, self.attempts
            )?;
        } else if !self.candidates.is_empty() {
            let names: Vec<&str> = self
                .candidates
                .iter()
                .map(|c| c.description.as_str())
                .collect();
            write!(
                f,
                "Timed out waiting for any of [{}] after {:.1}s",
                names.join(", "),
                self.timeout.as_secs_f64()
            )?;
            for c in &self.candidates {
                if let Some(err) = &c.last_error {
                    write!(f, "\n  {}: {}", c.description, err)?;
                }
            }
        } else {
            write!(
                f,
                "Timed out waiting for {} after {:.1}s",
                self.description,
                self.timeout.as_secs_f64()
            )?;
        }

        match &self.last_error {
            Some(err) => write!(f, ". Last error: {err}")?,
            None if self.candidates.is_empty() => {
                write!(f, " (condition kept returning falsy)")?
            }
            None => {}
        }

        write!(
            f,
            " [Attempts: {}, Elapsed: {:.2}s",
            self.attempts,
            self.elapsed.as_secs_f64()
        )?;
        if let Some(stage) = self.stage {
            write!(f, ", Stage: {stage}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for TimeoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// A failed high-level action, with the element it targeted and its cause.
#[derive(Debug)]
pub struct ActionFailure {
    pub action: String,
    pub element: Option<String>,
    pub details: Option<String>,
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Action trace captured while the failing action was still on the stack.
    pub trace: Option<String>,
    pub cause: Option<Box<AutomationError>>,
}

impl ActionFailure {
    pub fn new(action: &str, element: Option<&str>) -> Self {
        Self {
            action: action.to_string(),
            element: element.map(str::to_string),
            details: None,
            artifacts: BTreeMap::new(),
            trace: crate::context::ActionContext::format_trace(),
            cause: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_cause(mut self, cause: AutomationError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action '{}' failed", self.action)?;
        if let Some(element) = &self.element {
            write!(f, " on '{element}'")?;
        }
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ActionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
