//! Resilient desktop UI test automation
//!
//! Semantic element names from an object map are resolved into live handles
//! through ordered locator candidates. Elements heal themselves when their
//! handle goes stale, every wait is bounded by a named timing category, and
//! scenarios of keyword steps run to a JSON report.

pub mod actions;
pub mod context;
pub mod element;
pub mod errors;
pub mod object_map;
pub mod platforms;
pub mod resolver;
pub mod runner;
pub mod scenario;
pub mod timings;
pub mod waits;

pub use actions::Actions;
pub use context::{ActionContext, ActionScope};
pub use element::{ElementAction, ResilientElement};
pub use errors::{AutomationError, ErrorKind};
pub use object_map::{AppDefaults, Locator, ObjectMap};
pub use platforms::{create_session, Session, UiElement, WaitState};
pub use resolver::{ElementMeta, ResolvedHandle, Resolver};
pub use runner::{Report, RunOptions, RunStatus, Runner, StepRecord, StepStatus};
pub use scenario::{Command, Keyword, Scenario, ScenarioSchema};
pub use timings::{Operation, OverrideGuard, Preset, TimeConfig, TimeoutSettings, TimingOverride};
pub use waits::{Retry, Wait};
