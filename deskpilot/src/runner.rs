//! Runs a scenario document end to end and produces its report.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::actions::Actions;
use crate::context::ActionContext;
use crate::errors::AutomationError;
use crate::object_map::ObjectMap;
use crate::platforms::{ArtifactCollector, NoArtifacts, Session};
use crate::resolver::Resolver;
use crate::scenario::{Command, Scenario, ScenarioSchema, Step};
use crate::timings::{Operation, Preset, TimeConfig, TimingOverride};

/// Outcome of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Loaded,
    Validating,
    Running,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the scenario.
    pub index: usize,
    pub keyword: String,
    pub args: Value,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_trace: Option<String>,
    pub duration_sec: f64,
}

/// What a run produced. Written as JSON when a report path is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    /// File name of the scenario.
    pub scenario: String,
    /// RFC 3339 start time.
    pub started_at: String,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub errors: Vec<String>,
    pub duration_sec: f64,
}

impl Report {
    fn new(scenario: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            scenario: scenario.to_string(),
            started_at: Utc::now().to_rfc3339(),
            status: RunStatus::Failed,
            steps: Vec::new(),
            errors: Vec::new(),
            duration_sec: 0.0,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), AutomationError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AutomationError::Internal(format!("cannot create report directory '{}': {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AutomationError::Internal(format!("cannot serialize report: {e}")))?;
        fs::write(path, json)
            .map_err(|e| AutomationError::Internal(format!("cannot write report '{}': {e}", path.display())))
    }

    pub fn from_path(path: &Path) -> Result<Self, AutomationError> {
        let text = fs::read_to_string(path)
            .map_err(|e| AutomationError::Config(format!("cannot read report '{}': {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| AutomationError::Config(format!("invalid report '{}': {e}", path.display())))
    }
}

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Override the scenario's own `vars`.
    pub variables: Map<String, Value>,
    pub report_path: Option<PathBuf>,
    /// Application started before the first step.
    pub app_path: Option<String>,
    pub preset: Preset,
    pub overrides: Vec<TimingOverride>,
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

fn describe(err: &AutomationError) -> String {
    format!("{:?}: {err}", err.kind())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!(from = ?*state, to = ?next, "run state");
    *state = next;
}

pub struct Runner {
    map: Arc<ObjectMap>,
    session: Arc<dyn Session>,
    artifacts: Arc<dyn ArtifactCollector>,
    schema: ScenarioSchema,
}

impl Runner {
    pub fn new(map: Arc<ObjectMap>, session: Arc<dyn Session>) -> Result<Self, AutomationError> {
        Ok(Self {
            map,
            session,
            artifacts: Arc::new(NoArtifacts),
            schema: ScenarioSchema::builtin()?,
        })
    }

    pub fn with_schema(mut self, schema: ScenarioSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactCollector>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Runs the scenario at `path`. Never fails: every problem ends up in
    /// the returned report.
    pub fn run(&self, path: &Path, options: &RunOptions) -> Report {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.run_document(&name, Scenario::read_document(path), options)
    }

    /// Runs a scenario given as text, reported under `name`.
    pub fn run_str(&self, name: &str, text: &str, options: &RunOptions) -> Report {
        self.run_document(name, Scenario::parse_document(text), options)
    }

    fn run_document(&self, name: &str, document: Result<Value, AutomationError>, options: &RunOptions) -> Report {
        let started = Instant::now();
        let mut report = Report::new(name);
        let mut state = RunState::Loaded;
        info!(scenario = name, run_id = %report.run_id, preset = %options.preset, "run started");

        {
            let _timing = TimeConfig::scoped(TimeConfig::build(
                options.preset,
                Some(self.map.app().timing()),
                &options.overrides,
            ));

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.execute(document, options, &mut report, &mut state)
            }));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(describe(&err)),
                Err(payload) => Some(format!("Internal: panic: {}", panic_message(payload))),
            };
            match failure {
                None => transition(&mut state, RunState::Passed),
                Some(message) => {
                    error!(scenario = name, error = %message, "run failed");
                    report.errors.push(message);
                    transition(&mut state, RunState::Failed);
                }
            }

            ActionContext::clear();
            let close_timeout = TimeConfig::effective(Operation::WindowClose).timeout;
            match panic::catch_unwind(AssertUnwindSafe(|| self.session.close_main_windows(close_timeout))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "teardown could not close the application windows"),
                Err(payload) => {
                    let message = format!("Internal: panic during teardown: {}", panic_message(payload));
                    error!(scenario = name, error = %message, "teardown failed");
                    report.errors.push(message);
                    transition(&mut state, RunState::Failed);
                }
            }
        }

        report.status = if state == RunState::Passed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        report.duration_sec = round_ms(started.elapsed().as_secs_f64());
        info!(
            scenario = name,
            status = ?report.status,
            steps = report.steps.len(),
            duration_sec = report.duration_sec,
            "run finished"
        );

        if let Some(path) = &options.report_path {
            match report.write(path) {
                Ok(()) => info!(path = %path.display(), "report written"),
                Err(err) => error!(error = %err, "report could not be written"),
            }
        }
        report
    }

    fn execute(
        &self,
        document: Result<Value, AutomationError>,
        options: &RunOptions,
        report: &mut Report,
        state: &mut RunState,
    ) -> Result<(), AutomationError> {
        let document = document?;
        transition(state, RunState::Validating);
        self.schema.validate(&document)?;
        let mut scenario = Scenario::from_document(&document)?;
        let vars = scenario.merged_vars(&options.variables);
        scenario.resolve_vars(&vars)?;

        transition(state, RunState::Running);
        let resolver = Resolver::new(self.session.clone(), self.map.clone()).with_artifacts(self.artifacts.clone());
        let actions = Actions::new(&resolver);
        if let Some(app) = &options.app_path {
            actions.open_app(app, false)?;
        }

        for (offset, step) in scenario.steps.iter().enumerate() {
            let index = offset + 1;
            ActionContext::clear();
            let started = Instant::now();
            let result = {
                let _scope = ActionContext::enter(&format!("step {index}: {}", step.keyword), None, None);
                run_step(&actions, step, self.map.app().strict_locator_keys)
            };
            let duration_sec = round_ms(started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    debug!(index, keyword = %step.keyword, duration_sec, "step passed");
                    report.steps.push(StepRecord {
                        index,
                        keyword: step.keyword.clone(),
                        args: step.args.clone(),
                        status: StepStatus::Passed,
                        error: None,
                        action_trace: None,
                        duration_sec,
                    });
                }
                Err(err) => {
                    warn!(index, keyword = %step.keyword, error = %err, "step failed");
                    report.steps.push(StepRecord {
                        index,
                        keyword: step.keyword.clone(),
                        args: step.args.clone(),
                        status: StepStatus::Failed,
                        error: Some(describe(&err)),
                        action_trace: err.action_trace().map(str::to_string),
                        duration_sec,
                    });
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Parses and runs one step. A panic inside the step becomes an internal
/// error so the step is still recorded.
fn run_step(actions: &Actions<'_>, step: &Step, strict_keys: bool) -> Result<(), AutomationError> {
    let command = Command::parse_with(step, strict_keys)?;
    panic::catch_unwind(AssertUnwindSafe(|| dispatch(actions, &command)))
        .unwrap_or_else(|payload| Err(AutomationError::Internal(format!("panic: {}", panic_message(payload)))))
}

fn dispatch(actions: &Actions<'_>, command: &Command) -> Result<(), AutomationError> {
    let timeout = command.timeout()?;
    match command {
        Command::OpenApp(a) => actions.open_app(&a.path, a.wait_for_idle).map(|_| ()),
        Command::Connect(params) => actions.connect(params),
        Command::Click(a) => actions.click(&a.element, a.overrides.as_ref()),
        Command::DoubleClick(a) => actions.double_click(&a.element, a.overrides.as_ref()),
        Command::RightClick(a) => actions.right_click(&a.element, a.overrides.as_ref()),
        Command::Hover(a) => actions.hover(&a.element, a.overrides.as_ref()),
        Command::Hotkey(a) => actions.hotkey(&a.keys),
        Command::Type(a) => actions.type_text(&a.element, &a.text, a.clear, a.overrides.as_ref()),
        Command::ClickAndType(a) => actions.click_and_type(&a.element, &a.text, a.clear, a.overrides.as_ref()),
        Command::Wait(a) => actions.wait_for(&a.element, a.state, timeout, a.overrides.as_ref()),
        Command::WaitForGone(a) => actions.wait_for_gone(&a.element, timeout, a.overrides.as_ref()),
        Command::WaitForAny(a) => actions
            .wait_for_any(&a.elements, timeout, a.overrides.as_ref())
            .map(|_| ()),
        Command::Assert(a) => actions.assert_state(&a.element, a.state, a.overrides.as_ref()),
        Command::AssertTextEquals(a) => actions.assert_text_equals(&a.element, &a.expected, a.overrides.as_ref()),
        Command::AssertTextContains(a) => actions.assert_text_contains(&a.element, &a.substring, a.overrides.as_ref()),
        Command::SetCheckbox(a) => actions.set_checkbox(&a.element, a.checked, a.overrides.as_ref()),
        Command::AssertCheckboxState(a) => actions.assert_checkbox_state(&a.element, a.checked, a.overrides.as_ref()),
        Command::SelectCombobox(a) => {
            let option = a.select_option()?;
            actions.select_combobox(&a.element, &option, a.overrides.as_ref())
        }
        Command::SelectComboboxItem(a) => actions.select_combobox_item(&a.combobox, &a.item, a.overrides.as_ref()),
        Command::SelectListItem(a) => actions.select_list_item(
            &a.element,
            a.item_text.as_deref(),
            a.item_index,
            a.overrides.as_ref(),
        ),
        Command::AssertCount(a) => actions.assert_count(&a.element, a.expected, a.overrides.as_ref()),
        Command::CloseWindow(a) => actions.close_window(&a.window),
        Command::KillApp => actions.kill_app(),
        Command::ClickIfExists(a) => actions
            .click_if_exists(&a.element, timeout, a.overrides.as_ref())
            .map(|_| ()),
    }
}

/// Loads, schema-checks and type-checks a scenario without touching a
/// session. Returns the parsed commands in order. `strict_keys` applies to
/// override locators the way the object map applies it to its own.
pub fn check_scenario(
    path: &Path,
    schema: &ScenarioSchema,
    variables: &Map<String, Value>,
    strict_keys: bool,
) -> Result<Vec<Command>, AutomationError> {
    let document = Scenario::read_document(path)?;
    schema.validate(&document)?;
    let mut scenario = Scenario::from_document(&document)?;
    let vars = scenario.merged_vars(variables);
    scenario.resolve_vars(&vars)?;
    scenario
        .steps
        .iter()
        .enumerate()
        .map(|(offset, step)| {
            let command = Command::parse_with(step, strict_keys).map_err(|err| match err {
                AutomationError::Config(message) => AutomationError::Config(format!("step {}: {message}", offset + 1)),
                AutomationError::InvalidArgument(message) => {
                    AutomationError::InvalidArgument(format!("step {}: {message}", offset + 1))
                }
                other => other,
            })?;
            command.timeout()?;
            Ok(command)
        })
        .collect()
}
