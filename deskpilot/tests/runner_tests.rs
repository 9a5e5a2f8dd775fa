mod common;

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use deskpilot::platforms::memory::{MemoryDesktop, MemorySession};
use deskpilot::platforms::ConnectParams;
use deskpilot::{
    ActionContext, AutomationError, Locator, Report, RunOptions, RunStatus, Runner, ScenarioSchema, Session,
    StepStatus, TimeConfig, TimingOverride, UiElement,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// Where [`PanickingSession`] blows up.
#[derive(Clone, Copy, PartialEq)]
enum PanicAt {
    SendKeys,
    Teardown,
    Start,
}

/// Memory session that panics at one chosen entry point.
struct PanickingSession {
    inner: MemorySession,
    at: PanicAt,
}

impl Session for PanickingSession {
    fn start(&self, path: &str, wait_for_idle: bool) -> Result<u32, AutomationError> {
        if self.at == PanicAt::Start {
            panic!("launcher crashed");
        }
        self.inner.start(path, wait_for_idle)
    }

    fn connect(&self, params: &ConnectParams) -> Result<(), AutomationError> {
        self.inner.connect(params)
    }

    fn has_application(&self) -> bool {
        self.inner.has_application()
    }

    fn desktop_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        self.inner.desktop_window(locator)
    }

    fn app_window(&self, locator: &Locator) -> Result<Box<dyn UiElement>, AutomationError> {
        self.inner.app_window(locator)
    }

    fn close_main_windows(&self, timeout: Duration) -> Result<(), AutomationError> {
        if self.at == PanicAt::Teardown {
            panic!("window manager crashed");
        }
        self.inner.close_main_windows(timeout)
    }

    fn kill(&self) -> Result<(), AutomationError> {
        self.inner.kill()
    }

    fn send_keys(&self, keys: &str) -> Result<(), AutomationError> {
        if self.at == PanicAt::SendKeys {
            panic!("keyboard hook crashed");
        }
        self.inner.send_keys(keys)
    }
}

fn run_with_panic(at: PanicAt, options: RunOptions, report_path: &Path) -> Report {
    let desktop = login_desktop();
    desktop.on_launch("demo.exe", vec![login_window()]);
    let session = Arc::new(PanickingSession {
        inner: MemorySession::new(desktop),
        at,
    });
    let runner = Runner::new(object_map(), session).unwrap();
    let text = "steps:\n  - hotkey:\n      keys: \"^a\"\n  - click:\n      element: login_button\n";
    runner.run_str(
        "panic.yaml",
        text,
        &RunOptions {
            report_path: Some(report_path.to_path_buf()),
            ..options
        },
    )
}

const LOGIN_SCENARIO: &str = r#"
name: login
vars:
  USER: carol
  PIN: 1234
  T: 2
steps:
  - type:
      element: username
      text: "${USER}"
  - type:
      element: password
      text: "${PIN}"
  - set_checkbox:
      element: remember
      checked: true
  - wait:
      element: status
      state: visible
      timeout: "${T}"
  - click:
      element: login_button
  - assert_text_equals:
      element: username
      expected: bob
"#;

fn quick_failure_options() -> RunOptions {
    RunOptions {
        overrides: ["resolve_element=0.2,0.02", "child_window_quick=0.05,0.02", "resolve_window=0.2,0.02"]
            .iter()
            .map(|raw| TimingOverride::from_str(raw).unwrap())
            .collect(),
        ..Default::default()
    }
}

#[test]
fn test_passing_scenario_writes_report() {
    let desktop = login_desktop();
    let dir = TempDir::new().unwrap();
    let scenario_path = dir.path().join("login.yaml");
    fs::write(&scenario_path, LOGIN_SCENARIO).unwrap();
    let report_path = dir.path().join("reports").join("nested").join("run.json");

    let mut variables = Map::new();
    variables.insert("USER".into(), json!("bob"));
    let options = RunOptions {
        variables,
        report_path: Some(report_path.clone()),
        ..Default::default()
    };
    let report = runner(&desktop).run(&scenario_path, &options);

    assert!(report.passed(), "{:?}", report.errors);
    assert_eq!(report.scenario, "login.yaml");
    assert_eq!(report.steps.len(), 6);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Passed));
    assert!(report.errors.is_empty());
    // whole-token substitution keeps the number; the text argument takes it as "1234"
    assert_eq!(report.steps[1].args["text"], json!(1234));
    assert_eq!(report.steps[3].args["timeout"], json!(2));
    assert_eq!(desktop.text_of(USERNAME).as_deref(), Some("bob"));
    assert_eq!(desktop.text_of(PASSWORD).as_deref(), Some("1234"));
    assert_eq!(desktop.checked_of(REMEMBER), Some(true));
    assert_eq!(desktop.count_calls("close_main_windows"), 1);

    let written: Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(written["status"], "passed");
    assert_eq!(written["scenario"], "login.yaml");
    assert_eq!(written["steps"][0]["keyword"], "type");
    assert!(written["steps"][0].get("error").is_none());
    assert_eq!(Report::from_path(&report_path).unwrap(), report);
}

#[test]
fn test_unknown_keyword_fails_its_step() {
    let desktop = login_desktop();
    let text = r#"
steps:
  - click:
      element: login_button
  - launch_rocket:
      target: moon
  - click:
      element: login_button
"#;
    let report = runner(&desktop).run_str("rocket.yaml", text, &RunOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Passed);
    let failed = &report.steps[1];
    assert_eq!(failed.index, 2);
    assert_eq!(failed.keyword, "launch_rocket");
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("Unknown keyword: launch_rocket"));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("Config:"), "{}", report.errors[0]);
    assert_eq!(desktop.count_calls(&format!("click:{LOGIN_BUTTON}")), 1);
}

#[test]
fn test_schema_violation_runs_no_steps() {
    let desktop = login_desktop();
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("report.json");
    let options = RunOptions {
        report_path: Some(report_path.clone()),
        ..Default::default()
    };
    let text = "name: broken\nsteps:\n  - click:\n      element: login_button\nretries: 3\n";
    let report = runner(&desktop).run_str("broken.yaml", text, &options);

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.steps.is_empty());
    assert!(report.errors[0].contains("Scenario schema validation failed"), "{}", report.errors[0]);
    assert_eq!(desktop.count_calls("click:"), 0);
    assert!(report_path.exists());
}

#[test]
fn test_missing_scenario_file_is_reported() {
    let desktop = login_desktop();
    let dir = TempDir::new().unwrap();
    let report = runner(&desktop).run(&dir.path().join("nope.yaml"), &RunOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.scenario, "nope.yaml");
    assert!(report.steps.is_empty());
    assert!(report.errors[0].contains("Cannot read scenario"), "{}", report.errors[0]);
}

#[test]
fn test_failed_step_records_action_trace() {
    let desktop = login_desktop();
    let text = r#"
steps:
  - click:
      element: missing
"#;
    let report = runner(&desktop).run_str("trace.yaml", text, &quick_failure_options());

    assert_eq!(report.status, RunStatus::Failed);
    let step = &report.steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    let error = step.error.as_deref().unwrap();
    assert!(error.starts_with("Action:"), "{error}");
    assert!(error.contains("missing"), "{error}");
    let trace = step.action_trace.as_deref().unwrap();
    assert!(trace.contains("step 1: click"), "{trace}");
}

#[test]
fn test_app_path_is_started_before_the_first_step() {
    init_tracing();
    let desktop = MemoryDesktop::new();
    desktop.on_launch("demo.exe", vec![login_window()]);
    let text = r#"
steps:
  - click:
      element: login_button
"#;
    let options = RunOptions {
        app_path: Some("demo.exe".to_string()),
        ..Default::default()
    };
    let report = runner(&desktop).run_str("app.yaml", text, &options);

    assert!(report.passed(), "{:?}", report.errors);
    let calls = desktop.calls();
    assert_eq!(calls.first().map(String::as_str), Some("start:demo.exe"));
    assert!(calls.iter().any(|c| c == "app_window"));
    assert_eq!(desktop.count_calls(&format!("click:{LOGIN_BUTTON}")), 1);
}

#[test]
fn test_run_leaves_no_timing_or_context_behind() {
    let desktop = login_desktop();
    let text = "steps:\n  - click:\n      element: missing\n";
    let before = TimeConfig::override_depth();
    runner(&desktop).run_str("cleanup.yaml", text, &quick_failure_options());

    assert_eq!(TimeConfig::override_depth(), before);
    assert_eq!(ActionContext::depth(), 0);
}

#[test]
fn test_custom_schema_is_enforced() {
    let desktop = login_desktop();
    let schema = ScenarioSchema::compile(&json!({
        "type": "object",
        "required": ["name", "steps"]
    }))
    .unwrap();
    let text = "steps:\n  - click:\n      element: login_button\n";
    let report = runner(&desktop)
        .with_schema(schema)
        .run_str("unnamed.yaml", text, &RunOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.steps.is_empty());
    assert!(report.errors[0].contains("name"), "{}", report.errors[0]);
}

#[test]
fn test_panic_in_step_fails_the_step() {
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("step.json");
    let report = run_with_panic(PanicAt::SendKeys, RunOptions::default(), &report_path);

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    let error = report.steps[0].error.as_deref().unwrap();
    assert!(error.starts_with("Internal:") && error.contains("keyboard hook crashed"), "{error}");

    let written = Report::from_path(&report_path).unwrap();
    assert_eq!(written.status, RunStatus::Failed);
    assert_eq!(written.steps.len(), 1);
}

#[test]
fn test_panic_in_teardown_still_writes_report() {
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("teardown.json");
    let report = run_with_panic(PanicAt::Teardown, RunOptions::default(), &report_path);

    // both steps passed; only teardown went wrong
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Passed));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("Internal: panic during teardown"), "{}", report.errors[0]);
    assert!(report.errors[0].contains("window manager crashed"));

    let written: Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(written["status"], "failed");
    assert_eq!(TimeConfig::override_depth(), 0);
    assert_eq!(ActionContext::depth(), 0);
}

#[test]
fn test_panic_outside_any_step_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let report_path = dir.path().join("run.json");
    let options = RunOptions {
        app_path: Some("demo.exe".to_string()),
        ..Default::default()
    };
    let report = run_with_panic(PanicAt::Start, options, &report_path);

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.steps.is_empty());
    assert!(report.errors[0].contains("launcher crashed"), "{}", report.errors[0]);

    let written = Report::from_path(&report_path).unwrap();
    assert_eq!(written.status, RunStatus::Failed);
    assert_eq!(written, report);
}

#[test]
fn test_mistyped_override_key_fails_before_clicking() {
    let desktop = login_desktop();
    let text = r#"
steps:
  - click:
      element: login_button
      overrides:
        nam: Login
"#;
    let report = runner(&desktop).run_str("typo.yaml", text, &RunOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.steps[0].error.as_deref().unwrap();
    assert!(error.starts_with("Config:"), "{error}");
    assert!(error.contains("Unknown locator key 'nam'"), "{error}");
    assert_eq!(desktop.count_calls("click:"), 0);
}
