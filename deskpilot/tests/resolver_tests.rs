mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use deskpilot::errors::AttemptTarget;
use deskpilot::platforms::memory::{MemoryDesktop, MemoryNode};
use deskpilot::platforms::{ArtifactCollector, UiElement};
use deskpilot::resolver::Strategy;
use deskpilot::{Actions, AutomationError, ErrorKind, Locator, ObjectMap, Resolver};

/// Records which elements asked for artifacts and hands back a fake screenshot path.
#[derive(Default)]
struct RecordingArtifacts {
    labels: Mutex<Vec<String>>,
}

impl ArtifactCollector for RecordingArtifacts {
    fn collect(&self, label: &str, window: Option<&dyn UiElement>, dir: &Path) -> BTreeMap<String, PathBuf> {
        self.labels.lock().unwrap().push(label.to_string());
        let mut artifacts = BTreeMap::new();
        if window.is_some() {
            artifacts.insert("screenshot".to_string(), dir.join(format!("{label}.png")));
        }
        artifacts
    }
}

#[test]
fn test_override_locator_is_tried_first() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let overrides = Locator {
        auto_id: Some("password".into()),
        ..Default::default()
    };
    let resolved = resolver.resolve("username", Some(&overrides), None).unwrap();
    assert_eq!(resolved.element.runtime_id().unwrap(), format!("mem-{PASSWORD}"));
    assert_eq!(resolved.meta.locator, overrides);
    assert_eq!(resolved.meta.strategy, Strategy::ScopedChild);
}

#[test]
fn test_failing_override_falls_back_to_configured_locators() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let _quick = quick_timings();
    let overrides = Locator {
        auto_id: Some("ghost".into()),
        ..Default::default()
    };
    let resolved = resolver.resolve("username", Some(&overrides), None).unwrap();
    assert_eq!(resolved.element.runtime_id().unwrap(), format!("mem-{USERNAME}"));
    assert_eq!(resolved.meta.locator.auto_id.as_deref(), Some("user"));
}

#[test]
fn test_name_locator_never_consults_fallback() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    Actions::new(&resolver).click("login_button", None).unwrap();

    assert_eq!(desktop.count_calls(&format!("click:{LOGIN_BUTTON}")), 1);
    // the control_type fallback would have used a scoped child lookup
    assert_eq!(desktop.count_calls("child:"), 0);

    let meta = resolver.resolve("login_button", None, None).unwrap().meta;
    assert!(meta.found_via_name);
    assert_eq!(meta.strategy, Strategy::NameMatch);
    assert_eq!(meta.candidate_index, 0);
}

#[test]
fn test_window_not_found_lists_attempts() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    match resolver.resolve_window("home", Some(Duration::from_millis(50))) {
        Err(AutomationError::WindowNotFound(failure)) => {
            assert_eq!(failure.name, "home");
            assert_eq!(failure.attempts.len(), 1);
            assert_eq!(failure.attempts[0].target, AttemptTarget::Window);
            assert_eq!(failure.attempts[0].locator.title_re.as_deref(), Some("^Home"));
            assert!(failure.to_string().contains("Attempts:"));
        }
        other => panic!("expected WindowNotFound, got {other:?}"),
    }
}

#[test]
fn test_element_not_found_records_every_candidate_in_order() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let _quick = quick_timings();
    match resolver.resolve("missing", None, None) {
        Err(AutomationError::ElementNotFound(failure)) => {
            assert_eq!(failure.window.as_deref(), Some("login"));
            assert_eq!(failure.attempts.len(), 2);
            assert_eq!(failure.attempts[0].locator.auto_id.as_deref(), Some("nope"));
            assert_eq!(failure.attempts[1].locator.name.as_deref(), Some("Nope"));
            assert!(failure.last_error.is_some());
        }
        other => panic!("expected ElementNotFound, got {other:?}"),
    }
}

#[test]
fn test_exists_never_fails() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let _quick = quick_timings();
    assert!(resolver.exists("username", None, None));
    assert!(!resolver.exists("missing", Some(Duration::from_millis(50)), None));
    assert!(!resolver.exists("not_in_map", Some(Duration::from_millis(50)), None));
}

#[test]
fn test_wait_for_any_returns_first_present() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let _quick = quick_timings();

    let later = desktop.clone();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        later.add_window(home_window());
    });
    let names = vec!["missing".to_string(), "welcome".to_string()];
    let index = resolver
        .wait_for_any(&names, Some(Duration::from_secs(3)), None)
        .unwrap();
    opener.join().unwrap();
    assert_eq!(index, 1);
}

#[test]
fn test_cache_drops_entries_when_window_is_recreated() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let first = resolver.resolve("username", None, None).unwrap();
    assert_eq!(first.element.runtime_id().unwrap(), format!("mem-{USERNAME}"));

    desktop.remove(WINDOW);
    // ids continue after the original six nodes: window 7, username 8
    desktop.add_window(login_window());
    let again = resolver.resolve("username", None, None).unwrap();
    assert_eq!(again.element.runtime_id().unwrap(), "mem-8");
}

#[test]
fn test_only_visible_named_button_is_picked() {
    init_tracing();
    let desktop = MemoryDesktop::new();
    // window 1, pane 2, buttons 3..=5
    desktop.add_window(
        MemoryNode::window("Login").child(
            MemoryNode::new("Pane")
                .child(MemoryNode::new("Button").name("Login").hidden())
                .child(MemoryNode::new("Button").name("Login"))
                .child(MemoryNode::new("Button").name("Cancel")),
        ),
    );
    let resolver = resolver(&desktop);
    let resolved = resolver.resolve("login_button", None, None).unwrap();

    assert_eq!(resolved.element.runtime_id().unwrap(), "mem-4");
    assert_eq!(resolved.meta.strategy, Strategy::NameMatch);
    assert_eq!(resolved.meta.locator.name.as_deref(), Some("Login"));
    assert_eq!(desktop.count_calls("child:"), 0);
}

#[test]
fn test_index_out_of_range_collects_artifacts() {
    let desktop = login_desktop();
    let map = ObjectMap::from_yaml_str(
        r#"
app:
  artifacts_dir: shots
windows:
  login:
    locators:
      - title: Login
elements:
  second_login:
    window: login
    locators:
      - name: Login
        found_index: 3
"#,
    )
    .unwrap();
    let artifacts = Arc::new(RecordingArtifacts::default());
    let resolver = Resolver::new(session(&desktop), Arc::new(map)).with_artifacts(artifacts.clone());

    let err = resolver.resolve("second_login", None, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IndexOutOfRange);
    match &err {
        AutomationError::IndexOutOfRange(oor) => {
            assert_eq!(oor.match_count, 1);
            assert_eq!(oor.artifacts["screenshot"], Path::new("shots").join("second_login.png"));
        }
        other => panic!("expected IndexOutOfRange, got {other:?}"),
    }
    assert!(err.to_string().contains("Artifacts:"), "{err}");
    assert_eq!(*artifacts.labels.lock().unwrap(), vec!["second_login".to_string()]);
}

#[test]
fn test_override_without_criteria_is_rejected() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let err = resolver
        .resolve("login_button", Some(&Locator::default()), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("no match criteria"), "{err}");
}
