mod common;

use std::thread;
use std::time::Duration;

use common::*;
use deskpilot::platforms::memory::MemoryNode;
use deskpilot::platforms::ToggleState;
use deskpilot::{ErrorKind, WaitState};

#[test]
fn test_stale_handle_heals_before_acting() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let mut username = resolver.element("username", None).unwrap();

    desktop.remove(USERNAME);
    let replacement = desktop.add_child(WINDOW, MemoryNode::new("Edit").auto_id("user"));
    assert!(username.is_stale());

    username.set_text("alice", true).unwrap();
    assert!(!username.is_stale());
    assert_eq!(desktop.text_of(replacement).as_deref(), Some("alice"));
    assert_eq!(
        username.handle().runtime_id().unwrap(),
        format!("mem-{replacement}")
    );
}

#[test]
fn test_stale_without_replacement_is_reported() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let _quick = quick_timings();
    let mut username = resolver.element("username", None).unwrap();

    desktop.remove(USERNAME);
    let err = username.click().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleElement);
    assert_eq!(desktop.count_calls("click:"), 0);
}

#[test]
fn test_action_waits_for_visibility() {
    let desktop = login_desktop();
    desktop.set_visible(STATUS, false);
    let resolver = resolver(&desktop);
    let mut status = resolver.element("status", None).unwrap();

    let later = desktop.clone();
    let shower = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        later.set_visible(STATUS, true);
    });
    status.hover().unwrap();
    shower.join().unwrap();
    assert_eq!(desktop.count_calls(&format!("hover:{STATUS}")), 1);
}

#[test]
fn test_disabled_element_is_never_clicked() {
    let desktop = login_desktop();
    desktop.set_enabled(LOGIN_BUTTON, false);
    let resolver = resolver(&desktop);
    let _quick = quick_timings();
    let mut button = resolver.element("login_button", None).unwrap();

    let err = button.click().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ElementNotEnabled);
    assert!(err.to_string().contains("login_button"));
    assert_eq!(desktop.count_calls("click:"), 0);
}

#[test]
fn test_transient_platform_errors_are_retried() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let mut button = resolver.element("login_button", None).unwrap();

    desktop.fail_next(LOGIN_BUTTON, "click", 2);
    button.click().unwrap();
    assert_eq!(desktop.count_calls(&format!("click:{LOGIN_BUTTON}")), 1);
}

#[test]
fn test_retry_exhaustion_wraps_the_platform_error() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let mut button = resolver.element("login_button", None).unwrap();

    desktop.fail_next(LOGIN_BUTTON, "click", 5);
    let err = button.click().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Action);
    let message = err.to_string();
    assert!(message.contains("Action 'click' failed on 'login_button'"), "{message}");
    assert!(message.contains("after 3 attempts"), "{message}");
    assert_eq!(err.root_cause().kind(), ErrorKind::Platform);
    assert_eq!(desktop.count_calls("click:"), 0);
}

#[test]
fn test_checkbox_round_trip_is_idempotent() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let mut remember = resolver.element("remember", None).unwrap();

    assert_eq!(remember.checkbox_state(), ToggleState::Unchecked);
    remember.check().unwrap();
    remember.check().unwrap();
    assert_eq!(desktop.count_calls("toggle:"), 1);
    assert_eq!(remember.checkbox_state(), ToggleState::Checked);
    assert_eq!(desktop.checked_of(REMEMBER), Some(true));

    remember.uncheck().unwrap();
    assert_eq!(remember.checkbox_state(), ToggleState::Unchecked);
    assert_eq!(desktop.count_calls("toggle:"), 2);
}

#[test]
fn test_wait_re_resolves_a_missing_element() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let mut status = resolver.element("status", None).unwrap();
    desktop.remove(STATUS);

    let later = desktop.clone();
    let adder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        later.add_child(WINDOW, MemoryNode::new("Text").auto_id("status"))
    });
    status.wait(WaitState::Exists, Some(Duration::from_secs(3))).unwrap();
    let replacement = adder.join().unwrap();
    assert_eq!(
        status.handle().runtime_id().unwrap(),
        format!("mem-{replacement}")
    );
}

#[test]
fn test_wait_until_gone() {
    let desktop = login_desktop();
    let resolver = resolver(&desktop);
    let status = resolver.element("status", None).unwrap();

    let later = desktop.clone();
    let remover = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        later.remove(STATUS);
    });
    status.wait_until_gone(Some(Duration::from_secs(3))).unwrap();
    remover.join().unwrap();

    let password = resolver.element("password", None).unwrap();
    let err = password
        .wait_until_gone(Some(Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}
