//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use deskpilot::platforms::memory::{MemoryDesktop, MemoryNode, MemorySession};
use deskpilot::{ObjectMap, Operation, OverrideGuard, Resolver, Runner, Session, TimeConfig, TimeoutSettings};

pub const LOGIN_MAP: &str = r#"
app:
  backend: memory
  default_timeout: 0.5
  polling_interval: 0.02
windows:
  login:
    locators:
      - title: Login
  home:
    locators:
      - title_re: "^Home"
elements:
  username:
    window: login
    locators:
      - auto_id: user
  password:
    window: login
    locators:
      - auto_id: password
  login_button:
    window: login
    locators:
      - name: Login
      - control_type: Button
        found_index: 0
  remember:
    window: login
    locators:
      - name: Remember me
  status:
    window: login
    locators:
      - auto_id: status
  missing:
    window: login
    locators:
      - auto_id: nope
      - name: Nope
  welcome:
    window: home
    locators:
      - auto_id: welcome
"#;

/// Node ids of [`login_window`] once added to an empty desktop.
pub const WINDOW: u64 = 1;
pub const USERNAME: u64 = 2;
pub const PASSWORD: u64 = 3;
pub const LOGIN_BUTTON: u64 = 4;
pub const REMEMBER: u64 = 5;
pub const STATUS: u64 = 6;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn login_window() -> MemoryNode {
    MemoryNode::window("Login")
        .child(MemoryNode::new("Edit").auto_id("user"))
        .child(MemoryNode::new("Edit").auto_id("password"))
        .child(MemoryNode::new("Button").name("Login"))
        .child(MemoryNode::new("CheckBox").name("Remember me").checked(false))
        .child(MemoryNode::new("Text").auto_id("status"))
}

pub fn home_window() -> MemoryNode {
    MemoryNode::window("Home - Demo").child(MemoryNode::new("Text").auto_id("welcome").text("Welcome back"))
}

pub fn login_desktop() -> MemoryDesktop {
    init_tracing();
    let desktop = MemoryDesktop::new();
    desktop.add_window(login_window());
    desktop
}

pub fn object_map() -> Arc<ObjectMap> {
    Arc::new(ObjectMap::from_yaml_str(LOGIN_MAP).expect("fixture object map parses"))
}

pub fn session(desktop: &MemoryDesktop) -> Arc<dyn Session> {
    Arc::new(MemorySession::new(desktop.clone()))
}

pub fn resolver(desktop: &MemoryDesktop) -> Resolver {
    Resolver::new(session(desktop), object_map())
}

pub fn runner(desktop: &MemoryDesktop) -> Runner {
    Runner::new(object_map(), session(desktop)).expect("built-in schema compiles")
}

/// Shrinks every timing category so failure paths finish quickly.
pub fn quick_timings() -> OverrideGuard {
    TimeConfig::push_override(
        Operation::ALL
            .iter()
            .map(|op| (*op, TimeoutSettings::from_secs(0.3, 0.02, None))),
    )
}
