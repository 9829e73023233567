//! Test plan for the `studyhall-config` crate.
//!
//! These tests exercise the configuration loader across default handling,
//! file discovery, environment overrides, and validation behaviour.

use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use studyhall_config::{load, AppConfig, RealtimeConfig, StoreConfig};

const ENV_VARS_TO_RESET: &[&str] = &[
    "STUDYHALL_CONFIG",
    "STUDYHALL__REALTIME__TYPING_IDLE_MS",
    "STUDYHALL__REALTIME__EVENT_BUFFER",
    "STUDYHALL__REALTIME__MESSAGE_PAGE_SIZE",
    "STUDYHALL__STORE__MAX_MESSAGE_LENGTH",
    "STUDYHALL__STORE__MAX_ATTACHMENTS",
];

struct TestContext {
    vars: Vec<(String, Option<String>)>,
    original_dir: Option<PathBuf>,
}

impl TestContext {
    fn new() -> Self {
        Self {
            vars: Vec::new(),
            original_dir: None,
        }
    }

    fn reset_environment(&mut self) {
        for key in ENV_VARS_TO_RESET {
            self.remove_var(key);
        }
    }

    fn set_var(&mut self, key: &str, value: impl AsRef<str>) {
        let previous = std::env::var(key).ok();
        std::env::set_var(key, value.as_ref());
        self.vars.push((key.to_string(), previous));
    }

    fn remove_var(&mut self, key: &str) {
        let previous = std::env::var(key).ok();
        std::env::remove_var(key);
        self.vars.push((key.to_string(), previous));
    }

    fn set_current_dir(&mut self, dir: &Path) {
        if self.original_dir.is_none() {
            self.original_dir =
                Some(std::env::current_dir().expect("failed to capture current directory"));
        }
        std::env::set_current_dir(dir).expect("failed to set current directory");
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(original) = self.original_dir.take() {
            let _ = std::env::set_current_dir(original);
        }

        while let Some((key, value)) = self.vars.pop() {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }
    }
}

fn write_config_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create config directories");
    }
    fs::write(path, contents).expect("failed to write config file");
}

#[test]
#[serial]
fn load_uses_default_values_when_no_files_found() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    let config = load().expect("configuration load should succeed without files");
    let defaults = AppConfig::default();

    assert_eq!(config.realtime.typing_idle_ms, defaults.realtime.typing_idle_ms);
    assert_eq!(config.realtime.event_buffer, defaults.realtime.event_buffer);
    assert_eq!(
        config.realtime.message_page_size,
        defaults.realtime.message_page_size
    );
    assert_eq!(config.store.max_message_length, defaults.store.max_message_length);
    assert_eq!(config.store.max_attachments, defaults.store.max_attachments);
}

#[test]
#[serial]
fn load_picks_first_available_file_in_search_order() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "studyhall.toml",
        r#"
        [realtime]
        typing_idle_ms = 1500
        "#,
    );
    write_config_file(
        temp_dir.path(),
        "config/studyhall.toml",
        r#"
        [realtime]
        typing_idle_ms = 9000
        "#,
    );

    let config = load().expect("configuration load should pick the first file");
    assert_eq!(config.realtime.typing_idle_ms, 1500);
}

#[test]
#[serial]
fn load_merges_partial_file_with_defaults() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "studyhall.toml",
        r#"
        [realtime]
        message_page_size = 20

        [store]
        max_attachments = 4
        "#,
    );

    let config = load().expect("configuration load should succeed");
    let defaults = AppConfig::default();

    assert_eq!(config.realtime.message_page_size, 20);
    assert_eq!(config.realtime.typing_idle_ms, defaults.realtime.typing_idle_ms);
    assert_eq!(config.store.max_attachments, 4);
    assert_eq!(config.store.max_message_length, defaults.store.max_message_length);
}

#[test]
#[serial]
fn load_honours_explicit_config_path() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "elsewhere/custom.toml",
        r#"
        [realtime]
        event_buffer = 32
        "#,
    );
    let path = temp_dir.path().join("elsewhere/custom.toml");
    ctx.set_var("STUDYHALL_CONFIG", path.display().to_string());

    let config = load().expect("configuration load should read STUDYHALL_CONFIG");
    assert_eq!(config.realtime.event_buffer, 32);
}

#[test]
#[serial]
fn load_applies_environment_overrides() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "studyhall.toml",
        r#"
        [realtime]
        typing_idle_ms = 1000
        "#,
    );

    ctx.set_var("STUDYHALL__REALTIME__TYPING_IDLE_MS", "5000");

    let config = load().expect("configuration load should honour env overrides");
    assert_eq!(config.realtime.typing_idle_ms, 5000);
}

#[test]
#[serial]
fn load_rejects_zero_idle_window() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "studyhall.toml",
        r#"
        [realtime]
        typing_idle_ms = 0
        "#,
    );

    let error = load().expect_err("a zero idle window should be rejected");
    assert!(error.to_string().contains("invalid configuration"));
}

#[test]
#[serial]
fn load_errors_on_invalid_toml_contents() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "studyhall.toml",
        r#"
        [realtime]
        typing_idle_ms = "not-a-number
        "#,
    );

    let error = load().expect_err("invalid TOML should cause load to fail");
    let message = error.to_string();
    assert!(
        message.contains("invalid configuration") || message.contains("unable to build configuration"),
        "unexpected error message: {message}"
    );
}

#[test]
fn realtime_config_defaults_match_reference_behaviour() {
    let defaults = RealtimeConfig::default();
    assert_eq!(defaults.typing_idle_ms, 3_000);
    assert_eq!(defaults.typing_idle(), std::time::Duration::from_secs(3));
    assert_eq!(defaults.event_buffer, 256);
}

#[test]
fn store_config_defaults() {
    let defaults = StoreConfig::default();
    assert_eq!(defaults.max_message_length, 10_000);
    assert_eq!(defaults.max_attachments, 10);
}

#[test]
fn validate_rejects_zero_page_size() {
    let mut config = AppConfig::default();
    assert!(config.validate().is_ok());
    config.realtime.message_page_size = 0;
    assert!(config.validate().is_err());
}
