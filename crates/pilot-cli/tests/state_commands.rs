use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn saved_state(dir: &std::path::Path) -> Value {
    let raw = fs::read_to_string(dir.join("state.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_state_show_defaults() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"recentServiceIds\": []"))
        .stdout(predicate::str::contains("\"version\": \"1.0.0\""));
}

#[test]
fn test_select_service_tracks_recent() {
    let dir = tempdir().unwrap();

    for id in ["alpha", "beta", "alpha"] {
        cargo_bin_cmd!("pilot")
            .env("PILOT_HOME", dir.path())
            .args(["state", "select-service", id])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("Selected service {id}")));
    }

    let state = saved_state(dir.path());
    assert_eq!(state["selectedServiceId"], "alpha");
    assert_eq!(state["recentServiceIds"], serde_json::json!(["alpha", "beta"]));
}

#[test]
fn test_select_service_rejects_blank() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "select-service", "  "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must not be empty"));
}

#[test]
fn test_select_agent_and_clear() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "select-agent", "planner"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Selected agent planner"));
    assert_eq!(saved_state(dir.path())["selectedAgentCode"], "planner");

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "select-agent", ""])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared agent selection"));
    assert!(saved_state(dir.path())["selectedAgentCode"].is_null());
}

#[test]
fn test_tool_policy_updates_config() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "tool-policy", "comfyui", "auto-execute"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tool set comfyui: enabled, auto-execute"));

    let state = saved_state(dir.path());
    let sets = state["toolConfig"]["toolSets"].as_array().unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0]["id"], "comfyui");
    assert_eq!(sets[0]["enabled"], true);
    assert_eq!(sets[0]["executionPolicy"], "auto-execute");

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "tool-policy", "comfyui", "ask", "--disable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled, ask-every-time"));
}

#[test]
fn test_tool_policy_rejects_unknown_policy() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("pilot")
        .env("PILOT_HOME", dir.path())
        .args(["state", "tool-policy", "comfyui", "sometimes"])
        .assert()
        .failure();
    assert!(!dir.path().join("state.json").exists());
}
