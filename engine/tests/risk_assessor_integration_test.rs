//! Integration tests for the RiskAssessor module
//!
//! These tests check request scoring against the default rule table and the
//! way `[gate.rules]` overrides reach the assessor through `Config`.

use saan_engine::config::Config;
use saan_engine::risk_assessor::{RiskAssessor, DEFAULT_BLOCK_THRESHOLD};
use saan_sdk::RiskLevel;
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_protocol_methods_are_low_risk() {
    let assessor = RiskAssessor::new();

    for method in ["initialize", "tools/list", "resources/list"] {
        let a = assessor.assess(method, &json!({}));
        // 1 + 2 + 3 + 2 + 2
        assert_eq!(a.total, 10, "{} should score 10", method);
        assert_eq!(a.level, RiskLevel::Low, "{} should be LOW", method);
    }
}

#[test]
fn test_resource_reads_score_medium_security() {
    let assessor = RiskAssessor::new();
    let a = assessor.assess("resources/read", &json!({"uri": "session://info"}));
    assert_eq!(a.scores.security, 4);
    assert_eq!(a.total, 13);
    assert_eq!(a.level, RiskLevel::Low);
}

#[test]
fn test_every_catalog_tool_passes_the_default_gate() {
    let assessor = RiskAssessor::new();
    let tools = [
        "session_info",
        "search_conversation_history",
        "get_task_history",
        "restore_previous_context",
        "get_session_statistics",
        "remember_context",
        "start_workflow",
        "workflow_progress",
        "list_workflows",
        "agent_status",
    ];

    for tool in tools {
        let a = assessor.assess("tools/call", &json!({ "name": tool }));
        assert!(
            !RiskAssessor::exceeds(&a, DEFAULT_BLOCK_THRESHOLD),
            "{} scored {}",
            tool,
            a.total
        );
    }

    let a = assessor.assess("tools/call", &json!({"name": "search_conversation_history"}));
    // 8 + 2 + 3 + 4 + 2
    assert_eq!(a.total, 19);
    assert_eq!(a.level, RiskLevel::Medium);
}

#[test]
fn test_workflow_steps_are_scored_by_step_name() {
    let assessor = RiskAssessor::new();
    let a = assessor.assess("workflow/step", &json!({"name": "deployment_preparation"}));
    // 4 + 2 + 3 + 2 + 2
    assert_eq!(a.total, 13);

    let a = assessor.assess("workflow/step", &json!({"name": "destroy_environment"}));
    assert_eq!(a.scores.functional, 7);
    // Heavy-tool scoring only applies to tools/call
    let a = assessor.assess("workflow/step", &json!({"name": "thinking_advancement"}));
    assert_eq!(a.scores.performance, 2);
}

#[test]
fn test_level_boundaries() {
    assert_eq!(RiskLevel::from_total(14), RiskLevel::Low);
    assert_eq!(RiskLevel::from_total(15), RiskLevel::Medium);
    assert_eq!(RiskLevel::from_total(24), RiskLevel::Medium);
    assert_eq!(RiskLevel::from_total(25), RiskLevel::High);
    assert_eq!(RiskLevel::from_total(34), RiskLevel::High);
    assert_eq!(RiskLevel::from_total(35), RiskLevel::Critical);
}

#[test]
fn test_rule_overrides_from_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml(&format!(
        r#"
[core]
data_dir = "{}"

[gate]
block_threshold = 20

[gate.rules]
high_risk_methods = ["tools/call", "resources/read"]
destructive_markers = ["delete", "destroy", "drop"]
"#,
        dir.path().display()
    ))
    .unwrap();

    let assessor = RiskAssessor::with_rules(config.gate.rules.clone());

    let a = assessor.assess("resources/read", &json!({}));
    assert_eq!(a.scores.security, 8);

    let a = assessor.assess("tools/call", &json!({"name": "drop_tables"}));
    assert_eq!(a.scores.functional, 7);
    assert_eq!(a.total, 22);
    assert!(RiskAssessor::exceeds(&a, config.gate.block_threshold));

    // Untouched fields keep their defaults
    assert_eq!(config.gate.rules.contextual_base, 3);
}
