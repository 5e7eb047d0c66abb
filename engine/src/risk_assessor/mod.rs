//! Risk assessment module
//!
//! Every inbound request is scored on five independent dimensions before it
//! is dispatched:
//!
//! - **security**: which method is being invoked
//! - **functional**: what the named tool or step does (`delete`, `destroy`, `execute`)
//! - **contextual**: baseline exposure of acting on shared context
//! - **performance**: known CPU-heavy tools
//! - **operational**: baseline operational cost
//!
//! The total is the sum of the five scores and maps onto a `RiskLevel`
//! (LOW < 15 ≤ MEDIUM < 25 ≤ HIGH < 35 ≤ CRITICAL). A request whose total
//! reaches the block threshold is rejected by the gateway.
//!
//! The assessor is a pure function of the request shape and its rule table:
//! it does no I/O and records nothing. Persisting a BLOCKED record is the
//! caller's job.

use saan_sdk::types::{RiskAssessment, RiskScores};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default block threshold (the CRITICAL boundary)
pub const DEFAULT_BLOCK_THRESHOLD: u32 = 35;

/// Rule table driving the five evaluators
///
/// Defaults reproduce the production table; every field can be overridden
/// from the `[gate.rules]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskRules {
    /// Methods scored `security_high`
    pub high_risk_methods: Vec<String>,
    /// Methods scored `security_medium`
    pub medium_risk_methods: Vec<String>,
    pub security_high: u32,
    pub security_medium: u32,
    pub security_low: u32,

    /// Name substrings scored `functional_destructive`
    pub destructive_markers: Vec<String>,
    /// Name substrings scored `functional_executing`
    pub executing_markers: Vec<String>,
    pub functional_destructive: u32,
    pub functional_executing: u32,
    pub functional_base: u32,

    pub contextual_base: u32,

    /// Tools scored `performance_heavy`
    pub heavy_tools: Vec<String>,
    pub performance_heavy: u32,
    pub performance_base: u32,

    pub operational_base: u32,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            high_risk_methods: strings(&["tools/call", "sandbox_execute", "system_modify"]),
            medium_risk_methods: strings(&["resources/read", "context_update", "workflow/step"]),
            security_high: 8,
            security_medium: 4,
            security_low: 1,
            destructive_markers: strings(&["delete", "destroy"]),
            executing_markers: strings(&["execute"]),
            functional_destructive: 7,
            functional_executing: 5,
            functional_base: 2,
            contextual_base: 3,
            // search scans stored request and response text
            heavy_tools: strings(&["thinking_advancement", "search_conversation_history"]),
            performance_heavy: 4,
            performance_base: 2,
            operational_base: 2,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Methods whose `params.name` identifies a unit of work
const NAMED_WORK_METHODS: &[&str] = &["tools/call", "workflow/step"];

/// Risk assessor for request scoring
///
/// # Examples
///
/// ```
/// use saan_engine::risk_assessor::RiskAssessor;
/// use saan_sdk::RiskLevel;
/// use serde_json::json;
///
/// let assessor = RiskAssessor::new();
///
/// // Listing tools is low risk
/// let a = assessor.assess("tools/list", &json!({}));
/// assert_eq!(a.total, 10);
/// assert_eq!(a.level, RiskLevel::Low);
///
/// // Destructive tool calls escalate the functional score
/// let a = assessor.assess("tools/call", &json!({"name": "destroy_sandbox"}));
/// assert_eq!(a.scores.functional, 7);
/// assert_eq!(a.level, RiskLevel::Medium);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {
    rules: RiskRules,
}

impl RiskAssessor {
    /// Create an assessor with the default rule table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an assessor with a custom rule table
    pub fn with_rules(rules: RiskRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RiskRules {
        &self.rules
    }

    /// Score a request on all five dimensions
    pub fn assess(&self, method: &str, params: &Value) -> RiskAssessment {
        let name = work_name(method, params);

        RiskAssessment::from_scores(RiskScores {
            security: self.security_risk(method),
            functional: self.functional_risk(name),
            contextual: self.rules.contextual_base,
            performance: self.performance_risk(method, name),
            operational: self.rules.operational_base,
        })
    }

    /// Whether an assessment reaches the given block threshold
    pub fn exceeds(assessment: &RiskAssessment, threshold: u32) -> bool {
        assessment.total >= threshold
    }

    fn security_risk(&self, method: &str) -> u32 {
        if self.rules.high_risk_methods.iter().any(|m| m == method) {
            self.rules.security_high
        } else if self.rules.medium_risk_methods.iter().any(|m| m == method) {
            self.rules.security_medium
        } else {
            self.rules.security_low
        }
    }

    fn functional_risk(&self, name: Option<&str>) -> u32 {
        let Some(name) = name else {
            return self.rules.functional_base;
        };

        if contains_any(name, &self.rules.destructive_markers) {
            self.rules.functional_destructive
        } else if contains_any(name, &self.rules.executing_markers) {
            self.rules.functional_executing
        } else {
            self.rules.functional_base
        }
    }

    fn performance_risk(&self, method: &str, name: Option<&str>) -> u32 {
        match name {
            Some(name) if method == "tools/call" && contains_any(name, &self.rules.heavy_tools) => {
                self.rules.performance_heavy
            }
            _ => self.rules.performance_base,
        }
    }
}

/// `params.name` for methods that name a tool or step
fn work_name<'a>(method: &str, params: &'a Value) -> Option<&'a str> {
    if NAMED_WORK_METHODS.contains(&method) {
        params.get("name").and_then(|v| v.as_str())
    } else {
        None
    }
}

fn contains_any(haystack: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| haystack.contains(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use saan_sdk::RiskLevel;
    use serde_json::json;

    #[test]
    fn test_security_buckets() {
        let assessor = RiskAssessor::new();
        assert_eq!(assessor.assess("tools/call", &json!({})).scores.security, 8);
        assert_eq!(
            assessor.assess("resources/read", &json!({})).scores.security,
            4
        );
        assert_eq!(
            assessor.assess("workflow/step", &json!({})).scores.security,
            4
        );
        assert_eq!(assessor.assess("initialize", &json!({})).scores.security, 1);
    }

    #[test]
    fn test_functional_markers() {
        let assessor = RiskAssessor::new();
        let score = |name: &str| {
            assessor
                .assess("tools/call", &json!({ "name": name }))
                .scores
                .functional
        };

        assert_eq!(score("delete_project"), 7);
        assert_eq!(score("destroy_sandbox"), 7);
        assert_eq!(score("execute_in_sandbox"), 5);
        assert_eq!(score("session_info"), 2);
    }

    #[test]
    fn test_destructive_wins_over_executing() {
        let assessor = RiskAssessor::new();
        let a = assessor.assess("tools/call", &json!({"name": "execute_and_delete"}));
        assert_eq!(a.scores.functional, 7);
    }

    #[test]
    fn test_name_ignored_outside_work_methods() {
        let assessor = RiskAssessor::new();
        let a = assessor.assess("resources/read", &json!({"name": "delete_everything"}));
        assert_eq!(a.scores.functional, 2);
    }

    #[test]
    fn test_performance_heavy_tool() {
        let assessor = RiskAssessor::new();
        let a = assessor.assess("tools/call", &json!({"name": "thinking_advancement"}));
        assert_eq!(a.scores.performance, 4);
        let a = assessor.assess("tools/call", &json!({"name": "session_info"}));
        assert_eq!(a.scores.performance, 2);
    }

    #[test]
    fn test_heavy_tools_are_configurable() {
        let rules = RiskRules {
            heavy_tools: vec!["thinking_advancement".into()],
            ..RiskRules::default()
        };
        let assessor = RiskAssessor::with_rules(rules);
        let a = assessor.assess("tools/call", &json!({"name": "search_conversation_history"}));
        assert_eq!(a.scores.performance, 2);
        // Substring match
        let a = assessor.assess("tools/call", &json!({"name": "thinking_advancement_v2"}));
        assert_eq!(a.scores.performance, 4);
    }

    #[test]
    fn test_total_is_sum() {
        let assessor = RiskAssessor::new();
        let a = assessor.assess("tools/call", &json!({"name": "destroy_sandbox"}));
        assert_eq!(a.total, 8 + 7 + 3 + 2 + 2);
        assert_eq!(a.total, a.scores.total());
        assert_eq!(a.level, RiskLevel::Medium);
    }

    #[test]
    fn test_default_table_never_blocks() {
        // Worst case under the default table: 8 + 7 + 3 + 4 + 2
        let assessor = RiskAssessor::new();
        let a = assessor.assess(
            "tools/call",
            &json!({"name": "thinking_advancement_delete"}),
        );
        assert_eq!(a.total, 24);
        assert!(!RiskAssessor::exceeds(&a, DEFAULT_BLOCK_THRESHOLD));
    }

    #[test]
    fn test_exceeds_is_inclusive() {
        let rules = RiskRules {
            contextual_base: 15,
            ..RiskRules::default()
        };
        let assessor = RiskAssessor::with_rules(rules);

        // 8 + 5 + 15 + 2 + 2 = 32
        let a = assessor.assess("tools/call", &json!({"name": "execute_in_sandbox"}));
        assert_eq!(a.total, 32);
        assert!(!RiskAssessor::exceeds(&a, 35));

        // 8 + 7 + 15 + 2 + 2 = 34
        let a = assessor.assess("tools/call", &json!({"name": "destroy_sandbox"}));
        assert_eq!(a.total, 34);
        assert_eq!(a.level, RiskLevel::High);
        assert!(!RiskAssessor::exceeds(&a, 35));

        let rules = RiskRules {
            contextual_base: 16,
            ..RiskRules::default()
        };
        let a = RiskAssessor::with_rules(rules)
            .assess("tools/call", &json!({"name": "destroy_sandbox"}));
        assert_eq!(a.total, 35);
        assert_eq!(a.level, RiskLevel::Critical);
        assert!(RiskAssessor::exceeds(&a, 35));
    }

    #[test]
    fn test_rules_deserialize_partial_override() {
        let rules: RiskRules = toml::from_str("contextual_base = 9").unwrap();
        assert_eq!(rules.contextual_base, 9);
        assert_eq!(rules.security_high, 8);
        assert!(rules.high_risk_methods.contains(&"tools/call".to_string()));
    }
}
