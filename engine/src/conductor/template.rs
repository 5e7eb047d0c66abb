//! Workflow templates
//!
//! A template is a named chain of steps, each bound to one agent. The chain
//! is singly linked through `next_step` and must end in `null`; anything
//! else (cycles, branches, dangling links, unreachable steps) is rejected
//! when the template is built, including when it is read back from the
//! ledger.

use saan_sdk::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::types::AgentId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub agent: AgentId,
    pub next_step: Option<String>,
}

/// Validated linear workflow template
///
/// Steps are held in chain order starting from the entry step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTemplate")]
pub struct WorkflowTemplate {
    name: String,
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct RawTemplate {
    name: String,
    steps: Vec<Step>,
}

impl TryFrom<RawTemplate> for WorkflowTemplate {
    type Error = GatewayError;

    fn try_from(raw: RawTemplate) -> Result<Self, Self::Error> {
        WorkflowTemplate::new(raw.name, raw.steps)
    }
}

impl WorkflowTemplate {
    /// Build a template; the first step is the entry point
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, GatewayError> {
        let name = name.into();
        let invalid = |reason: String| GatewayError::TemplateInvalid {
            template: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("template name is empty".into()));
        }
        let Some(entry) = steps.first() else {
            return Err(invalid("template has no steps".into()));
        };

        let mut by_id: HashMap<&str, &Step> = HashMap::new();
        for step in &steps {
            if step.id.is_empty() {
                return Err(invalid("step id is empty".into()));
            }
            if by_id.insert(step.id.as_str(), step).is_some() {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut ordered = Vec::with_capacity(steps.len());
        let mut seen = HashSet::new();
        let mut cursor = Some(entry);

        while let Some(step) = cursor {
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("cycle at step '{}'", step.id)));
            }
            ordered.push(step.clone());

            cursor = match &step.next_step {
                None => None,
                Some(next) => match by_id.get(next.as_str()) {
                    Some(next) => Some(*next),
                    None => {
                        return Err(invalid(format!(
                            "step '{}' points to unknown step '{}'",
                            step.id, next
                        )))
                    }
                },
            };
        }

        if ordered.len() != steps.len() {
            let orphan = steps
                .iter()
                .find(|s| !seen.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .unwrap_or_default();
            return Err(invalid(format!(
                "step '{}' is unreachable from '{}'",
                orphan, entry.id
            )));
        }

        Ok(Self {
            name,
            steps: ordered,
        })
    }

    /// Chain built from `(step_id, agent)` pairs in order
    pub fn linear(name: &str, chain: &[(&str, AgentId)]) -> Result<Self, GatewayError> {
        let steps = chain
            .iter()
            .enumerate()
            .map(|(i, (id, agent))| Step {
                id: id.to_string(),
                agent: *agent,
                next_step: chain.get(i + 1).map(|(next, _)| next.to_string()),
            })
            .collect();
        Self::new(name, steps)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// Templates shipped with a fresh ledger
pub fn default_templates() -> BTreeMap<String, WorkflowTemplate> {
    use AgentId::*;

    let chains: [(&str, &[(&str, AgentId)]); 2] = [
        (
            "development_cycle",
            &[
                ("requirements_analysis", Boosaan),
                ("design_planning", Uijeongboo),
                ("implementation", Boosaan),
                ("quality_assurance", Oolsaan),
                ("deployment_preparation", Ilsaan),
            ],
        ),
        (
            "feature_enhancement",
            &[
                ("analysis", Boosaan),
                ("enhancement_design", Uijeongboo),
                ("enhancement_implementation", Boosaan),
                ("enhancement_validation", Oolsaan),
            ],
        ),
    ];

    chains
        .iter()
        .filter_map(|(name, chain)| WorkflowTemplate::linear(name, chain).ok())
        .map(|t| (t.name().to_string(), t))
        .collect()
}
