//! Compiled scenario plan.

use std::collections::HashMap;

use super::step::ScenarioStep;

/// An immutable, validated scenario: the ordered step list plus the
/// label-to-index map. Compiled once per distinct script and shared
/// (read-only, behind an `Arc`) by every connection that references it.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    source: String,
    steps: Vec<ScenarioStep>,
    labels: HashMap<String, usize>,
}

impl ScenarioPlan {
    pub(crate) fn new(
        source: String,
        steps: Vec<ScenarioStep>,
        labels: HashMap<String, usize>,
    ) -> Self {
        Self { source, steps, labels }
    }

    /// Script file (or other source name) this plan was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The ordered steps.
    pub fn steps(&self) -> &[ScenarioStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step index of a label. Jump steps already carry resolved indices;
    /// this is a diagnostic accessor.
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }
}
