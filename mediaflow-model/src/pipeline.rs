use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ModelError, Result};
use crate::ids::TemplateId;

/// One step of a pipeline template. Stages run strictly in declaration
/// order; `weight` is this stage's share of overall progress.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageDefinition {
    pub name: String,
    pub weight: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

impl StageDefinition {
    pub fn new(
        name: impl Into<String>,
        weight: u32,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            max_attempts,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Ordered list of stages a task runs through.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineTemplate {
    pub id: TemplateId,
    pub stages: Vec<StageDefinition>,
}

impl PipelineTemplate {
    pub fn new(id: impl Into<TemplateId>, stages: Vec<StageDefinition>) -> Self {
        Self {
            id: id.into(),
            stages,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&StageDefinition> {
        self.stages.get(index)
    }

    pub fn total_weight(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.weight)).sum()
    }

    /// Sum of the weights of stages `0..count`.
    pub fn weight_through(&self, count: usize) -> u64 {
        self.stages
            .iter()
            .take(count)
            .map(|s| u64::from(s.weight))
            .sum()
    }

    pub fn longest_timeout(&self) -> Duration {
        self.stages
            .iter()
            .map(StageDefinition::timeout)
            .max()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| ModelError::InvalidPipeline {
            template: self.id.to_string(),
            reason: reason.to_string(),
        };

        if self.id.as_str().trim().is_empty() {
            return Err(invalid("template id must not be empty"));
        }
        if self.stages.is_empty() {
            return Err(invalid("pipeline has no stages"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(invalid("stage name must not be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(&format!("duplicate stage `{}`", stage.name)));
            }
            if stage.max_attempts == 0 {
                return Err(invalid(&format!(
                    "stage `{}` must allow at least one attempt",
                    stage.name
                )));
            }
            if stage.timeout_ms == 0 {
                return Err(invalid(&format!(
                    "stage `{}` has a zero timeout",
                    stage.name
                )));
            }
        }

        if self.total_weight() == 0 {
            return Err(invalid("total stage weight must be positive"));
        }

        Ok(())
    }
}
