use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mediaflow_model::{PipelineTemplate, StageDefinition, TemplateId};

use crate::error::{OrchestratorError, Result};

pub const MEDIA_PIPELINE_ID: &str = "media";

/// The stock media pipeline. Weights reproduce the 10/25/55/75/90/100
/// progress marks reported after each stage.
pub fn default_media_pipeline() -> PipelineTemplate {
    let stage = |name: &str, weight: u32, timeout_secs: u64| {
        StageDefinition::new(name, weight, 5, Duration::from_secs(timeout_secs))
    };

    PipelineTemplate::new(
        MEDIA_PIPELINE_ID,
        vec![
            stage("validate", 10, 30),
            stage("thumbnail", 15, 60),
            stage("convert", 30, 600),
            stage("watermark", 20, 120),
            stage("upload", 15, 300),
            stage("finalize", 10, 30),
        ],
    )
}

/// Immutable set of validated templates, shared by every task.
#[derive(Clone, Default)]
pub struct PipelineCatalog {
    templates: HashMap<TemplateId, Arc<PipelineTemplate>>,
}

impl fmt::Debug for PipelineCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.templates.keys().map(TemplateId::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("PipelineCatalog").field("templates", &ids).finish()
    }
}

impl PipelineCatalog {
    pub fn from_templates<I>(templates: I) -> Result<Self>
    where
        I: IntoIterator<Item = PipelineTemplate>,
    {
        let mut catalog = Self::default();
        for template in templates {
            template.validate()?;
            if catalog.templates.contains_key(&template.id) {
                return Err(OrchestratorError::Internal(format!(
                    "pipeline template `{}` registered twice",
                    template.id
                )));
            }
            catalog
                .templates
                .insert(template.id.clone(), Arc::new(template));
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &TemplateId) -> Option<Arc<PipelineTemplate>> {
        self.templates.get(id).cloned()
    }

    pub fn contains(&self, id: &TemplateId) -> bool {
        self.templates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PipelineTemplate>> {
        self.templates.values()
    }
}
