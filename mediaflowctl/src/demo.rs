//! Simulated media stage bodies used by `mediaflowctl run`.

use std::time::Duration;

use mediaflow_core::model::Outputs;
use mediaflow_core::orchestration::{StageContext, StageError, StageRegistry};
use rand::Rng;
use tracing::debug;

/// Simulated duration of each media stage at `time_scale = 1.0`.
const MEDIA_STAGES: [(&str, u64); 6] = [
    ("validate", 200),
    ("thumbnail", 300),
    ("convert", 800),
    ("watermark", 400),
    ("upload", 500),
    ("finalize", 100),
];

#[derive(Debug, Clone, Copy)]
pub struct DemoSettings {
    pub failure_rate: f64,
    pub time_scale: f64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            time_scale: 1.0,
        }
    }
}

pub fn media_registry(settings: DemoSettings) -> StageRegistry {
    // NaN collapses to the lower bound.
    let failure_rate = settings.failure_rate.max(0.0).min(1.0);
    let time_scale = settings.time_scale.max(0.0).min(1000.0);

    let mut registry = StageRegistry::new();
    for (name, base_ms) in MEDIA_STAGES {
        let work = Duration::from_millis(base_ms).mul_f64(time_scale);
        registry.register_fn(name, move |ctx: StageContext| async move {
            simulate(ctx, work, failure_rate).await
        });
    }
    registry
}

async fn simulate(ctx: StageContext, work: Duration, failure_rate: f64) -> Result<Outputs, StageError> {
    if !work.is_zero() {
        tokio::time::sleep(work).await;
    }

    if rand::rng().random_bool(failure_rate) {
        debug!(
            target: "mediaflow::demo",
            task_id = %ctx.task_id,
            stage = %ctx.stage_name,
            attempt = ctx.attempt_number,
            "injecting transient failure"
        );
        return Err(StageError::Retryable(format!(
            "simulated {} hiccup",
            ctx.stage_name
        )));
    }

    Ok(stage_outputs(&ctx))
}

fn stage_outputs(ctx: &StageContext) -> Outputs {
    let task = ctx.task_id;
    let mut outputs = Outputs::new();
    match ctx.stage_name.as_str() {
        "validate" => {
            outputs.insert("source".into(), ctx.payload_reference.clone());
        }
        "thumbnail" => {
            outputs.insert("thumbnail".into(), format!("thumbnails/{task}.jpg"));
        }
        "convert" => {
            outputs.insert("rendition".into(), format!("renditions/{task}.mp4"));
        }
        "watermark" => {
            outputs.insert("watermarked".into(), format!("renditions/{task}-wm.mp4"));
        }
        "upload" => {
            outputs.insert("public_url".into(), format!("https://cdn.mediaflow.local/{task}.mp4"));
        }
        _ => {}
    }
    outputs
}

#[cfg(test)]
mod tests {
    use mediaflow_core::model::{OwnerId, TaskId, TemplateId};
    use mediaflow_core::orchestration::StageBody;

    use super::*;

    fn context(stage: &str) -> StageContext {
        StageContext {
            task_id: TaskId::new(),
            owner_id: OwnerId::new("demo-1"),
            template_id: TemplateId::new("media"),
            stage_index: 0,
            stage_name: stage.to_string(),
            attempt_number: 1,
            payload_reference: "uploads/clip.mov".into(),
            outputs: Outputs::new(),
        }
    }

    #[test]
    fn every_media_stage_has_a_body() {
        let registry = media_registry(DemoSettings::default());
        for (name, _) in MEDIA_STAGES {
            assert!(registry.contains(name), "missing body for {name}");
        }
    }

    #[tokio::test]
    async fn stages_produce_outputs() {
        let registry = media_registry(DemoSettings {
            failure_rate: 0.0,
            time_scale: 0.0,
        });
        let body = registry.get("thumbnail").unwrap();
        let ctx = context("thumbnail");
        let task = ctx.task_id;
        let outputs = body.execute(ctx).await.unwrap();
        assert_eq!(outputs.get("thumbnail"), Some(&format!("thumbnails/{task}.jpg")));
    }

    #[tokio::test]
    async fn certain_failure_is_retryable() {
        let registry = media_registry(DemoSettings {
            failure_rate: 1.0,
            time_scale: 0.0,
        });
        let body = registry.get("upload").unwrap();
        let err = body.execute(context("upload")).await.unwrap_err();
        assert!(matches!(err, StageError::Retryable(_)));
    }
}
