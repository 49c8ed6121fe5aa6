use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::pipeline::key_color::KeyColor;
use crate::pipeline::PipelineStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    StageStarted(PipelineStage),
    KeyColorDetected(KeyColor),
    KeyColorFallback { color: KeyColor, reason: String },
    ChromaKeyFailed { stderr: String },
    ReturningOriginal { path: PathBuf },
    TrimFailed { stderr: String },
}

pub trait PipelineReporter: Send + Sync + 'static {
    fn report(&self, event: &PipelineEvent);
}

pub type SharedPipelineReporter = Arc<dyn PipelineReporter>;

#[derive(Debug, Default, Clone)]
pub struct TracingPipelineReporter;

impl PipelineReporter for TracingPipelineReporter {
    fn report(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted(stage) => info!(
                stage = stage.as_str(),
                "[{}/{}] {}",
                stage.position(),
                PipelineStage::ORDER.len(),
                stage.description()
            ),
            PipelineEvent::KeyColorDetected(color) => {
                info!(key_color = %color, "key color: {color}")
            }
            PipelineEvent::KeyColorFallback { color, reason } => warn!(
                key_color = %color,
                reason = %reason,
                "could not auto-detect key color, defaulting to {color}"
            ),
            PipelineEvent::ChromaKeyFailed { stderr } => {
                error!(stderr = %stderr.trim(), "chroma-key filter failed")
            }
            PipelineEvent::ReturningOriginal { path } => warn!(
                path = %path.display(),
                "returning original image without transparency"
            ),
            PipelineEvent::TrimFailed { stderr } => warn!(
                stderr = %stderr.trim(),
                "trim failed, but transparency was applied"
            ),
        }
    }
}
