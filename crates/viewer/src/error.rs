use handoff::HandoffError;
use region_planner::PlannerError;
use viewer_protocol::UpstreamError;

use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewerRenderError {
    #[error("viewer render failed: {0}")]
    RenderFailed(UpstreamError),
    #[error("nothing visible to render")]
    EmptyRegion,
    #[error("viewer render aborted")]
    Aborted,
    #[error("a viewer render is already in flight")]
    Busy,
    #[error("presentation thread disconnected")]
    PresentationDisconnected,
    #[error("presentation could not provide {byte_len} bytes of frame storage")]
    StorageUnavailable { byte_len: usize },
}

impl ViewerRenderError {
    /// Outcomes that are part of normal operation rather than failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::EmptyRegion)
    }
}

impl From<PlannerError> for ViewerRenderError {
    fn from(error: PlannerError) -> Self {
        match error {
            PlannerError::RenderFailed(upstream) => Self::RenderFailed(upstream),
            PlannerError::EmptyRegion => Self::EmptyRegion,
        }
    }
}

impl From<HandoffError> for ViewerRenderError {
    fn from(error: HandoffError) -> Self {
        match error {
            HandoffError::Busy => Self::Busy,
            HandoffError::Disconnected => Self::PresentationDisconnected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerStartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build tile worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn presentation thread: {0}")]
    PresentationThread(#[from] std::io::Error),
    #[error(transparent)]
    Pacer(#[from] playback_pacer::PacerError),
}
