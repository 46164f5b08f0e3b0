//! Viewer frame pipeline: wires the display cache, region planner, tile
//! workers, presentation thread and playback pacer into one viewer.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod presentation;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use display_cache::DisplayCache;
use handoff::handoff_channel;
use playback_pacer::{FrameRateReport, PacerError, PlaybackPacer};
use region_planner::RegionPlanner;
use tile_workers::TileRenderPool;
use tracing::info;
use viewer_protocol::{CancellationToken, DisplayBackend, PresentationSurface, UpstreamNode};

pub use config::{ConfigError, ViewerConfig};
pub use error::{ViewerRenderError, ViewerStartError};
pub use orchestrator::{RenderOutcome, RenderPath, ViewerRenderer, ViewerRequest};
pub use playback::{PlaybackLoop, PlaybackOptions, PlaybackStop, PlaybackSummary};
pub use presentation::{PresentationStats, PresentationThread, spawn_presentation_thread};
pub use state::RenderState;

/// One running viewer. Field order matters: the renderer owns the
/// presentation producer and must drop before the presentation thread joins.
pub struct Viewer {
    renderer: ViewerRenderer,
    presentation: PresentationThread,
    pacer: PlaybackPacer,
    looping: bool,
}

impl Viewer {
    pub fn start(
        config: &ViewerConfig,
        cache: Arc<DisplayCache>,
        upstream: Arc<dyn UpstreamNode>,
        backend: Arc<dyn DisplayBackend>,
        surface: Box<dyn PresentationSurface>,
        cancel: CancellationToken,
    ) -> Result<Self, ViewerStartError> {
        config.validate()?;
        let pacer = PlaybackPacer::new(config.pacer_config())?;
        let workers = TileRenderPool::new(config.worker_thread_count())?;
        let (producer, consumer) = handoff_channel();
        let presentation = spawn_presentation_thread(surface, consumer)?;
        let renderer = ViewerRenderer::new(
            upstream,
            backend,
            cache,
            RegionPlanner::new(config.project_default_window),
            workers,
            producer,
            cancel,
        )
        .with_fit_to_view(config.fit_to_view);
        info!(
            worker_threads = renderer.workers().thread_count(),
            target_fps = config.target_fps,
            "[viewer] started"
        );
        Ok(Self {
            renderer,
            presentation,
            pacer,
            looping: config.loop_playback,
        })
    }

    pub fn renderer(&self) -> &ViewerRenderer {
        &self.renderer
    }

    pub fn pacer(&self) -> &PlaybackPacer {
        &self.pacer
    }

    pub fn render(&self, request: ViewerRequest) -> Result<RenderOutcome, ViewerRenderError> {
        self.renderer.render_viewer(request)
    }

    pub fn request_refresh(&self) {
        self.renderer.request_refresh();
    }

    pub fn set_desired_frame_rate(&self, fps: f64) -> Result<(), PacerError> {
        self.pacer.set_desired_frame_rate(fps)
    }

    pub fn subscribe_frame_rate(&self) -> crossbeam_channel::Receiver<FrameRateReport> {
        self.pacer.subscribe()
    }

    /// Plays the upstream frame range on the calling thread.
    pub fn play(&self, view: u32, max_frames: Option<u64>) -> PlaybackSummary {
        self.pacer.reset();
        let options = PlaybackOptions {
            view,
            looping: self.looping,
            max_frames,
        };
        PlaybackLoop::new(&self.renderer, &self.pacer, options).run()
    }

    /// Stops the presentation thread and returns what it served.
    pub fn shutdown(self) -> PresentationStats {
        let Self {
            renderer,
            presentation,
            ..
        } = self;
        drop(renderer);
        let stats = presentation.join();
        info!(?stats, "[viewer] shut down");
        stats
    }
}
