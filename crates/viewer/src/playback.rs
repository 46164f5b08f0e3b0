//! Forward playback over the upstream frame range.

use playback_pacer::PlaybackPacer;
use tracing::{debug, info};

use crate::error::ViewerRenderError;
use crate::orchestrator::{RenderPath, ViewerRenderer, ViewerRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackOptions {
    pub view: u32,
    pub looping: bool,
    /// Stop after this many presented frames.
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStop {
    ReachedEnd,
    FrameLimit,
    Cancelled,
    Failed(ViewerRenderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub cache_hits: u64,
    pub stop: PlaybackStop,
}

pub struct PlaybackLoop<'a> {
    renderer: &'a ViewerRenderer,
    pacer: &'a PlaybackPacer,
    options: PlaybackOptions,
}

impl<'a> PlaybackLoop<'a> {
    pub fn new(
        renderer: &'a ViewerRenderer,
        pacer: &'a PlaybackPacer,
        options: PlaybackOptions,
    ) -> Self {
        Self {
            renderer,
            pacer,
            options,
        }
    }

    pub fn run(&self) -> PlaybackSummary {
        let (first, last) = self.renderer.frame_range();
        info!(first, last, looping = self.options.looping, "[playback] started");
        let mut summary = PlaybackSummary {
            frames_presented: 0,
            frames_skipped: 0,
            cache_hits: 0,
            stop: PlaybackStop::ReachedEnd,
        };
        if last < first {
            return summary;
        }

        let mut time = first;
        let mut presented_this_pass = 0u64;
        summary.stop = loop {
            if self
                .options
                .max_frames
                .is_some_and(|limit| summary.frames_presented >= limit)
            {
                break PlaybackStop::FrameLimit;
            }
            if self.renderer.cancellation_token().is_cancelled() {
                break PlaybackStop::Cancelled;
            }

            let request = ViewerRequest {
                time,
                view: self.options.view,
            };
            match self.renderer.render_viewer(request) {
                Ok(outcome) => {
                    summary.frames_presented += 1;
                    presented_this_pass += 1;
                    if outcome.path == RenderPath::CacheHit {
                        summary.cache_hits += 1;
                    }
                    self.pacer.wait_until_next_frame_due();
                }
                Err(ViewerRenderError::EmptyRegion) => {
                    debug!(time, "[playback] nothing to draw");
                    summary.frames_skipped += 1;
                }
                Err(ViewerRenderError::Aborted) => break PlaybackStop::Cancelled,
                Err(error) => break PlaybackStop::Failed(error),
            }

            if time < last {
                time += 1;
                continue;
            }
            // A looping pass that drew nothing would spin forever.
            if !self.options.looping || presented_this_pass == 0 {
                break PlaybackStop::ReachedEnd;
            }
            time = first;
            presented_this_pass = 0;
        };

        info!(
            frames_presented = summary.frames_presented,
            frames_skipped = summary.frames_skipped,
            cache_hits = summary.cache_hits,
            stop = ?summary.stop,
            actual_fps = self.pacer.actual_frame_rate(),
            "[playback] stopped"
        );
        summary
    }
}
