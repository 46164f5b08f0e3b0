//! The presentation thread owns the display surface and serves storage,
//! cached-frame and rendered-frame requests from the render thread.
//!
//! It exits once the render side drops its producer. Dropping a
//! [`PresentationThread`] joins it, so the producer must go first.

use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};
use viewer_protocol::{InterThreadInfo, PresentationReply, PresentationRequest, PresentationSurface};

use crate::orchestrator::PresentationConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentationStats {
    pub allocations: u64,
    pub cached_frames: u64,
    pub rendered_frames: u64,
}

#[derive(Debug)]
pub struct PresentationThread {
    handle: Option<JoinHandle<PresentationStats>>,
}

pub fn spawn_presentation_thread(
    surface: Box<dyn PresentationSurface>,
    consumer: PresentationConsumer,
) -> std::io::Result<PresentationThread> {
    let handle = thread::Builder::new()
        .name("viewer-presentation".to_string())
        .spawn(move || run_presentation_loop(surface, consumer))?;
    Ok(PresentationThread {
        handle: Some(handle),
    })
}

impl PresentationThread {
    /// Waits for the thread to exit. Blocks until the producer is dropped.
    pub fn join(mut self) -> PresentationStats {
        self.join_inner().unwrap_or_default()
    }

    fn join_inner(&mut self) -> Option<PresentationStats> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(stats) => Some(stats),
            Err(panic) => {
                error!(?panic, "[presentation] thread panicked");
                None
            }
        }
    }
}

impl Drop for PresentationThread {
    fn drop(&mut self) {
        self.join_inner();
    }
}

fn run_presentation_loop(
    mut surface: Box<dyn PresentationSurface>,
    consumer: PresentationConsumer,
) -> PresentationStats {
    info!("[presentation] thread started");
    let mut stats = PresentationStats::default();
    while let Some(pending) = consumer.recv() {
        let request = *pending.signal();
        let reply = serve(surface.as_mut(), request, pending.info(), &mut stats);
        match reply {
            Some(reply) => pending.complete(reply),
            None => {
                // Dropping the request releases the render thread with an error.
                warn!(?request, "[presentation] request carried no pixels");
                drop(pending);
            }
        }
    }
    info!(
        allocations = stats.allocations,
        cached_frames = stats.cached_frames,
        rendered_frames = stats.rendered_frames,
        "[presentation] thread exiting"
    );
    stats
}

fn serve(
    surface: &mut dyn PresentationSurface,
    request: PresentationRequest,
    info: &InterThreadInfo,
    stats: &mut PresentationStats,
) -> Option<PresentationReply> {
    match request {
        PresentationRequest::AllocateStorage => {
            debug!(byte_len = info.byte_len, "[presentation] allocating storage");
            let Some(storage) = surface.allocate_storage(info.byte_len) else {
                warn!(byte_len = info.byte_len, "[presentation] storage allocation failed");
                return Some(PresentationReply::StorageUnavailable);
            };
            stats.allocations += 1;
            Some(PresentationReply::Storage(storage))
        }
        PresentationRequest::PresentCached => {
            let entry = info.cached_entry.as_ref()?;
            surface.display_cached(&info.texture_rect, entry);
            stats.cached_frames += 1;
            Some(PresentationReply::Displayed)
        }
        PresentationRequest::PresentRendered => {
            let pixels = info.rendered_pixels.as_ref()?;
            surface.display_rendered(&info.texture_rect, info.channel_mode, pixels);
            stats.rendered_frames += 1;
            Some(PresentationReply::Displayed)
        }
    }
}
