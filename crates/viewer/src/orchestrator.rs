//! One cancellable viewer request: plan, key, cache check, then either present
//! the cached frame or render, present and cache a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use display_cache::DisplayCache;
use frame_model::{DisplayParams, FrameEntry, FrameKey, TextureRect};
use handoff::{HandoffConsumer, HandoffProducer};
use parking_lot::RwLock;
use region_planner::{RegionPlan, RegionPlanner};
use tile_workers::{RenderCompletion, RowRenderJob, TileRenderPool};
use tracing::{debug, warn};
use viewer_protocol::{
    CancellationToken, DisplayBackend, InterThreadInfo, PresentationReply, PresentationRequest,
    UpstreamNode,
};

use crate::error::ViewerRenderError;
use crate::state::{RenderState, StateTrace};

pub type PresentationProducer =
    HandoffProducer<PresentationRequest, InterThreadInfo, PresentationReply>;
pub type PresentationConsumer =
    HandoffConsumer<PresentationRequest, InterThreadInfo, PresentationReply>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerRequest {
    pub time: i64,
    pub view: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    CacheHit,
    /// `cached` is false when the cache refused the frame.
    Rendered { cached: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub key: FrameKey,
    pub texture_rect: TextureRect,
    pub path: RenderPath,
    pub states: Vec<RenderState>,
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ViewerRenderer {
    upstream: RwLock<Arc<dyn UpstreamNode>>,
    backend: Arc<dyn DisplayBackend>,
    cache: Arc<DisplayCache>,
    planner: RegionPlanner,
    workers: TileRenderPool,
    presentation: PresentationProducer,
    cancel: CancellationToken,
    fit_to_view: bool,
    force_refresh: AtomicBool,
    in_flight: AtomicBool,
}

impl ViewerRenderer {
    pub fn new(
        upstream: Arc<dyn UpstreamNode>,
        backend: Arc<dyn DisplayBackend>,
        cache: Arc<DisplayCache>,
        planner: RegionPlanner,
        workers: TileRenderPool,
        presentation: PresentationProducer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            upstream: RwLock::new(upstream),
            backend,
            cache,
            planner,
            workers,
            presentation,
            cancel,
            fit_to_view: false,
            force_refresh: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_fit_to_view(mut self, fit_to_view: bool) -> Self {
        self.fit_to_view = fit_to_view;
        self
    }

    /// Reconnects the viewer input. Takes effect on the next request.
    pub fn set_upstream(&self, upstream: Arc<dyn UpstreamNode>) {
        *self.upstream.write() = upstream;
    }

    pub fn frame_range(&self) -> (i64, i64) {
        self.upstream.read().frame_range()
    }

    pub fn cache(&self) -> &Arc<DisplayCache> {
        &self.cache
    }

    pub fn workers(&self) -> &TileRenderPool {
        &self.workers
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Makes the next request skip the cache lookup and re-render.
    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::Release);
    }

    pub fn render_viewer(
        &self,
        request: ViewerRequest,
    ) -> Result<RenderOutcome, ViewerRenderError> {
        let Some(_in_flight) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(time = request.time, "[viewer] rejected overlapping request");
            return Err(ViewerRenderError::Busy);
        };
        let upstream = self.upstream.read().clone();
        let mut trace = StateTrace::new(request);

        let result = self.run_request(upstream.as_ref(), request, &mut trace);
        match &result {
            Ok(_) => trace.enter(RenderState::Idle),
            Err(ViewerRenderError::Aborted) => trace.enter(RenderState::Aborted),
            Err(error) if error.is_expected() => {
                debug!(time = request.time, %error, "[viewer] nothing rendered");
            }
            Err(error) => {
                warn!(time = request.time, %error, "[viewer] render request failed");
            }
        }
        let (key, texture_rect, path) = result?;
        Ok(RenderOutcome {
            key,
            texture_rect,
            path,
            states: trace.into_states(),
        })
    }

    fn run_request(
        &self,
        upstream: &dyn UpstreamNode,
        request: ViewerRequest,
        trace: &mut StateTrace,
    ) -> Result<(FrameKey, TextureRect, RenderPath), ViewerRenderError> {
        let plan = self.planner.plan(
            upstream,
            self.backend.as_ref(),
            request.time,
            request.view,
            self.fit_to_view,
        )?;
        let params = DisplayParams {
            zoom: plan.zoom,
            ..self.backend.display_params()
        };
        let key = FrameKey::new(
            request.time,
            request.view,
            upstream.graph_hash(request.time),
            &params,
            plan.region_of_definition,
            plan.display_window,
            plan.texture_rect,
        );
        trace.enter(RenderState::KeyBuilt);

        let forced = self.force_refresh.swap(false, Ordering::AcqRel);
        let cached = if forced { None } else { self.cache.lookup(&key) };
        trace.enter(RenderState::CacheChecked);

        let path = match cached {
            Some(entry) => {
                trace.enter(RenderState::CachedEngine);
                self.present_cached(&plan, &params, entry, trace)?;
                RenderPath::CacheHit
            }
            None => {
                debug!(%key, forced, "[viewer] cache miss");
                self.render_and_present(upstream, request, &plan, &params, key, trace)?
            }
        };
        Ok((key, plan.texture_rect, path))
    }

    fn present_cached(
        &self,
        plan: &RegionPlan,
        params: &DisplayParams,
        entry: Arc<FrameEntry>,
        trace: &mut StateTrace,
    ) -> Result<(), ViewerRenderError> {
        self.checkpoint("final presentation")?;
        trace.enter(RenderState::Presenting);
        let info = InterThreadInfo::for_rect(plan.texture_rect, params.channel_mode)
            .with_cached_entry(entry);
        self.present(PresentationRequest::PresentCached, info)?;
        trace.enter(RenderState::Done);
        Ok(())
    }

    fn render_and_present(
        &self,
        upstream: &dyn UpstreamNode,
        request: ViewerRequest,
        plan: &RegionPlan,
        params: &DisplayParams,
        key: FrameKey,
        trace: &mut StateTrace,
    ) -> Result<RenderPath, ViewerRenderError> {
        self.checkpoint("storage allocation")?;
        trace.enter(RenderState::Allocating);
        let info = InterThreadInfo::for_rect(plan.texture_rect, params.channel_mode);
        let byte_len = info.byte_len;
        let mut storage = match self
            .presentation
            .round_trip(PresentationRequest::AllocateStorage, info)?
        {
            PresentationReply::Storage(storage) if storage.len() == byte_len => storage,
            PresentationReply::Storage(storage) => {
                warn!(
                    expected = byte_len,
                    provided = storage.len(),
                    "[viewer] presentation storage has the wrong size"
                );
                return Err(ViewerRenderError::StorageUnavailable { byte_len });
            }
            PresentationReply::StorageUnavailable => {
                return Err(ViewerRenderError::StorageUnavailable { byte_len });
            }
            other => panic!("presentation answered a storage request with {other:?}"),
        };

        trace.enter(RenderState::Rendering);
        let image = upstream
            .render_region_of_interest(request.time, request.view, plan.visible, plan.zoom)
            .map_err(ViewerRenderError::RenderFailed)?;

        self.checkpoint("waking tile workers")?;
        let job = RowRenderJob {
            image: &image,
            rows: &plan.rows.sources,
            columns: &plan.columns.sources,
            channel_mode: params.channel_mode,
            exposure: params.exposure,
        };
        let report = self.workers.render(&job, &mut storage, &self.cancel);
        if report.completion == RenderCompletion::Aborted {
            debug!(
                rows_written = report.rows_written,
                "[viewer] tile render abandoned"
            );
            return Err(ViewerRenderError::Aborted);
        }
        let pixels: Arc<[u8]> = Arc::from(storage);

        // Last checkpoint: a presented frame is always offered to the cache.
        self.checkpoint("final presentation and cache insertion")?;
        trace.enter(RenderState::Presenting);
        let info = InterThreadInfo::for_rect(plan.texture_rect, params.channel_mode)
            .with_rendered_pixels(pixels.clone());
        self.present(PresentationRequest::PresentRendered, info)?;

        let cached = match self.cache.insert(
            key,
            plan.region_of_definition,
            plan.display_window,
            &pixels,
        ) {
            Ok(_) => {
                trace.enter(RenderState::Cached);
                true
            }
            Err(error) => {
                warn!(%key, %error, "[viewer] frame not cached");
                trace.enter(RenderState::Done);
                false
            }
        };
        Ok(RenderPath::Rendered { cached })
    }

    fn present(
        &self,
        request: PresentationRequest,
        info: InterThreadInfo,
    ) -> Result<(), ViewerRenderError> {
        match self.presentation.round_trip(request, info)? {
            PresentationReply::Displayed => Ok(()),
            other => panic!("presentation answered {request:?} with {other:?}"),
        }
    }

    fn checkpoint(&self, before: &str) -> Result<(), ViewerRenderError> {
        if self.cancel.is_cancelled() {
            debug!(before, "[viewer] cancellation observed");
            return Err(ViewerRenderError::Aborted);
        }
        Ok(())
    }
}
