use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use display_cache::DisplayCache;
use frame_model::{ChannelMode, DisplayParams, FrameEntry, PixelRect, TextureRect};
use parking_lot::Mutex;
use playback_pacer::PacerConfig;
use region_planner::uniform_span;
use viewer_protocol::{Image, SharedImage, SpanDecomposition, UpstreamError};

use super::*;

const COLOR: [f32; 4] = [1.0, 0.5, 0.0, 1.0];

struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

struct MockUpstream {
    rod: PixelRect,
    hidden_times: Vec<i64>,
    frame_range: (i64, i64),
    fail_render: bool,
    gate: Option<Gate>,
    renders: AtomicUsize,
}

impl MockUpstream {
    fn new(rod: PixelRect) -> Self {
        Self {
            rod,
            hidden_times: Vec::new(),
            frame_range: (0, 0),
            fail_render: false,
            gate: None,
            renders: AtomicUsize::new(0),
        }
    }

    fn with_frame_range(mut self, first: i64, last: i64) -> Self {
        self.frame_range = (first, last);
        self
    }

    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl UpstreamNode for MockUpstream {
    fn region_of_definition(&self, time: i64, _view: u32) -> Result<PixelRect, UpstreamError> {
        if self.hidden_times.contains(&time) {
            return Ok(PixelRect::new(5000, 5000, 5100, 5100));
        }
        Ok(self.rod)
    }

    fn render_region_of_interest(
        &self,
        time: i64,
        _view: u32,
        region: PixelRect,
        _scale: f64,
    ) -> Result<SharedImage, UpstreamError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.send(()).expect("gate entered");
            gate.release.recv().expect("gate release");
        }
        if self.fail_render {
            return Err(UpstreamError::Render {
                time,
                reason: "mock failure".to_string(),
            });
        }
        Ok(Arc::new(Image::filled(region, COLOR)))
    }

    fn frame_range(&self) -> (i64, i64) {
        self.frame_range
    }

    fn graph_hash(&self, _time: i64) -> u64 {
        0xfeed
    }
}

struct MockBackend {
    window: PixelRect,
    channel_mode: ChannelMode,
}

impl MockBackend {
    fn new(window: PixelRect) -> Self {
        Self {
            window,
            channel_mode: ChannelMode::Byte,
        }
    }
}

impl DisplayBackend for MockBackend {
    fn display_params(&self) -> DisplayParams {
        DisplayParams {
            channel_mode: self.channel_mode,
            ..DisplayParams::default()
        }
    }

    fn display_window(&self) -> PixelRect {
        self.window
    }

    fn clipping_enabled(&self) -> bool {
        true
    }

    fn fit_to_region(&self, _region: PixelRect) {}

    fn compute_row_span(&self, bottom: i32, top: i32, zoom: f64) -> SpanDecomposition {
        uniform_span(bottom, top, zoom)
    }

    fn compute_column_span(&self, left: i32, right: i32, zoom: f64) -> SpanDecomposition {
        uniform_span(left, right, zoom)
    }
}

#[derive(Debug, Default)]
struct SurfaceLog {
    allocations: Vec<usize>,
    cached: Vec<(TextureRect, Vec<u8>)>,
    rendered: Vec<(TextureRect, Vec<u8>)>,
}

impl SurfaceLog {
    fn is_untouched(&self) -> bool {
        self.allocations.is_empty() && self.cached.is_empty() && self.rendered.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageSupply {
    Exact,
    Missing,
    Short,
}

struct RecordingSurface {
    log: Arc<Mutex<SurfaceLog>>,
    storage: StorageSupply,
    cancel_on_display: Option<CancellationToken>,
}

impl RecordingSurface {
    fn new(log: Arc<Mutex<SurfaceLog>>) -> Self {
        Self {
            log,
            storage: StorageSupply::Exact,
            cancel_on_display: None,
        }
    }
}

impl PresentationSurface for RecordingSurface {
    fn allocate_storage(&mut self, byte_len: usize) -> Option<Vec<u8>> {
        self.log.lock().allocations.push(byte_len);
        match self.storage {
            StorageSupply::Exact => Some(vec![0; byte_len]),
            StorageSupply::Missing => None,
            StorageSupply::Short => Some(vec![0; byte_len / 2]),
        }
    }

    fn display_cached(&mut self, texture_rect: &TextureRect, entry: &FrameEntry) {
        self.log
            .lock()
            .cached
            .push((*texture_rect, entry.pixels().to_vec()));
    }

    fn display_rendered(&mut self, texture_rect: &TextureRect, _mode: ChannelMode, pixels: &[u8]) {
        self.log.lock().rendered.push((*texture_rect, pixels.to_vec()));
        if let Some(cancel) = &self.cancel_on_display {
            cancel.cancel();
        }
    }
}

struct Harness {
    renderer: Arc<ViewerRenderer>,
    _presentation: PresentationThread,
    upstream: Arc<MockUpstream>,
    cache: Arc<DisplayCache>,
    surface: Arc<Mutex<SurfaceLog>>,
    cancel: CancellationToken,
}

fn harness_with(upstream: MockUpstream, backend: MockBackend, cache_capacity: usize) -> Harness {
    harness_with_surface(upstream, backend, cache_capacity, |_, _| {})
}

fn harness_with_surface(
    upstream: MockUpstream,
    backend: MockBackend,
    cache_capacity: usize,
    configure: impl FnOnce(&mut RecordingSurface, &CancellationToken),
) -> Harness {
    let upstream = Arc::new(upstream);
    let cache = Arc::new(DisplayCache::new(cache_capacity));
    let surface = Arc::new(Mutex::new(SurfaceLog::default()));
    let cancel = CancellationToken::new();
    let mut recording = RecordingSurface::new(surface.clone());
    configure(&mut recording, &cancel);
    let (producer, consumer) = handoff_channel();
    let presentation =
        spawn_presentation_thread(Box::new(recording), consumer).expect("presentation thread");
    let renderer = ViewerRenderer::new(
        upstream.clone(),
        Arc::new(backend),
        cache.clone(),
        RegionPlanner::new(PixelRect::new(0, 0, 1920, 1080)),
        TileRenderPool::new(4).expect("worker pool"),
        producer,
        cancel.clone(),
    );
    Harness {
        renderer: Arc::new(renderer),
        _presentation: presentation,
        upstream,
        cache,
        surface,
        cancel,
    }
}

fn harness(upstream: MockUpstream) -> Harness {
    harness_with(upstream, MockBackend::new(PixelRect::new(0, 0, 200, 200)), 1 << 24)
}

fn square(size: i32) -> PixelRect {
    PixelRect::new(0, 0, size, size)
}

const AT_FIVE: ViewerRequest = ViewerRequest { time: 5, view: 0 };

#[test]
fn miss_renders_presents_and_caches_then_repeat_hits() {
    let h = harness(MockUpstream::new(square(100)));

    let first = h.renderer.render_viewer(AT_FIVE).expect("first render");
    assert_eq!(first.path, RenderPath::Rendered { cached: true });
    assert_eq!(
        first.states,
        vec![
            RenderState::KeyBuilt,
            RenderState::CacheChecked,
            RenderState::Allocating,
            RenderState::Rendering,
            RenderState::Presenting,
            RenderState::Cached,
            RenderState::Idle,
        ]
    );
    assert_eq!(first.texture_rect.h, 100);
    assert_eq!(first.key.time(), 5);
    assert_eq!(h.renderer.workers().groups_dispatched(), 4);
    assert_eq!(h.cache.len(), 1);

    let second = h.renderer.render_viewer(AT_FIVE).expect("second render");
    assert_eq!(second.path, RenderPath::CacheHit);
    assert_eq!(second.key, first.key);
    assert_eq!(
        second.states,
        vec![
            RenderState::KeyBuilt,
            RenderState::CacheChecked,
            RenderState::CachedEngine,
            RenderState::Presenting,
            RenderState::Done,
            RenderState::Idle,
        ]
    );
    assert_eq!(h.renderer.workers().groups_dispatched(), 4);
    assert_eq!(h.upstream.renders(), 1);

    let log = h.surface.lock();
    assert_eq!(log.allocations, vec![100 * 100 * 4]);
    assert_eq!(log.rendered.len(), 1);
    assert_eq!(log.cached.len(), 1);
    assert_eq!(log.rendered[0].1, log.cached[0].1);
    assert_eq!(&log.rendered[0].1[0..4], &[255, 128, 0, 255]);
}

#[test]
fn region_outside_window_is_empty_without_side_effects() {
    let h = harness(MockUpstream::new(PixelRect::new(500, 500, 600, 600)));

    let error = h.renderer.render_viewer(AT_FIVE).expect_err("empty region");

    assert_eq!(error, ViewerRenderError::EmptyRegion);
    assert!(error.is_expected());
    assert!(h.cache.is_empty());
    assert_eq!(h.upstream.renders(), 0);
    assert!(h.surface.lock().is_untouched());
}

#[test]
fn cancelled_request_aborts_before_any_side_effect() {
    let h = harness(MockUpstream::new(square(100)));
    h.cancel.cancel();

    assert_eq!(
        h.renderer.render_viewer(AT_FIVE),
        Err(ViewerRenderError::Aborted)
    );
    assert!(h.cache.is_empty());
    assert_eq!(h.upstream.renders(), 0);
    assert!(h.surface.lock().is_untouched());
}

#[test]
fn cancelled_cache_hit_is_not_presented() {
    let h = harness(MockUpstream::new(square(50)));
    h.renderer.render_viewer(AT_FIVE).expect("populate cache");
    h.cancel.cancel();

    assert_eq!(
        h.renderer.render_viewer(AT_FIVE),
        Err(ViewerRenderError::Aborted)
    );
    assert!(h.surface.lock().cached.is_empty());
}

#[test]
fn cancellation_during_upstream_render_skips_workers_and_presentation() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let mut upstream = MockUpstream::new(square(40));
    upstream.gate = Some(Gate {
        entered: entered_tx,
        release: release_rx,
    });
    let h = harness(upstream);

    let renderer = h.renderer.clone();
    let request = thread::spawn(move || renderer.render_viewer(AT_FIVE));
    entered_rx.recv().expect("upstream entered");
    h.cancel.cancel();
    release_tx.send(()).expect("release upstream");

    assert_eq!(
        request.join().expect("render thread"),
        Err(ViewerRenderError::Aborted)
    );
    assert_eq!(h.renderer.workers().groups_dispatched(), 0);
    assert!(h.cache.is_empty());
    let log = h.surface.lock();
    assert_eq!(log.allocations.len(), 1);
    assert!(log.rendered.is_empty());
}

#[test]
fn cancellation_while_workers_run_is_neither_presented_nor_cached() {
    let h = harness_with(
        MockUpstream::new(square(1500)),
        MockBackend::new(square(2048)),
        1 << 24,
    );

    let renderer = h.renderer.clone();
    let cancel = h.cancel.clone();
    let canceller = thread::spawn(move || {
        while renderer.workers().groups_dispatched() == 0 {
            thread::yield_now();
        }
        cancel.cancel();
    });
    let result = h.renderer.render_viewer(AT_FIVE);
    canceller.join().expect("canceller thread");

    assert_eq!(result, Err(ViewerRenderError::Aborted));
    assert!(h.renderer.workers().groups_dispatched() > 0);
    assert!(h.cache.is_empty());
    let log = h.surface.lock();
    assert_eq!(log.allocations.len(), 1);
    assert!(log.rendered.is_empty());
}

#[test]
fn cancellation_during_presentation_still_caches_the_frame() {
    let h = harness_with_surface(
        MockUpstream::new(square(40)),
        MockBackend::new(square(200)),
        1 << 24,
        |surface, cancel| surface.cancel_on_display = Some(cancel.clone()),
    );

    let outcome = h.renderer.render_viewer(AT_FIVE).expect("render");

    assert!(h.cancel.is_cancelled());
    assert_eq!(outcome.path, RenderPath::Rendered { cached: true });
    assert!(h.cache.contains(&outcome.key));
    assert_eq!(h.surface.lock().rendered.len(), 1);
}

#[test]
fn missing_storage_fails_before_rendering() {
    let h = harness_with_surface(
        MockUpstream::new(square(10)),
        MockBackend::new(square(200)),
        1 << 24,
        |surface, _| surface.storage = StorageSupply::Missing,
    );

    let error = h.renderer.render_viewer(AT_FIVE).expect_err("no storage");

    assert_eq!(error, ViewerRenderError::StorageUnavailable { byte_len: 400 });
    assert!(!error.is_expected());
    assert_eq!(h.upstream.renders(), 0);
    assert!(h.cache.is_empty());
    let log = h.surface.lock();
    assert_eq!(log.allocations, vec![400]);
    assert!(log.rendered.is_empty());
}

#[test]
fn undersized_storage_is_reported_as_unavailable() {
    let h = harness_with_surface(
        MockUpstream::new(square(10)),
        MockBackend::new(square(200)),
        1 << 24,
        |surface, _| surface.storage = StorageSupply::Short,
    );

    assert_eq!(
        h.renderer.render_viewer(AT_FIVE),
        Err(ViewerRenderError::StorageUnavailable { byte_len: 400 })
    );
    assert_eq!(h.upstream.renders(), 0);
    assert!(h.surface.lock().rendered.is_empty());
    assert!(h.cache.is_empty());
}

#[test]
fn overlapping_request_is_busy() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let mut upstream = MockUpstream::new(square(20));
    upstream.gate = Some(Gate {
        entered: entered_tx,
        release: release_rx,
    });
    let h = harness(upstream);

    let renderer = h.renderer.clone();
    let first = thread::spawn(move || renderer.render_viewer(AT_FIVE));
    entered_rx.recv().expect("upstream entered");

    assert_eq!(
        h.renderer.render_viewer(ViewerRequest { time: 6, view: 0 }),
        Err(ViewerRenderError::Busy)
    );

    release_tx.send(()).expect("release upstream");
    let outcome = first.join().expect("render thread").expect("first render");
    assert_eq!(outcome.path, RenderPath::Rendered { cached: true });
}

#[test]
fn forced_refresh_bypasses_lookup_once() {
    let h = harness(MockUpstream::new(square(30)));
    h.renderer.render_viewer(AT_FIVE).expect("first render");

    h.renderer.request_refresh();
    let refreshed = h.renderer.render_viewer(AT_FIVE).expect("refresh");
    assert_eq!(refreshed.path, RenderPath::Rendered { cached: true });
    assert_eq!(h.upstream.renders(), 2);
    assert_eq!(h.cache.stats().insertions, 2);
    assert_eq!(h.cache.len(), 1);

    let after = h.renderer.render_viewer(AT_FIVE).expect("after refresh");
    assert_eq!(after.path, RenderPath::CacheHit);
}

#[test]
fn upstream_failure_is_render_failed_and_uncached() {
    let mut upstream = MockUpstream::new(square(10));
    upstream.fail_render = true;
    let h = harness(upstream);

    let error = h.renderer.render_viewer(AT_FIVE).expect_err("failure");

    assert!(matches!(
        error,
        ViewerRenderError::RenderFailed(UpstreamError::Render { time: 5, .. })
    ));
    assert!(!error.is_expected());
    assert!(h.cache.is_empty());
    assert!(h.surface.lock().rendered.is_empty());
}

#[test]
fn frame_larger_than_cache_is_presented_uncached() {
    let h = harness_with(
        MockUpstream::new(square(100)),
        MockBackend::new(square(200)),
        1000,
    );

    let outcome = h.renderer.render_viewer(AT_FIVE).expect("render");

    assert_eq!(outcome.path, RenderPath::Rendered { cached: false });
    assert!(outcome.states.contains(&RenderState::Done));
    assert!(h.cache.is_empty());
    assert_eq!(h.surface.lock().rendered.len(), 1);
}

#[test]
fn float_mode_allocates_four_bytes_per_channel() {
    let mut backend = MockBackend::new(square(200));
    backend.channel_mode = ChannelMode::Float;
    let h = harness_with(MockUpstream::new(square(10)), backend, 1 << 20);

    let outcome = h.renderer.render_viewer(AT_FIVE).expect("render");

    assert_eq!(outcome.key.channel_mode(), ChannelMode::Float);
    assert_eq!(h.surface.lock().allocations, vec![10 * 10 * 16]);
    let entry = h.cache.lookup(&outcome.key).expect("cached");
    let green = f32::from_le_bytes(entry.pixels()[4..8].try_into().expect("4 bytes"));
    assert_eq!(green, 0.5);
}

#[test]
fn distinct_times_do_not_alias_in_cache() {
    let h = harness(MockUpstream::new(square(10)));
    h.renderer.render_viewer(AT_FIVE).expect("time 5");
    let other = h
        .renderer
        .render_viewer(ViewerRequest { time: 6, view: 0 })
        .expect("time 6");
    assert_eq!(other.path, RenderPath::Rendered { cached: true });
    assert_eq!(h.cache.len(), 2);
}

#[test]
fn missing_presentation_thread_is_reported() {
    let (producer, consumer) = handoff_channel();
    drop(consumer);
    let renderer = ViewerRenderer::new(
        Arc::new(MockUpstream::new(square(10))),
        Arc::new(MockBackend::new(square(20))),
        Arc::new(DisplayCache::new(1 << 20)),
        RegionPlanner::new(square(100)),
        TileRenderPool::new(1).expect("worker pool"),
        producer,
        CancellationToken::new(),
    );

    assert_eq!(
        renderer.render_viewer(AT_FIVE),
        Err(ViewerRenderError::PresentationDisconnected)
    );
}

fn fast_pacer() -> PlaybackPacer {
    PlaybackPacer::new(PacerConfig {
        target_fps: 1000.0,
        ..PacerConfig::default()
    })
    .expect("pacer")
}

#[test]
fn playback_presents_every_frame_in_range() {
    let h = harness(MockUpstream::new(square(10)).with_frame_range(1, 3));
    let pacer = fast_pacer();

    let summary = PlaybackLoop::new(&h.renderer, &pacer, PlaybackOptions::default()).run();

    assert_eq!(summary.frames_presented, 3);
    assert_eq!(summary.cache_hits, 0);
    assert_eq!(summary.stop, PlaybackStop::ReachedEnd);
    assert_eq!(pacer.frames_presented(), 3);
}

#[test]
fn looping_playback_reuses_cached_frames_until_limit() {
    let h = harness(MockUpstream::new(square(10)).with_frame_range(1, 3));
    let pacer = fast_pacer();
    let options = PlaybackOptions {
        view: 0,
        looping: true,
        max_frames: Some(5),
    };

    let summary = PlaybackLoop::new(&h.renderer, &pacer, options).run();

    assert_eq!(summary.frames_presented, 5);
    assert_eq!(summary.cache_hits, 2);
    assert_eq!(summary.stop, PlaybackStop::FrameLimit);
}

#[test]
fn playback_skips_empty_frames() {
    let mut upstream = MockUpstream::new(square(10)).with_frame_range(1, 3);
    upstream.hidden_times = vec![2];
    let h = harness(upstream);
    let pacer = fast_pacer();

    let summary = PlaybackLoop::new(&h.renderer, &pacer, PlaybackOptions::default()).run();

    assert_eq!(summary.frames_presented, 2);
    assert_eq!(summary.frames_skipped, 1);
    assert_eq!(summary.stop, PlaybackStop::ReachedEnd);
}

#[test]
fn looping_playback_with_nothing_to_draw_terminates() {
    let mut upstream = MockUpstream::new(square(10)).with_frame_range(0, 2);
    upstream.hidden_times = vec![0, 1, 2];
    let h = harness(upstream);
    let pacer = fast_pacer();
    let options = PlaybackOptions {
        looping: true,
        ..PlaybackOptions::default()
    };

    let summary = PlaybackLoop::new(&h.renderer, &pacer, options).run();

    assert_eq!(summary.frames_presented, 0);
    assert_eq!(summary.frames_skipped, 3);
    assert_eq!(summary.stop, PlaybackStop::ReachedEnd);
}

#[test]
fn playback_stops_on_render_failure_and_cancellation() {
    let mut upstream = MockUpstream::new(square(10)).with_frame_range(0, 4);
    upstream.fail_render = true;
    let h = harness(upstream);
    let pacer = fast_pacer();

    let summary = PlaybackLoop::new(&h.renderer, &pacer, PlaybackOptions::default()).run();
    assert!(matches!(
        summary.stop,
        PlaybackStop::Failed(ViewerRenderError::RenderFailed(_))
    ));
    assert_eq!(summary.frames_presented, 0);

    h.cancel.cancel();
    let summary = PlaybackLoop::new(&h.renderer, &pacer, PlaybackOptions::default()).run();
    assert_eq!(summary.stop, PlaybackStop::Cancelled);
}

#[test]
fn viewer_start_render_play_and_shutdown() {
    let config = ViewerConfig {
        worker_threads: 2,
        target_fps: 500.0,
        ..ViewerConfig::default()
    };
    let surface = Arc::new(Mutex::new(SurfaceLog::default()));
    let viewer = Viewer::start(
        &config,
        config.create_display_cache(),
        Arc::new(MockUpstream::new(square(16)).with_frame_range(0, 9)),
        Arc::new(MockBackend::new(square(64))),
        Box::new(RecordingSurface::new(surface.clone())),
        CancellationToken::new(),
    )
    .expect("viewer");

    viewer
        .render(ViewerRequest { time: 0, view: 0 })
        .expect("first frame");
    let summary = viewer.play(0, Some(3));
    assert_eq!(summary.frames_presented, 3);
    assert_eq!(summary.cache_hits, 1);

    let stats = viewer.shutdown();
    assert_eq!(
        stats,
        PresentationStats {
            allocations: 3,
            cached_frames: 1,
            rendered_frames: 3,
        }
    );
    assert_eq!(surface.lock().rendered.len(), 3);
}
