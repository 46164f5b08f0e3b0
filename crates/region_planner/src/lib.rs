//! Visible-region planning for one viewer request.
//!
//! Resolves the upstream region of definition, clips it against the project
//! and display windows and turns the result into the row/column tiling the
//! display backend expects at the current zoom.

use frame_model::{PixelRect, TextureRect};
use tracing::trace;
use viewer_protocol::{DisplayBackend, SpanDecomposition, UpstreamError, UpstreamNode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    #[error("upstream region of definition failed: {0}")]
    RenderFailed(#[from] UpstreamError),
    /// Nothing visible; not a defect.
    #[error("visible region is empty")]
    EmptyRegion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionPlan {
    pub region_of_definition: PixelRect,
    pub display_window: PixelRect,
    pub visible: PixelRect,
    pub zoom: f64,
    pub rows: SpanDecomposition,
    pub columns: SpanDecomposition,
    pub texture_rect: TextureRect,
}

#[derive(Debug, Clone)]
pub struct RegionPlanner {
    project_default_window: PixelRect,
}

impl RegionPlanner {
    pub fn new(project_default_window: PixelRect) -> Self {
        assert!(
            !project_default_window.is_empty() && !project_default_window.is_unbounded(),
            "project default window must be a bounded, non-empty rectangle"
        );
        Self {
            project_default_window,
        }
    }

    pub fn project_default_window(&self) -> PixelRect {
        self.project_default_window
    }

    pub fn plan(
        &self,
        upstream: &dyn UpstreamNode,
        backend: &dyn DisplayBackend,
        time: i64,
        view: u32,
        fit_to_view: bool,
    ) -> Result<RegionPlan, PlannerError> {
        let mut region_of_definition = upstream.region_of_definition(time, view)?;
        if region_of_definition.is_unbounded() {
            region_of_definition =
                region_of_definition.clip_unbounded_to(&self.project_default_window);
        }

        if fit_to_view {
            backend.fit_to_region(region_of_definition);
        }

        let display_window = backend.display_window();
        let zoom = backend.display_params().zoom;
        let clipped = if backend.clipping_enabled() {
            region_of_definition.intersect(&display_window)
        } else if region_of_definition.is_empty() {
            None
        } else {
            Some(region_of_definition)
        };
        let Some(visible) = clipped else {
            trace!(
                time,
                ?region_of_definition,
                ?display_window,
                "[region_planner] nothing visible"
            );
            return Err(PlannerError::EmptyRegion);
        };

        let rows = backend.compute_row_span(visible.y1, visible.y2, zoom);
        let columns = backend.compute_column_span(visible.x1, visible.x2, zoom);
        assert_eq!(
            rows.sources.len(),
            rows.count as usize,
            "row span must list one source row per destination row"
        );
        assert_eq!(
            columns.sources.len(),
            columns.count as usize,
            "column span must list one source column per destination column"
        );

        let texture_rect = texture_rect_from_spans(&rows, &columns, zoom);
        if texture_rect.is_empty() {
            return Err(PlannerError::EmptyRegion);
        }
        trace!(time, ?visible, ?texture_rect, "[region_planner] planned");

        Ok(RegionPlan {
            region_of_definition,
            display_window,
            visible,
            zoom,
            rows,
            columns,
            texture_rect,
        })
    }
}

fn texture_rect_from_spans(
    rows: &SpanDecomposition,
    columns: &SpanDecomposition,
    zoom: f64,
) -> TextureRect {
    let (x, right) = span_extent(columns);
    let (y, top) = span_extent(rows);
    TextureRect {
        x,
        y,
        right,
        top,
        w: columns.count,
        h: rows.count,
        step: closest_power_of_two_step(zoom),
    }
}

fn span_extent(span: &SpanDecomposition) -> (i32, i32) {
    match (span.sources.first(), span.sources.last()) {
        (Some(first), Some(last)) => (*first, last + 1),
        _ => (span.start, span.start),
    }
}

/// Sampling step in image pixels for a zoom factor: 1 when zoomed in,
/// otherwise the smallest power of two covering `1 / zoom`.
pub fn closest_power_of_two_step(zoom: f64) -> u32 {
    if !zoom.is_finite() || zoom <= 0.0 || zoom >= 1.0 {
        return 1;
    }
    let inverse = (1.0 / zoom).min(f64::from(1u32 << 30));
    let mut step = 1u32;
    while f64::from(step) < inverse {
        step <<= 1;
    }
    step
}

/// Uniform span over `[lo, hi)` sampled every `closest_power_of_two_step(zoom)`
/// pixels. Backends without their own viewport mapping can use this directly.
pub fn uniform_span(lo: i32, hi: i32, zoom: f64) -> SpanDecomposition {
    if hi <= lo {
        return SpanDecomposition {
            start: lo,
            count: 0,
            sources: Vec::new(),
        };
    }
    let step = closest_power_of_two_step(zoom) as usize;
    let sources: Vec<i32> = (lo..hi).step_by(step).collect();
    SpanDecomposition {
        start: lo,
        count: sources.len() as u32,
        sources,
    }
}
