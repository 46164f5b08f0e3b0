//! Parallel conversion of an upstream image into a viewer frame buffer.
//!
//! The destination rows are split into contiguous groups, one per worker.
//! Each group owns a disjoint `&mut` slice of the destination, so workers
//! never synchronize with each other; the caller only waits for the join.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use frame_model::ChannelMode;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::debug;
use viewer_protocol::{CancellationToken, Image};

const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

/// Splits `0..total_rows` into contiguous groups of at most
/// `ceil(total_rows / thread_count)` rows; the last group may be shorter.
pub fn partition_rows(total_rows: usize, thread_count: usize) -> Vec<Range<usize>> {
    if total_rows == 0 {
        return Vec::new();
    }
    let group_len = total_rows.div_ceil(thread_count.max(1));
    (0..total_rows)
        .step_by(group_len)
        .map(|start| start..(start + group_len).min(total_rows))
        .collect()
}

/// What to render: the sampled source rows and columns of `image`, in
/// destination order.
#[derive(Debug, Clone, Copy)]
pub struct RowRenderJob<'a> {
    pub image: &'a Image,
    pub rows: &'a [i32],
    pub columns: &'a [i32],
    pub channel_mode: ChannelMode,
    pub exposure: f64,
}

impl RowRenderJob<'_> {
    pub fn row_byte_len(&self) -> usize {
        self.columns.len() * self.channel_mode.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.rows.len() * self.row_byte_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCompletion {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderReport {
    pub completion: RenderCompletion,
    pub groups: usize,
    pub rows_written: usize,
}

#[derive(Debug)]
pub struct TileRenderPool {
    pool: ThreadPool,
    thread_count: usize,
    groups_dispatched: AtomicU64,
}

impl TileRenderPool {
    pub fn new(thread_count: usize) -> Result<Self, ThreadPoolBuildError> {
        let thread_count = thread_count.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|index| format!("viewer-tile-worker-{index}"))
            .build()?;
        Ok(Self {
            pool,
            thread_count,
            groups_dispatched: AtomicU64::new(0),
        })
    }

    pub fn with_hardware_concurrency() -> Result<Self, ThreadPoolBuildError> {
        let thread_count = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::new(thread_count)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Total row groups handed to workers since the pool was created.
    pub fn groups_dispatched(&self) -> u64 {
        self.groups_dispatched.load(Ordering::Relaxed)
    }

    /// Renders every row of `job` into `dest` and blocks until all groups
    /// finished. On cancellation the rows written so far are left in place.
    pub fn render(
        &self,
        job: &RowRenderJob<'_>,
        dest: &mut [u8],
        cancel: &CancellationToken,
    ) -> RenderReport {
        assert_eq!(
            dest.len(),
            job.byte_len(),
            "destination buffer must hold exactly rows * columns * pixel stride bytes"
        );
        let row_byte_len = job.row_byte_len();
        if job.rows.is_empty() || row_byte_len == 0 {
            return RenderReport {
                completion: RenderCompletion::Completed,
                groups: 0,
                rows_written: 0,
            };
        }

        let groups = partition_rows(job.rows.len(), self.thread_count);
        let rows_written = AtomicUsize::new(0);
        self.groups_dispatched
            .fetch_add(groups.len() as u64, Ordering::Relaxed);

        self.pool.scope(|scope| {
            let mut remaining = dest;
            for group in &groups {
                let (group_dest, rest) =
                    std::mem::take(&mut remaining).split_at_mut(group.len() * row_byte_len);
                remaining = rest;
                let source_rows = &job.rows[group.clone()];
                let rows_written = &rows_written;
                scope.spawn(move |_| {
                    let written = render_group(job, source_rows, group_dest, cancel);
                    rows_written.fetch_add(written, Ordering::Relaxed);
                });
            }
        });

        let rows_written = rows_written.into_inner();
        let completion = if cancel.is_cancelled() {
            RenderCompletion::Aborted
        } else {
            RenderCompletion::Completed
        };
        debug!(
            groups = groups.len(),
            rows_written,
            ?completion,
            "[tile_workers] render joined"
        );
        RenderReport {
            completion,
            groups: groups.len(),
            rows_written,
        }
    }
}

fn render_group(
    job: &RowRenderJob<'_>,
    source_rows: &[i32],
    group_dest: &mut [u8],
    cancel: &CancellationToken,
) -> usize {
    let gain = job.exposure.exp2() as f32;
    let mut written = 0;
    for (source_y, dest_row) in source_rows
        .iter()
        .zip(group_dest.chunks_exact_mut(job.row_byte_len()))
    {
        if cancel.is_cancelled() {
            break;
        }
        write_row(job, *source_y, gain, dest_row);
        written += 1;
    }
    written
}

fn write_row(job: &RowRenderJob<'_>, source_y: i32, gain: f32, dest_row: &mut [u8]) {
    let pixel_stride = job.channel_mode.bytes_per_pixel();
    for (source_x, dest_pixel) in job
        .columns
        .iter()
        .zip(dest_row.chunks_exact_mut(pixel_stride))
    {
        let [r, g, b, a] = job.image.pixel(*source_x, source_y).unwrap_or(TRANSPARENT);
        let channels = [r * gain, g * gain, b * gain, a];
        match job.channel_mode {
            ChannelMode::Byte => {
                for (slot, value) in dest_pixel.iter_mut().zip(channels) {
                    *slot = quantize_u8(value);
                }
            }
            ChannelMode::Float => {
                for (slot, value) in dest_pixel.chunks_exact_mut(4).zip(channels) {
                    slot.copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

fn quantize_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
