//! Presentation frame-rate pacing.
//!
//! The presentation side calls [`PlaybackPacer::wait_until_next_frame_due`]
//! once per presented frame. The desired rate can be changed from any thread
//! and applies to the next wait. Every `report_interval_frames` presented
//! frames a [`FrameRateReport`] is published to observers; delivery never
//! blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::debug;

const REPORT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacerConfig {
    pub target_fps: f64,
    pub report_interval_frames: u32,
    /// Weight of the newest sample in the smoothed rate (0, 1].
    pub smoothing: f64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_fps: 24.0,
            report_interval_frames: 10,
            smoothing: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PacerError {
    #[error("invalid frame rate {0}: must be positive with a representable frame interval")]
    InvalidFrameRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRateReport {
    pub frames_presented: u64,
    pub actual_fps: f64,
    pub desired_fps: f64,
}

#[derive(Debug, Default)]
struct PacerState {
    last_frame_at: Option<Instant>,
    smoothed_fps: Option<f64>,
    frames_presented: u64,
}

#[derive(Debug)]
pub struct PlaybackPacer {
    desired_fps_bits: AtomicU64,
    report_interval_frames: u32,
    smoothing: f64,
    state: Mutex<PacerState>,
    observers: Mutex<Vec<Sender<FrameRateReport>>>,
}

impl PlaybackPacer {
    pub fn new(config: PacerConfig) -> Result<Self, PacerError> {
        validate_fps(config.target_fps)?;
        assert!(
            config.report_interval_frames > 0,
            "report interval must be at least one frame"
        );
        assert!(
            config.smoothing > 0.0 && config.smoothing <= 1.0,
            "smoothing factor must be in (0, 1]"
        );
        Ok(Self {
            desired_fps_bits: AtomicU64::new(config.target_fps.to_bits()),
            report_interval_frames: config.report_interval_frames,
            smoothing: config.smoothing,
            state: Mutex::new(PacerState::default()),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn desired_frame_rate(&self) -> f64 {
        f64::from_bits(self.desired_fps_bits.load(Ordering::Acquire))
    }

    pub fn set_desired_frame_rate(&self, fps: f64) -> Result<(), PacerError> {
        validate_fps(fps)?;
        self.desired_fps_bits.store(fps.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        frame_interval_for(self.desired_frame_rate()).unwrap_or(Duration::MAX)
    }

    /// Smoothed measured rate; 0 until two frames were presented.
    pub fn actual_frame_rate(&self) -> f64 {
        self.state.lock().smoothed_fps.unwrap_or(0.0)
    }

    pub fn frames_presented(&self) -> u64 {
        self.state.lock().frames_presented
    }

    pub fn subscribe(&self) -> Receiver<FrameRateReport> {
        let (sender, receiver) = bounded(REPORT_QUEUE_CAPACITY);
        self.observers.lock().push(sender);
        receiver
    }

    /// Sleeps until one frame interval has elapsed since the previous call,
    /// then records the frame.
    pub fn wait_until_next_frame_due(&self) {
        let remaining = self
            .state
            .lock()
            .last_frame_at
            .map(|last| self.frame_interval().saturating_sub(last.elapsed()));
        if let Some(remaining) = remaining.filter(|remaining| !remaining.is_zero()) {
            std::thread::sleep(remaining);
        }
        self.record_frame_at(Instant::now());
    }

    /// Forgets the previous frame time, e.g. when playback restarts.
    pub fn reset(&self) {
        *self.state.lock() = PacerState::default();
    }

    fn record_frame_at(&self, now: Instant) {
        let report = {
            let mut state = self.state.lock();
            if let Some(last) = state.last_frame_at {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                if elapsed > 0.0 {
                    let instant_fps = 1.0 / elapsed;
                    state.smoothed_fps = Some(match state.smoothed_fps {
                        None => instant_fps,
                        Some(previous) => previous + self.smoothing * (instant_fps - previous),
                    });
                }
            }
            state.last_frame_at = Some(now);
            state.frames_presented += 1;
            if state.frames_presented % u64::from(self.report_interval_frames) == 0 {
                Some(FrameRateReport {
                    frames_presented: state.frames_presented,
                    actual_fps: state.smoothed_fps.unwrap_or(0.0),
                    desired_fps: self.desired_frame_rate(),
                })
            } else {
                None
            }
        };
        if let Some(report) = report {
            debug!(
                frames = report.frames_presented,
                actual_fps = report.actual_fps,
                desired_fps = report.desired_fps,
                "[playback_pacer] frame rate report"
            );
            self.observers.lock().retain(|observer| {
                !matches!(
                    observer.try_send(report),
                    Err(TrySendError::Disconnected(_))
                )
            });
        }
    }
}

/// Accepts finite positive rates whose frame interval fits a `Duration`.
pub fn validate_fps(fps: f64) -> Result<(), PacerError> {
    frame_interval_for(fps)
        .map(|_| ())
        .ok_or(PacerError::InvalidFrameRate(fps))
}

fn frame_interval_for(fps: f64) -> Option<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pacer(target_fps: f64) -> PlaybackPacer {
        PlaybackPacer::new(PacerConfig {
            target_fps,
            ..PacerConfig::default()
        })
        .expect("pacer")
    }

    #[test]
    fn waits_at_least_one_interval_between_frames() {
        let pacer = pacer(100.0);
        pacer.wait_until_next_frame_due();
        let started = Instant::now();
        pacer.wait_until_next_frame_due();
        pacer.wait_until_next_frame_due();
        assert!(started.elapsed() >= Duration::from_millis(19));
        assert_eq!(pacer.frames_presented(), 3);
    }

    #[test]
    fn first_frame_does_not_wait() {
        let pacer = pacer(1.0);
        let started = Instant::now();
        pacer.wait_until_next_frame_due();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn reports_every_interval_with_smoothed_rate() {
        let pacer = pacer(24.0);
        let reports = pacer.subscribe();
        let start = Instant::now();
        for frame in 0..25u32 {
            pacer.record_frame_at(start + Duration::from_millis(40) * frame);
        }

        let received: Vec<FrameRateReport> = reports.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].frames_presented, 10);
        assert_eq!(received[1].frames_presented, 20);
        assert!((received[1].actual_fps - 25.0).abs() < 1e-6);
        assert!((pacer.actual_frame_rate() - 25.0).abs() < 1e-6);
    }

    #[test]
    fn rate_change_from_another_thread_applies_to_next_wait() {
        let pacer = Arc::new(pacer(1.0));
        let setter = pacer.clone();
        std::thread::spawn(move || setter.set_desired_frame_rate(200.0))
            .join()
            .expect("setter thread")
            .expect("valid rate");

        pacer.wait_until_next_frame_due();
        let started = Instant::now();
        pacer.wait_until_next_frame_due();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(pacer.desired_frame_rate(), 200.0);
    }

    #[test]
    fn rejects_invalid_rates() {
        let pacer = pacer(24.0);
        assert_eq!(
            pacer.set_desired_frame_rate(0.0),
            Err(PacerError::InvalidFrameRate(0.0))
        );
        assert!(pacer.set_desired_frame_rate(f64::INFINITY).is_err());
        assert_eq!(pacer.desired_frame_rate(), 24.0);
    }

    #[test]
    fn rejects_rates_whose_interval_overflows() {
        let pacer = pacer(24.0);
        assert_eq!(
            pacer.set_desired_frame_rate(1e-300),
            Err(PacerError::InvalidFrameRate(1e-300))
        );
        assert!(pacer.set_desired_frame_rate(f64::MIN_POSITIVE).is_err());
        assert!(
            PlaybackPacer::new(PacerConfig {
                target_fps: 1e-300,
                ..PacerConfig::default()
            })
            .is_err()
        );

        pacer.wait_until_next_frame_due();
        pacer.wait_until_next_frame_due();
        assert_eq!(pacer.frames_presented(), 2);
    }

    #[test]
    fn very_slow_valid_rate_has_finite_interval() {
        let pacer = pacer(1e-12);
        let interval = pacer.frame_interval();
        assert!(interval > Duration::from_secs(86_400));
        assert!(interval < Duration::MAX);
        assert!(validate_fps(1e-12).is_ok());
    }
}
