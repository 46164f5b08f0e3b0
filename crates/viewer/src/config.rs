use std::sync::Arc;

use display_cache::DisplayCache;
use frame_model::PixelRect;
use playback_pacer::PacerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("viewer config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid viewer config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Tile worker threads; 0 uses the hardware concurrency.
    pub worker_threads: usize,
    pub cache_capacity_bytes: usize,
    pub target_fps: f64,
    pub rate_report_interval_frames: u32,
    pub pacer_smoothing: f64,
    /// Replaces unbounded regions of definition.
    pub project_default_window: PixelRect,
    pub fit_to_view: bool,
    pub loop_playback: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let pacer = PacerConfig::default();
        Self {
            worker_threads: 0,
            cache_capacity_bytes: 512 * 1024 * 1024,
            target_fps: pacer.target_fps,
            rate_report_interval_frames: pacer.report_interval_frames,
            pacer_smoothing: pacer.smoothing,
            project_default_window: PixelRect::new(0, 0, 1920, 1080),
            fit_to_view: false,
            loop_playback: false,
        }
    }
}

impl ViewerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache_capacity_bytes must be greater than zero".to_string(),
            ));
        }
        if let Err(error) = playback_pacer::validate_fps(self.target_fps) {
            return Err(ConfigError::Invalid(format!("target_fps: {error}")));
        }
        if self.rate_report_interval_frames == 0 {
            return Err(ConfigError::Invalid(
                "rate_report_interval_frames must be at least 1".to_string(),
            ));
        }
        if !(self.pacer_smoothing > 0.0 && self.pacer_smoothing <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "pacer_smoothing must be in (0, 1], got {}",
                self.pacer_smoothing
            )));
        }
        let window = self.project_default_window;
        if window.is_empty() || window.is_unbounded() {
            return Err(ConfigError::Invalid(format!(
                "project_default_window must be bounded and non-empty, got {window:?}"
            )));
        }
        Ok(())
    }

    pub fn worker_thread_count(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }

    /// The cache is process-wide; build it once and share it between viewers.
    pub fn create_display_cache(&self) -> Arc<DisplayCache> {
        Arc::new(DisplayCache::new(self.cache_capacity_bytes))
    }

    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            target_fps: self.target_fps,
            report_interval_frames: self.rate_report_interval_frames,
            smoothing: self.pacer_smoothing,
        }
    }
}
