use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of the control loop for operators and dashboards.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlannerStatus {
    pub timestamp: f64,
    pub frames: u64,
    pub plans_published: u64,
    pub distance_driven: f64,
    // Calibration
    pub calibrated: bool,
    pub lane_width: f32,
    pub width_trim: f32,
    pub angle_bias: f32,
    pub angle_offset: f32,
    // Arbitration
    pub model_index: usize,
    pub override_timer: i32,
    // Lane sensing
    pub l_prob: f32,
    pub r_prob: f32,
    pub center: f32,
    pub l_offset: f32,
    pub r_offset: f32,
    // Timing
    pub avg_cycle_ms: f64,
}

impl PlannerStatus {
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

const INITIAL_AVG_MS: f64 = 27.0;
const GAIN_DECAY: f64 = 0.96;
const MIN_GAIN: f64 = 0.0001;

/// Exponentially smoothed cycle time whose gain starts at 1 and decays to a floor.
#[derive(Clone, Debug)]
pub struct CycleTimer {
    avg_ms: f64,
    factor: f64,
}

impl Default for CycleTimer {
    fn default() -> Self {
        Self {
            avg_ms: INITIAL_AVG_MS,
            factor: 1.0,
        }
    }
}

impl CycleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed_ms: f64) {
        self.avg_ms += self.factor.max(MIN_GAIN) * (elapsed_ms - self.avg_ms);
        self.factor *= GAIN_DECAY;
    }

    pub fn average_ms(&self) -> f64 {
        self.avg_ms
    }
}
