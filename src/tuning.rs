//! Live tuning file
//!
//! The tuning file is a flat JSON object whose values may be strings or
//! numbers. It is re-read on a fixed cycle cadence, and only when its
//! modification time changed. A key that is missing or does not parse keeps
//! its previous in-memory value.

use crate::error::{PlannerError, PlannerResult};
use crate::types::{ramp, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How the left/right lane estimates are merged into one center.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Linear,
    MinimizeMagnitude,
    MinimizeCurvature,
}

/// In-memory tuning values consumed by the planner.
///
/// `angle_speed`, `angle_limit`, `speed_factor`, `wiggle_angle` and
/// `combine_flags` are parsed and held for reporting only; no cycle reads them.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuning {
    pub advance_steer: f32,
    pub angle_factor: f32,
    pub steer_factor: f32,
    pub angle_speed: usize,
    pub discrete_angle: bool,
    pub angle_limit: f32,
    pub blend_mode: BlendMode,
    pub first_model: usize,
    pub last_model: usize,
    pub model_factor: f32,
    pub speed_factor: f32,
    pub width_factor: f32,
    pub wiggle_angle: f32,
    pub combine_flags: i64,
    pub accel_limit: Row,
    pub lateral_factor: f32,
    pub yaw_factor: f32,
}

impl Tuning {
    pub fn new(slot_count: usize) -> Self {
        Self {
            advance_steer: 1.0,
            angle_factor: 1.0,
            steer_factor: 1.0,
            angle_speed: 3,
            discrete_angle: true,
            angle_limit: 0.0,
            blend_mode: BlendMode::Linear,
            first_model: 0,
            last_model: slot_count.saturating_sub(1),
            model_factor: 0.5,
            speed_factor: 1.0,
            width_factor: 1.0,
            wiggle_angle: 0.0,
            combine_flags: 0,
            accel_limit: ramp(1.0 / 7.5),
            lateral_factor: 1.0,
            yaw_factor: 1.0,
        }
    }

    /// Apply every recognized key found in `values`, validating each one.
    pub fn apply(&mut self, values: &HashMap<String, Value>, slot_count: usize) {
        let last_slot = slot_count.saturating_sub(1);
        let num = |key: &str| values.get(key).and_then(as_number).filter(|v| v.is_finite());

        if let Some(v) = num("advanceSteer") {
            self.advance_steer = 1.0 + v.max(0.0) as f32;
        }
        if let Some(v) = num("angleFactor") {
            // divisor of the steering channels
            if v > 0.0 {
                self.angle_factor = v as f32;
            }
        }
        if let Some(v) = num("steerFactor") {
            self.steer_factor = v as f32;
        }
        if let Some(v) = num("polyReact") {
            self.angle_speed = ((10.0 * v) as i64).clamp(0, 5) as usize;
        }
        if let Some(v) = num("discreteAngle") {
            self.discrete_angle = v > 0.0;
            self.angle_limit = v.abs() as f32;
        }
        if let Some(v) = values.get("useMinimize").and_then(as_number) {
            self.blend_mode = match v as i64 {
                1 => BlendMode::MinimizeMagnitude,
                2 => BlendMode::MinimizeCurvature,
                _ => BlendMode::Linear,
            };
        }
        if let Some(v) = num("firstModel") {
            self.first_model = (v as i64).clamp(0, last_slot as i64) as usize;
        }
        if let Some(v) = num("lastModel") {
            self.last_model = (v as i64).clamp(self.first_model as i64, last_slot as i64) as usize;
        }
        self.last_model = self.last_model.max(self.first_model);
        if let Some(v) = num("modelFactor") {
            self.model_factor = v.abs() as f32;
        }
        if let Some(v) = num("speedFactor") {
            self.speed_factor = v.abs() as f32;
        }
        if let Some(v) = num("widthFactor") {
            self.width_factor = v.abs() as f32;
        }
        if let Some(v) = num("wiggleAngle") {
            self.wiggle_angle = v.abs() as f32;
        }
        if let Some(v) = num("useCombineFlags") {
            self.combine_flags = (v as i64).abs();
        }
        if let Some(v) = num("accelLimit") {
            self.accel_limit = ramp((v.abs() * 6.7).max(0.0) as f32);
        }
        if let Some(v) = num("lateralFactor") {
            self.lateral_factor = v.abs() as f32;
        }
        if let Some(v) = num("yawFactor") {
            self.yaw_factor = v.abs() as f32;
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Tuning file watched by modification time.
pub struct TuningSource {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl TuningSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file if it changed since the last successful read.
    ///
    /// Returns `Ok(true)` when new values were applied, `Ok(false)` when the
    /// file is unchanged.
    pub fn refresh(&mut self, tuning: &mut Tuning, slot_count: usize) -> PlannerResult<bool> {
        let modified = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| PlannerError::TuningRead(format!("{}: {}", self.path.display(), e)))?;

        if self.last_modified == Some(modified) {
            return Ok(false);
        }

        let text = fs::read_to_string(&self.path)
            .map_err(|e| PlannerError::TuningRead(format!("{}: {}", self.path.display(), e)))?;
        let values: HashMap<String, Value> = serde_json::from_str(&text)
            .map_err(|e| PlannerError::TuningRead(format!("{}: {}", self.path.display(), e)))?;

        tuning.apply(&values, slot_count);
        self.last_modified = Some(modified);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: Value) -> HashMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_string_and_number_values() {
        let mut tuning = Tuning::new(2);
        tuning.apply(
            &values(json!({"advanceSteer": "0.5", "modelFactor": -2, "useMinimize": "1"})),
            2,
        );
        assert_eq!(tuning.advance_steer, 1.5);
        assert_eq!(tuning.model_factor, 2.0);
        assert_eq!(tuning.blend_mode, BlendMode::MinimizeMagnitude);
    }

    #[test]
    fn test_invalid_values_keep_previous() {
        let mut tuning = Tuning::new(2);
        tuning.apply(&values(json!({"angleFactor": "0", "steerFactor": "abc"})), 2);
        assert_eq!(tuning.angle_factor, 1.0);
        assert_eq!(tuning.steer_factor, 1.0);
    }

    #[test]
    fn test_discrete_angle_sign_and_magnitude() {
        let mut tuning = Tuning::new(2);
        tuning.apply(&values(json!({"discreteAngle": "-0.7"})), 2);
        assert!(!tuning.discrete_angle);
        assert!((tuning.angle_limit - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_model_range_clamped() {
        let mut tuning = Tuning::new(2);
        tuning.apply(&values(json!({"firstModel": "5", "lastModel": "0"})), 2);
        assert_eq!(tuning.first_model, 1);
        assert_eq!(tuning.last_model, 1);
    }

    #[test]
    fn test_accel_limit_envelope() {
        let mut tuning = Tuning::new(2);
        tuning.apply(&values(json!({"accelLimit": "-1"})), 2);
        assert!((tuning.accel_limit[2] - 13.4).abs() < 1e-4);
        assert_eq!(tuning.accel_limit[0], 0.0);
    }

    #[test]
    fn test_poly_react_clamped() {
        let mut tuning = Tuning::new(2);
        tuning.apply(&values(json!({"polyReact": "2"})), 2);
        assert_eq!(tuning.angle_speed, 5);
    }

    #[test]
    fn test_refresh_skips_unchanged_file() {
        let path = std::env::temp_dir().join(format!("tuning_{}.json", std::process::id()));
        fs::write(&path, r#"{"yawFactor": "2"}"#).unwrap();

        let mut source = TuningSource::new(&path);
        let mut tuning = Tuning::new(2);
        assert!(source.refresh(&mut tuning, 2).unwrap());
        assert_eq!(tuning.yaw_factor, 2.0);
        assert!(!source.refresh(&mut tuning, 2).unwrap());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_refresh_rereads_after_modification() {
        let path = std::env::temp_dir().join(format!("tuning_mtime_{}.json", std::process::id()));
        fs::write(&path, r#"{"lateralFactor": "2"}"#).unwrap();

        let mut source = TuningSource::new(&path);
        let mut tuning = Tuning::new(2);
        assert!(source.refresh(&mut tuning, 2).unwrap());
        assert_eq!(tuning.lateral_factor, 2.0);

        fs::write(&path, r#"{"lateralFactor": "3"}"#).unwrap();
        let later = fs::metadata(&path).unwrap().modified().unwrap()
            + std::time::Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(source.refresh(&mut tuning, 2).unwrap());
        assert_eq!(tuning.lateral_factor, 3.0);
        assert!(!source.refresh(&mut tuning, 2).unwrap());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_tuning_error() {
        let mut source = TuningSource::new("/nonexistent/tuning.json");
        let mut tuning = Tuning::new(2);
        let err = source.refresh(&mut tuning, 2).unwrap_err();
        assert!(matches!(err, PlannerError::TuningRead(_)));
        assert_eq!(tuning, Tuning::new(2));
    }
}
