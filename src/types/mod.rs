pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// One camera lane-line report as carried on the vehicle bus.
///
/// `params` holds the ten raw numeric fields, 1-based in the sensor's own
/// documentation (`params[0]` is param 1).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneLine {
    pub frame: u32,
    pub params: [f32; LINE_PARAMS],
}

impl LaneLine {
    /// Lateral offset of the line (param 2).
    pub fn offset(&self) -> f32 {
        self.params[1]
    }

    /// Detection confidence (param 4), 0 when the line is not seen.
    pub fn confidence(&self) -> f32 {
        self.params[3]
    }

    /// Bit-packed quality flags (param 6).
    pub fn quality_bits(&self) -> i64 {
        self.params[5] as i64
    }

    /// Packed confidence byte (param 8).
    pub fn confidence_byte(&self) -> i64 {
        self.params[7] as i64
    }

    /// Presence probability in [0, 1].
    pub fn probability(&self) -> f32 {
        (self.confidence() / 127.0).clamp(0.0, 1.0)
    }
}

/// One vehicle-rate telemetry message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CarState {
    pub v_ego: f32,
    pub long_accel: f32,
    pub steering_angle: f32,
    pub steering_rate: f32,
    pub steering_torque: f32,
    pub steering_torque_eps: f32,
    pub lateral_accel: f32,
    pub yaw_rate_can: f32,
    pub torque_request: f32,
    pub cruise_enabled: bool,
    pub cam_left: LaneLine,
    pub cam_far_left: LaneLine,
    pub cam_right: LaneLine,
    pub cam_far_right: LaneLine,
    pub can_time: u64,
    pub sys_time: u64,
}

/// Published lateral plan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPlan {
    pub angle_steers: f32,
    pub fast_angles: Vec<Vec<f32>>,
    pub lane_width: f32,
    pub angle_offset: f32,
    pub angle_bias: f32,
    pub model_index: usize,
    pub params_valid: bool,
    pub center_compensation: f32,
    pub c_poly: Vec<f32>,
    pub l_poly: Vec<f32>,
    pub r_poly: Vec<f32>,
    pub l_prob: f32,
    pub r_prob: f32,
    pub c_prob: f32,
    pub can_time: u64,
    pub sys_time: u64,
}

impl PathPlan {
    /// Empty readiness message sent once at startup.
    pub fn bootstrap() -> Self {
        Self::default()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.fast_angles.is_empty() && self.c_poly.is_empty()
    }
}

/// One-hot vehicle fingerprint fed to every model. Callers validate the
/// index; out-of-range values saturate to the last vehicle.
pub fn fingerprint(index: usize) -> [f32; FINGERPRINT_LEN] {
    let mut one_hot = [0.0; FINGERPRINT_LEN];
    one_hot[index.min(FINGERPRINT_LEN - 1)] = 1.0;
    one_hot
}

/// Combined probability that at least one lane line is present.
pub fn combined_probability(l_prob: f32, r_prob: f32) -> f32 {
    l_prob + r_prob - l_prob * r_prob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_clamped() {
        let mut line = LaneLine::default();
        line.params[3] = 254.0;
        assert_eq!(line.probability(), 1.0);
        line.params[3] = -5.0;
        assert_eq!(line.probability(), 0.0);
    }

    #[test]
    fn test_fingerprint_one_hot() {
        assert_eq!(fingerprint(2), [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(fingerprint(9), [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_car_state_json_names() {
        let json = r#"{"vEgo": 20.0, "steeringAngle": 1.5, "cruiseEnabled": true}"#;
        let cs: CarState = serde_json::from_str(json).unwrap();
        assert_eq!(cs.v_ego, 20.0);
        assert_eq!(cs.steering_angle, 1.5);
        assert!(cs.cruise_enabled);
    }
}
