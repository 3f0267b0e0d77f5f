//! Model output post-processing: angle projection, rate limiting and the
//! triangular lane blend.

use crate::error::{PlannerError, PlannerResult};
use crate::tuning::{BlendMode, Tuning};
use crate::types::{Row, OUTPUT_ROWS, TRAILING_COLUMNS};
use ndarray::Array3;

/// Weight cap for the minimizing blends.
const BLEND_WEIGHT_CAP: f32 = 500.0;
/// Row used as the start of the curvature measure.
const CURVE_START_ROW: usize = 4;
/// Seconds between projected rows of the kinematic clamp.
const PROJECTION_STEP: f32 = 0.006_666_6;

/// One model run split into angle projections and the lane triple.
#[derive(Clone, Debug, PartialEq)]
pub struct RawOutput {
    /// One `Row` per angle column.
    pub angles: Vec<Row>,
    /// `[center, left, right]`.
    pub lanes: [Row; 3],
}

impl RawOutput {
    /// Split a `[1, OUTPUT_ROWS, angles + TRAILING_COLUMNS]` tensor.
    ///
    /// The lane triple is read with stride 3 from the first trailing column.
    pub fn from_tensor(tensor: &Array3<f32>) -> PlannerResult<Self> {
        let (batch, rows, cols) = tensor.dim();
        if batch < 1 || rows != OUTPUT_ROWS || cols <= TRAILING_COLUMNS {
            return Err(PlannerError::InvalidModelOutput { rows, cols });
        }
        let angle_count = cols - TRAILING_COLUMNS;
        let column = |c: usize| Row::from_fn(|r, _| tensor[[0, r, c]]);

        Ok(Self {
            angles: (0..angle_count).map(column).collect(),
            lanes: [
                column(angle_count),
                column(angle_count + 3),
                column(angle_count + 6),
            ],
        })
    }
}

/// Turn raw angle columns into absolute steering-angle projections.
///
/// Discrete mode scales the model's absolute angles and anchors them at the
/// calibrated baseline; relative mode scales the model's change from its own
/// first row and anchors it at the measured angle.
pub fn project_angles(
    raw: &RawOutput,
    tuning: &Tuning,
    baseline: f32,
    steering_angle: f32,
) -> Vec<Row> {
    raw.angles
        .iter()
        .map(|column| {
            if tuning.discrete_angle {
                column * tuning.angle_factor + Row::repeat(baseline)
            } else {
                let gain = tuning.angle_factor * tuning.advance_steer;
                column.map(|v| gain * (v - column[0]) + steering_angle)
            }
        })
        .collect()
}

/// Elementwise `clip(values, center - limit, center + limit)`.
pub fn clamp_around(values: &Row, center: &Row, limit: &Row) -> Row {
    values.zip_zip_map(center, limit, |v, c, l| v.max(c - l).min(c + l))
}

/// Short-horizon linear projection of the current angle and rate.
pub fn projected_steering(steering_angle: f32, steering_rate: f32) -> Row {
    Row::from_fn(|i, _| steering_angle + steering_rate * PROJECTION_STEP * (i + 1) as f32)
}

/// Continuity and kinematic clamps over successive plans.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    previous: Vec<Row>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last limited plan.
    pub fn previous(&self) -> &[Row] {
        &self.previous
    }

    /// Clamp `angles` to the previous plan, then to the kinematic projection,
    /// both within the per-row `limit` envelope.
    pub fn limit(&mut self, angles: &[Row], projection: &Row, limit: &Row) -> Vec<Row> {
        let plan: Vec<Row> = angles
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let previous = self.previous.get(i).copied().unwrap_or_else(Row::zeros);
                let continuous = clamp_around(column, &previous, limit);
                clamp_around(&continuous, projection, limit)
            })
            .collect();
        self.previous = plan.clone();
        plan
    }
}

/// Blend a `[center, left, right]` triple using line-presence probabilities.
///
/// Returns `[blended center, left, right]` with the left/right rows passed
/// through unchanged.
pub fn tri_blend(l_prob: f32, r_prob: f32, lanes: &[Row; 3], mode: BlendMode) -> [Row; 3] {
    let [center, left_value, right_value] = lanes;
    let left = left_value * l_prob + center * (1.0 - l_prob);
    let right = right_value * r_prob + center * (1.0 - r_prob);

    let weights = match mode {
        BlendMode::Linear => None,
        BlendMode::MinimizeMagnitude => Some((
            left.abs().sum().clamp(0.0, BLEND_WEIGHT_CAP),
            right.abs().sum().clamp(0.0, BLEND_WEIGHT_CAP),
        )),
        BlendMode::MinimizeCurvature => Some((
            (left[OUTPUT_ROWS - 1] - left[CURVE_START_ROW]).clamp(0.0, BLEND_WEIGHT_CAP),
            (right[CURVE_START_ROW] - right[OUTPUT_ROWS - 1]).clamp(0.0, BLEND_WEIGHT_CAP),
        )),
    };

    // each side is weighted by the other side's measure
    let blended = match weights {
        Some((w_left, w_right)) if w_left + w_right > 0.0 => {
            (left * w_right + right * w_left) / (w_left + w_right)
        }
        _ => (left + right) * 0.5,
    };

    [blended, *left_value, *right_value]
}
