//! Model invocation seam.
//!
//! Each model slot owns one engine. The planner never sees the backend; it
//! hands over batched history tensors and gets back one
//! `[1, OUTPUT_ROWS, angles + TRAILING_COLUMNS]` output tensor.

use crate::error::{PlannerError, PlannerResult};
use crate::types::{FINGERPRINT_LEN, LINE_BLOCK, OUTPUT_ROWS, TRAILING_COLUMNS};
use log::debug;
use ndarray::{Array3, Axis};

/// Batched inputs for one model run. Every tensor is `[1, rows, channels]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInputs {
    pub vehicle: Array3<f32>,
    pub camera_vehicle: Array3<f32>,
    pub lane_packed: Array3<f32>,
    pub lane_unpacked: Array3<f32>,
    pub fingerprint: [f32; FINGERPRINT_LEN],
}

impl ModelInputs {
    /// Newest row of a `[1, rows, channels]` tensor.
    fn newest(tensor: &Array3<f32>, channel: usize) -> f32 {
        let rows = tensor.len_of(Axis(1));
        if rows == 0 || channel >= tensor.len_of(Axis(2)) {
            return 0.0;
        }
        tensor[[0, rows - 1, channel]]
    }
}

pub trait InferenceEngine: Send {
    fn run(&mut self, inputs: &ModelInputs) -> PlannerResult<Array3<f32>>;
}

/// Backend-free engine that extrapolates the current state.
///
/// Every angle column repeats the newest debiased steering channel, and the
/// lane triple is built from the newest left/right line offsets. Used for
/// replay runs without trained weights.
pub struct PassthroughEngine {
    angle_columns: usize,
}

/// Vehicle-rate channel holding the scaled steering angle.
const ANGLE_CHANNEL: usize = 1;
/// Offset column of the left and right blocks in the unpacked lane row.
const LEFT_OFFSET: usize = 2 * LINE_BLOCK + 1;
const RIGHT_OFFSET: usize = 3 * LINE_BLOCK + 1;

impl PassthroughEngine {
    pub fn new(angle_columns: usize) -> PlannerResult<Self> {
        if angle_columns == 0 {
            return Err(PlannerError::InvalidModelOutput {
                rows: OUTPUT_ROWS,
                cols: TRAILING_COLUMNS,
            });
        }
        Ok(Self { angle_columns })
    }
}

impl InferenceEngine for PassthroughEngine {
    fn run(&mut self, inputs: &ModelInputs) -> PlannerResult<Array3<f32>> {
        let angle = ModelInputs::newest(&inputs.vehicle, ANGLE_CHANNEL);
        let left = ModelInputs::newest(&inputs.lane_unpacked, LEFT_OFFSET);
        let right = ModelInputs::newest(&inputs.lane_unpacked, RIGHT_OFFSET);
        let center = 0.5 * (left + right);
        let asc = self.angle_columns;

        debug!("passthrough run: angle {:.2} left {:.1} right {:.1}", angle, left, right);

        Ok(Array3::from_shape_fn(
            (1, OUTPUT_ROWS, asc + TRAILING_COLUMNS),
            |(_, _, c)| match c {
                c if c < asc => angle,
                c if c == asc => center,
                c if c == asc + 3 => left,
                c if c == asc + 6 => right,
                _ => 0.0,
            },
        ))
    }
}
