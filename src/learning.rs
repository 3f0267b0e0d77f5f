//! Slow online adaptation of the plan biases and the lane width estimate.
//!
//! Learning only happens while the driver is hands-off and the plan is being
//! followed. Strong driver counter-torque against the plan freezes it for a
//! fixed number of cycles instead of teaching it the wrong direction.

use crate::arbitration::{ModelArbitrator, REFERENCE_PROJECTION};
use crate::calibration::CalibrationState;
use crate::decoder::{MAX_LANE_WIDTH, MIN_LANE_WIDTH};
use crate::types::{CarState, Row};
use log::debug;

/// Driver torque above which a sign conflict counts as an override.
pub const OVERRIDE_TORQUE: f32 = 300.0;
/// Cycles learning stays frozen after an override.
pub const SUPPRESSION_CYCLES: i32 = 45;

const MAX_RATE: f32 = 3.0;
const MAX_ANGLE_DEVIATION: f32 = 3.0;
const MIN_SPEED: f32 = 10.0;
const ANGLE_BIAS_STEP: f32 = 0.000_01;
const MODEL_BIAS_STEP: f32 = 0.000_001;
const WIDTH_STEP: f32 = 0.05;
const TRIM_WIDEN: f32 = 0.5;
const TRIM_NARROW: f32 = 1.0;
const TRIM_MIN: f32 = -200.0;
const TRIM_MAX: f32 = 100.0;
/// Center row whose sign the driver torque is compared against.
const TORQUE_SIGN_ROW: usize = 3;

/// Move the lane width toward the measured line separation.
///
/// The per-cycle step scales with speed and both line probabilities. The
/// estimate may shrink by up to two steps, grow by up to one, and never leaves
/// `[MIN_LANE_WIDTH, MAX_LANE_WIDTH]` on the way up or drops below the floor.
pub fn track_lane_width(width: f32, cs: &CarState, l_prob: f32, r_prob: f32) -> f32 {
    let step = WIDTH_STEP * cs.v_ego * l_prob * r_prob;
    let measured = cs.cam_left.offset() - cs.cam_right.offset();
    MIN_LANE_WIDTH
        .max(width - 2.0 * step)
        .max(MAX_LANE_WIDTH.min(width + step).min(measured))
}

/// What a learning pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LearningOutcome {
    Nudged,
    OverrideDetected,
    Idle,
}

/// Inputs read by one learning pass.
pub struct LearningInputs<'a> {
    pub car_state: &'a CarState,
    /// Blended center published this cycle.
    pub use_center: &'a Row,
    pub l_prob: f32,
    pub r_prob: f32,
    pub lr_prob: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BiasLearner {
    override_timer: i32,
    width_trim: f32,
    override_torque: f32,
    suppression_cycles: i32,
}

impl Default for BiasLearner {
    fn default() -> Self {
        Self::new(OVERRIDE_TORQUE, SUPPRESSION_CYCLES)
    }
}

impl BiasLearner {
    pub fn new(override_torque: f32, suppression_cycles: i32) -> Self {
        Self {
            override_timer: 0,
            width_trim: 0.0,
            override_torque,
            suppression_cycles,
        }
    }

    pub fn width_trim(&self) -> f32 {
        self.width_trim
    }

    pub fn override_timer(&self) -> i32 {
        self.override_timer
    }

    pub fn is_suppressed(&self) -> bool {
        self.override_timer >= 0
    }

    /// Hands-off, confident, tracking.
    fn eligible(&self, input: &LearningInputs, baseline: f32, slot_center: &Row) -> bool {
        let cs = input.car_state;
        let torque_agrees = (cs.steering_torque < 0.0) == (slot_center[TORQUE_SIGN_ROW] < 0.0);
        !self.is_suppressed()
            && cs.steering_rate.abs() < MAX_RATE
            && (cs.steering_angle - baseline).abs() < MAX_ANGLE_DEVIATION
            && cs.torque_request != 0.0
            && input.l_prob > 0.0
            && input.r_prob > 0.0
            && cs.v_ego > MIN_SPEED
            && (cs.steering_torque.abs() < self.override_torque || torque_agrees)
    }

    /// One learning pass, run after arbitration.
    pub fn step(
        &mut self,
        input: &LearningInputs,
        arbitrator: &ModelArbitrator,
        calibration: &mut CalibrationState,
    ) -> LearningOutcome {
        self.override_timer = (self.override_timer - 1).max(-1);

        if arbitrator.model_index() != 0 {
            return LearningOutcome::Idle;
        }
        let cs = input.car_state;
        let slots = arbitrator.slots();
        let [slot_center, slot_left, slot_right] = slots[0].lanes;

        if self.eligible(input, calibration.baseline(), &slot_center) {
            let speed_step = ANGLE_BIAS_STEP * cs.v_ego;
            if input.use_center[0] > 0.0 {
                calibration.angle_bias += speed_step;
            } else if input.use_center[0] < 0.0 {
                calibration.angle_bias -= speed_step;
            }

            if slots.len() > 1 {
                let gain = MODEL_BIAS_STEP * cs.v_ego * input.lr_prob;
                for (index, slot) in slots.iter().enumerate() {
                    if let (Some(bias), Some(reference)) = (
                        calibration.model_bias.get_mut(index),
                        slot.fast_angles.get(REFERENCE_PROJECTION),
                    ) {
                        *bias += reference * gain;
                    }
                    if let Some(bias) = calibration.center_bias.get_mut(index) {
                        *bias += slot.lanes[0].add_scalar(-input.use_center[0]) * gain;
                    }
                }
            }

            // widening and narrowing steps differ and the trim never goes positive
            if slot_left[0] > slot_right[0] {
                self.width_trim += TRIM_WIDEN;
            } else {
                self.width_trim -= TRIM_NARROW;
            }
            self.width_trim = TRIM_MAX.min(TRIM_MIN.max(self.width_trim.min(0.0)));
            LearningOutcome::Nudged
        } else if cs.steering_torque.abs() > self.override_torque
            && (cs.steering_torque < 0.0) != (slot_center[TORQUE_SIGN_ROW] < 0.0)
        {
            debug!(
                "driver override ({:.0}), learning frozen for {} cycles",
                cs.steering_torque, self.suppression_cycles
            );
            self.override_timer = self.suppression_cycles;
            LearningOutcome::OverrideDetected
        } else {
            LearningOutcome::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::ModelSlot;
    use crate::error::PlannerResult;
    use crate::inference::{InferenceEngine, ModelInputs};
    use crate::types::LaneLine;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    struct IdleEngine;

    impl InferenceEngine for IdleEngine {
        fn run(&mut self, _inputs: &ModelInputs) -> PlannerResult<Array3<f32>> {
            Ok(Array3::zeros((1, 15, 19)))
        }
    }

    /// Two slots whose outputs are set directly.
    fn arbitrator(center: f32, left: f32, right: f32) -> ModelArbitrator {
        let mut arbitrator = ModelArbitrator::new(vec![
            ModelSlot::new(2, Box::new(IdleEngine)),
            ModelSlot::new(5, Box::new(IdleEngine)),
        ]);
        let lanes = [Row::repeat(center), Row::repeat(left), Row::repeat(right)];
        for slot in arbitrator.slots_mut() {
            slot.fast_angles = vec![Row::repeat(2.0); 12];
            slot.lanes = lanes;
        }
        arbitrator
    }

    fn line(offset: f32) -> LaneLine {
        let mut params = [0.0; 10];
        params[1] = offset;
        params[3] = 127.0;
        LaneLine { frame: 1, params }
    }

    fn hands_off() -> CarState {
        CarState {
            v_ego: 20.0,
            torque_request: 1.0,
            steering_torque: 10.0,
            cam_left: line(900.0),
            cam_right: line(-900.0),
            ..Default::default()
        }
    }

    fn inputs<'a>(cs: &'a CarState, center: &'a Row) -> LearningInputs<'a> {
        LearningInputs {
            car_state: cs,
            use_center: center,
            l_prob: 1.0,
            r_prob: 1.0,
            lr_prob: 1.0,
        }
    }

    #[test]
    fn test_nudges_when_eligible() {
        let arbitrator = arbitrator(5.0, 1.0, -1.0);
        let mut calibration = CalibrationState::new(2);
        let mut learner = BiasLearner::default();
        let cs = hands_off();
        let center = Row::repeat(5.0);

        assert_eq!(
            learner.step(&inputs(&cs, &center), &arbitrator, &mut calibration),
            LearningOutcome::Nudged
        );
        assert_abs_diff_eq!(calibration.angle_bias, 20.0 * 1e-5, epsilon = 1e-9);
        assert_abs_diff_eq!(calibration.model_bias[1][0], 1e-6 * 20.0 * 2.0, epsilon = 1e-9);
        // slot center equals the published center, so no center residual
        assert_eq!(calibration.center_bias[0], Row::zeros());
    }

    #[test]
    fn test_override_suppresses_for_exactly_45_cycles() {
        let arbitrator = arbitrator(5.0, 1.0, -1.0);
        let mut calibration = CalibrationState::new(2);
        let mut learner = BiasLearner::default();
        let center = Row::repeat(5.0);

        let mut opposing = hands_off();
        opposing.steering_torque = -400.0;
        assert_eq!(
            learner.step(&inputs(&opposing, &center), &arbitrator, &mut calibration),
            LearningOutcome::OverrideDetected
        );

        let cs = hands_off();
        for cycle in 1..=45 {
            assert_eq!(
                learner.step(&inputs(&cs, &center), &arbitrator, &mut calibration),
                LearningOutcome::Idle,
                "cycle {} should be suppressed",
                cycle
            );
        }
        assert_eq!(calibration.angle_bias, 0.0);
        assert_eq!(
            learner.step(&inputs(&cs, &center), &arbitrator, &mut calibration),
            LearningOutcome::Nudged
        );
    }

    #[test]
    fn test_agreeing_torque_is_not_override() {
        let arbitrator = arbitrator(5.0, 1.0, -1.0);
        let mut calibration = CalibrationState::new(2);
        let mut learner = BiasLearner::default();
        let center = Row::repeat(5.0);

        let mut cs = hands_off();
        cs.steering_torque = 400.0;
        assert_eq!(
            learner.step(&inputs(&cs, &center), &arbitrator, &mut calibration),
            LearningOutcome::Nudged
        );
    }

    #[test]
    fn test_no_learning_on_alternate_model() {
        let mut arbitrator = arbitrator(5.0, 1.0, -1.0);
        arbitrator.slots_mut()[1].fast_angles = vec![Row::repeat(4.0); 12];
        let _ = arbitrator.arbitrate(1.0, 1.0, true);
        assert_eq!(arbitrator.model_index(), 1);

        let mut calibration = CalibrationState::new(2);
        let mut learner = BiasLearner::default();
        let cs = hands_off();
        let center = Row::repeat(5.0);
        assert_eq!(
            learner.step(&inputs(&cs, &center), &arbitrator, &mut calibration),
            LearningOutcome::Idle
        );
    }

    /// Observed behavior: widening steps are half the narrowing steps and the
    /// trim is forced non-positive, so it can only ratchet back toward zero.
    #[test]
    fn test_width_trim_one_sided_ratchet() {
        let mut calibration = CalibrationState::new(2);
        let mut learner = BiasLearner::default();
        let cs = hands_off();
        let center = Row::repeat(5.0);

        let narrowing = arbitrator(5.0, -1.0, 1.0);
        for _ in 0..3 {
            learner.step(&inputs(&cs, &center), &narrowing, &mut calibration);
        }
        assert_eq!(learner.width_trim(), -3.0);

        let widening = arbitrator(5.0, 1.0, -1.0);
        learner.step(&inputs(&cs, &center), &widening, &mut calibration);
        assert_eq!(learner.width_trim(), -2.5);
        for _ in 0..10 {
            learner.step(&inputs(&cs, &center), &widening, &mut calibration);
        }
        assert_eq!(learner.width_trim(), 0.0);

        for _ in 0..500 {
            learner.step(&inputs(&cs, &center), &narrowing, &mut calibration);
        }
        assert_eq!(learner.width_trim(), -200.0);
    }

    #[test]
    fn test_lane_width_floor_and_step_cap() {
        let mut cs = hands_off();
        cs.cam_left = line(200.0);
        cs.cam_right = line(-200.0);
        let width = track_lane_width(MIN_LANE_WIDTH, &cs, 1.0, 1.0);
        assert_eq!(width, MIN_LANE_WIDTH);

        let step = WIDTH_STEP * cs.v_ego;
        let wide = track_lane_width(1000.0, &cs, 1.0, 1.0);
        assert!(wide >= 1000.0 - 2.0 * step);
        assert!((1000.0 - wide) <= 2.0 * step);
    }

    #[test]
    fn test_lane_width_grows_by_one_step() {
        let cs = hands_off();
        let width = track_lane_width(1000.0, &cs, 1.0, 1.0);
        assert_eq!(width, 1000.0 + WIDTH_STEP * 20.0);
        // no confidence, no movement
        assert_eq!(track_lane_width(1000.0, &cs, 0.0, 1.0), 1000.0);
        assert_eq!(track_lane_width(1690.0, &cs, 1.0, 1.0), 1691.0);
        assert_eq!(track_lane_width(1700.0, &cs, 1.0, 1.0), 1700.0);
    }
}
