//! Model slots and the per-cycle hysteresis selection between them.

use crate::calibration::CalibrationState;
use crate::error::{PlannerError, PlannerResult};
use crate::history::PreparedHistory;
use crate::inference::InferenceEngine;
use crate::trajectory::{project_angles, tri_blend, RawOutput};
use crate::tuning::Tuning;
use crate::types::{CarState, Row};
use log::{debug, info};

/// Projection inspected by the switch rule.
pub const REFERENCE_PROJECTION: usize = 10;
/// Row compared between slots.
pub const MAGNITUDE_ROW: usize = 6;
/// Row that must carry a confident alternate output.
pub const CONFIDENCE_ROW: usize = 8;

/// One model and the last output it produced.
pub struct ModelSlot {
    pub history_rows: usize,
    engine: Box<dyn InferenceEngine>,
    /// Bias-corrected angle projections; empty until the slot first runs.
    pub fast_angles: Vec<Row>,
    /// `[center, left, right]` after blending.
    pub lanes: [Row; 3],
}

impl ModelSlot {
    pub fn new(history_rows: usize, engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            history_rows,
            engine,
            fast_angles: Vec::new(),
            lanes: [Row::zeros(); 3],
        }
    }

    pub fn is_populated(&self) -> bool {
        !self.fast_angles.is_empty()
    }

    fn reference_cell(&self, row: usize) -> f32 {
        self.fast_angles
            .get(REFERENCE_PROJECTION)
            .map_or(0.0, |projection| projection[row])
    }
}

/// Per-cycle context shared by every slot run.
pub struct CycleInputs<'a> {
    pub history: &'a PreparedHistory,
    pub tuning: &'a Tuning,
    pub calibration: &'a CalibrationState,
    pub car_state: &'a CarState,
    pub l_prob: f32,
    pub r_prob: f32,
}

pub struct ModelArbitrator {
    slots: Vec<ModelSlot>,
    model_index: usize,
}

impl ModelArbitrator {
    pub fn new(slots: Vec<ModelSlot>) -> Self {
        Self {
            slots,
            model_index: 0,
        }
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [ModelSlot] {
        &mut self.slots
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn primary(&self) -> &ModelSlot {
        &self.slots[self.model_index]
    }

    pub fn max_history_rows(&self) -> usize {
        self.slots.iter().map(|s| s.history_rows).max().unwrap_or(0)
    }

    /// Index of the candidate that may challenge the primary.
    pub fn alternate_index(&self) -> usize {
        if self.model_index == 0 {
            1
        } else {
            0
        }
    }

    /// Run slot `index` and store its projections and lane triple.
    ///
    /// The primary is corrected by its learned model and center biases; an
    /// alternate run is stored uncorrected.
    fn run_slot(&mut self, index: usize, ctx: &CycleInputs, corrected: bool) -> PlannerResult<()> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| PlannerError::Inference(format!("no model slot {}", index)))?;

        let output = slot.engine.run(&ctx.history.inputs_for(slot.history_rows))?;
        let raw = RawOutput::from_tensor(&output)?;

        let mut angles = project_angles(
            &raw,
            ctx.tuning,
            ctx.calibration.baseline(),
            ctx.car_state.steering_angle,
        );
        let mut lanes = tri_blend(ctx.l_prob, ctx.r_prob, &raw.lanes, ctx.tuning.blend_mode);

        if corrected {
            if let Some(bias) = ctx.calibration.model_bias.get(index) {
                angles.iter_mut().for_each(|projection| *projection -= bias);
            }
            if let Some(bias) = ctx.calibration.center_bias.get(index) {
                lanes.iter_mut().for_each(|row| *row -= bias);
            }
        }

        slot.fast_angles = angles;
        slot.lanes = lanes;
        Ok(())
    }

    /// Run the current primary slot.
    pub fn run_primary(&mut self, ctx: &CycleInputs) -> PlannerResult<&ModelSlot> {
        let index = self.model_index;
        self.run_slot(index, ctx, true)?;
        Ok(&self.slots[index])
    }

    /// Run the alternate when it is the challenger, both lines are seen and
    /// it is inside the enabled model range.
    ///
    /// Returns whether it ran. A failed run leaves the slot's previous output
    /// in place.
    pub fn run_alternate(&mut self, ctx: &CycleInputs, lr_prob: f32) -> PlannerResult<bool> {
        let other = self.alternate_index();
        let enabled = other >= ctx.tuning.first_model && other <= ctx.tuning.last_model;
        if other != 1 || lr_prob <= 0.0 || !enabled || other >= self.slots.len() {
            return Ok(false);
        }
        self.run_slot(other, ctx, false)?;
        Ok(true)
    }

    /// Apply the switch rule once.
    ///
    /// When slot 1 has no output of the same shape as slot 0 it is mirrored
    /// from slot 0 and `ShapeMismatch` is returned with the index unchanged.
    pub fn arbitrate(
        &mut self,
        lr_prob: f32,
        model_factor: f32,
        calibrated: bool,
    ) -> PlannerResult<usize> {
        if self.slots.len() < 2 {
            return Ok(self.model_index);
        }

        let primary = self.slots[0].fast_angles.len();
        let alternate = self.slots[1].fast_angles.len();
        if primary != alternate {
            self.slots[1].fast_angles = self.slots[0].fast_angles.clone();
            return Err(PlannerError::ShapeMismatch { primary, alternate });
        }

        if lr_prob > 0.0 || self.model_index == 1 {
            let current = self.slots[0].reference_cell(MAGNITUDE_ROW).abs();
            let challenger = self.slots[1].reference_cell(MAGNITUDE_ROW).abs();
            let confident = (self.slots[1].reference_cell(CONFIDENCE_ROW).abs() * model_factor)
                as i64
                > 0;

            let switch = (current < challenger || self.model_index == 1) && confident && calibrated;
            let next = if switch { 1 } else { 0 };
            if next != self.model_index {
                info!("model switch {} -> {}", self.model_index, next);
            }
            self.model_index = next;
        } else {
            debug!("arbitration skipped: no lane confidence");
        }
        Ok(self.model_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationState;
    use crate::history::HistoryBuffers;
    use crate::inference::ModelInputs;
    use crate::types::{fingerprint, OUTPUT_ROWS, TRAILING_COLUMNS, VEHICLE_CHANNELS};
    use ndarray::Array3;
    use std::sync::{Arc, Mutex};

    /// Engine returning whatever value the test last scripted.
    struct ScriptedEngine {
        value: Arc<Mutex<f32>>,
        columns: usize,
    }

    impl InferenceEngine for ScriptedEngine {
        fn run(&mut self, _inputs: &ModelInputs) -> PlannerResult<Array3<f32>> {
            let value = *self.value.lock().unwrap();
            Ok(Array3::from_elem(
                (1, OUTPUT_ROWS, self.columns + TRAILING_COLUMNS),
                value,
            ))
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn run(&mut self, _inputs: &ModelInputs) -> PlannerResult<Array3<f32>> {
            Err(PlannerError::Inference("offline".into()))
        }
    }

    fn scripted(columns: usize) -> (Box<dyn InferenceEngine>, Arc<Mutex<f32>>) {
        let value = Arc::new(Mutex::new(0.0));
        let engine = ScriptedEngine {
            value: Arc::clone(&value),
            columns,
        };
        (Box::new(engine), value)
    }

    fn warm_history() -> HistoryBuffers {
        let mut history = HistoryBuffers::new(5);
        for _ in 0..40 {
            history.push_vehicle([0.0; VEHICLE_CHANNELS]);
        }
        history
    }

    struct Rig {
        arbitrator: ModelArbitrator,
        primary: Arc<Mutex<f32>>,
        alternate: Arc<Mutex<f32>>,
        history: HistoryBuffers,
        calibration: CalibrationState,
        tuning: Tuning,
        car_state: CarState,
    }

    impl Rig {
        fn new() -> Self {
            let (e0, primary) = scripted(12);
            let (e1, alternate) = scripted(12);
            Self {
                arbitrator: ModelArbitrator::new(vec![ModelSlot::new(2, e0), ModelSlot::new(5, e1)]),
                primary,
                alternate,
                history: warm_history(),
                calibration: CalibrationState::new(2),
                tuning: Tuning::new(2),
                car_state: CarState::default(),
            }
        }

        /// One primary + alternate + arbitration pass.
        fn cycle(&mut self, primary: f32, alternate: f32, calibrated: bool) -> usize {
            *self.primary.lock().unwrap() = primary;
            *self.alternate.lock().unwrap() = alternate;
            let prepared = self.history.prepare(&self.calibration, fingerprint(0)).unwrap();
            let ctx = CycleInputs {
                history: &prepared,
                tuning: &self.tuning,
                calibration: &self.calibration,
                car_state: &self.car_state,
                l_prob: 1.0,
                r_prob: 1.0,
            };
            self.arbitrator.run_primary(&ctx).unwrap();
            self.arbitrator.run_alternate(&ctx, 1.0).unwrap();
            self.arbitrator
                .arbitrate(1.0, self.tuning.model_factor, calibrated)
                .unwrap_or(self.arbitrator.model_index())
        }
    }

    #[test]
    fn test_switch_requires_advantage_and_calibration() {
        let mut rig = Rig::new();
        // alternate larger and confident but not calibrated
        assert_eq!(rig.cycle(1.0, 4.0, false), 0);
        // alternate weaker
        assert_eq!(rig.cycle(5.0, 4.0, true), 0);
        // alternate stronger
        assert_eq!(rig.cycle(1.0, 4.0, true), 1);
    }

    #[test]
    fn test_hysteresis_two_cycle_sequence() {
        let mut rig = Rig::new();
        assert_eq!(rig.cycle(1.0, 4.0, true), 1);

        // slot 1 is now primary; slot 0 keeps its previous output and the
        // alternate does not run, yet slot 1 stays in control
        rig.arbitrator.slots[0].fast_angles = vec![Row::repeat(9.0); 12];
        assert_eq!(rig.cycle(0.0, 4.0, true), 1);
    }

    #[test]
    fn test_exit_without_cooldown() {
        let mut rig = Rig::new();
        assert_eq!(rig.cycle(1.0, 4.0, true), 1);
        // confidence cell collapses: |0.5| * 0.5 truncates to zero
        assert_eq!(rig.cycle(0.0, 0.5, true), 0);
        // and it may come straight back on the following cycle
        assert_eq!(rig.cycle(1.0, 4.0, true), 1);
    }

    #[test]
    fn test_unpopulated_alternate_is_mirrored() {
        let (e0, _) = scripted(12);
        let mut arbitrator = ModelArbitrator::new(vec![
            ModelSlot::new(2, e0),
            ModelSlot::new(5, Box::new(FailingEngine)),
        ]);
        let history = warm_history();
        let calibration = CalibrationState::new(2);
        let prepared = history.prepare(&calibration, fingerprint(0)).unwrap();
        let tuning = Tuning::new(2);
        let car_state = CarState::default();
        let ctx = CycleInputs {
            history: &prepared,
            tuning: &tuning,
            calibration: &calibration,
            car_state: &car_state,
            l_prob: 1.0,
            r_prob: 1.0,
        };

        arbitrator.run_primary(&ctx).unwrap();
        assert!(arbitrator.run_alternate(&ctx, 1.0).is_err());
        assert_eq!(
            arbitrator.arbitrate(1.0, 0.5, true),
            Err(PlannerError::ShapeMismatch {
                primary: 12,
                alternate: 0
            })
        );
        assert_eq!(arbitrator.slots()[1].fast_angles, arbitrator.slots()[0].fast_angles);
        assert_eq!(arbitrator.model_index(), 0);
    }

    #[test]
    fn test_alternate_respects_model_range() {
        let mut rig = Rig::new();
        rig.tuning.last_model = 0;
        let prepared = rig.history.prepare(&rig.calibration, fingerprint(0)).unwrap();
        let ctx = CycleInputs {
            history: &prepared,
            tuning: &rig.tuning,
            calibration: &rig.calibration,
            car_state: &rig.car_state,
            l_prob: 1.0,
            r_prob: 1.0,
        };
        assert!(!rig.arbitrator.run_alternate(&ctx, 1.0).unwrap());
        assert!(!rig.arbitrator.slots()[1].is_populated());
    }

    #[test]
    fn test_primary_is_bias_corrected() {
        let mut rig = Rig::new();
        rig.calibration.model_bias[0] = Row::repeat(0.25);
        rig.calibration.center_bias[0] = Row::repeat(1.0);
        rig.calibration.model_bias[1] = Row::repeat(7.0);
        rig.cycle(2.0, 2.0, false);

        let slots = rig.arbitrator.slots();
        assert_eq!(slots[0].fast_angles[0][3], 1.75);
        assert_eq!(slots[0].lanes[1][0], 1.0);
        // alternate output is stored uncorrected
        assert_eq!(slots[1].fast_angles[0][3], 2.0);
    }
}
