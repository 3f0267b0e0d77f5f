//! One plan cycle: ingest telemetry, run the models, publish, then arbitrate,
//! learn and persist.

use crate::arbitration::{CycleInputs, ModelArbitrator, ModelSlot};
use crate::bus::PlanSink;
use crate::calibration::{update_allowed, CalibrationState, ParamStore, CALIBRATION_KEY};
use crate::decoder::{vehicle_row, SignalDecoder, MIN_ROW_SPEED};
use crate::error::{PlannerError, PlannerResult};
use crate::history::HistoryBuffers;
use crate::inference::InferenceEngine;
use crate::learning::{
    track_lane_width, BiasLearner, LearningInputs, OVERRIDE_TORQUE, SUPPRESSION_CYCLES,
};
use crate::status::{current_timestamp, CycleTimer, PlannerStatus};
use crate::trajectory::{projected_steering, RateLimiter};
use crate::tuning::{Tuning, TuningSource};
use crate::types::{
    combined_probability, fingerprint, CarState, PathPlan, Row, FINGERPRINT_LEN,
};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Plan row reported as the immediate steering command.
const ANGLE_STEERS_ROW: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Camera frames consumed by each model slot.
    pub history_rows: Vec<usize>,
    /// Vehicle fingerprint index for the one-hot model input.
    pub fingerprint: usize,
    pub calibration_key: String,
    /// Accumulated speed between calibration saves.
    pub save_distance: f64,
    pub status_period: u64,
    pub tuning_period: u64,
    pub override_torque: f32,
    pub suppression_cycles: i32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            history_rows: vec![2, 5],
            fingerprint: 0,
            calibration_key: CALIBRATION_KEY.to_string(),
            save_distance: 133_000.0,
            status_period: 60,
            tuning_period: 100,
            override_torque: OVERRIDE_TORQUE,
            suppression_cycles: SUPPRESSION_CYCLES,
        }
    }
}

/// Everything the loop carries from one cycle to the next.
pub struct ControlLoopState {
    pub decoder: SignalDecoder,
    pub history: HistoryBuffers,
    pub calibration: CalibrationState,
    pub arbitrator: ModelArbitrator,
    pub learner: BiasLearner,
    pub rate_limiter: RateLimiter,
    pub tuning: Tuning,
    pub frame: u64,
    pub plans_published: u64,
    pub distance_driven: f64,
    pub next_save_distance: f64,
    pub timer: CycleTimer,
    last_probabilities: (f32, f32),
    last_offsets: (f32, f32),
}

pub struct Planner {
    config: PlannerConfig,
    state: ControlLoopState,
    store: Arc<dyn ParamStore>,
    tuning_source: Option<TuningSource>,
}

impl Planner {
    /// Build a planner with one engine per configured slot.
    ///
    /// Calibration is loaded from `store`; the tuning file, when given, is
    /// read once up front.
    pub fn new(
        config: PlannerConfig,
        engines: Vec<Box<dyn InferenceEngine>>,
        store: Arc<dyn ParamStore>,
        tuning_source: Option<TuningSource>,
    ) -> PlannerResult<Self> {
        if engines.is_empty() || engines.len() != config.history_rows.len() {
            return Err(PlannerError::Inference(format!(
                "{} engines for {} model slots",
                engines.len(),
                config.history_rows.len()
            )));
        }

        if config.fingerprint >= FINGERPRINT_LEN {
            return Err(PlannerError::Config(format!(
                "fingerprint {} out of range, expected 0..{}",
                config.fingerprint, FINGERPRINT_LEN
            )));
        }

        let slots: Vec<ModelSlot> = config
            .history_rows
            .iter()
            .zip(engines)
            .map(|(&rows, engine)| ModelSlot::new(rows, engine))
            .collect();
        let slot_count = slots.len();
        let arbitrator = ModelArbitrator::new(slots);

        let mut tuning = Tuning::new(slot_count);
        let mut tuning_source = tuning_source;
        if let Some(source) = tuning_source.as_mut() {
            if let Err(e) = source.refresh(&mut tuning, slot_count) {
                warn!("Using default tuning: {}", e);
            }
        }

        let state = ControlLoopState {
            decoder: SignalDecoder::new(),
            history: HistoryBuffers::new(arbitrator.max_history_rows()),
            calibration: CalibrationState::load(store.as_ref(), &config.calibration_key, slot_count),
            arbitrator,
            learner: BiasLearner::new(config.override_torque, config.suppression_cycles),
            rate_limiter: RateLimiter::new(),
            tuning,
            frame: 0,
            plans_published: 0,
            distance_driven: 0.0,
            next_save_distance: config.save_distance,
            timer: CycleTimer::new(),
            last_probabilities: (0.0, 0.0),
            last_offsets: (0.0, 0.0),
        };

        Ok(Self {
            config,
            state,
            store,
            tuning_source,
        })
    }

    pub fn state(&self) -> &ControlLoopState {
        &self.state
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Push one telemetry message into the history buffers.
    fn ingest(&mut self, cs: &CarState) {
        let state = &mut self.state;
        state.history.push_vehicle(vehicle_row(cs, &state.tuning));

        let lane_width = state.calibration.lane_width + state.learner.width_trim();
        match state.decoder.decode(cs, &state.tuning, lane_width) {
            Ok(frame) => state.history.push_frame(frame),
            Err(e) => trace!("{}", e),
        }
    }

    /// Run one plan cycle over every message received since the last wake.
    ///
    /// The plan is published to `sink` as soon as the primary model has run;
    /// arbitration, learning and persistence follow. Returns the published
    /// plan, or `None` while history is still filling or the primary model
    /// failed.
    pub fn step(&mut self, batch: &[CarState], sink: &mut dyn PlanSink) -> Option<PathPlan> {
        let started = Instant::now();
        let cs = batch.last()?;
        for sample in batch {
            self.ingest(sample);
        }

        let l_prob = cs.cam_left.probability();
        let r_prob = cs.cam_right.probability();
        let lr_prob = combined_probability(l_prob, r_prob);
        self.state.last_probabilities = (l_prob, r_prob);
        self.state.last_offsets = (cs.cam_left.offset(), cs.cam_right.offset());

        let state = &mut self.state;
        let prepared = match state
            .history
            .prepare(&state.calibration, fingerprint(self.config.fingerprint))
        {
            Ok(prepared) => prepared,
            Err(e) => {
                trace!("{}", e);
                return None;
            }
        };

        let ctx = CycleInputs {
            history: &prepared,
            tuning: &state.tuning,
            calibration: &state.calibration,
            car_state: cs,
            l_prob,
            r_prob,
        };

        let primary = match state.arbitrator.run_primary(&ctx) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Primary inference failed: {}", e);
                return None;
            }
        };
        let projection = projected_steering(cs.steering_angle, cs.steering_rate);
        let angle_plan =
            state
                .rate_limiter
                .limit(&primary.fast_angles, &projection, &state.tuning.accel_limit);
        let lanes = primary.lanes;

        let plan = assemble_plan(PlanParts {
            car_state: cs,
            angle_plan: &angle_plan,
            lanes: &lanes,
            calibration: &state.calibration,
            width_trim: state.learner.width_trim(),
            model_index: state.arbitrator.model_index(),
            l_prob,
            r_prob,
        });
        match sink.publish(&plan) {
            Ok(()) => state.plans_published += 1,
            Err(e) => warn!("Plan publish failed: {}", e),
        }

        match state.arbitrator.run_alternate(&ctx, lr_prob) {
            Ok(ran) => trace!("alternate ran: {}", ran),
            Err(e) => warn!("Alternate inference failed: {}", e),
        }
        if let Err(e) = state.arbitrator.arbitrate(
            lr_prob,
            state.tuning.model_factor,
            state.calibration.calibrated,
        ) {
            debug!("{}, alternate mirrored from primary", e);
        }

        state.calibration.lane_width =
            track_lane_width(state.calibration.lane_width, cs, l_prob, r_prob);

        let use_center = lanes[0];
        state.learner.step(
            &LearningInputs {
                car_state: cs,
                use_center: &use_center,
                l_prob,
                r_prob,
                lr_prob,
            },
            &state.arbitrator,
            &mut state.calibration,
        );

        state.frame += 1;
        state.distance_driven += f64::from(cs.v_ego);

        if update_allowed(cs, state.calibration.baseline(), l_prob, r_prob) {
            if let (Some(vehicle), Some(camera_vehicle), Some(unpacked)) = (
                state.history.latest_vehicle(),
                state.history.latest_camera_vehicle(),
                state.history.latest_unpacked(),
            ) {
                state.calibration.update(cs, vehicle, camera_vehicle, unpacked);
            }
        }

        if self.config.status_period > 0 && self.state.frame % self.config.status_period == 0 {
            self.log_status(&use_center);
        }
        self.persist_if_due(cs);
        if self.config.tuning_period > 0 && self.state.frame % self.config.tuning_period == 0 {
            self.refresh_tuning();
        }

        self.state
            .timer
            .record(started.elapsed().as_secs_f64() * 1000.0);
        Some(plan)
    }

    fn log_status(&self, center: &Row) {
        let state = &self.state;
        let (l_prob, r_prob) = state.last_probabilities;
        let (l_offset, r_offset) = state.last_offsets;
        info!(
            "lane_width: {:.1} angle bias: {:.2} distance_driven: {:.2} center: {:.1} l_prob: {:.2} r_prob: {:.2} l_offset: {:.2} r_offset: {:.2} cycle time: {:.4}s",
            state.calibration.lane_width,
            state.calibration.angle_bias,
            state.distance_driven,
            center[0],
            l_prob,
            r_prob,
            l_offset,
            r_offset,
            0.001 * state.timer.average_ms(),
        );
    }

    /// Save calibration once enough distance has accumulated and the car is
    /// parked, or immediately when nothing was ever saved.
    fn persist_if_due(&mut self, cs: &CarState) {
        let state = &mut self.state;
        let parked = cs.v_ego < MIN_ROW_SPEED && !cs.cruise_enabled;
        if state.distance_driven <= state.next_save_distance
            || !(parked || !state.calibration.calibrated)
        {
            return;
        }

        state.next_save_distance = state.distance_driven + self.config.save_distance;
        let background = state.calibration.calibrated;
        match state
            .calibration
            .save(self.store.as_ref(), &self.config.calibration_key, background)
        {
            Ok(()) => info!(
                "Calibration saved at {:.0} ({})",
                state.distance_driven,
                if background { "background" } else { "first save" }
            ),
            Err(e) => warn!("Calibration save failed: {}", e),
        }
        state.calibration.calibrated = true;
    }

    fn refresh_tuning(&mut self) {
        let slot_count = self.state.arbitrator.slot_count();
        if let Some(source) = self.tuning_source.as_mut() {
            match source.refresh(&mut self.state.tuning, slot_count) {
                Ok(true) => info!("Tuning reloaded from {}", source.path().display()),
                Ok(false) => {}
                Err(e) => warn!("Keeping previous tuning: {}", e),
            }
        }
    }

    /// Synchronous save used on shutdown.
    pub fn save_calibration(&self) -> PlannerResult<()> {
        self.state
            .calibration
            .save(self.store.as_ref(), &self.config.calibration_key, false)
    }

    pub fn status(&self) -> PlannerStatus {
        let state = &self.state;
        let (l_prob, r_prob) = state.last_probabilities;
        let (l_offset, r_offset) = state.last_offsets;
        PlannerStatus {
            timestamp: current_timestamp(),
            frames: state.frame,
            plans_published: state.plans_published,
            distance_driven: state.distance_driven,
            calibrated: state.calibration.calibrated,
            lane_width: state.calibration.lane_width,
            width_trim: state.learner.width_trim(),
            angle_bias: state.calibration.angle_bias,
            angle_offset: state.calibration.baseline(),
            model_index: state.arbitrator.model_index(),
            override_timer: state.learner.override_timer(),
            l_prob,
            r_prob,
            center: state.arbitrator.primary().lanes[0][0],
            l_offset,
            r_offset,
            avg_cycle_ms: state.timer.average_ms(),
        }
    }
}

struct PlanParts<'a> {
    car_state: &'a CarState,
    angle_plan: &'a [Row],
    lanes: &'a [Row; 3],
    calibration: &'a CalibrationState,
    width_trim: f32,
    model_index: usize,
    l_prob: f32,
    r_prob: f32,
}

fn assemble_plan(parts: PlanParts) -> PathPlan {
    let cal = parts.calibration;
    let half_width = 0.5 * cal.lane_width;
    let to_vec = |row: &Row| row.iter().copied().collect::<Vec<f32>>();

    PathPlan {
        angle_steers: parts
            .angle_plan
            .first()
            .map_or(0.0, |projection| projection[ANGLE_STEERS_ROW]),
        fast_angles: parts
            .angle_plan
            .iter()
            .map(|projection| to_vec(&projection.add_scalar(cal.angle_bias)))
            .collect(),
        lane_width: cal.lane_width + parts.width_trim,
        angle_offset: cal.baseline(),
        angle_bias: cal.angle_bias,
        model_index: parts.model_index,
        params_valid: cal.calibrated,
        center_compensation: 0.0,
        c_poly: to_vec(&parts.lanes[0]),
        l_poly: to_vec(&parts.lanes[1].add_scalar(half_width)),
        r_poly: to_vec(&parts.lanes[2].add_scalar(-half_width)),
        l_prob: parts.l_prob,
        r_prob: parts.r_prob,
        c_prob: combined_probability(parts.l_prob, parts.r_prob),
        can_time: parts.car_state.can_time,
        sys_time: parts.car_state.sys_time,
    }
}
