//! Online calibration state and its persisted form.
//!
//! Channel biases follow one-pole filters whose gain grows with speed and is
//! capped per channel. The whole state round-trips through a JSON blob kept in
//! a key/value [`ParamStore`]; a missing or mismatched blob resets everything
//! to zero and marks the session uncalibrated.

use crate::error::{PlannerError, PlannerResult};
use crate::types::{
    CarState, Row, CALIBRATION_LEN, CAMERA_VEHICLE_CAL_LEN, CAMERA_VEHICLE_CAL_MASK, LANE_CAL_LEN,
    LANE_CAL_MASK, LANE_CHANNELS, LINE_BLOCK, OUTPUT_ROWS, VEHICLE_CAL_LEN, VEHICLE_CAL_MASK,
};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

pub const CALIBRATION_KEY: &str = "CalibrationParams";
const SPEED_GAIN: f32 = 0.000_01;
const GATE_MIN_SPEED: f32 = 10.0;
const GATE_MAX_ANGLE_DEVIATION: f32 = 3.0;
const GATE_MAX_RATE: f32 = 3.0;

/// Persisted calibration blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBlob {
    pub calibration: Vec<f32>,
    #[serde(rename = "laneWidth", alias = "lane_width")]
    pub lane_width: f32,
    #[serde(rename = "angleBias", alias = "angle_bias")]
    pub angle_bias: f32,
    #[serde(default)]
    pub center_bias: Vec<f32>,
    #[serde(default)]
    pub model_bias: Vec<f32>,
}

/// Learned offsets and lane geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationState {
    pub vehicle: Vec<f32>,
    pub camera_vehicle: Vec<f32>,
    pub lane: Vec<f32>,
    pub lane_width: f32,
    pub angle_bias: f32,
    pub model_bias: Vec<Row>,
    pub center_bias: Vec<Row>,
    pub calibrated: bool,
}

impl CalibrationState {
    /// Uncalibrated zero state for `slot_count` model slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            vehicle: vec![0.0; VEHICLE_CAL_LEN],
            camera_vehicle: vec![0.0; CAMERA_VEHICLE_CAL_LEN],
            lane: vec![0.0; LANE_CAL_LEN],
            lane_width: 0.0,
            angle_bias: 0.0,
            model_bias: vec![Row::zeros(); slot_count],
            center_bias: vec![Row::zeros(); slot_count],
            calibrated: false,
        }
    }

    /// Steering-angle offset the plan is anchored to.
    pub fn baseline(&self) -> f32 {
        self.vehicle[0]
    }

    /// Filter the calibration channels toward the latest raw sample.
    pub fn update(
        &mut self,
        cs: &CarState,
        vehicle: &[f32],
        camera_vehicle: &[f32],
        unpacked: &[f32; LANE_CHANNELS],
    ) {
        let speed_gain = cs.v_ego * SPEED_GAIN;
        // unpacked block order: far-left, far-right, left, right
        let line_caps = [
            cs.cam_far_left.confidence(),
            cs.cam_far_right.confidence(),
            cs.cam_left.confidence(),
            cs.cam_right.confidence(),
        ];

        filter_members(&mut self.vehicle, &VEHICLE_CAL_MASK, vehicle, |_| speed_gain);
        filter_members(
            &mut self.camera_vehicle,
            &CAMERA_VEHICLE_CAL_MASK,
            camera_vehicle,
            |_| speed_gain,
        );
        filter_members(&mut self.lane, &LANE_CAL_MASK, unpacked, |column| {
            speed_gain.min(line_caps[column / LINE_BLOCK])
        });
    }

    /// Frozen copy in persisted form.
    pub fn to_blob(&self) -> CalibrationBlob {
        let mut calibration = Vec::with_capacity(CALIBRATION_LEN);
        calibration.extend_from_slice(&self.vehicle);
        calibration.extend_from_slice(&self.camera_vehicle);
        calibration.extend_from_slice(&self.lane);

        CalibrationBlob {
            calibration,
            lane_width: self.lane_width,
            angle_bias: self.angle_bias,
            center_bias: self.center_bias.iter().flat_map(|r| r.iter().copied()).collect(),
            model_bias: self.model_bias.iter().flat_map(|r| r.iter().copied()).collect(),
        }
    }

    /// Rebuild state from a blob, rejecting any schema mismatch.
    pub fn from_blob(blob: &CalibrationBlob, slot_count: usize) -> PlannerResult<Self> {
        if blob.calibration.len() != CALIBRATION_LEN {
            return Err(PlannerError::CalibrationInvalid(format!(
                "expected {} calibration values, found {}",
                CALIBRATION_LEN,
                blob.calibration.len()
            )));
        }

        let (vehicle, rest) = blob.calibration.split_at(VEHICLE_CAL_LEN);
        let (camera_vehicle, lane) = rest.split_at(CAMERA_VEHICLE_CAL_LEN);

        Ok(Self {
            vehicle: vehicle.to_vec(),
            camera_vehicle: camera_vehicle.to_vec(),
            lane: lane.to_vec(),
            lane_width: blob.lane_width,
            angle_bias: blob.angle_bias,
            model_bias: split_rows("model_bias", &blob.model_bias, slot_count)?,
            center_bias: split_rows("center_bias", &blob.center_bias, slot_count)?,
            calibrated: true,
        })
    }

    /// Load from `store`, falling back to the uncalibrated state.
    ///
    /// A blob that was read but cannot be used is deleted so the next save
    /// starts clean. A failed read leaves the stored blob alone.
    pub fn load(store: &dyn ParamStore, key: &str, slot_count: usize) -> Self {
        let text = match store.get(key) {
            Ok(Some(text)) => text,
            Ok(None) => {
                log::info!("No stored calibration under {}", key);
                return Self::new(slot_count);
            }
            Err(err) => {
                log::warn!("Could not read calibration, starting uncalibrated: {}", err);
                return Self::new(slot_count);
            }
        };

        let parsed = serde_json::from_str::<CalibrationBlob>(&text)
            .map_err(|e| PlannerError::CalibrationInvalid(e.to_string()))
            .and_then(|blob| Self::from_blob(&blob, slot_count));

        match parsed {
            Ok(state) => {
                log::info!(
                    "Loaded calibration: lane width {:.1}, angle bias {:.3}",
                    state.lane_width,
                    state.angle_bias
                );
                state
            }
            Err(err) => {
                log::warn!("Resetting calibration: {}", err);
                if let Err(del) = store.delete(key) {
                    log::warn!("Could not delete {}: {}", key, del);
                }
                Self::new(slot_count)
            }
        }
    }

    /// Persist a snapshot; `background` hands the write off to the store.
    pub fn save(&self, store: &dyn ParamStore, key: &str, background: bool) -> PlannerResult<()> {
        let json = serde_json::to_string(&self.to_blob())
            .map_err(|e| PlannerError::Store(e.to_string()))?;
        if background {
            store.put_nonblocking(key, json)
        } else {
            store.put(key, &json)
        }
    }
}

fn filter_members(
    bias: &mut [f32],
    mask: &[bool],
    latest: &[f32],
    gain: impl Fn(usize) -> f32,
) {
    let members = mask
        .iter()
        .enumerate()
        .filter(|(_, member)| **member)
        .map(|(column, _)| column);
    for (slot, column) in bias.iter_mut().zip(members) {
        *slot += gain(column) * (latest[column] - *slot);
    }
}

/// Per-slot rows from a flat vector. An empty vector means the key was never
/// written and yields zero rows.
fn split_rows(name: &str, flat: &[f32], slot_count: usize) -> PlannerResult<Vec<Row>> {
    if flat.is_empty() {
        return Ok(vec![Row::zeros(); slot_count]);
    }
    if flat.len() != slot_count * OUTPUT_ROWS {
        return Err(PlannerError::CalibrationInvalid(format!(
            "expected {} {} values, found {}",
            slot_count * OUTPUT_ROWS,
            name,
            flat.len()
        )));
    }
    Ok(flat.chunks_exact(OUTPUT_ROWS).map(Row::from_column_slice).collect())
}

/// Steady, confident driving where channel offsets can be observed.
pub fn update_allowed(cs: &CarState, baseline: f32, l_prob: f32, r_prob: f32) -> bool {
    cs.v_ego > GATE_MIN_SPEED
        && (cs.steering_angle - baseline).abs() <= GATE_MAX_ANGLE_DEVIATION
        && cs.steering_rate.abs() < GATE_MAX_RATE
        && l_prob > 0.0
        && r_prob > 0.0
}

/// Key/value persistence for calibration.
pub trait ParamStore: Send + Sync {
    fn get(&self, key: &str) -> PlannerResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> PlannerResult<()>;
    fn delete(&self, key: &str) -> PlannerResult<()>;

    /// Write without blocking the caller. Stores without a background path
    /// write inline.
    fn put_nonblocking(&self, key: &str, value: String) -> PlannerResult<()> {
        self.put(key, &value)
    }
}

enum StoreOp {
    Write { key: String, value: String },
    Delete { key: String },
    Sync,
}

struct StoreRequest {
    op: StoreOp,
    reply: Option<Sender<std::io::Result<()>>>,
}

/// One file per key under a directory.
///
/// Every write and delete runs on a single writer thread in submission order,
/// so a background save can never land after a later synchronous one.
#[derive(Clone, Debug)]
pub struct FileParamStore {
    dir: PathBuf,
    requests: Sender<StoreRequest>,
}

impl FileParamStore {
    pub fn new(dir: impl Into<PathBuf>) -> PlannerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (requests, rx) = unbounded();
        spawn_store_writer(dir.clone(), rx)?;
        Ok(Self { dir, requests })
    }

    /// Queue `op` and wait for the writer to finish it.
    fn call(&self, op: StoreOp) -> PlannerResult<()> {
        let (reply, done) = bounded(1);
        self.requests
            .send(StoreRequest {
                op,
                reply: Some(reply),
            })
            .map_err(|_| PlannerError::Store("param writer stopped".into()))?;
        let result = done
            .recv()
            .map_err(|_| PlannerError::Store("param writer stopped".into()))?;
        Ok(result?)
    }
}

fn write_atomic(dir: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", key));
    fs::write(&tmp, value)?;
    fs::rename(&tmp, dir.join(key))
}

fn remove_key(dir: &Path, key: &str) -> std::io::Result<()> {
    match fs::remove_file(dir.join(key)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Writer thread owning all mutations under `dir`. Exits once every store
/// handle is dropped and the queue is drained.
fn spawn_store_writer(
    dir: PathBuf,
    rx: Receiver<StoreRequest>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("param-writer".into())
        .spawn(move || {
            for request in rx {
                let result = match &request.op {
                    StoreOp::Write { key, value } => write_atomic(&dir, key, value),
                    StoreOp::Delete { key } => remove_key(&dir, key),
                    StoreOp::Sync => Ok(()),
                };
                match request.reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            log::warn!("Background param write failed: {}", e);
                        }
                    }
                }
            }
        })
}

impl ParamStore for FileParamStore {
    fn get(&self, key: &str) -> PlannerResult<Option<String>> {
        // read after any queued writes
        self.call(StoreOp::Sync)?;
        match fs::read_to_string(self.dir.join(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> PlannerResult<()> {
        self.call(StoreOp::Write {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn delete(&self, key: &str) -> PlannerResult<()> {
        self.call(StoreOp::Delete {
            key: key.to_string(),
        })
    }

    fn put_nonblocking(&self, key: &str, value: String) -> PlannerResult<()> {
        self.requests
            .send(StoreRequest {
                op: StoreOp::Write {
                    key: key.to_string(),
                    value,
                },
                reply: None,
            })
            .map_err(|_| PlannerError::Store("param writer stopped".into()))
    }
}

/// In-memory store, used for replays without a params directory and in tests.
#[derive(Debug, Default)]
pub struct MemoryParamStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PlannerResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| PlannerError::Store("param store lock poisoned".into()))
    }
}

impl ParamStore for MemoryParamStore {
    fn get(&self, key: &str) -> PlannerResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> PlannerResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> PlannerResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
