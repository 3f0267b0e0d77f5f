//! Sliding history windows feeding the models.
//!
//! Two independent fixed-capacity ring buffers: vehicle-rate rows and
//! camera-rate frames. Storage is allocated once; pushes overwrite the oldest
//! entry in place.

use crate::calibration::CalibrationState;
use crate::decoder::LaneFrame;
use crate::error::{PlannerError, PlannerResult};
use crate::inference::ModelInputs;
use crate::types::{
    vehicle_depth, vehicle_window, VehicleRow, CAMERA_DEPTH, CAMERA_VEHICLE_CAL_MASK,
    CAMERA_VEHICLE_CHANNELS, FINGERPRINT_LEN, LANE_CAL_MASK, LANE_CHANNELS, VEHICLE_CAL_MASK,
    VEHICLE_CHANNELS,
};
use ndarray::{s, Array2, Array3, Axis};

/// Vehicle-rate lag: channels 2..=6 trail by this many rows.
pub const VEHICLE_LAG_ROWS: usize = 6;
const VEHICLE_LAG_CHANNELS: std::ops::Range<usize> = 2..7;
/// Camera-rate lag: channels 4..=5 trail by one frame.
pub const CAMERA_LAG_ROWS: usize = 1;
const CAMERA_LAG_CHANNELS: std::ops::Range<usize> = 4..6;

/// Fixed-capacity ring buffer indexed modulo capacity.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    head: usize,
    len: usize,
}

impl<T: Clone + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![T::default(); capacity.max(1)],
            head: 0,
            len: 0,
        }
    }
}

impl<T> RingBuffer<T> {
    pub fn push(&mut self, value: T) {
        let capacity = self.slots.len();
        self.slots[(self.head + self.len) % capacity] = value;
        if self.len < capacity {
            self.len += 1;
        } else {
            self.head = (self.head + 1) % capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.slots.len();
        (0..self.len).map(move |i| &self.slots[(self.head + i) % capacity])
    }

    pub fn latest(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            Some(&self.slots[(self.head + self.len - 1) % self.slots.len()])
        }
    }
}

/// Copy the newest `rows` entries into a `[rows, width]` matrix, zero-padding
/// the oldest rows when fewer are buffered.
fn window<const W: usize>(buffer: &RingBuffer<[f32; W]>, rows: usize) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((rows, W));
    let available = buffer.len().min(rows);
    let skip = buffer.len() - available;
    let offset = rows - available;
    for (i, row) in buffer.iter().skip(skip).enumerate() {
        for (c, value) in row.iter().enumerate() {
            out[[offset + i, c]] = *value;
        }
    }
    out
}

/// Overwrite `channels` of every row `r >= lag` with row `r - lag`'s values.
pub fn apply_lag(matrix: &mut Array2<f32>, lag: usize, channels: std::ops::Range<usize>) {
    let rows = matrix.nrows();
    if lag == 0 || rows <= lag {
        return;
    }
    let earlier = matrix
        .slice(s![..rows - lag, channels.clone()])
        .to_owned();
    matrix.slice_mut(s![lag.., channels]).assign(&earlier);
}

fn subtract_bias(matrix: &mut Array2<f32>, mask: &[bool], bias: &[f32]) {
    let columns = mask
        .iter()
        .enumerate()
        .filter(|(_, member)| **member)
        .map(|(c, _)| c);
    for (column, offset) in columns.zip(bias.iter()) {
        matrix.column_mut(column).mapv_inplace(|v| v - offset);
    }
}

fn batched(matrix: Array2<f32>) -> Array3<f32> {
    matrix.insert_axis(Axis(0))
}

/// Debiased, lag-realigned history ready to be windowed per slot.
pub struct PreparedHistory {
    vehicle: Array2<f32>,
    camera_vehicle: Array2<f32>,
    packed: Array2<f32>,
    unpacked: Array2<f32>,
    fingerprint: [f32; FINGERPRINT_LEN],
}

impl PreparedHistory {
    /// Tensors for a slot consuming `history_rows` camera frames.
    pub fn inputs_for(&self, history_rows: usize) -> ModelInputs {
        let v_rows = vehicle_window(history_rows).min(self.vehicle.nrows());
        let c_rows = history_rows.min(CAMERA_DEPTH);
        let tail = |m: &Array2<f32>, rows: usize| {
            batched(m.slice(s![m.nrows() - rows.., ..]).to_owned())
        };

        ModelInputs {
            vehicle: tail(&self.vehicle, v_rows),
            camera_vehicle: tail(&self.camera_vehicle, c_rows),
            lane_packed: tail(&self.packed, c_rows),
            lane_unpacked: tail(&self.unpacked, c_rows),
            fingerprint: self.fingerprint,
        }
    }
}

/// Vehicle-rate and camera-rate history.
pub struct HistoryBuffers {
    vehicle: RingBuffer<VehicleRow>,
    camera_vehicle: RingBuffer<[f32; CAMERA_VEHICLE_CHANNELS]>,
    packed: RingBuffer<[f32; LANE_CHANNELS]>,
    unpacked: RingBuffer<[f32; LANE_CHANNELS]>,
}

impl HistoryBuffers {
    /// Buffers deep enough for the deepest slot (`max_history_rows` camera frames).
    pub fn new(max_history_rows: usize) -> Self {
        Self {
            vehicle: RingBuffer::new(vehicle_depth(max_history_rows)),
            camera_vehicle: RingBuffer::new(CAMERA_DEPTH),
            packed: RingBuffer::new(CAMERA_DEPTH),
            unpacked: RingBuffer::new(CAMERA_DEPTH),
        }
    }

    pub fn push_vehicle(&mut self, row: VehicleRow) {
        self.vehicle.push(row);
    }

    pub fn push_frame(&mut self, frame: LaneFrame) {
        self.camera_vehicle.push(frame.vehicle);
        self.packed.push(frame.packed);
        self.unpacked.push(frame.unpacked);
    }

    pub fn vehicle_len(&self) -> usize {
        self.vehicle.len()
    }

    pub fn vehicle_depth(&self) -> usize {
        self.vehicle.capacity()
    }

    pub fn frame_count(&self) -> usize {
        self.packed.len()
    }

    pub fn latest_vehicle(&self) -> Option<&VehicleRow> {
        self.vehicle.latest()
    }

    pub fn latest_unpacked(&self) -> Option<&[f32; LANE_CHANNELS]> {
        self.unpacked.latest()
    }

    pub fn latest_camera_vehicle(&self) -> Option<&[f32; CAMERA_VEHICLE_CHANNELS]> {
        self.camera_vehicle.latest()
    }

    /// Assemble lag-realigned, debiased history.
    ///
    /// Fails with [`PlannerError::ColdStart`] until the vehicle buffer is full.
    pub fn prepare(
        &self,
        calibration: &CalibrationState,
        fingerprint: [f32; FINGERPRINT_LEN],
    ) -> PlannerResult<PreparedHistory> {
        if !self.vehicle.is_full() {
            return Err(PlannerError::ColdStart {
                have: self.vehicle.len(),
                need: self.vehicle.capacity(),
            });
        }

        let mut vehicle = window(&self.vehicle, self.vehicle.capacity());
        let mut camera_vehicle = window(&self.camera_vehicle, CAMERA_DEPTH);
        let packed = window(&self.packed, CAMERA_DEPTH);
        let mut unpacked = window(&self.unpacked, CAMERA_DEPTH);

        apply_lag(&mut vehicle, VEHICLE_LAG_ROWS, VEHICLE_LAG_CHANNELS);
        apply_lag(&mut camera_vehicle, CAMERA_LAG_ROWS, CAMERA_LAG_CHANNELS);

        subtract_bias(&mut vehicle, &VEHICLE_CAL_MASK, &calibration.vehicle);
        subtract_bias(&mut camera_vehicle, &CAMERA_VEHICLE_CAL_MASK, &calibration.camera_vehicle);
        subtract_bias(&mut unpacked, &LANE_CAL_MASK, &calibration.lane);

        debug_assert_eq!(vehicle.ncols(), VEHICLE_CHANNELS);
        Ok(PreparedHistory {
            vehicle,
            camera_vehicle,
            packed,
            unpacked,
            fingerprint,
        })
    }
}
