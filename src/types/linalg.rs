//! Fixed-size vector types for the planner
//!
//! Every per-output-row quantity (angle projections, lane centers, biases,
//! rate limits) is a `Row`, so dimensions are checked at compile time instead
//! of being inferred from loaded arrays.

use nalgebra::SVector;

// ===== Output Dimensions =====
pub const OUTPUT_ROWS: usize = 15;

/// Model output columns that follow the angle columns.
pub const TRAILING_COLUMNS: usize = 7;

// ===== Input Channel Widths =====
pub const VEHICLE_CHANNELS: usize = 7; // vehicle-rate row
pub const CAMERA_VEHICLE_CHANNELS: usize = 6; // camera-rate vehicle-context row
pub const LINE_COUNT: usize = 4;
pub const LINE_PARAMS: usize = 10;
pub const LINE_BLOCK: usize = 8;
pub const LANE_CHANNELS: usize = LINE_COUNT * LINE_BLOCK; // 32
pub const FINGERPRINT_LEN: usize = 4;

// ===== Window Depths =====
pub const CAMERA_DEPTH: usize = 6;
pub const VEHICLE_WINDOW_CAP: usize = 26;
pub const ROWS_PER_CAMERA_FRAME: f64 = 6.666_666_7;

pub type Row = SVector<f32, OUTPUT_ROWS>;
pub type VehicleRow = [f32; VEHICLE_CHANNELS];
pub type CameraVehicleRow = [f32; CAMERA_VEHICLE_CHANNELS];
pub type LaneRow = [f32; LANE_CHANNELS];

// ===== Calibration Membership =====
// angle, lateral accel, yaw rate
pub const VEHICLE_CAL_MASK: [bool; VEHICLE_CHANNELS] =
    [false, true, true, false, false, true, false];
pub const CAMERA_VEHICLE_CAL_MASK: [bool; CAMERA_VEHICLE_CHANNELS] =
    [false, false, false, true, true, true];
// params 1, 7, 9 of every line block
pub const LANE_CAL_MASK: [bool; LANE_CHANNELS] = line_block_mask();

const fn line_block_mask() -> [bool; LANE_CHANNELS] {
    let block = [false, false, true, false, false, false, true, true];
    let mut mask = [false; LANE_CHANNELS];
    let mut i = 0;
    while i < LANE_CHANNELS {
        mask[i] = block[i % LINE_BLOCK];
        i += 1;
    }
    mask
}

pub const fn member_count(mask: &[bool]) -> usize {
    let mut n = 0;
    let mut i = 0;
    while i < mask.len() {
        if mask[i] {
            n += 1;
        }
        i += 1;
    }
    n
}

pub const VEHICLE_CAL_LEN: usize = member_count(&VEHICLE_CAL_MASK);
pub const CAMERA_VEHICLE_CAL_LEN: usize = member_count(&CAMERA_VEHICLE_CAL_MASK);
pub const LANE_CAL_LEN: usize = member_count(&LANE_CAL_MASK);
pub const CALIBRATION_LEN: usize = VEHICLE_CAL_LEN + CAMERA_VEHICLE_CAL_LEN + LANE_CAL_LEN;

/// Vehicle-rate depth needed before the deepest slot can run.
pub fn vehicle_depth(max_history_rows: usize) -> usize {
    (max_history_rows as f64 * ROWS_PER_CAMERA_FRAME + 7.0).round() as usize
}

/// Vehicle-rate rows handed to a slot with `history_rows` camera frames.
pub fn vehicle_window(history_rows: usize) -> usize {
    (history_rows as f64 * ROWS_PER_CAMERA_FRAME)
        .min(VEHICLE_WINDOW_CAP as f64)
        .round() as usize
}

/// `i`-th row envelope: `base * i`.
pub fn ramp(base: f32) -> Row {
    Row::from_fn(|i, _| base * i as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_counts() {
        assert_eq!(VEHICLE_CAL_LEN, 3);
        assert_eq!(CAMERA_VEHICLE_CAL_LEN, 3);
        assert_eq!(LANE_CAL_LEN, 12);
        assert_eq!(CALIBRATION_LEN, 18);
    }

    #[test]
    fn test_default_depths() {
        assert_eq!(vehicle_depth(5), 40);
        assert_eq!(vehicle_window(2), 13);
        assert_eq!(vehicle_window(5), 26);
    }

    #[test]
    fn test_ramp() {
        let r = ramp(0.5);
        assert_eq!(r[0], 0.0);
        assert_eq!(r[14], 7.0);
    }
}
