//! Telemetry decoding into normalized model feature rows.

use crate::error::{PlannerError, PlannerResult};
use crate::tuning::Tuning;
use crate::types::{
    CameraVehicleRow, CarState, LaneLine, LaneRow, VehicleRow, LANE_CHANNELS, LINE_BLOCK,
};

/// Per-line mask applied to `[missing, q, q, q, q, q, q, confByte]`.
pub const BIT_MASK: [i64; LINE_BLOCK] = [1, 128, 64, 32, 8, 4, 2, 8];

/// Unpacked parameter order within a line block (0-based: params 10,2,1,3,4,5,7,9).
pub const UNPACKED_PARAMS: [usize; LINE_BLOCK] = [9, 1, 0, 2, 3, 4, 6, 8];

pub const MIN_ROW_SPEED: f32 = 10.0;
pub const MIN_LANE_WIDTH: f32 = 570.0;
pub const MAX_LANE_WIDTH: f32 = 1700.0;
const ANGLE_CLIP: f32 = 30.0;
const RATE_CLIP: f32 = 40.0;

/// One camera-rate sample.
#[derive(Clone, Debug, PartialEq)]
pub struct LaneFrame {
    pub vehicle: CameraVehicleRow,
    pub packed: LaneRow,
    pub unpacked: LaneRow,
}

impl Default for LaneFrame {
    fn default() -> Self {
        Self {
            vehicle: [0.0; 6],
            packed: [0.0; LANE_CHANNELS],
            unpacked: [0.0; LANE_CHANNELS],
        }
    }
}

/// Normalized steering angle shared by both row kinds.
fn scaled_angle(value: f32, tuning: &Tuning, clip: f32) -> f32 {
    (tuning.steer_factor * value / tuning.angle_factor).clamp(-clip, clip)
}

/// Vehicle-rate row: speed, angle, lateral accel, rate, EPS torque, yaw rate, driver torque.
pub fn vehicle_row(cs: &CarState, tuning: &Tuning) -> VehicleRow {
    [
        cs.v_ego.max(MIN_ROW_SPEED),
        scaled_angle(cs.steering_angle, tuning, ANGLE_CLIP),
        tuning.lateral_factor * cs.lateral_accel,
        scaled_angle(cs.steering_rate, tuning, RATE_CLIP),
        cs.steering_torque_eps.clamp(-RATE_CLIP, RATE_CLIP),
        tuning.yaw_factor * cs.yaw_rate_can,
        cs.steering_torque,
    ]
}

/// Pack one line block through [`BIT_MASK`], each bit clamped to [-1, 1].
pub fn pack_line(line: &LaneLine) -> [f32; LINE_BLOCK] {
    let missing = if line.confidence() == 0.0 { 1 } else { 0 };
    let quality = line.quality_bits();
    let raw = [
        missing,
        quality,
        quality,
        quality,
        quality,
        quality,
        quality,
        line.confidence_byte(),
    ];

    let mut block = [0.0; LINE_BLOCK];
    for (slot, (value, mask)) in block.iter_mut().zip(raw.iter().zip(BIT_MASK.iter())) {
        *slot = (value & mask).clamp(-1, 1) as f32;
    }
    block
}

fn unpack_line(line: &LaneLine) -> [f32; LINE_BLOCK] {
    let mut block = [0.0; LINE_BLOCK];
    for (slot, &param) in block.iter_mut().zip(UNPACKED_PARAMS.iter()) {
        *slot = line.params[param];
    }
    block
}

fn concat_blocks(blocks: [[f32; LINE_BLOCK]; 4]) -> LaneRow {
    let mut row = [0.0; LANE_CHANNELS];
    for (chunk, block) in row.chunks_exact_mut(LINE_BLOCK).zip(blocks.iter()) {
        chunk.copy_from_slice(block);
    }
    row
}

/// Turns lane-line reports into camera-rate frames.
///
/// A frame is emitted only when the left line's counter advances and matches
/// the far-right line's counter, so a partially updated set of lines is never
/// decoded.
#[derive(Debug, Default)]
pub struct SignalDecoder {
    last_frame: Option<u32>,
}

impl SignalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `cs` if its lane lines form a new aligned frame.
    ///
    /// `lane_width` is the current effective width estimate in sensor units.
    pub fn decode(
        &mut self,
        cs: &CarState,
        tuning: &Tuning,
        lane_width: f32,
    ) -> PlannerResult<LaneFrame> {
        let frame = cs.cam_left.frame;
        if self.last_frame == Some(frame) || frame != cs.cam_far_right.frame {
            return Err(PlannerError::StaleFrame);
        }
        self.last_frame = Some(frame);

        let vehicle = [
            cs.v_ego.max(MIN_ROW_SPEED),
            cs.long_accel,
            tuning.width_factor * lane_width.max(MIN_LANE_WIDTH),
            scaled_angle(cs.steering_angle, tuning, ANGLE_CLIP),
            tuning.lateral_factor * cs.lateral_accel,
            tuning.yaw_factor * cs.yaw_rate_can,
        ];

        let packed = concat_blocks([
            pack_line(&cs.cam_left),
            pack_line(&cs.cam_far_left),
            pack_line(&cs.cam_right),
            pack_line(&cs.cam_far_right),
        ]);
        let unpacked = concat_blocks([
            unpack_line(&cs.cam_far_left),
            unpack_line(&cs.cam_far_right),
            unpack_line(&cs.cam_left),
            unpack_line(&cs.cam_right),
        ]);

        Ok(LaneFrame {
            vehicle,
            packed,
            unpacked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(frame: u32, confidence: f32, quality: f32, conf_byte: f32) -> LaneLine {
        let mut params = [0.0; 10];
        for (i, p) in params.iter_mut().enumerate() {
            *p = (i + 1) as f32;
        }
        params[3] = confidence;
        params[5] = quality;
        params[7] = conf_byte;
        LaneLine { frame, params }
    }

    fn aligned_state(frame: u32) -> CarState {
        CarState {
            v_ego: 25.0,
            cam_left: line(frame, 100.0, 0b1010_1010 as f32, 8.0),
            cam_far_left: line(frame, 0.0, 0.0, 0.0),
            cam_right: line(frame, 90.0, 255.0, 0.0),
            cam_far_right: line(frame, 50.0, 4.0, 9.0),
            ..Default::default()
        }
    }

    /// Rebuild the quality byte from a packed block's quality bits.
    fn quality_from_block(block: &[f32; LINE_BLOCK]) -> f32 {
        (1..7)
            .filter(|&i| block[i] != 0.0)
            .map(|i| BIT_MASK[i])
            .sum::<i64>() as f32
    }

    #[test]
    fn test_pack_line_bits() {
        let packed = pack_line(&line(1, 100.0, 0b1010_1010 as f32, 8.0));
        // masks 128, 64, 32, 8, 4, 2 against 0b1010_1010
        assert_eq!(packed, [0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_missing_flag_from_zero_confidence() {
        let packed = pack_line(&line(1, 0.0, 0.0, 0.0));
        assert_eq!(packed[0], 1.0);
        assert!(packed[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_bit_mask_round_trip() {
        for quality in [0.0, 2.0, 0b1010_1010 as f32, 0b1110_1110 as f32] {
            let first = pack_line(&line(1, 10.0, quality, 8.0));
            let rebuilt = line(1, 10.0, quality_from_block(&first), 8.0);
            assert_eq!(pack_line(&rebuilt), first);
            assert!(first.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_decode_requires_alignment() {
        let mut decoder = SignalDecoder::new();
        let tuning = Tuning::new(2);

        let mut cs = aligned_state(7);
        cs.cam_far_right.frame = 6;
        assert_eq!(decoder.decode(&cs, &tuning, 0.0), Err(PlannerError::StaleFrame));

        let cs = aligned_state(7);
        assert!(decoder.decode(&cs, &tuning, 0.0).is_ok());
        // same counter again is stale
        assert_eq!(decoder.decode(&cs, &tuning, 0.0), Err(PlannerError::StaleFrame));
        assert!(decoder.decode(&aligned_state(8), &tuning, 0.0).is_ok());
    }

    #[test]
    fn test_decode_layout() {
        let mut decoder = SignalDecoder::new();
        let frame = decoder.decode(&aligned_state(1), &Tuning::new(2), 600.0).unwrap();

        assert_eq!(frame.vehicle[0], 25.0);
        assert_eq!(frame.vehicle[2], 600.0);
        // packed order: left, far-left, right, far-right
        assert_eq!(frame.packed[8], 1.0); // far-left missing
        assert_eq!(frame.packed[31], 1.0); // far-right conf byte 9 & 8
        // unpacked order: far-left, far-right, left, right; first param is 10
        assert_eq!(frame.unpacked[0], 10.0);
        assert_eq!(frame.unpacked[17], 2.0); // left offset
    }

    #[test]
    fn test_lane_width_floor_in_row() {
        let mut decoder = SignalDecoder::new();
        let frame = decoder.decode(&aligned_state(1), &Tuning::new(2), 0.0).unwrap();
        assert_eq!(frame.vehicle[2], MIN_LANE_WIDTH);
    }

    #[test]
    fn test_vehicle_row_clipping() {
        let cs = CarState {
            v_ego: 3.0,
            steering_angle: 90.0,
            steering_rate: -100.0,
            steering_torque_eps: 55.0,
            ..Default::default()
        };
        let row = vehicle_row(&cs, &Tuning::new(2));
        assert_eq!(row[0], MIN_ROW_SPEED);
        assert_eq!(row[1], 30.0);
        assert_eq!(row[3], -40.0);
        assert_eq!(row[4], 40.0);
    }
}
