use serde::{Deserialize, Serialize};

/// The 13 permitted joystick directions. The first 4 bits of an encoded
/// input select an entry; `(dx, dy)` components are in the virtual-grid
/// basis used by the simulator.
pub const DIRECTION_DECODER: [[i32; 2]; 13] = [
    [0, 0],
    [0, 1],
    [0, -1],
    [2, 0],
    [-2, 0],
    [2, 1],
    [-2, -1],
    [2, -1],
    [-2, 1],
    [2, 0],
    [-2, 0],
    [0, 1],
    [0, -1],
];

/// Bit 4 of the encoded input carries the attack button level.
pub const INPUT_BTN_A_BIT: u64 = 1 << 4;

const INPUT_DIR_MASK: u64 = 0x0F;

/// One player's command for one input frame, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInput {
    pub dx: i32,
    pub dy: i32,
    pub btn_a_level: u64,
}

/// Decode the 5 used bits of an encoded input. An out-of-range direction
/// index decodes as "no movement" rather than being rejected; by then the
/// input is already part of the authoritative timeline.
pub fn decode_input(encoded: u64) -> DecodedInput {
    let idx = (encoded & INPUT_DIR_MASK) as usize;
    let [dx, dy] = if idx < DIRECTION_DECODER.len() {
        DIRECTION_DECODER[idx]
    } else {
        DIRECTION_DECODER[0]
    };
    DecodedInput {
        dx,
        dy,
        btn_a_level: (encoded & INPUT_BTN_A_BIT) >> 4,
    }
}

pub fn encode_input(direction_idx: u8, btn_a: bool) -> u64 {
    let mut encoded = u64::from(direction_idx) & INPUT_DIR_MASK;
    if btn_a {
        encoded |= INPUT_BTN_A_BIT;
    }
    encoded
}

/// `renderFrameId → inputFrameId` under the given delay. Clamped at 0 for
/// early render frames so the kickoff input frame always resolves.
pub fn convert_to_input_frame_id(
    render_frame_id: i32,
    input_delay_frames: i32,
    input_scale_frames: u32,
) -> i32 {
    if render_frame_id < input_delay_frames {
        return 0;
    }
    (render_frame_id - input_delay_frames) >> input_scale_frames
}

/// First render frame that consumes `input_frame_id`.
pub fn convert_to_first_used_render_frame_id(
    input_frame_id: i32,
    input_delay_frames: i32,
    input_scale_frames: u32,
) -> i32 {
    (input_frame_id << input_scale_frames) + input_delay_frames
}

/// Last render frame that consumes `input_frame_id`.
pub fn convert_to_last_used_render_frame_id(
    input_frame_id: i32,
    input_delay_frames: i32,
    input_scale_frames: u32,
) -> i32 {
    (input_frame_id << input_scale_frames) + input_delay_frames + (1 << input_scale_frames) - 1
}

/// True on the render frames that open a new input-frame slot, i.e. every
/// `1 << input_scale_frames`-th frame.
pub fn should_prefab_input_frame_downsync(render_frame_id: i32, input_scale_frames: u32) -> bool {
    0 == (render_frame_id & ((1 << input_scale_frames) - 1))
}

/// One input per player slot for a single downsampled frame, plus the
/// bitmask of join indices whose input is a real upsync rather than a
/// prefabbed prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameDownsync {
    pub input_frame_id: i32,
    pub input_list: Vec<u64>,
    pub confirmed_list: u64,
}

impl InputFrameDownsync {
    pub fn all_confirmed_mask(capacity: usize) -> u64 {
        (1u64 << capacity) - 1
    }
}

/// A single client command as carried by the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameUpsync {
    pub input_frame_id: i32,
    pub encoded: u64,
}
