use serde::{Deserialize, Serialize};

use crate::PlayerId;
use crate::frame::{MeleeBullet, RoomDownsyncFrame};
use crate::input::{InputFrameDownsync, InputFrameUpsync};

/// Client → server message acts.
pub mod upsync_act {
    pub const HB_PING: i32 = 1;
    pub const PLAYER_CMD: i32 = 2;
    pub const PLAYER_COLLIDER_ACK: i32 = 3;
}

/// Server → client message acts. Negative values are meta frames that mark
/// lifecycle milestones rather than simulation traffic.
pub mod downsync_act {
    pub const HB_REQ: i32 = 1;
    pub const INPUT_BATCH: i32 = 2;
    pub const BATTLE_STOPPED: i32 = 3;
    pub const FORCED_RESYNC: i32 = 4;

    pub const BATTLE_READY_TO_START: i32 = -1;
    pub const BATTLE_START: i32 = 0;
    pub const PLAYER_ADDED_AND_ACKED: i32 = -98;
    pub const PLAYER_READDED_AND_ACKED: i32 = -97;
}

pub mod ret_code {
    pub const OK: i32 = 9000;
    pub const UNKNOWN_ERROR: i32 = 1001;
    pub const PLAYER_NOT_ADDABLE_TO_ROOM: i32 = 1002;
    pub const PLAYER_NOT_FOUND: i32 = 1003;
    pub const ROOM_FULL: i32 = 1004;
}

/// One binary upsync record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsReq {
    pub player_id: PlayerId,
    pub join_index: i32,
    pub act: i32,
    pub acking_frame_id: i32,
    pub acking_input_frame_id: i32,
    pub input_frame_upsync_batch: Vec<InputFrameUpsync>,
}

impl WsReq {
    pub fn heartbeat(player_id: PlayerId, join_index: i32) -> Self {
        Self {
            player_id,
            join_index,
            act: upsync_act::HB_PING,
            acking_frame_id: 0,
            acking_input_frame_id: -1,
            input_frame_upsync_batch: Vec::new(),
        }
    }
}

/// One binary downsync record. At most one of `rdf`/`bci` is set; the
/// input batch may accompany either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsResp {
    pub ret: i32,
    pub act: i32,
    pub rdf: Option<RoomDownsyncFrame>,
    pub input_frame_downsync_batch: Vec<InputFrameDownsync>,
    pub bci: Option<BattleColliderInfo>,
}

/// Pushed to a session right after admission: everything a client needs to
/// mirror the server's collision setup and frame pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleColliderInfo {
    pub room_id: i32,
    pub room_capacity: i32,
    pub stage_name: String,
    pub stage_discrete_w: i32,
    pub stage_discrete_h: i32,
    pub stage_tile_w: i32,
    pub stage_tile_h: i32,

    pub server_fps: i32,
    pub battle_duration_frames: i32,
    pub battle_duration_nanos: i64,
    pub rollback_estimated_dt_nanos: i64,
    pub input_delay_frames: i32,
    pub input_scale_frames: u32,
    pub nst_delay_frames: i32,
    pub sp_atk_lookup_frames: i32,
    pub render_cache_size: i32,

    pub world_to_virtual_grid_ratio: f64,
    pub virtual_grid_to_world_ratio: f64,
    pub melee_skill: MeleeBullet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_carries_no_inputs() {
        let hb = WsReq::heartbeat(42, 1);
        assert_eq!(hb.act, upsync_act::HB_PING);
        assert!(hb.input_frame_upsync_batch.is_empty());
        assert_eq!(hb.acking_input_frame_id, -1);
    }
}
