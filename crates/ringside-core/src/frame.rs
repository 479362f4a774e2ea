use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PlayerId;

/// Character animation/logic states shared with clients. Kept as plain
/// integers on the wire.
pub mod character_state {
    pub const IDLE1: i32 = 0;
    pub const WALKING: i32 = 1;
    pub const ATK1: i32 = 2;
    pub const ATKED1: i32 = 3;
}

/// Authoritative per-player snapshot inside a render frame. Positions are
/// virtual-grid integers; `speed` is virtual-grid units per render frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerDownsync {
    pub id: PlayerId,
    pub virtual_grid_x: i32,
    pub virtual_grid_y: i32,
    pub dir_x: i32,
    pub dir_y: i32,
    pub character_state: i32,
    pub speed: i32,
    pub frames_to_recover: i32,
    pub hp: i32,
    pub max_hp: i32,
    pub collider_radius: f64,
    pub join_index: i32,
}

/// An in-flight melee attack. Startup/active/recovery windows are counted
/// in render frames from `originated_render_frame_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeleeBullet {
    pub battle_local_id: i32,
    pub offender_join_index: i32,
    pub offender_player_id: PlayerId,
    pub originated_render_frame_id: i32,

    pub startup_frames: i32,
    pub active_frames: i32,
    pub recovery_frames: i32,
    pub recovery_frames_on_block: i32,
    pub recovery_frames_on_hit: i32,

    pub hitbox_offset: f64,
    pub hitbox_size_x: f64,
    pub hitbox_size_y: f64,
    pub moveforward_x: f64,
    pub moveforward_y: f64,

    pub hit_stun_frames: i32,
    pub block_stun_frames: i32,
    pub pushback: f64,
    pub release_trigger_type: i32,
    pub damage: i32,
}

impl MeleeBullet {
    /// Render-frame ids during which the hitbox is live.
    pub fn active_window(&self) -> (i32, i32) {
        let st = self.originated_render_frame_id + self.startup_frames;
        (st, st + self.active_frames)
    }

    pub fn is_active_at(&self, render_frame_id: i32) -> bool {
        let (st, ed) = self.active_window();
        st <= render_frame_id && render_frame_id < ed
    }
}

/// Rising-edge button release.
pub const RELEASE_TRIGGER_RISING_EDGE: i32 = 1;

/// The basic punch, skill id 1. Cloned whenever an attack input has a
/// rising edge.
pub fn punch_skill() -> MeleeBullet {
    MeleeBullet {
        battle_local_id: 0,
        offender_join_index: 0,
        offender_player_id: 0,
        originated_render_frame_id: 0,
        startup_frames: 23,
        active_frames: 3,
        recovery_frames: 61,
        recovery_frames_on_block: 61,
        recovery_frames_on_hit: 61,
        hitbox_offset: 12.0,
        hitbox_size_x: 45.0,
        hitbox_size_y: 32.0,
        moveforward_x: 0.0,
        moveforward_y: 0.0,
        hit_stun_frames: 18,
        block_stun_frames: 9,
        pushback: 11.0,
        release_trigger_type: RELEASE_TRIGGER_RISING_EDGE,
        damage: 5,
    }
}

/// One authoritative simulation tick. Players are keyed by id in a sorted
/// map so serialization and iteration order are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDownsyncFrame {
    pub id: i32,
    pub players: BTreeMap<PlayerId, PlayerDownsync>,
    pub countdown_nanos: i64,
    pub melee_bullets: Vec<MeleeBullet>,
}

impl RoomDownsyncFrame {
    /// Player ids ordered by join index; every per-frame loop iterates in
    /// this order to keep the step deterministic.
    pub fn player_ids_in_join_order(&self) -> Vec<PlayerId> {
        let mut ids: Vec<(i32, PlayerId)> = self
            .players
            .values()
            .map(|p| (p.join_index, p.id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_window_excludes_startup_and_end() {
        let mut b = punch_skill();
        b.originated_render_frame_id = 100;
        assert!(!b.is_active_at(100));
        assert!(!b.is_active_at(122));
        assert!(b.is_active_at(123));
        assert!(b.is_active_at(125));
        assert!(!b.is_active_at(126));
    }

    #[test]
    fn join_order_ignores_map_key_order() {
        let mut frame = RoomDownsyncFrame {
            id: 0,
            players: BTreeMap::new(),
            countdown_nanos: 0,
            melee_bullets: Vec::new(),
        };
        // Lower player id carries the higher join index.
        for (id, join_index) in [(3, 2), (9, 1)] {
            frame.players.insert(
                id,
                PlayerDownsync {
                    id,
                    virtual_grid_x: 0,
                    virtual_grid_y: 0,
                    dir_x: 2,
                    dir_y: 0,
                    character_state: character_state::IDLE1,
                    speed: 1000,
                    frames_to_recover: 0,
                    hp: 100,
                    max_hp: 100,
                    collider_radius: 12.0,
                    join_index,
                },
            );
        }
        assert_eq!(frame.player_ids_in_join_order(), vec![9, 3]);
    }
}
