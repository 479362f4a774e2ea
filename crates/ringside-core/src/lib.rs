pub mod collision;
pub mod dynamics;
pub mod frame;
pub mod grid;
pub mod input;
pub mod net;
pub mod ring_buffer;
pub mod stage;

/// Unique identifier for a player across the whole process.
pub type PlayerId = i32;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::collections::BTreeMap;

    use crate::PlayerId;
    use crate::frame::{PlayerDownsync, RoomDownsyncFrame, character_state};
    use crate::grid::WORLD_TO_VIRTUAL_GRID_RATIO;

    /// Build a kickoff-style render frame holding `n` players spread along
    /// the x axis (world -80, +80, ...), ids starting at 10 and join
    /// indices at 1.
    pub fn make_render_frame(n: usize, countdown_nanos: i64) -> RoomDownsyncFrame {
        let mut players: BTreeMap<PlayerId, PlayerDownsync> = BTreeMap::new();
        for i in 0..n {
            let join_index = i as i32 + 1;
            players.insert(
                10 + i as PlayerId,
                PlayerDownsync {
                    id: 10 + i as PlayerId,
                    virtual_grid_x: (-80 + i as i32 * 160) * WORLD_TO_VIRTUAL_GRID_RATIO as i32,
                    virtual_grid_y: 0,
                    dir_x: if join_index % 2 == 0 { -2 } else { 2 },
                    dir_y: 0,
                    character_state: character_state::IDLE1,
                    speed: WORLD_TO_VIRTUAL_GRID_RATIO as i32,
                    frames_to_recover: 0,
                    hp: 100,
                    max_hp: 100,
                    collider_radius: 12.0,
                    join_index,
                },
            );
        }
        RoomDownsyncFrame {
            id: 0,
            players,
            countdown_nanos,
            melee_bullets: Vec::new(),
        }
    }
}
