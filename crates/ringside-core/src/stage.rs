//! Stage geometry consumed by the battle core.
//!
//! The TMX/TSX map pipeline is an external collaborator; it boils each map
//! down to the exact records below (tile-grid dimensions, the
//! `PlayerStartingPos` point list and the `Barrier` polygon list, all in
//! world coordinates centered on the stage). The builtin stages mirror that
//! output shape so the core never touches map files.

use crate::collision::Vec2;

/// One barrier polygon: a convex outline anchored somewhere on the stage.
#[derive(Debug, Clone)]
pub struct BarrierPolygon {
    pub anchor: Vec2,
    pub points: Vec<Vec2>,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: &'static str,
    pub stage_discrete_w: i32,
    pub stage_discrete_h: i32,
    pub stage_tile_w: i32,
    pub stage_tile_h: i32,
    pub player_starting_pos: Vec<Vec2>,
    pub barriers: Vec<BarrierPolygon>,
}

impl Stage {
    pub fn world_width(&self) -> f64 {
        f64::from(self.stage_discrete_w * self.stage_tile_w)
    }

    pub fn world_height(&self) -> f64 {
        f64::from(self.stage_discrete_h * self.stage_tile_h)
    }

    pub fn names() -> &'static [&'static str] {
        &["richsoil", "dungeon"]
    }

    pub fn by_name(name: &str) -> Option<Stage> {
        match name {
            "richsoil" => Some(richsoil()),
            "dungeon" => Some(dungeon()),
            _ => None,
        }
    }
}

fn wall(anchor_x: f64, anchor_y: f64, w: f64, h: f64) -> BarrierPolygon {
    BarrierPolygon {
        anchor: Vec2::new(anchor_x, anchor_y),
        points: vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(w, 0.0),
            Vec2::new(w, h),
            Vec2::new(0.0, h),
        ],
    }
}

/// 64×64 tiles of 16 px: a walled arena with two mid-field pillars.
fn richsoil() -> Stage {
    let half = 512.0;
    let t = 16.0;
    Stage {
        name: "richsoil",
        stage_discrete_w: 64,
        stage_discrete_h: 64,
        stage_tile_w: 16,
        stage_tile_h: 16,
        player_starting_pos: vec![
            Vec2::new(-120.0, -40.0),
            Vec2::new(120.0, 40.0),
            Vec2::new(-120.0, 120.0),
            Vec2::new(120.0, -120.0),
        ],
        barriers: vec![
            // Perimeter
            wall(-half, -half, 2.0 * half, t),
            wall(-half, half - t, 2.0 * half, t),
            wall(-half, -half + t, t, 2.0 * (half - t)),
            wall(half - t, -half + t, t, 2.0 * (half - t)),
            // Pillars
            wall(-48.0, -160.0, 96.0, 32.0),
            wall(-48.0, 128.0, 96.0, 32.0),
            // A slanted outcrop, kept convex
            BarrierPolygon {
                anchor: Vec2::new(224.0, -32.0),
                points: vec![
                    Vec2::new(0.0, 0.0),
                    Vec2::new(64.0, 16.0),
                    Vec2::new(64.0, 48.0),
                    Vec2::new(0.0, 64.0),
                ],
            },
        ],
    }
}

/// 32×32 tiles of 16 px: a tight room with a single center block.
fn dungeon() -> Stage {
    let half = 256.0;
    let t = 16.0;
    Stage {
        name: "dungeon",
        stage_discrete_w: 32,
        stage_discrete_h: 32,
        stage_tile_w: 16,
        stage_tile_h: 16,
        player_starting_pos: vec![Vec2::new(-80.0, 0.0), Vec2::new(80.0, 0.0)],
        barriers: vec![
            wall(-half, -half, 2.0 * half, t),
            wall(-half, half - t, 2.0 * half, t),
            wall(-half, -half + t, t, 2.0 * (half - t)),
            wall(half - t, -half + t, t, 2.0 * (half - t)),
            wall(-32.0, -32.0, 64.0, 64.0),
        ],
    }
}
