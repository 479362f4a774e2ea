use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use ringside_core::PlayerId;

use crate::config::ServerConfig;
use crate::room::Room;
use crate::room_heap::RoomHeap;

pub type SharedRoomHeap = Arc<Mutex<RoomHeap>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Matchmaking pool; every heap access goes through this one mutex.
    pub room_heap: SharedRoomHeap,
    /// Id → room lookup; the pool membership never changes after startup.
    pub room_map: Arc<HashMap<i32, Arc<Room>>>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Preallocate the whole room pool; rooms are recycled via dismissal,
    /// never created at runtime.
    pub fn new(config: ServerConfig) -> Self {
        let rooms: Vec<Arc<Room>> = (1..=config.rooms.count as i32)
            .map(|id| Arc::new(Room::new(id, config.rooms.capacity, config.battle.clone())))
            .collect();
        let room_map: HashMap<i32, Arc<Room>> =
            rooms.iter().map(|r| (r.id, Arc::clone(r))).collect();
        tracing::info!(
            count = rooms.len(),
            capacity = config.rooms.capacity,
            "Room pool initialized"
        );
        Self {
            config: Arc::new(config),
            room_heap: Arc::new(Mutex::new(RoomHeap::new(rooms))),
            room_map: Arc::new(room_map),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// The room (if any) that still counts `player_id` as a member; used
    /// to route rejoins.
    pub fn find_room_with_player(&self, player_id: PlayerId) -> Option<Arc<Room>> {
        self.room_map
            .values()
            .find(|room| {
                room.players
                    .read()
                    .expect("players lock")
                    .contains_key(&player_id)
            })
            .cloned()
    }
}

/// RAII guard that decrements a counter on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_preallocated_and_indexed() {
        let state = AppState::new(ServerConfig {
            rooms: crate::config::RoomPoolConfig {
                count: 4,
                capacity: 2,
            },
            ..ServerConfig::default()
        });
        assert_eq!(state.room_map.len(), 4);
        assert_eq!(state.room_heap.lock().unwrap().len(), 4);
        assert!(state.room_map.contains_key(&1));
        assert!(state.room_map.contains_key(&4));
        assert!(state.find_room_with_player(42).is_none());
    }

    #[test]
    fn connection_guard_tracks_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _g1 = ConnectionGuard::new(Arc::clone(&counter));
            let _g2 = ConnectionGuard::new(Arc::clone(&counter));
            assert_eq!(counter.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
