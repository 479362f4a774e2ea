use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::room::Room;

/// Max-heap of rooms by matchmaking score. Each room tracks its own slot
/// (`heap_index`) so targeted re-heapify stays O(log n). All access is
/// serialized by the single process-wide mutex in `AppState`.
pub struct RoomHeap {
    rooms: Vec<Arc<Room>>,
}

impl RoomHeap {
    pub fn new(rooms: Vec<Arc<Room>>) -> Self {
        let mut heap = Self { rooms };
        for (i, room) in heap.rooms.iter().enumerate() {
            room.heap_index.store(i as i32, Ordering::Release);
        }
        heap.heapify();
        heap
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn push(&mut self, room: Arc<Room>) {
        let i = self.rooms.len();
        room.heap_index.store(i as i32, Ordering::Release);
        self.rooms.push(room);
        self.sift_up(i);
    }

    /// Remove and return the best room, but only if it is actually
    /// matchable (positive score). Scores drift while rooms sit in the
    /// pool (battles start, settle and dismiss), so the heap property is
    /// re-established first.
    pub fn pop(&mut self) -> Option<Arc<Room>> {
        self.heapify();
        if self.rooms.is_empty() {
            return None;
        }
        if self.rooms[0].score() <= 0.0 {
            return None;
        }
        let last = self.rooms.len() - 1;
        self.rooms.swap(0, last);
        let top = self.rooms.pop().expect("non-empty");
        top.heap_index.store(-1, Ordering::Release);
        if !self.rooms.is_empty() {
            self.rooms[0].heap_index.store(0, Ordering::Release);
            self.sift_down(0);
        }
        Some(top)
    }

    /// Re-heapify around one room after its score changed.
    pub fn update(&mut self, room: &Arc<Room>) {
        let i = room.heap_index.load(Ordering::Acquire);
        if i < 0 || i as usize >= self.rooms.len() {
            return;
        }
        let i = i as usize;
        self.sift_up(i);
        self.sift_down(i);
    }

    fn heapify(&mut self) {
        if self.rooms.len() < 2 {
            return;
        }
        for i in (0..self.rooms.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.rooms[i].score() <= self.rooms[parent].score() {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.rooms.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut largest = i;
            if l < n && self.rooms[l].score() > self.rooms[largest].score() {
                largest = l;
            }
            if r < n && self.rooms[r].score() > self.rooms[largest].score() {
                largest = r;
            }
            if largest == i {
                break;
            }
            self.swap(i, largest);
            i = largest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.rooms.swap(a, b);
        self.rooms[a].heap_index.store(a as i32, Ordering::Release);
        self.rooms[b].heap_index.store(b as i32, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BattleTuning;
    use crate::player::{Player, PlayerSession};
    use crate::room::room_state;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_rooms(n: i32) -> Vec<Arc<Room>> {
        (1..=n)
            .map(|id| Arc::new(Room::new(id, 2, BattleTuning::default())))
            .collect()
    }

    fn occupy(room: &Arc<Room>, player_id: i32) {
        let (tx, _rx) = mpsc::channel(8);
        let session = PlayerSession {
            sender: tx,
            close: CancellationToken::new(),
        };
        assert!(room.add_player_if_possible(
            Arc::new(Player::new(player_id, format!("P{player_id}"))),
            session
        ));
        // _rx dropped: sends will fail silently, which these tests ignore.
    }

    #[test]
    fn pop_prefers_half_full_waiting_room() {
        let rooms = make_rooms(3);
        occupy(&rooms[1], 100);
        let mut heap = RoomHeap::new(rooms.clone());

        let best = heap.pop().expect("matchable room");
        assert_eq!(best.id, 2, "the WAITING half-full room scores highest");
        assert_eq!(heap.len(), 2);
        assert_eq!(best.heap_index.load(Ordering::Acquire), -1);
    }

    #[test]
    fn pop_skips_unmatchable_pool() {
        let rooms = make_rooms(2);
        for r in &rooms {
            r.set_state(room_state::IN_BATTLE);
            r.update_score();
        }
        let mut heap = RoomHeap::new(rooms);
        assert!(heap.pop().is_none(), "no positive-score room to match into");
        assert_eq!(heap.len(), 2, "unmatchable rooms stay pooled");
    }

    #[test]
    fn push_restores_membership_and_indices() {
        let rooms = make_rooms(4);
        let mut heap = RoomHeap::new(rooms);
        let a = heap.pop().unwrap();
        let b = heap.pop().unwrap();
        heap.push(a);
        heap.push(b);
        assert_eq!(heap.len(), 4);
        for i in 0..heap.rooms.len() {
            assert_eq!(heap.rooms[i].heap_index.load(Ordering::Acquire), i as i32);
        }
    }

    #[test]
    fn update_reorders_after_score_change() {
        let rooms = make_rooms(3);
        let mut heap = RoomHeap::new(rooms.clone());

        // Room 3 becomes the most attractive.
        occupy(&rooms[2], 200);
        heap.update(&rooms[2]);
        let best = heap.pop().unwrap();
        assert_eq!(best.id, 3);
    }

    #[test]
    fn pop_reflects_scores_changed_while_pooled() {
        let rooms = make_rooms(2);
        let mut heap = RoomHeap::new(rooms.clone());
        // Scores change without any update() call, as when a battle ends.
        rooms[0].set_state(room_state::IN_BATTLE);
        rooms[0].update_score();
        let best = heap.pop().unwrap();
        assert_eq!(best.id, 2);
    }
}
