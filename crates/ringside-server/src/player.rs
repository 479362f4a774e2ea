use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ringside_core::PlayerId;
use ringside_core::frame::{PlayerDownsync, character_state};

pub mod player_battle_state {
    pub const ADDED_PENDING_BATTLE_COLLIDER_ACK: i32 = 0;
    pub const READDED_PENDING_BATTLE_COLLIDER_ACK: i32 = 1;
    pub const ACTIVE: i32 = 2;
    pub const DISCONNECTED: i32 = 3;
    pub const LOST: i32 = 4;
    pub const EXPELLED_DURING_GAME: i32 = 5;
    pub const EXPELLED_IN_DISMISSAL: i32 = 6;
}

pub const MAGIC_JOIN_INDEX_INVALID: i32 = -1;

/// `last_sent_input_frame_id` sentinel for a freshly added player.
pub const MAGIC_LAST_SENT_INPUT_FRAME_ID_NORMAL_ADDED: i32 = -1;
/// `last_sent_input_frame_id` sentinel for a player that just rejoined and
/// must be resynced on the next tick.
pub const MAGIC_LAST_SENT_INPUT_FRAME_ID_READDED: i32 = -2;

/// The live network attachment of a player. Replaced wholesale on rejoin;
/// writes go through the bounded sender only, so the main loop never blocks
/// on a slow socket. Both fields are cheap handles, so a session clones.
#[derive(Clone)]
pub struct PlayerSession {
    pub sender: mpsc::Sender<Bytes>,
    pub close: CancellationToken,
}

impl PlayerSession {
    /// Ask the connection task to tear the socket down. Idempotent.
    pub fn signal_to_close(&self, ret_code: i32, reason: &str) {
        tracing::warn!(ret_code, reason, "Signaling session close");
        self.close.cancel();
    }
}

/// A player as the room sees it. Reader tasks update the ack fields, the
/// main loop updates `last_sent_input_frame_id` and both sides read
/// `battle_state`, so those are atomics; the rest only changes under the
/// room's admission path.
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub join_index: AtomicI32,
    pub battle_state: AtomicI32,
    pub acking_frame_id: AtomicI32,
    pub acking_input_frame_id: AtomicI32,
    pub last_sent_input_frame_id: AtomicI32,
    /// Spawn-time snapshot used for kickoff/meta frames.
    pub downsync: Mutex<PlayerDownsync>,
    pub session: Mutex<Option<PlayerSession>>,
}

impl Player {
    pub fn new(id: PlayerId, name: String) -> Self {
        Self {
            id,
            name,
            join_index: AtomicI32::new(MAGIC_JOIN_INDEX_INVALID),
            battle_state: AtomicI32::new(player_battle_state::ADDED_PENDING_BATTLE_COLLIDER_ACK),
            acking_frame_id: AtomicI32::new(0),
            acking_input_frame_id: AtomicI32::new(-1),
            last_sent_input_frame_id: AtomicI32::new(MAGIC_LAST_SENT_INPUT_FRAME_ID_NORMAL_ADDED),
            downsync: Mutex::new(PlayerDownsync {
                id,
                virtual_grid_x: 0,
                virtual_grid_y: 0,
                dir_x: 0,
                dir_y: 0,
                character_state: character_state::IDLE1,
                speed: 0,
                frames_to_recover: 0,
                hp: 100,
                max_hp: 100,
                collider_radius: 12.0,
                join_index: MAGIC_JOIN_INDEX_INVALID,
            }),
            session: Mutex::new(None),
        }
    }

    pub fn battle_state(&self) -> i32 {
        self.battle_state.load(Ordering::Acquire)
    }

    pub fn set_battle_state(&self, state: i32) {
        self.battle_state.store(state, Ordering::Release);
    }

    pub fn join_index_loaded(&self) -> i32 {
        self.join_index.load(Ordering::Acquire)
    }

    pub fn install_session(&self, session: PlayerSession) {
        let mut guard = self.session.lock().expect("session lock");
        *guard = Some(session);
    }

    pub fn clear_session(&self) -> Option<PlayerSession> {
        let mut guard = self.session.lock().expect("session lock");
        guard.take()
    }

    /// Try to push an encoded downsync to the session. Returns false when
    /// there is no session or the channel is saturated/closed.
    pub fn try_send(&self, data: Bytes) -> bool {
        let guard = self.session.lock().expect("session lock");
        match guard.as_ref() {
            Some(session) => session.sender.try_send(data).is_ok(),
            None => false,
        }
    }

    /// Close the session with a custom ret code, if one is attached.
    pub fn signal_to_close(&self, ret_code: i32, reason: &str) {
        let guard = self.session.lock().expect("session lock");
        if let Some(session) = guard.as_ref() {
            session.signal_to_close(ret_code, reason);
        }
    }
}
