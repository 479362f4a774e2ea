use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;

use ringside_core::PlayerId;
use ringside_core::dynamics::{BattleColliders, spawn_point_to_virtual_grid};
use ringside_core::frame::{PlayerDownsync, RoomDownsyncFrame, character_state};
use ringside_core::grid::WORLD_TO_VIRTUAL_GRID_RATIO;
use ringside_core::input::{InputFrameDownsync, InputFrameUpsync};
use ringside_core::net::messages::{WsResp, downsync_act, ret_code};
use ringside_core::net::protocol::encode_ws_resp;
use ringside_core::ring_buffer::RingBuffer;
use ringside_core::stage::Stage;

use crate::config::BattleTuning;
use crate::player::{
    MAGIC_JOIN_INDEX_INVALID, MAGIC_LAST_SENT_INPUT_FRAME_ID_NORMAL_ADDED,
    MAGIC_LAST_SENT_INPUT_FRAME_ID_READDED, Player, PlayerSession, player_battle_state,
};

pub mod room_state {
    pub const IDLE: i32 = 0;
    pub const WAITING: i32 = -1;
    pub const PREPARE: i32 = 10_000_000;
    pub const IN_BATTLE: i32 = 10_000_001;
    pub const STOPPING_BATTLE_FOR_SETTLEMENT: i32 = 10_000_002;
    pub const IN_SETTLEMENT: i32 = 10_000_003;
    pub const IN_DISMISSAL: i32 = 10_000_004;
}

/// Matchmaking priority. Peaks when a room is half full and collapses for
/// any room past WAITING.
pub fn cal_room_score(in_room_player_count: i32, capacity: usize, state: i32) -> f32 {
    let x = in_room_player_count as f32 / capacity as f32;
    let d = x - 0.5;
    -7.8125 * d * d + 5.0 - state as f32
}

/// Everything owned exclusively by the room's main loop (plus the brief
/// admission paths, which run while no loop exists or between its ticks).
pub struct BattleCore {
    pub stage: Stage,
    pub join_index_boolean_arr: Vec<bool>,
    /// Player ids by join index - 1; `None` for freed slots.
    pub players_arr: Vec<Option<PlayerId>>,
    pub inputs_buffer: RingBuffer<InputFrameDownsync>,
    pub render_frame_buffer: RingBuffer<RoomDownsyncFrame>,
    pub last_all_confirmed_input_list: Vec<u64>,
    pub colliders: Option<BattleColliders>,
    pub bullet_local_id_counter: i32,
}

impl BattleCore {
    fn fresh(capacity: usize, tuning: &BattleTuning, stage: Stage) -> Self {
        Self {
            stage,
            join_index_boolean_arr: vec![false; capacity],
            players_arr: vec![None; capacity],
            inputs_buffer: RingBuffer::new(tuning.input_buffer_size()),
            render_frame_buffer: RingBuffer::new(tuning.render_cache_size),
            last_all_confirmed_input_list: vec![0; capacity],
            colliders: None,
            bullet_local_id_counter: 0,
        }
    }

    /// Debug dump of the confirmation cursors and buffered ids, used in
    /// warn/fatal messages.
    pub fn inputs_buffer_summary(&self) -> String {
        format!(
            "[st={}, ed={}, cnt={}]",
            self.inputs_buffer.st_frame_id, self.inputs_buffer.ed_frame_id, self.inputs_buffer.cnt
        )
    }
}

/// A finite-capacity battle session. Rooms are preallocated at process
/// start and recycled through the dismissal path.
pub struct Room {
    pub id: i32,
    pub capacity: usize,
    pub tuning: BattleTuning,

    state: AtomicI32,
    effective_player_count: AtomicI32,
    score_bits: AtomicU32,
    /// Slot inside the matchmaking heap, maintained by the heap.
    pub heap_index: AtomicI32,

    render_frame_id: AtomicI32,
    cur_dynamics_render_frame_id: AtomicI32,
    last_all_confirmed_input_frame_id: AtomicI32,
    last_all_confirmed_input_frame_id_with_change: AtomicI32,
    /// Mirrors of the ring-buffer bounds for reader tasks, which must not
    /// touch the buffer itself.
    inputs_buffer_st_frame_id: AtomicI32,
    inputs_buffer_ed_frame_id: AtomicI32,

    pub players: RwLock<HashMap<PlayerId, Arc<Player>>>,
    /// Upsync scatter map: `(inputFrameId, joinIndex)` → latest upsync.
    /// Reader tasks `insert`, the main loop `remove`s (atomic
    /// load-and-delete).
    pub discrete_inputs_buffer: DashMap<(i32, i32), InputFrameUpsync>,
    pub battle: Mutex<BattleCore>,
}

impl Room {
    pub fn new(id: i32, capacity: usize, tuning: BattleTuning) -> Self {
        let stage = choose_stage();
        let room = Self {
            id,
            capacity,
            battle: Mutex::new(BattleCore::fresh(capacity, &tuning, stage)),
            tuning,
            state: AtomicI32::new(room_state::IDLE),
            effective_player_count: AtomicI32::new(0),
            score_bits: AtomicU32::new(0),
            heap_index: AtomicI32::new(-1),
            render_frame_id: AtomicI32::new(0),
            cur_dynamics_render_frame_id: AtomicI32::new(0),
            last_all_confirmed_input_frame_id: AtomicI32::new(-1),
            last_all_confirmed_input_frame_id_with_change: AtomicI32::new(-1),
            inputs_buffer_st_frame_id: AtomicI32::new(0),
            inputs_buffer_ed_frame_id: AtomicI32::new(0),
            players: RwLock::new(HashMap::new()),
            discrete_inputs_buffer: DashMap::new(),
        };
        room.update_score();
        room
    }

    pub fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: i32) {
        self.state.store(state, Ordering::Release);
    }

    pub fn score(&self) -> f32 {
        f32::from_bits(self.score_bits.load(Ordering::Acquire))
    }

    pub fn update_score(&self) {
        let score = cal_room_score(
            self.effective_player_count.load(Ordering::Acquire),
            self.capacity,
            self.state(),
        );
        self.score_bits.store(score.to_bits(), Ordering::Release);
    }

    pub fn effective_player_count(&self) -> i32 {
        self.effective_player_count.load(Ordering::Acquire)
    }

    pub fn render_frame_id(&self) -> i32 {
        self.render_frame_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_render_frame_id(&self, v: i32) {
        self.render_frame_id.store(v, Ordering::Release);
    }

    pub fn cur_dynamics_render_frame_id(&self) -> i32 {
        self.cur_dynamics_render_frame_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_cur_dynamics_render_frame_id(&self, v: i32) {
        self.cur_dynamics_render_frame_id.store(v, Ordering::Release);
    }

    pub fn last_all_confirmed_input_frame_id(&self) -> i32 {
        self.last_all_confirmed_input_frame_id.load(Ordering::Acquire)
    }

    pub(crate) fn store_last_all_confirmed_input_frame_id(&self, v: i32) {
        self.last_all_confirmed_input_frame_id.store(v, Ordering::Release);
    }

    pub fn last_all_confirmed_input_frame_id_with_change(&self) -> i32 {
        self.last_all_confirmed_input_frame_id_with_change
            .load(Ordering::Acquire)
    }

    pub(crate) fn store_last_all_confirmed_input_frame_id_with_change(&self, v: i32) {
        self.last_all_confirmed_input_frame_id_with_change
            .store(v, Ordering::Release);
    }

    pub fn inputs_buffer_st_frame_id(&self) -> i32 {
        self.inputs_buffer_st_frame_id.load(Ordering::Acquire)
    }

    pub fn inputs_buffer_ed_frame_id(&self) -> i32 {
        self.inputs_buffer_ed_frame_id.load(Ordering::Acquire)
    }

    /// Refresh the reader-task-visible bounds after the main loop mutated
    /// the inputs buffer.
    pub(crate) fn publish_inputs_buffer_bounds(&self, st: i32, ed: i32) {
        self.inputs_buffer_st_frame_id.store(st, Ordering::Release);
        self.inputs_buffer_ed_frame_id.store(ed, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Admission / readmission / loss
    // ------------------------------------------------------------------

    /// Admit a fresh player. Valid only in IDLE/WAITING and while the
    /// player is not yet a member.
    pub fn add_player_if_possible(
        self: &Arc<Self>,
        player: Arc<Player>,
        session: PlayerSession,
    ) -> bool {
        let state = self.state();
        if room_state::IDLE != state && room_state::WAITING != state {
            tracing::warn!(
                room_id = self.id,
                player_id = player.id,
                state,
                "add_player_if_possible rejected by room state"
            );
            return false;
        }
        {
            let mut players = self.players.write().expect("players lock");
            if players.len() >= self.capacity {
                tracing::warn!(room_id = self.id, player_id = player.id, "room is full");
                return false;
            }
            if players.contains_key(&player.id) {
                tracing::warn!(
                    room_id = self.id,
                    player_id = player.id,
                    "add_player_if_possible: already in room"
                );
                return false;
            }
            players.insert(player.id, Arc::clone(&player));
        }

        player.acking_frame_id.store(0, Ordering::Release);
        player.acking_input_frame_id.store(-1, Ordering::Release);
        player.last_sent_input_frame_id.store(
            MAGIC_LAST_SENT_INPUT_FRAME_ID_NORMAL_ADDED,
            Ordering::Release,
        );
        player.set_battle_state(player_battle_state::ADDED_PENDING_BATTLE_COLLIDER_ACK);
        player.install_session(session);

        self.on_player_added(&player);
        true
    }

    fn on_player_added(&self, player: &Arc<Player>) {
        let effective = self.effective_player_count.fetch_add(1, Ordering::AcqRel) + 1;
        if 1 == effective {
            self.set_state(room_state::WAITING);
        }

        let mut core = self.battle.lock().expect("battle lock");
        let Some(slot) = core.join_index_boolean_arr.iter().position(|used| !used) else {
            tracing::warn!(room_id = self.id, player_id = player.id, "no free join index");
            return;
        };
        core.join_index_boolean_arr[slot] = true;
        core.players_arr[slot] = Some(player.id);

        let join_index = slot as i32 + 1;
        player.join_index.store(join_index, Ordering::Release);

        let (vx, vy) = spawn_point_to_virtual_grid(&core.stage, slot);
        {
            let mut downsync = player.downsync.lock().expect("downsync lock");
            *downsync = PlayerDownsync {
                id: player.id,
                virtual_grid_x: vx,
                virtual_grid_y: vy,
                // Even join index faces -x, odd faces +x.
                dir_x: if join_index % 2 == 0 { -2 } else { 2 },
                dir_y: 0,
                character_state: character_state::IDLE1,
                speed: WORLD_TO_VIRTUAL_GRID_RATIO as i32,
                frames_to_recover: 0,
                hp: 100,
                max_hp: 100,
                collider_radius: 12.0,
                join_index,
            };
        }
        drop(core);

        self.update_score();
        tracing::info!(
            room_id = self.id,
            player_id = player.id,
            join_index,
            effective,
            "Player added"
        );
    }

    /// Reattach a returning player. Valid while the room still remembers
    /// the membership, i.e. any state past IDLE.
    pub fn re_add_player_if_possible(&self, player_id: PlayerId, session: PlayerSession) -> bool {
        let state = self.state();
        if room_state::WAITING != state
            && room_state::PREPARE != state
            && room_state::IN_BATTLE != state
            && room_state::IN_SETTLEMENT != state
            && room_state::IN_DISMISSAL != state
        {
            tracing::warn!(
                room_id = self.id,
                player_id,
                state,
                "re_add_player_if_possible rejected by room state"
            );
            return false;
        }
        let player = {
            let players = self.players.read().expect("players lock");
            match players.get(&player_id) {
                Some(p) => Arc::clone(p),
                None => {
                    tracing::warn!(
                        room_id = self.id,
                        player_id,
                        "re_add_player_if_possible: not a member"
                    );
                    return false;
                },
            }
        };

        player.install_session(session);
        player.acking_frame_id.store(0, Ordering::Release);
        player.acking_input_frame_id.store(-1, Ordering::Release);
        player
            .last_sent_input_frame_id
            .store(MAGIC_LAST_SENT_INPUT_FRAME_ID_READDED, Ordering::Release);
        player.set_battle_state(player_battle_state::READDED_PENDING_BATTLE_COLLIDER_ACK);

        self.update_score();
        tracing::info!(room_id = self.id, player_id, state, "Player re-added");
        true
    }

    /// The client confirmed its battle colliders. Broadcast the milestone
    /// and, once the room is full of ACTIVE players, start the battle.
    pub fn on_player_battle_collider_acked(self: &Arc<Self>, player_id: PlayerId) -> bool {
        let player = {
            let players = self.players.read().expect("players lock");
            match players.get(&player_id) {
                Some(p) => Arc::clone(p),
                None => return false,
            }
        };

        let act = match player.battle_state() {
            player_battle_state::ADDED_PENDING_BATTLE_COLLIDER_ACK => {
                downsync_act::PLAYER_ADDED_AND_ACKED
            },
            player_battle_state::READDED_PENDING_BATTLE_COLLIDER_ACK => {
                downsync_act::PLAYER_READDED_AND_ACKED
            },
            other => {
                tracing::warn!(
                    room_id = self.id,
                    player_id,
                    battle_state = other,
                    "collider ack in unexpected battle state"
                );
                return true;
            },
        };

        self.broadcast_meta_frame(act);
        player.set_battle_state(player_battle_state::ACTIVE);
        tracing::info!(
            room_id = self.id,
            player_id,
            state = self.state(),
            "Player battle collider acked"
        );

        let full_and_active = {
            let players = self.players.read().expect("players lock");
            players.len() == self.capacity
                && players
                    .values()
                    .all(|p| player_battle_state::ACTIVE == p.battle_state())
        };
        if full_and_active {
            self.start_battle();
        }

        self.update_score();
        true
    }

    /// Idempotent for players already in a terminal state. In WAITING the
    /// player is removed outright; mid-battle the slot is kept so a later
    /// `re_add_player_if_possible` stays legal.
    pub fn on_player_disconnected(&self, player_id: PlayerId) {
        let player = {
            let players = self.players.read().expect("players lock");
            match players.get(&player_id) {
                Some(p) => Arc::clone(p),
                None => {
                    tracing::info!(room_id = self.id, player_id, "disconnect for non-member");
                    return;
                },
            }
        };
        match player.battle_state() {
            player_battle_state::DISCONNECTED
            | player_battle_state::LOST
            | player_battle_state::EXPELLED_DURING_GAME
            | player_battle_state::EXPELLED_IN_DISMISSAL => {
                return;
            },
            _ => {},
        }

        match self.state() {
            room_state::WAITING => {
                self.on_player_lost(&player);
                self.players.write().expect("players lock").remove(&player_id);
                if 0 == self.effective_player_count() {
                    self.set_state(room_state::IDLE);
                }
                self.update_score();
                tracing::info!(
                    room_id = self.id,
                    player_id,
                    state = self.state(),
                    "Player disconnected while waiting"
                );
            },
            _ => {
                player.set_battle_state(player_battle_state::DISCONNECTED);
                player.clear_session();
                tracing::info!(
                    room_id = self.id,
                    player_id,
                    state = self.state(),
                    "Player disconnected from battle"
                );
            },
        }
    }

    fn on_player_lost(&self, player: &Arc<Player>) {
        player.set_battle_state(player_battle_state::LOST);
        player.clear_session();
        self.effective_player_count.fetch_sub(1, Ordering::AcqRel);

        let join_index = player.join_index_loaded();
        let mut core = self.battle.lock().expect("battle lock");
        let slot = join_index - 1;
        if 0 <= slot && (slot as usize) < core.join_index_boolean_arr.len() {
            core.join_index_boolean_arr[slot as usize] = false;
            core.players_arr[slot as usize] = None;
        }
        drop(core);
        player.join_index.store(MAGIC_JOIN_INDEX_INVALID, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Battle lifecycle
    // ------------------------------------------------------------------

    /// Initialize the kickoff frame and collision space, then run the
    /// timed preparation countdown; the main loop task starts afterwards.
    pub fn start_battle(self: &Arc<Self>) {
        if room_state::WAITING != self.state() {
            tracing::warn!(
                room_id = self.id,
                state = self.state(),
                "start_battle outside WAITING is a no-op"
            );
            return;
        }

        self.seed_battle();
        self.on_battle_prepare();
    }

    /// Reset frame cursors, refresh the collision space and put the
    /// zero-id kickoff frame into the render buffer.
    pub(crate) fn seed_battle(&self) {
        self.set_render_frame_id(0);
        self.set_cur_dynamics_render_frame_id(0);

        let snapshot = self.snapshot_players();
        let mut core = self.battle.lock().expect("battle lock");
        core.colliders = Some(BattleColliders::build(&core.stage, &snapshot));
        core.render_frame_buffer.put(RoomDownsyncFrame {
            id: 0,
            players: snapshot,
            countdown_nanos: self.tuning.battle_duration_nanos(),
            melee_bullets: Vec::new(),
        });
    }

    fn on_battle_prepare(self: &Arc<Self>) {
        if room_state::WAITING != self.state() {
            tracing::warn!(room_id = self.id, state = self.state(), "prepare outside WAITING");
            return;
        }
        self.set_state(room_state::PREPARE);
        self.update_score();
        tracing::info!(room_id = self.id, "Room state transitted to PREPARE");

        self.broadcast_meta_frame(downsync_act::BATTLE_READY_TO_START);

        let room = Arc::clone(self);
        let preparation = std::time::Duration::from_millis(room.tuning.battle_preparation_millis);
        tokio::spawn(async move {
            tokio::time::sleep(preparation).await;
            room.on_battle_started();
            tokio::spawn(crate::battle::battle_main_loop(Arc::clone(&room)));
        });
    }

    fn on_battle_started(&self) {
        if room_state::PREPARE != self.state() {
            return;
        }
        self.set_state(room_state::IN_BATTLE);
        self.update_score();
        tracing::info!(room_id = self.id, "Battle started");
    }

    /// Flip to STOPPING so the main loop drains out, and tell every active
    /// player the battle is over.
    pub fn stop_battle_for_settlement(&self) {
        if room_state::IN_BATTLE != self.state() {
            return;
        }
        self.set_state(room_state::STOPPING_BATTLE_FOR_SETTLEMENT);
        self.update_score();
        tracing::info!(room_id = self.id, "Stopping battle for settlement");

        let render_frame_id = self.render_frame_id() + 1;
        self.set_render_frame_id(render_frame_id);

        let players = {
            let core = self.battle.lock().expect("battle lock");
            core.render_frame_buffer
                .last()
                .map(|f| f.players.clone())
                .unwrap_or_else(|| self.snapshot_players())
        };
        let stop_frame = RoomDownsyncFrame {
            id: render_frame_id,
            players,
            countdown_nanos: -1,
            melee_bullets: Vec::new(),
        };
        let resp = WsResp {
            ret: ret_code::OK,
            act: downsync_act::BATTLE_STOPPED,
            rdf: Some(stop_frame),
            input_frame_downsync_batch: Vec::new(),
            bci: None,
        };
        self.broadcast_resp(&resp);
    }

    /// Called by the main loop after it drained. Runs settlement labor and
    /// proceeds to dismissal.
    pub(crate) fn on_battle_stopped_for_settlement(&self) {
        if room_state::STOPPING_BATTLE_FOR_SETTLEMENT != self.state() {
            return;
        }
        self.set_state(room_state::IN_SETTLEMENT);
        self.update_score();
        tracing::info!(room_id = self.id, "Room is in settlement");
        // TODO: settlement labor (scoring is not part of the sync core).
        self.on_settlement_completed();
    }

    fn on_settlement_completed(&self) {
        self.dismiss();
    }

    fn dismiss(&self) {
        if room_state::IN_SETTLEMENT != self.state() {
            return;
        }
        self.set_state(room_state::IN_DISMISSAL);
        self.update_score();

        let players: Vec<Arc<Player>> = {
            let players = self.players.read().expect("players lock");
            players.values().cloned().collect()
        };
        for player in players {
            tracing::info!(room_id = self.id, player_id = player.id, "Expelling for dismissal");
            player.signal_to_close(ret_code::OK, "room dismissal");
            self.on_player_lost(&player);
            player.set_battle_state(player_battle_state::EXPELLED_IN_DISMISSAL);
        }

        self.on_dismissed();
    }

    /// Reset every buffer, re-choose the stage and return to IDLE. Also the
    /// initializer for preallocated rooms.
    pub fn on_dismissed(&self) {
        self.players.write().expect("players lock").clear();
        self.discrete_inputs_buffer.clear();

        {
            let mut core = self.battle.lock().expect("battle lock");
            *core = BattleCore::fresh(self.capacity, &self.tuning, choose_stage());
        }

        self.set_render_frame_id(0);
        self.set_cur_dynamics_render_frame_id(0);
        self.store_last_all_confirmed_input_frame_id(-1);
        self.store_last_all_confirmed_input_frame_id_with_change(-1);
        self.publish_inputs_buffer_bounds(0, 0);
        self.effective_player_count.store(0, Ordering::Release);

        // IDLE only after every refresh above is visible.
        self.set_state(room_state::IDLE);
        self.update_score();
        tracing::info!(room_id = self.id, "Room completely dismissed");
    }

    // ------------------------------------------------------------------
    // Downsync plumbing
    // ------------------------------------------------------------------

    /// Players snapshot for kickoff/meta frames, keyed and ordered by id.
    pub fn snapshot_players(&self) -> BTreeMap<PlayerId, PlayerDownsync> {
        let players: Vec<Arc<Player>> = {
            let players = self.players.read().expect("players lock");
            players.values().cloned().collect()
        };
        players
            .iter()
            .map(|p| (p.id, p.downsync.lock().expect("downsync lock").clone()))
            .collect()
    }

    /// Meta frames mark lifecycle milestones; they carry the member
    /// snapshot so late sessions can draw the roster.
    fn broadcast_meta_frame(&self, act: i32) {
        let resp = WsResp {
            ret: ret_code::OK,
            act,
            rdf: Some(RoomDownsyncFrame {
                id: self.render_frame_id(),
                players: self.snapshot_players(),
                countdown_nanos: self.tuning.battle_duration_nanos(),
                melee_bullets: Vec::new(),
            }),
            input_frame_downsync_batch: Vec::new(),
            bci: None,
        };
        self.broadcast_resp(&resp);
    }

    fn broadcast_resp(&self, resp: &WsResp) {
        let bytes = match encode_ws_resp(resp) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::error!(room_id = self.id, error = %e, "Failed to encode broadcast");
                return;
            },
        };
        let players: Vec<Arc<Player>> = {
            let players = self.players.read().expect("players lock");
            players.values().cloned().collect()
        };
        for player in players {
            if !player.try_send(bytes.clone()) {
                tracing::debug!(
                    room_id = self.id,
                    player_id = player.id,
                    "Skipping broadcast to detached or slow session"
                );
            }
        }
    }

    /// Serialize and write one downsync to one player; any failure closes
    /// that session and the room moves on.
    pub(crate) fn send_safely(&self, player: &Player, resp: &WsResp) {
        match encode_ws_resp(resp) {
            Ok(bytes) => {
                if !player.try_send(Bytes::from(bytes)) {
                    player.signal_to_close(ret_code::UNKNOWN_ERROR, "downsync write failed");
                }
            },
            Err(e) => {
                tracing::error!(
                    room_id = self.id,
                    player_id = player.id,
                    error = %e,
                    "Error marshaling downsync message"
                );
                player.signal_to_close(ret_code::UNKNOWN_ERROR, "downsync serialize failed");
            },
        }
    }

    /// Players in `players_arr` (join-index) order, ACTIVE or not; fan-out
    /// filters. The slot array, not the map, is the determinism source.
    pub(crate) fn players_in_join_order(&self, core: &BattleCore) -> Vec<Arc<Player>> {
        let players = self.players.read().expect("players lock");
        core.players_arr
            .iter()
            .flatten()
            .filter_map(|player_id| players.get(player_id).cloned())
            .collect()
    }
}

fn choose_stage() -> Stage {
    let names = Stage::names();
    let chosen = names[rand::thread_rng().gen_range(0..names.len())];
    Stage::by_name(chosen).expect("builtin stage")
}
