//! The per-room battle pipeline: upsync scatter, input-frame prefab,
//! mark/force confirmation, server-side dynamics, downsync fan-out,
//! buffer eviction and the main loop task that drives them in order.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ringside_core::dynamics::{
    DynamicsConfig, apply_input_frame_downsync_dynamics_on_single_render_frame,
};
use ringside_core::frame::punch_skill;
use ringside_core::input::{
    InputFrameDownsync, convert_to_input_frame_id, convert_to_last_used_render_frame_id,
    should_prefab_input_frame_downsync,
};
use ringside_core::net::messages::{WsReq, WsResp, downsync_act, ret_code, upsync_act};

use crate::player::{MAGIC_LAST_SENT_INPUT_FRAME_ID_READDED, player_battle_state};
use crate::room::{BattleCore, Room, room_state};

/// Invariant violations that are fatal to one battle. The main loop traps
/// them and converts them into a settlement transition; the process keeps
/// serving other rooms.
#[derive(Debug)]
pub enum BattleFatal {
    MissingInputFrame { input_frame_id: i32, summary: String },
    MissingRenderFrame { render_frame_id: i32 },
    NotAllConfirmed { input_frame_id: i32, last_all_confirmed: i32 },
    CollidersUnavailable,
}

impl std::fmt::Display for BattleFatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInputFrame {
                input_frame_id,
                summary,
            } => write!(f, "required inputFrameId={input_frame_id} doesn't exist {summary}"),
            Self::MissingRenderFrame { render_frame_id } => {
                write!(f, "required renderFrameId={render_frame_id} doesn't exist")
            },
            Self::NotAllConfirmed {
                input_frame_id,
                last_all_confirmed,
            } => write!(
                f,
                "inputFrameId={input_frame_id} is not all-confirmed (lastAllConfirmed={last_all_confirmed})"
            ),
            Self::CollidersUnavailable => write!(f, "collision space not initialized"),
        }
    }
}

impl std::error::Error for BattleFatal {}

impl Room {
    /// Entry point for reader tasks: scatter the batch into the concurrent
    /// map and update the player's ack cursors. Obsolete, already-confirmed
    /// and absurdly advanced ids are dropped without touching the room.
    pub fn on_battle_cmd_received(&self, req: &WsReq) {
        if room_state::IN_BATTLE != self.state() {
            return;
        }
        if upsync_act::PLAYER_CMD != req.act {
            return;
        }

        let player = {
            let players = self.players.read().expect("players lock");
            match players.get(&req.player_id) {
                Some(p) => Arc::clone(p),
                None => {
                    tracing::warn!(
                        room_id = self.id,
                        player_id = req.player_id,
                        "upsync from non-member"
                    );
                    return;
                },
            }
        };
        player
            .acking_frame_id
            .store(req.acking_frame_id, Ordering::Release);
        player
            .acking_input_frame_id
            .store(req.acking_input_frame_id, Ordering::Release);

        let join_index = player.join_index_loaded();
        if join_index < 1 {
            return;
        }

        let st_frame_id = self.inputs_buffer_st_frame_id();
        // Inputs may legitimately run ahead of the prefab cursor (clients
        // tick faster than the diluted backend); only reject what could
        // never be consumed.
        let advance_cap =
            self.inputs_buffer_ed_frame_id() + self.tuning.input_buffer_size() as i32;
        for upsync in &req.input_frame_upsync_batch {
            let client_input_frame_id = upsync.input_frame_id;
            if client_input_frame_id < st_frame_id {
                tracing::warn!(
                    room_id = self.id,
                    player_id = req.player_id,
                    client_input_frame_id,
                    st_frame_id,
                    "Obsolete inputFrameUpsync dropped"
                );
                continue;
            }
            if client_input_frame_id <= self.last_all_confirmed_input_frame_id() {
                tracing::debug!(
                    room_id = self.id,
                    player_id = req.player_id,
                    client_input_frame_id,
                    "Already-confirmed inputFrameUpsync dropped"
                );
                continue;
            }
            if client_input_frame_id >= advance_cap {
                tracing::warn!(
                    room_id = self.id,
                    player_id = req.player_id,
                    client_input_frame_id,
                    advance_cap,
                    "inputFrame too advanced, is the client clock broken?"
                );
                continue;
            }
            self.discrete_inputs_buffer
                .insert((client_input_frame_id, join_index), *upsync);
        }
    }
}

/// Append the next input frame. Id 0 starts from all-zero inputs; later
/// frames clone the previous frame's direction bits, with the attack bit
/// cleared so an attack is never predicted forward.
pub(crate) fn prefab_input_frame_downsync(
    room: &Room,
    core: &mut BattleCore,
    input_frame_id: i32,
) -> Result<(), BattleFatal> {
    let frame = if 0 == input_frame_id && core.inputs_buffer.is_empty() {
        InputFrameDownsync {
            input_frame_id: 0,
            input_list: vec![0; room.capacity],
            confirmed_list: 0,
        }
    } else {
        let prev = core
            .inputs_buffer
            .get_by_frame_id(input_frame_id - 1)
            .ok_or_else(|| BattleFatal::MissingInputFrame {
                input_frame_id: input_frame_id - 1,
                summary: core.inputs_buffer_summary(),
            })?;
        InputFrameDownsync {
            input_frame_id,
            input_list: prev.input_list.iter().map(|v| v & 0b1111).collect(),
            confirmed_list: 0,
        }
    };
    core.inputs_buffer.put(frame);
    room.publish_inputs_buffer_bounds(core.inputs_buffer.st_frame_id, core.inputs_buffer.ed_frame_id);
    Ok(())
}

fn on_input_frame_downsync_all_confirmed(
    room: &Room,
    core: &mut BattleCore,
    input_frame_id: i32,
    input_list: &[u64],
) {
    if -1 == room.last_all_confirmed_input_frame_id_with_change()
        || input_list != core.last_all_confirmed_input_list.as_slice()
    {
        room.store_last_all_confirmed_input_frame_id_with_change(input_frame_id);
        tracing::debug!(room_id = room.id, input_frame_id, "Key inputFrame change");
    }
    room.store_last_all_confirmed_input_frame_id(input_frame_id);
    core.last_all_confirmed_input_list.copy_from_slice(input_list);
}

/// Gather scattered upsyncs into the prefabbed frames and confirm them
/// strictly in order, stopping at the first frame still missing a player.
pub(crate) fn mark_confirmation_if_applicable(room: &Room, core: &mut BattleCore) {
    let all_confirmed_mask = InputFrameDownsync::all_confirmed_mask(room.capacity);
    let mut input_frame_id = room.last_all_confirmed_input_frame_id() + 1;
    if input_frame_id < core.inputs_buffer.st_frame_id {
        input_frame_id = core.inputs_buffer.st_frame_id;
    }

    while input_frame_id < core.inputs_buffer.ed_frame_id {
        let (confirmed, input_list) = {
            let Some(frame) = core.inputs_buffer.get_mut_by_frame_id(input_frame_id) else {
                break;
            };
            for join_index in 1..=room.capacity as i32 {
                if let Some((_, upsync)) = room
                    .discrete_inputs_buffer
                    .remove(&(input_frame_id, join_index))
                {
                    frame.input_list[(join_index - 1) as usize] = upsync.encoded & 0b1_1111;
                    frame.confirmed_list |= 1u64 << (join_index - 1);
                }
            }
            (
                frame.confirmed_list == all_confirmed_mask,
                frame.input_list.clone(),
            )
        };
        if !confirmed {
            break;
        }
        on_input_frame_downsync_all_confirmed(room, core, input_frame_id, &input_list);
        input_frame_id += 1;
    }
}

/// Guard against laggy or vanished players stalling the authoritative
/// timeline: when the input frame that should long have been acked is
/// still partial, confirm it by decree. At most one frame per check, so
/// clients get `1 << input_scale_frames` render frames to recover between
/// forces. Returns the mask of players whose input got forced.
pub(crate) fn force_confirmation_if_applicable(
    room: &Room,
    core: &mut BattleCore,
) -> Result<u64, BattleFatal> {
    let render_frame_id_1 = room.render_frame_id() - room.tuning.nst_delay_frames;
    if render_frame_id_1 < 0
        || !should_prefab_input_frame_downsync(render_frame_id_1, room.tuning.input_scale_frames)
    {
        return Ok(0);
    }
    let input_frame_id_2 = render_frame_id_1 >> room.tuning.input_scale_frames;
    if input_frame_id_2 <= room.last_all_confirmed_input_frame_id() {
        // Already confirmed through natural acks.
        return Ok(0);
    }

    let all_confirmed_mask = InputFrameDownsync::all_confirmed_mask(room.capacity);
    let (unconfirmed_mask, input_list) = {
        let frame2 = match core.inputs_buffer.get_mut_by_frame_id(input_frame_id_2) {
            Some(f) => f,
            None => {
                let summary = core.inputs_buffer_summary();
                return Err(BattleFatal::MissingInputFrame {
                    input_frame_id: input_frame_id_2,
                    summary,
                });
            }
        };
        let old_confirmed_list = frame2.confirmed_list;
        frame2.confirmed_list = all_confirmed_mask;
        (
            old_confirmed_list ^ all_confirmed_mask,
            frame2.input_list.clone(),
        )
    };
    on_input_frame_downsync_all_confirmed(room, core, input_frame_id_2, &input_list);
    tracing::warn!(
        room_id = room.id,
        input_frame_id = input_frame_id_2,
        unconfirmed_mask,
        "Force-confirmed inputFrame"
    );
    Ok(unconfirmed_mask)
}

/// Move `curDynamicsRenderFrameId` from `from` to `to` one render frame at
/// a time. The backend only rolls forward; every consumed input frame must
/// already be all-confirmed.
pub(crate) fn apply_input_frame_downsync_dynamics(
    room: &Room,
    core: &mut BattleCore,
    from_render_frame_id: i32,
    to_render_frame_id: i32,
) -> Result<(), BattleFatal> {
    if from_render_frame_id >= to_render_frame_id {
        return Ok(());
    }
    let delay = room.tuning.input_delay_frames;
    let scale = room.tuning.input_scale_frames;
    let dynamics_cfg = DynamicsConfig {
        battle_duration_nanos: room.tuning.battle_duration_nanos(),
        rollback_estimated_dt_nanos: room.tuning.rollback_estimated_dt_nanos(),
        melee_skill: punch_skill(),
    };
    let all_confirmed_mask = InputFrameDownsync::all_confirmed_mask(room.capacity);

    for collision_sys_render_frame_id in from_render_frame_id..to_render_frame_id {
        let curr = core
            .render_frame_buffer
            .get_by_frame_id(collision_sys_render_frame_id)
            .ok_or(BattleFatal::MissingRenderFrame {
                render_frame_id: collision_sys_render_frame_id,
            })?
            .clone();

        // Negative means this render frame predates the first input frame
        // and is simulated without input.
        let delayed_input_frame_id = (collision_sys_render_frame_id - delay) >> scale;
        let delayed_input_frame = if delayed_input_frame_id >= 0 {
            if delayed_input_frame_id > room.last_all_confirmed_input_frame_id() {
                return Err(BattleFatal::NotAllConfirmed {
                    input_frame_id: delayed_input_frame_id,
                    last_all_confirmed: room.last_all_confirmed_input_frame_id(),
                });
            }
            let frame = match core
                .inputs_buffer
                .get_mut_by_frame_id(delayed_input_frame_id)
            {
                Some(f) => f,
                None => {
                    let summary = core.inputs_buffer_summary();
                    return Err(BattleFatal::MissingInputFrame {
                        input_frame_id: delayed_input_frame_id,
                        summary,
                    });
                }
            };
            // Authoritative override.
            frame.confirmed_list = all_confirmed_mask;
            Some(frame.clone())
        } else {
            None
        };

        let prev_delayed_input_frame_id = (collision_sys_render_frame_id - 1 - delay) >> scale;
        let prev_delayed_input_frame = if prev_delayed_input_frame_id >= 0 {
            core.inputs_buffer
                .get_by_frame_id(prev_delayed_input_frame_id)
                .cloned()
        } else {
            None
        };

        let BattleCore {
            colliders,
            bullet_local_id_counter,
            render_frame_buffer,
            ..
        } = core;
        let colliders = colliders.as_mut().ok_or(BattleFatal::CollidersUnavailable)?;
        let next = apply_input_frame_downsync_dynamics_on_single_render_frame(
            &curr,
            delayed_input_frame.as_ref(),
            prev_delayed_input_frame.as_ref(),
            colliders,
            &dynamics_cfg,
            bullet_local_id_counter,
        );
        render_frame_buffer.put(next);
        room.set_cur_dynamics_render_frame_id(collision_sys_render_frame_id + 1);
    }
    Ok(())
}

/// The reference render frame id downsyncs anchor to this tick: the last
/// render frame covered by the newest all-confirmed input, clamped to
/// what's actually been produced.
pub(crate) fn ref_render_frame_id(room: &Room) -> i32 {
    let upper = room.last_all_confirmed_input_frame_id();
    let scale = room.tuning.input_scale_frames;
    let mut ref_id = (upper << scale) + (1 << scale) - 1;
    let render_frame_id = room.render_frame_id();
    if ref_id > render_frame_id {
        ref_id = render_frame_id;
    }
    if room.tuning.backend_dynamics_enabled && ref_id > room.cur_dynamics_render_frame_id() {
        ref_id = room.cur_dynamics_render_frame_id();
    }
    ref_id
}

/// Per-player downsync selection. The transport is ordered and inputs are
/// never re-sent to the same session; `last_sent_input_frame_id` is the
/// cursor. `unconfirmed_mask` is this tick's force-confirmation fallout.
pub(crate) fn downsync_to_players(
    room: &Room,
    core: &mut BattleCore,
    unconfirmed_mask: u64,
) -> Result<(), BattleFatal> {
    let render_frame_id = room.render_frame_id();
    let upper_to_send_input_frame_id = room.last_all_confirmed_input_frame_id();
    let ref_id = ref_render_frame_id(room);
    let delay = room.tuning.input_delay_frames;
    let scale = room.tuning.input_scale_frames;

    for player in room.players_in_join_order(core) {
        if player_battle_state::ACTIVE != player.battle_state() {
            // A jammed channel would only delay battle recovery for the
            // reconnected player.
            continue;
        }

        if 0 == render_frame_id {
            let kickoff = core
                .render_frame_buffer
                .get_by_frame_id(0)
                .ok_or(BattleFatal::MissingRenderFrame { render_frame_id: 0 })?;
            room.send_safely(
                &player,
                &WsResp {
                    ret: ret_code::OK,
                    act: downsync_act::BATTLE_START,
                    rdf: Some(kickoff.clone()),
                    input_frame_downsync_batch: Vec::new(),
                    bci: None,
                },
            );
            continue;
        }

        let last_sent = player.last_sent_input_frame_id.load(Ordering::Acquire);
        let should_resync_1 = MAGIC_LAST_SENT_INPUT_FRAME_ID_READDED == last_sent;
        let mut candidate_to_send_input_frame_id = if should_resync_1 {
            // Rejoin sentinel: restart the batch where the reference frame
            // starts consuming inputs.
            convert_to_input_frame_id(ref_id, delay, scale)
        } else {
            last_sent + 1
        };
        if candidate_to_send_input_frame_id < core.inputs_buffer.st_frame_id {
            tracing::warn!(
                room_id = room.id,
                player_id = player.id,
                candidate_to_send_input_frame_id,
                st_frame_id = core.inputs_buffer.st_frame_id,
                "lastSentInputFrameId already evicted, clamping"
            );
            candidate_to_send_input_frame_id = core.inputs_buffer.st_frame_id;
        }

        let mut to_send_input_frames = Vec::new();
        let mut send_id = candidate_to_send_input_frame_id;
        while send_id <= upper_to_send_input_frame_id {
            let frame = core.inputs_buffer.get_by_frame_id(send_id).ok_or_else(|| {
                BattleFatal::MissingInputFrame {
                    input_frame_id: send_id,
                    summary: core.inputs_buffer_summary(),
                }
            })?;
            to_send_input_frames.push(frame.clone());
            send_id += 1;
        }
        if to_send_input_frames.is_empty() {
            continue;
        }

        let join_mask = 1u64 << (player.join_index_loaded() - 1);
        let should_resync_2 = 0 != (unconfirmed_mask & join_mask);
        // Any force this tick snaps every session, so even on-time clients
        // converge on the forced inputs immediately.
        let should_resync_3 = 0 != unconfirmed_mask;

        if room.tuning.backend_dynamics_enabled
            && (should_resync_1 || should_resync_2 || should_resync_3)
        {
            let ref_frame = core.render_frame_buffer.get_by_frame_id(ref_id).ok_or(
                BattleFatal::MissingRenderFrame {
                    render_frame_id: ref_id,
                },
            )?;
            room.send_safely(
                &player,
                &WsResp {
                    ret: ret_code::OK,
                    act: downsync_act::FORCED_RESYNC,
                    rdf: Some(ref_frame.clone()),
                    input_frame_downsync_batch: to_send_input_frames,
                    bci: None,
                },
            );
        } else {
            room.send_safely(
                &player,
                &WsResp {
                    ret: ret_code::OK,
                    act: downsync_act::INPUT_BATCH,
                    rdf: None,
                    input_frame_downsync_batch: to_send_input_frames,
                    bci: None,
                },
            );
        }
        player
            .last_sent_input_frame_id
            .store(send_id - 1, Ordering::Release);
    }
    Ok(())
}

/// Drop render frames below the reference frame and input frames nobody
/// can still need, bounded so no active player's send cursor is orphaned.
pub(crate) fn evict_buffers(room: &Room, core: &mut BattleCore, ref_id: i32) {
    while core.render_frame_buffer.cnt > 0 && core.render_frame_buffer.st_frame_id < ref_id {
        core.render_frame_buffer.pop();
    }

    let mut to_keep_input_frame_id = convert_to_input_frame_id(
        ref_id - room.tuning.sp_atk_lookup_frames,
        room.tuning.input_delay_frames,
        room.tuning.input_scale_frames,
    );
    let min_last_sent = room
        .players_in_join_order(core)
        .iter()
        .filter(|p| player_battle_state::ACTIVE == p.battle_state())
        .map(|p| p.last_sent_input_frame_id.load(Ordering::Acquire))
        .min();
    if let Some(min_last_sent) = min_last_sent {
        to_keep_input_frame_id = to_keep_input_frame_id.min(min_last_sent + 1);
    }
    // The newest frame always stays; the next prefab clones it.
    to_keep_input_frame_id = to_keep_input_frame_id.min(core.inputs_buffer.ed_frame_id - 1);

    while core.inputs_buffer.cnt > 0 && core.inputs_buffer.st_frame_id < to_keep_input_frame_id {
        core.inputs_buffer.pop();
    }
    let st = core.inputs_buffer.st_frame_id;
    room.publish_inputs_buffer_bounds(st, core.inputs_buffer.ed_frame_id);
    room.discrete_inputs_buffer
        .retain(|(input_frame_id, _), _| *input_frame_id >= st);
}

/// One full tick of the main loop, run with the battle core locked.
fn tick_once(room: &Room) -> Result<(), BattleFatal> {
    let mut core = room.battle.lock().expect("battle lock");
    let render_frame_id = room.render_frame_id();

    if should_prefab_input_frame_downsync(render_frame_id, room.tuning.input_scale_frames) {
        let no_delay_input_frame_id = render_frame_id >> room.tuning.input_scale_frames;
        prefab_input_frame_downsync(room, &mut core, no_delay_input_frame_id)?;
    }

    mark_confirmation_if_applicable(room, &mut core);
    let unconfirmed_mask = force_confirmation_if_applicable(room, &mut core)?;

    if room.tuning.backend_dynamics_enabled && 0 <= room.cur_dynamics_render_frame_id() {
        // The authoritative simulation trails the tick counter even when
        // prompt acks would allow it to run ahead.
        let next_dynamics_render_frame_id = convert_to_last_used_render_frame_id(
            room.last_all_confirmed_input_frame_id(),
            room.tuning.input_delay_frames,
            room.tuning.input_scale_frames,
        )
        .min(render_frame_id);
        apply_input_frame_downsync_dynamics(
            room,
            &mut core,
            room.cur_dynamics_render_frame_id(),
            next_dynamics_render_frame_id,
        )?;
    }

    downsync_to_players(room, &mut core, unconfirmed_mask)?;
    evict_buffers(room, &mut core, ref_render_frame_id(room));
    Ok(())
}

/// The task that exclusively owns a room's battle for its whole duration.
/// Paced slightly slower than the client frame rate
/// (`dt · 12/11`) so clients keep up with forced resyncs.
pub async fn battle_main_loop(room: Arc<Room>) {
    tracing::info!(room_id = room.id, "battle main loop started");
    let budget = Duration::from_nanos(room.tuning.diluted_rollback_estimated_dt_nanos() as u64);

    loop {
        let tick_started = tokio::time::Instant::now();

        if room.render_frame_id() > room.tuning.battle_duration_frames {
            tracing::info!(room_id = room.id, "battle duration exceeded");
            room.stop_battle_for_settlement();
        }
        if room_state::IN_BATTLE != room.state() {
            break;
        }

        if let Err(fatal) = tick_once(&room) {
            tracing::error!(room_id = room.id, error = %fatal, "fatal battle error");
            room.stop_battle_for_settlement();
            break;
        }

        room.set_render_frame_id(room.render_frame_id() + 1);

        let elapsed = tick_started.elapsed();
        if elapsed < budget {
            tokio::time::sleep(budget - elapsed).await;
        }
    }

    tracing::info!(room_id = room.id, "battle main loop stopped");
    room.on_battle_stopped_for_settlement();
}
