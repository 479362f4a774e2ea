use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ringside_core::PlayerId;
use ringside_core::net::messages::{BattleColliderInfo, WsResp, downsync_act, ret_code, upsync_act};
use ringside_core::net::protocol::{MAX_MESSAGE_SIZE, decode_ws_req, encode_ws_resp};

use crate::player::{Player, PlayerSession};
use crate::room::Room;
use crate::state::{AppState, ConnectionGuard};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub player_id: PlayerId,
    pub name: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<axum::response::Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if params.player_id <= 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, params))
        .into_response())
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: WsParams) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let player_id = params.player_id;

    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.player_message_buffer);
    let close = CancellationToken::new();
    let session = PlayerSession {
        sender: tx,
        close: close.clone(),
    };

    let room = match admit(&state, player_id, params.name, session) {
        Ok(room) => room,
        Err(ret) => {
            tracing::warn!(player_id, ret, "Admission failed");
            let reject = WsResp {
                ret,
                act: downsync_act::HB_REQ,
                rdf: None,
                input_frame_downsync_batch: Vec::new(),
                bci: None,
            };
            if let Ok(bytes) = encode_ws_resp(&reject) {
                let _ = socket.send(Message::Binary(bytes.into())).await;
            }
            return;
        },
    };

    // First downsync on any admitted session: the battle collider info the
    // client mirrors before acking.
    let bci = battle_collider_info(&room);
    {
        let players = room.players.read().expect("players lock");
        if let Some(player) = players.get(&player_id) {
            room.send_safely(
                player,
                &WsResp {
                    ret: ret_code::OK,
                    act: downsync_act::HB_REQ,
                    rdf: None,
                    input_frame_downsync_batch: Vec::new(),
                    bci: Some(bci),
                },
            );
        }
    }

    let (ws_sink, ws_stream) = socket.split();
    spawn_writer(ws_sink, rx, close.clone());

    tracing::info!(player_id, room_id = room.id, "Session established");
    read_loop(ws_stream, &room, player_id, close).await;

    room.on_player_disconnected(player_id);
    tracing::info!(player_id, room_id = room.id, "Player session ended");
}

/// Route the player into a room: back into the one that still remembers
/// it, otherwise the best room the matchmaking heap offers.
fn admit(
    state: &AppState,
    player_id: PlayerId,
    name: Option<String>,
    session: PlayerSession,
) -> Result<Arc<Room>, i32> {
    if let Some(room) = state.find_room_with_player(player_id) {
        if room.re_add_player_if_possible(player_id, session) {
            return Ok(room);
        }
        return Err(ret_code::PLAYER_NOT_ADDABLE_TO_ROOM);
    }

    let player = Arc::new(Player::new(
        player_id,
        name.unwrap_or_else(|| format!("Player{player_id}")),
    ));

    // Walk the heap best-first. A full-but-still-WAITING room keeps a
    // positive score until its battle starts, so admission failures must
    // skip past it instead of giving up.
    let mut heap = state.room_heap.lock().expect("room heap lock");
    let mut skipped = Vec::new();
    let mut admitted_room = None;
    while let Some(room) = heap.pop() {
        let admitted = room.add_player_if_possible(Arc::clone(&player), session.clone());
        skipped.push(Arc::clone(&room));
        if admitted {
            admitted_room = Some(room);
            break;
        }
    }
    // Every popped room returns to the pool; its own score decides whether
    // it is offered again.
    for room in skipped {
        heap.push(room);
    }
    admitted_room.ok_or(ret_code::PLAYER_NOT_ADDABLE_TO_ROOM)
}

fn battle_collider_info(room: &Room) -> BattleColliderInfo {
    let core = room.battle.lock().expect("battle lock");
    BattleColliderInfo {
        room_id: room.id,
        room_capacity: room.capacity as i32,
        stage_name: core.stage.name.to_string(),
        stage_discrete_w: core.stage.stage_discrete_w,
        stage_discrete_h: core.stage.stage_discrete_h,
        stage_tile_w: core.stage.stage_tile_w,
        stage_tile_h: core.stage.stage_tile_h,
        server_fps: room.tuning.server_fps,
        battle_duration_frames: room.tuning.battle_duration_frames,
        battle_duration_nanos: room.tuning.battle_duration_nanos(),
        rollback_estimated_dt_nanos: room.tuning.rollback_estimated_dt_nanos(),
        input_delay_frames: room.tuning.input_delay_frames,
        input_scale_frames: room.tuning.input_scale_frames,
        nst_delay_frames: room.tuning.nst_delay_frames,
        sp_atk_lookup_frames: room.tuning.sp_atk_lookup_frames,
        render_cache_size: room.tuning.render_cache_size as i32,
        world_to_virtual_grid_ratio: ringside_core::grid::WORLD_TO_VIRTUAL_GRID_RATIO,
        virtual_grid_to_world_ratio: ringside_core::grid::VIRTUAL_GRID_TO_WORLD_RATIO,
        melee_skill: ringside_core::frame::punch_skill(),
    }
}

/// Outbound half: drains the bounded channel into the socket. Closing the
/// token (from `signal_to_close` or the reader) ends it with a close
/// frame.
fn spawn_writer(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    close: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = close.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                item = rx.recv() => {
                    match item {
                        Some(data) => {
                            if ws_sink.send(Message::Binary(data)).await.is_err() {
                                close.cancel();
                                break;
                            }
                        },
                        None => break,
                    }
                }
            }
        }
    });
}

/// Inbound half: every binary message is one `WsReq`. Player commands go
/// to the room's scatter path; collider acks drive the lifecycle.
async fn read_loop(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    room: &Arc<Room>,
    player_id: PlayerId,
    close: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            msg = ws_stream.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(d))) => d,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                if data.is_empty() || data.len() > MAX_MESSAGE_SIZE {
                    continue;
                }
                let req = match decode_ws_req(&data) {
                    Ok(req) => req,
                    Err(e) => {
                        tracing::debug!(player_id, error = %e, "Undecodable upsync dropped");
                        continue;
                    },
                };
                if req.player_id != player_id {
                    tracing::warn!(
                        player_id,
                        claimed = req.player_id,
                        "Spoofed player id in upsync"
                    );
                    continue;
                }
                match req.act {
                    upsync_act::PLAYER_CMD => room.on_battle_cmd_received(&req),
                    upsync_act::PLAYER_COLLIDER_ACK => {
                        room.on_player_battle_collider_acked(player_id);
                    },
                    upsync_act::HB_PING => {},
                    other => {
                        tracing::debug!(player_id, act = other, "Unknown upsync act");
                    },
                }
            }
        }
    }
}
