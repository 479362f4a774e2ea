use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ringside_core::PlayerId;
use ringside_core::input::InputFrameUpsync;
use ringside_core::net::messages::{BattleColliderInfo, WsReq, WsResp, downsync_act, upsync_act};
use ringside_core::net::protocol::{decode_ws_resp, encode_ws_req};

use ringside_server::build_app;
use ringside_server::config::{BattleTuning, RoomPoolConfig, ServerConfig};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    _serve: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, _state) = build_app(config);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _serve: handle,
        }
    }

    /// A short battle with a fast preparation countdown, so a whole
    /// lifecycle fits in a test.
    pub async fn quick_battle() -> Self {
        Self::from_config(ServerConfig {
            rooms: RoomPoolConfig {
                count: 2,
                capacity: 2,
            },
            battle: BattleTuning {
                battle_duration_frames: 120,
                battle_preparation_millis: 100,
                ..BattleTuning::default()
            },
            ..ServerConfig::default()
        })
        .await
    }

    pub fn ws_url(&self, player_id: PlayerId) -> String {
        format!("ws://{}/ws?player_id={player_id}", self.addr)
    }
}

pub async fn ws_connect(url: &str) -> WsClient {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn send_req(client: &mut WsClient, req: &WsReq) {
    let bytes = encode_ws_req(req).unwrap();
    client.send(Message::Binary(bytes.into())).await.unwrap();
}

pub async fn send_collider_ack(client: &mut WsClient, player_id: PlayerId) {
    send_req(
        client,
        &WsReq {
            player_id,
            join_index: 0,
            act: upsync_act::PLAYER_COLLIDER_ACK,
            acking_frame_id: 0,
            acking_input_frame_id: -1,
            input_frame_upsync_batch: Vec::new(),
        },
    )
    .await;
}

pub async fn send_cmd(
    client: &mut WsClient,
    player_id: PlayerId,
    join_index: i32,
    input_frame_id: i32,
    encoded: u64,
) {
    send_req(
        client,
        &WsReq {
            player_id,
            join_index,
            act: upsync_act::PLAYER_CMD,
            acking_frame_id: 0,
            acking_input_frame_id: -1,
            input_frame_upsync_batch: vec![InputFrameUpsync {
                input_frame_id,
                encoded,
            }],
        },
    )
    .await;
}

/// Next downsync, failing the test if none arrives in time.
pub async fn read_resp(client: &mut WsClient) -> WsResp {
    try_read_resp(client, 3_000)
        .await
        .expect("expected a downsync before timeout")
}

pub async fn try_read_resp(client: &mut WsClient, timeout_millis: u64) -> Option<WsResp> {
    let deadline = Duration::from_millis(timeout_millis);
    loop {
        let msg = tokio::time::timeout(deadline, client.next()).await.ok()??;
        match msg.ok()? {
            Message::Binary(data) => return Some(decode_ws_resp(&data).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Connect and consume the `BattleColliderInfo` handshake push.
pub async fn connect_admitted(server: &TestServer, player_id: PlayerId) -> (WsClient, BattleColliderInfo) {
    let mut client = ws_connect(&server.ws_url(player_id)).await;
    let resp = read_resp(&mut client).await;
    assert_eq!(resp.act, downsync_act::HB_REQ);
    let bci = resp.bci.expect("admission pushes battle collider info");
    (client, bci)
}

/// Read downsyncs until one matches `act` (collecting everything seen),
/// failing on timeout.
pub async fn read_until_act(client: &mut WsClient, act: i32) -> Vec<WsResp> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        let resp = read_resp(client).await;
        let found = resp.act == act;
        seen.push(resp);
        if found {
            return seen;
        }
    }
    panic!("act {act} never arrived; saw {} downsyncs", seen.len());
}
