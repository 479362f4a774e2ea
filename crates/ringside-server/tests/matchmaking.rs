#[allow(dead_code)]
mod common;

use common::{TestServer, connect_admitted, read_resp, ws_connect};
use ringside_core::net::messages::ret_code;
use ringside_server::config::{BattleTuning, RoomPoolConfig, ServerConfig};

#[tokio::test]
async fn players_fill_one_room_then_spill_to_the_next() {
    let server = TestServer::from_config(ServerConfig {
        rooms: RoomPoolConfig {
            count: 2,
            capacity: 2,
        },
        ..ServerConfig::default()
    })
    .await;

    let (_c1, bci1) = connect_admitted(&server, 1).await;
    let (_c2, bci2) = connect_admitted(&server, 2).await;
    assert_eq!(bci1.room_id, bci2.room_id, "second player tops up the waiting room");

    // The first room is full (nobody acked, so it is still WAITING);
    // the third player must land in the other room.
    let (_c3, bci3) = connect_admitted(&server, 3).await;
    assert_ne!(bci3.room_id, bci1.room_id);
}

#[tokio::test]
async fn exhausted_pool_rejects_with_ret_code() {
    let server = TestServer::from_config(ServerConfig {
        rooms: RoomPoolConfig {
            count: 1,
            capacity: 2,
        },
        ..ServerConfig::default()
    })
    .await;

    let (_c1, _) = connect_admitted(&server, 1).await;
    let (_c2, _) = connect_admitted(&server, 2).await;

    let mut c3 = ws_connect(&server.ws_url(3)).await;
    let resp = read_resp(&mut c3).await;
    assert_ne!(resp.ret, ret_code::OK);
    assert!(resp.bci.is_none());
}

#[tokio::test]
async fn duplicate_player_id_is_treated_as_rejoin_target() {
    let server = TestServer::from_config(ServerConfig {
        rooms: RoomPoolConfig {
            count: 2,
            capacity: 2,
        },
        battle: BattleTuning {
            battle_preparation_millis: 50,
            ..BattleTuning::default()
        },
        ..ServerConfig::default()
    })
    .await;

    let (_c1, bci1) = connect_admitted(&server, 7).await;
    // Same player id again while the first session is still attached: the
    // room remembers the membership, so this goes down the readmission
    // path into the same room.
    let (_c1b, bci1b) = connect_admitted(&server, 7).await;
    assert_eq!(bci1.room_id, bci1b.room_id);
}
