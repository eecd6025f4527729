//! Integration tests for the game server over real TCP sockets.
//!
//! These drive complete games through the WebSocket transport: role
//! assignment, move broadcasting, wins, draws, restarts and shutdown.

mod common;

use common::{play, two_players, LinesClient, TestServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ttt_core::{GameState, Role};
use ttt_protocol::frame::{Inbound, Opcode, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use ttt_protocol::handshake::HealthReport;
use ttt_protocol::message::{ClientMessage, ServerMessage, GAME_FULL_MESSAGE};

// ============================================================================
// Role assignment
// ============================================================================

#[tokio::test]
async fn test_roles_assigned_in_order_and_third_rejected() {
    let server = TestServer::spawn().await;

    let (_x, role, state) = server.join().await;
    assert_eq!(role, Role::X);
    assert_eq!(state, GameState::new());

    let (_o, role, _) = server.join().await;
    assert_eq!(role, Role::O);

    let mut third = server.connect().await;
    assert_eq!(
        third.recv_message().await,
        ServerMessage::Error {
            message: GAME_FULL_MESSAGE.to_string()
        }
    );
    assert_eq!(third.expect_closed().await, Some(CLOSE_POLICY_VIOLATION));
}

#[tokio::test]
async fn test_role_freed_on_disconnect() {
    let server = TestServer::spawn().await;
    let (x, _o) = two_players(&server).await;

    x.close().await;

    let (_next, role, _) = server.join().await;
    assert_eq!(role, Role::X);
}

#[tokio::test]
async fn test_assignment_carries_current_state() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    play(&mut x, &mut o, &[4]).await;
    o.close().await;

    let (_late, role, state) = server.join().await;
    assert_eq!(role, Role::O);
    assert_eq!(state.board[4], Some(Role::X));
    assert_eq!(state.next_role, Role::O);
}

#[tokio::test]
async fn test_rapid_connect_disconnect_leaks_no_roles() {
    let server = TestServer::spawn().await;

    for _ in 0..10 {
        let (client, role, _) = server.join().await;
        assert_eq!(role, Role::X);
        client.close().await;
    }

    let (_x, _o) = two_players(&server).await;
}

// ============================================================================
// Game play
// ============================================================================

#[tokio::test]
async fn test_move_broadcast_to_both_players() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    x.make_move(4).await;

    let seen_by_x = x.recv_state().await;
    let seen_by_o = o.recv_state().await;
    assert_eq!(seen_by_x, seen_by_o);
    assert_eq!(seen_by_x.board[4], Some(Role::X));
    assert_eq!(seen_by_x.next_role, Role::O);
}

#[tokio::test]
async fn test_row_win_then_moves_ignored() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    let state = play(&mut x, &mut o, &[0, 4, 1, 3, 2]).await;
    assert_eq!(
        state.board,
        [
            Some(Role::X),
            Some(Role::X),
            Some(Role::X),
            Some(Role::O),
            Some(Role::O),
            None,
            None,
            None,
            None
        ]
    );
    assert_eq!(state.winner, Some(Role::X));
    assert!(!state.is_draw);

    // Game over: nothing is broadcast for either player.
    o.make_move(5).await;
    x.make_move(6).await;
    x.expect_silence().await;
    o.expect_silence().await;
}

#[tokio::test]
async fn test_draw_detected() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    let state = play(&mut x, &mut o, &[0, 1, 2, 4, 3, 5, 7, 6, 8]).await;
    assert_eq!(state.winner, None);
    assert!(state.is_draw);
    assert!(state.board.iter().all(Option::is_some));
}

#[tokio::test]
async fn test_illegal_moves_are_silent() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    // O out of turn, then out-of-range and negative cells
    o.make_move(0).await;
    x.make_move(9).await;
    x.make_move(-1).await;
    x.expect_silence().await;
    o.expect_silence().await;

    // Occupied cell
    play(&mut x, &mut o, &[4]).await;
    o.make_move(4).await;
    o.expect_silence().await;

    // A legal move still goes through afterwards
    o.make_move(0).await;
    let state = x.recv_state().await;
    assert_eq!(state.board[0], Some(Role::O));
    assert_eq!(state.board[4], Some(Role::X));
}

#[tokio::test]
async fn test_restart_resets_for_everyone() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    play(&mut x, &mut o, &[0, 4, 1, 3, 2]).await;

    o.restart().await;
    assert_eq!(x.recv_state().await, GameState::new());
    assert_eq!(o.recv_state().await, GameState::new());

    // X opens again
    let state = play(&mut x, &mut o, &[8]).await;
    assert_eq!(state.board[8], Some(Role::X));
}

#[tokio::test]
async fn test_restart_mid_game() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    play(&mut x, &mut o, &[0, 4]).await;
    x.send(&ClientMessage::RestartGame).await;

    assert_eq!(x.recv_state().await, GameState::new());
    assert_eq!(o.recv_state().await, GameState::new());
}

#[tokio::test]
async fn test_rejected_third_client_sees_no_broadcasts() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    let mut third = server.connect().await;
    let _ = third.recv_message().await;
    third.expect_closed().await;

    play(&mut x, &mut o, &[0]).await;
}

// ============================================================================
// Control frames and shutdown
// ============================================================================

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let server = TestServer::spawn().await;
    let (mut x, _, _) = server.join().await;

    x.send_frame(Opcode::Ping, b"are you there").await;
    match x.recv().await {
        Some(Inbound::Pong(payload)) => assert_eq!(&payload[..], b"are you there"),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_frame_echoed() {
    let server = TestServer::spawn().await;
    let (mut x, _, _) = server.join().await;

    x.send_frame(Opcode::Close, &CLOSE_NORMAL.to_be_bytes()).await;
    assert_eq!(x.expect_closed().await, Some(CLOSE_NORMAL));
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::spawn().await;
    let (mut x, mut o) = two_players(&server).await;

    server.cancel();

    for client in [&mut x, &mut o] {
        let code = client.expect_closed().await;
        assert!(code.is_none() || code == Some(CLOSE_GOING_AWAY), "got {code:?}");
    }
}

// ============================================================================
// Health probe and JSON-lines transport
// ============================================================================

#[tokio::test]
async fn test_health_probe() {
    let server = TestServer::spawn().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/json"));
    let report: HealthReport = serde_json::from_str(body).unwrap();
    assert_eq!(report.status, "ok");
    assert_eq!(report.instance, "node-a");

    // The probe takes no role
    let (_x, role, _) = server.join().await;
    assert_eq!(role, Role::X);
}

#[tokio::test]
async fn test_json_lines_game() {
    let server = TestServer::spawn_lines().await;

    let mut x = LinesClient::connect(server.addr).await;
    let Some(ServerMessage::PlayerAssignment { data }) = x.recv().await else {
        panic!("expected assignment");
    };
    assert_eq!(data.player_role, Role::X);

    let mut o = LinesClient::connect(server.addr).await;
    let Some(ServerMessage::PlayerAssignment { data }) = o.recv().await else {
        panic!("expected assignment");
    };
    assert_eq!(data.player_role, Role::O);

    x.send(&ClientMessage::make_move(4)).await;
    for client in [&mut x, &mut o] {
        let Some(ServerMessage::GameState { data }) = client.recv().await else {
            panic!("expected game state");
        };
        assert_eq!(data.board[4], Some(Role::X));
    }

    // Unknown lines are ignored; the session stays open
    o.send_line("not json").await;
    o.send(&ClientMessage::make_move(0)).await;
    let Some(ServerMessage::GameState { data }) = x.recv().await else {
        panic!("expected game state");
    };
    assert_eq!(data.board[0], Some(Role::O));

    let mut third = LinesClient::connect(server.addr).await;
    assert_eq!(
        third.recv().await,
        Some(ServerMessage::Error {
            message: GAME_FULL_MESSAGE.to_string()
        })
    );
    assert_eq!(third.recv().await, None);
}
