//! End-to-end matches over loopback TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use rts_core::command::{Action, GameTick};
use rts_core::components::{PlayerId, UnitId};
use rts_core::settings::ids;
use rts_core::simulation::Simulation;
use rts_net::barrier::DisconnectPolicy;
use rts_net::client::{ClientConnection, ClientEvent, LockstepClient};
use rts_net::config::ServerConfig;
use rts_net::error::{NetError, Result};
use rts_net::protocol::{AbortReason, FrameHeader, MessageKind, NetworkMessage, PROTOCOL_VERSION};
use rts_net::server::{LockstepServer, MatchOutcome};
use rts_net::transport::read_message;
use rts_test_utils::fixtures::cell;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn test_config(max_ticks: GameTick, disconnect: DisconnectPolicy) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".into(),
        tick_rate: 500,
        input_delay: 2,
        disconnect,
        handshake_timeout_ms: 2000,
        max_ticks: Some(max_ticks),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (SocketAddr, JoinHandle<Result<MatchOutcome>>) {
    let server = LockstepServer::bind(config).await.expect("bind ephemeral port");
    let addr = server.local_addr().expect("local addr");
    (addr, tokio::spawn(server.run()))
}

fn worker_of(sim: &Simulation, slot: PlayerId) -> UnitId {
    sim.entities()
        .iter()
        .find(|(_, e)| e.owner == slot && e.blueprint == ids::WORKER)
        .map(|(id, _)| *id)
        .expect("scenario gives every slot a worker")
}

async fn join(addr: SocketAddr, name: &'static str) -> Result<(ClientConnection, LockstepClient)> {
    let (conn, info, sim) = ClientConnection::connect(addr, name, Duration::from_secs(5)).await?;
    Ok((conn, LockstepClient::new(info.slot, info.input_delay, sim)))
}

/// Play until the server ends the match or `until` is reached.
/// Slot 0 orders its worker east on tick 3.
async fn play_out(
    mut conn: ClientConnection,
    mut client: LockstepClient,
    until: Option<GameTick>,
) -> Result<(LockstepClient, Vec<ClientEvent>)> {
    let worker = worker_of(client.simulation(), client.slot());
    let events = conn
        .play(&mut client, until, |c| {
            if c.slot() == 0 && c.simulation().tick() == 3 {
                vec![(worker, Action::Move { to: cell(10, 5) })]
            } else {
                Vec::new()
            }
        })
        .await?;
    Ok((client, events))
}

/// Join, then play.
async fn player(
    addr: SocketAddr,
    name: &'static str,
    until: Option<GameTick>,
) -> Result<(LockstepClient, Vec<ClientEvent>)> {
    let (conn, client) = join(addr, name).await?;
    play_out(conn, client, until).await
}

#[tokio::test]
async fn test_two_clients_finish_in_lockstep() {
    let (addr, server) = start_server(test_config(40, DisconnectPolicy::Exclude)).await;
    let a = tokio::spawn(player(addr, "alpha", None));
    let b = tokio::spawn(player(addr, "bravo", None));

    let (a, a_events) = tokio::time::timeout(TEST_TIMEOUT, a).await.unwrap().unwrap().unwrap();
    let (b, b_events) = tokio::time::timeout(TEST_TIMEOUT, b).await.unwrap().unwrap().unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(a.simulation().tick(), 40);
    assert_eq!(b.simulation().tick(), 40);
    assert_eq!(a.simulation().state_hash(), b.simulation().state_hash());
    assert_eq!(a.simulation().snapshot(), b.simulation().snapshot());
    assert_eq!(
        outcome,
        MatchOutcome::Completed {
            ticks: 40,
            checksum: Some(a.simulation().state_hash()),
        }
    );
    assert_eq!(a_events.last(), Some(&ClientEvent::MatchEnded));
    assert_eq!(b_events.last(), Some(&ClientEvent::MatchEnded));

    // The order from slot 0 reached both peers and moved the worker.
    let worker = worker_of(a.simulation(), 0);
    let moved_a = a.simulation().entities().get(worker).unwrap().cell;
    let moved_b = b.simulation().entities().get(worker).unwrap().cell;
    assert_eq!(moved_a, moved_b);
    assert_ne!(moved_a, cell(4, 2));
}

#[tokio::test]
async fn test_protocol_mismatch_is_rejected_and_match_continues() {
    let (addr, server) = start_server(test_config(10, DisconnectPolicy::Exclude)).await;

    let mut stranger = TcpStream::connect(addr).await.unwrap();
    let mut header = FrameHeader::new(MessageKind::Hello, 0).encode();
    header[0..2].copy_from_slice(&(PROTOCOL_VERSION + 98).to_be_bytes());
    stranger.write_all(&header).await.unwrap();
    let reply = tokio::time::timeout(TEST_TIMEOUT, read_message(&mut stranger))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reply,
        NetworkMessage::Abort {
            reason: AbortReason::ProtocolMismatch {
                expected: PROTOCOL_VERSION
            }
        }
    );

    let a = tokio::spawn(player(addr, "alpha", None));
    let b = tokio::spawn(player(addr, "bravo", None));
    let (a, _) = tokio::time::timeout(TEST_TIMEOUT, a).await.unwrap().unwrap().unwrap();
    let (b, _) = tokio::time::timeout(TEST_TIMEOUT, b).await.unwrap().unwrap().unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, MatchOutcome::Completed { ticks: 10, .. }));
    assert_ne!(a.slot(), b.slot());
    assert_eq!(a.simulation().state_hash(), b.simulation().state_hash());
}

async fn run_with_dropout(policy: DisconnectPolicy) {
    let (addr, server) = start_server(test_config(30, policy)).await;
    let stayer = tokio::spawn(player(addr, "stayer", None));
    // Give the first client slot 0 so the dropout is always slot 1.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let leaver = tokio::spawn(player(addr, "leaver", Some(5)));

    let (left, _) = tokio::time::timeout(TEST_TIMEOUT, leaver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(left.slot(), 1);
    assert_eq!(left.simulation().tick(), 5);
    drop(left);

    let (stayed, events) = tokio::time::timeout(TEST_TIMEOUT, stayer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let lost = events.iter().find_map(|e| match e {
        ClientEvent::PeerLost { slot, from_tick } => Some((*slot, *from_tick)),
        _ => None,
    });
    let (slot, from_tick) = lost.expect("surviving client hears about the dropout");
    assert_eq!(slot, 1);
    assert!(from_tick >= 5);
    assert_eq!(stayed.simulation().tick(), 30);
    assert!(matches!(outcome, MatchOutcome::Completed { ticks: 30, .. }));
}

#[tokio::test]
async fn test_dropout_with_exclude_policy() {
    run_with_dropout(DisconnectPolicy::Exclude).await;
}

#[tokio::test]
async fn test_dropout_with_pause_policy() {
    run_with_dropout(DisconnectPolicy::Pause { grace_ms: 50 }).await;
}

#[tokio::test]
async fn test_silent_connection_does_not_hold_up_the_lobby() {
    let mut config = test_config(10, DisconnectPolicy::Exclude);
    config.handshake_timeout_ms = 30_000;
    let (addr, server) = start_server(config).await;

    // Connected first and never says Hello.
    let _silent = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both must be seated well inside the silent peer's handshake timeout.
    let a = tokio::spawn(player(addr, "alpha", None));
    let b = tokio::spawn(player(addr, "bravo", None));
    let (a, _) = tokio::time::timeout(TEST_TIMEOUT, a).await.unwrap().unwrap().unwrap();
    let (b, _) = tokio::time::timeout(TEST_TIMEOUT, b).await.unwrap().unwrap().unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, MatchOutcome::Completed { ticks: 10, .. }));
    assert_ne!(a.slot(), b.slot());
    assert_eq!(a.simulation().state_hash(), b.simulation().state_hash());
}

#[tokio::test]
async fn test_late_joiner_is_told_match_is_full() {
    let (addr, server) = start_server(test_config(10, DisconnectPolicy::Exclude)).await;
    let (a, b) = tokio::join!(join(addr, "alpha"), join(addr, "bravo"));
    let (a_conn, a_client) = a.unwrap();
    let (b_conn, b_client) = b.unwrap();

    let late = tokio::time::timeout(TEST_TIMEOUT, join(addr, "charlie"))
        .await
        .unwrap();
    match late {
        Err(NetError::Rejected(reason)) => assert_eq!(reason, AbortReason::MatchFull.to_string()),
        Err(other) => panic!("expected MatchFull rejection, got {other}"),
        Ok(_) => panic!("a third player was seated in a two-slot match"),
    }

    let a = tokio::spawn(play_out(a_conn, a_client, None));
    let b = tokio::spawn(play_out(b_conn, b_client, None));
    tokio::time::timeout(TEST_TIMEOUT, a).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(TEST_TIMEOUT, b).await.unwrap().unwrap().unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, MatchOutcome::Completed { ticks: 10, .. }));
}

#[tokio::test]
async fn test_shutdown_aborts_running_match() {
    let server = LockstepServer::bind(test_config(1_000_000, DisconnectPolicy::Exclude))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));

    let a = tokio::spawn(player(addr, "alpha", None));
    let b = tokio::spawn(player(addr, "bravo", None));
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.send(()).unwrap();

    let outcome = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, MatchOutcome::Shutdown { .. }));

    for handle in [a, b] {
        let (client, events) = tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(client.is_ended());
        assert_eq!(
            events.last(),
            Some(&ClientEvent::Aborted(AbortReason::Shutdown))
        );
    }
}
