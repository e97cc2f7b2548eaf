//! Two-node scenarios over the in-memory network and over TCP.

use hive_node::{AgentOptions, Listener, MemoryNetwork, Node, PeerInfo, TcpConnector};
use hive_types::{codes, HiveConfig, HiveError, NodeId, Shutdown};
use hive_wire::{Codec, Head};
use hive_worker::Policy;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const GAME: u16 = 10;
const LOBBY: u16 = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Join {
    player: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Joined {
    seat: u32,
    greeting: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Move {
    seq: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RoundOver {
    round: u32,
}

fn codec() -> Codec {
    let codec = Codec::new();
    codec.register::<Join, Joined>(GAME, 1, 2).unwrap();
    codec.register_one::<Move>(GAME, 3).unwrap();
    codec.register_one::<RoundOver>(GAME, 5).unwrap();
    codec
}

fn config(node_id: NodeId, services: Vec<u16>) -> HiveConfig {
    HiveConfig {
        node_id,
        services,
        listen_addr: format!("node-{node_id}"),
        reconnect_delay_ms: 10,
        send_retry_ms: 10,
        heartbeat_secs: 0,
        ..HiveConfig::default()
    }
}

struct Mesh {
    network: Arc<MemoryNetwork>,
    server: Arc<Node>,
    client: Arc<Node>,
}

/// Node 1 hosts GAME and listens on "node-1"; node 2 hosts LOBBY.
fn mesh() -> Mesh {
    mesh_with(config(1, vec![GAME]))
}

fn mesh_with(server_config: HiveConfig) -> Mesh {
    let network = MemoryNetwork::new();
    let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
    let server = Node::new(server_config, codec(), connector.clone(), Shutdown::never()).unwrap();
    network.listen("node-1", server.acceptor());
    let client = Node::new(config(2, vec![LOBBY]), codec(), connector, Shutdown::never()).unwrap();
    Mesh {
        network,
        server,
        client,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Node 2 subscribes to RoundOver on node 1; returns the rounds it receives.
async fn watch_rounds(m: &Mesh) -> mpsc::UnboundedReceiver<Option<u32>> {
    let (tx, rx) = mpsc::unbounded_channel();
    m.client
        .router()
        .bind_notify(GAME, 5, Policy::Inline, move |pkt| {
            let _ = tx.send(pkt.msg_as::<RoundOver>().map(|r| r.round));
            Ok(())
        })
        .unwrap();
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("watch from node 2", || !m.server.watchers(GAME, 5).is_empty()).await;
    rx
}

async fn assert_nothing_delivered(m: &Mesh, rx: &mut mpsc::UnboundedReceiver<Option<u32>>) {
    assert!(m.server.watchers(GAME, 5).is_empty());
    assert!(m.server.watched_keys(2).is_empty());
    assert_eq!(m.server.notify(Head::new(), RoundOver { round: 9 }).unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

fn bind_join(node: &Node) {
    node.router()
        .bind_request(GAME, 1, Policy::Share, |pkt| {
            let player = pkt
                .msg_as::<Join>()
                .map(|j| j.player.clone())
                .unwrap_or_default();
            if player.is_empty() {
                return Err(HiveError::Fail(1234));
            }
            pkt.ok(Joined {
                seat: 4,
                greeting: format!("welcome {player}"),
            });
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn test_remote_call_succeeds() {
    let m = mesh();
    bind_join(&m.server);
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("link to node 1", || m.client.is_connected(1)).await;

    let mut res = Joined::default();
    let code = m
        .client
        .call(Head::new(), Join { player: "ada".into() }, &mut res)
        .await;
    assert_eq!(code, codes::SUCCESS);
    assert_eq!(res.seat, 4);
    assert_eq!(res.greeting, "welcome ada");
    assert_eq!(m.client.router().pending_count(), 0);
}

#[tokio::test]
async fn test_remote_call_failure_leaves_response_untouched() {
    let m = mesh();
    bind_join(&m.server);
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("link to node 1", || m.client.is_connected(1)).await;

    let mut res = Joined {
        seat: 99,
        greeting: "unchanged".into(),
    };
    let code = m.client.call(Head::new(), Join::default(), &mut res).await;
    assert_eq!(code, 1234);
    assert_eq!(res.seat, 99);
    assert_eq!(res.greeting, "unchanged");
}

#[tokio::test]
async fn test_call_to_unbound_method_fails_not_exist() {
    let m = mesh();
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("link to node 1", || m.client.is_connected(1)).await;

    let mut res = Joined::default();
    let code = m
        .client
        .call(Head::new(), Join { player: "bo".into() }, &mut res)
        .await;
    assert_eq!(code, codes::NOT_EXIST);
}

#[tokio::test]
async fn test_call_to_unknown_service_fails_immediately() {
    let m = mesh();
    let mut res = Joined::default();
    let code = m
        .client
        .call(Head::new(), Join { player: "cy".into() }, &mut res)
        .await;
    assert_eq!(code, codes::NOT_EXIST);
    assert_eq!(m.client.router().pending_count(), 0);
}

#[tokio::test]
async fn test_watch_subscription_and_cleanup() {
    let m = mesh();
    let (tx, mut rx) = mpsc::unbounded_channel();
    m.client
        .router()
        .bind_notify(GAME, 5, Policy::Inline, move |pkt| {
            let _ = tx.send(pkt.msg_as::<RoundOver>().map(|r| r.round));
            Ok(())
        })
        .unwrap();
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("watch from node 2", || !m.server.watchers(GAME, 5).is_empty()).await;
    assert_eq!(m.server.watchers(GAME, 5)[0].0, 2);
    assert_eq!(m.server.watched_keys(2).len(), 1);

    let delivered = m.server.notify(Head::new(), RoundOver { round: 3 }).unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(rx.recv().await.unwrap(), Some(3));

    m.client.disconnect(GAME, 1).unwrap();
    eventually("watch cleanup", || {
        m.server.watchers(GAME, 5).is_empty() && m.server.watched_keys(2).is_empty()
    })
    .await;
    assert_eq!(m.server.notify(Head::new(), RoundOver { round: 4 }).unwrap(), 0);
    assert!(m.client.hosts(GAME).is_empty());
}

#[tokio::test]
async fn test_disconnecting_a_node_drops_its_watches() {
    let m = mesh();
    m.network.listen("node-2", m.client.acceptor());
    let mut rx = watch_rounds(&m).await;

    m.server.connect(PeerInfo::new(LOBBY, 2, "node-2")).unwrap();
    eventually("link to node 2", || m.server.is_connected(2)).await;
    assert_eq!(m.server.watched_keys(2).len(), 1);

    m.server.disconnect(LOBBY, 2).unwrap();
    eventually("watch cleanup", || m.server.watchers(GAME, 5).is_empty()).await;
    assert!(m.server.dialer(2).is_none());
    assert_nothing_delivered(&m, &mut rx).await;
}

#[tokio::test]
async fn test_lost_node_drops_its_watches() {
    let mut server_config = config(1, vec![GAME]);
    server_config.max_reconnect = 1;
    let m = mesh_with(server_config);
    let mut rx = watch_rounds(&m).await;

    // Node 1 learns of node 2 at an address nobody listens on; its dialer
    // gives up and the node is dropped along with its watches.
    m.server.connect(PeerInfo::new(LOBBY, 2, "nowhere")).unwrap();
    eventually("watch cleanup", || m.server.watchers(GAME, 5).is_empty()).await;
    assert!(m.server.hosts(LOBBY).is_empty());
    assert_nothing_delivered(&m, &mut rx).await;
}

#[tokio::test]
async fn test_notify_filter_uses_watch_meta() {
    let network = MemoryNetwork::new();
    let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
    let server =
        Node::new(config(1, vec![GAME]), codec(), connector.clone(), Shutdown::never()).unwrap();
    network.listen("node-1", server.acceptor());
    let mut cfg = config(2, vec![LOBBY]);
    cfg.watch_meta.insert("zone".into(), "eu".into());
    let client = Node::new(cfg, codec(), connector, Shutdown::never()).unwrap();
    client
        .router()
        .bind_notify(GAME, 5, Policy::Inline, |_| Ok(()))
        .unwrap();
    client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("watch from node 2", || !server.watchers(GAME, 5).is_empty()).await;

    let us = server
        .notify_where(Head::new(), RoundOver { round: 1 }, |meta| {
            meta.get_str("zone") == Some("us")
        })
        .unwrap();
    assert_eq!(us, 0);
    assert!(server
        .notify_one(Head::new(), RoundOver { round: 2 }, |meta| {
            meta.get_str("zone") == Some("eu")
        })
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_dialer_gives_up_after_max_reconnect() {
    let network = MemoryNetwork::new();
    let connector = Arc::new(network.connector(AgentOptions::default(), Shutdown::never()));
    let mut cfg = config(2, vec![LOBBY]);
    cfg.max_reconnect = 3;
    let client = Node::new(cfg, codec(), connector, Shutdown::never()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_service_disconnected(move |svc, node| {
        let _ = tx.send((svc, node));
    });

    client.connect(PeerInfo::new(GAME, 1, "nowhere")).unwrap();
    assert_eq!(rx.recv().await.unwrap(), (GAME, 1));
    assert_eq!(network.attempts("nowhere"), 3);
    assert!(client.hosts(GAME).is_empty());
    assert!(client.dialer(1).is_none());
}

#[tokio::test]
async fn test_active_policy_keeps_push_order() {
    let m = mesh();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    m.server
        .router()
        .bind_push(GAME, 3, Policy::Active, move |pkt| {
            if let Some(mv) = pkt.msg_as::<Move>() {
                sink.lock().unwrap().push(mv.seq);
            }
            Ok(())
        })
        .unwrap();
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("link to node 1", || m.client.is_connected(1)).await;

    for seq in 0..50 {
        tokio_test::assert_ok!(m.client.push(Head::new().with("key", "table-7"), Move { seq }));
    }
    eventually("all moves", || seen.lock().unwrap().len() == 50).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_connected_hooks_and_directory() {
    let m = mesh();
    let (tx, mut rx) = mpsc::unbounded_channel();
    m.client.on_service_connected(move |svc, node| {
        let _ = tx.send((svc, node));
    });
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    assert_eq!(rx.recv().await.unwrap(), (GAME, 1));
    assert_eq!(m.client.hosts(GAME), vec![1]);
    let records = m.client.directory().connected();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].addr, "node-1");

    // Same node id again: no second dialer.
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.network.attempts("node-1"), 1);
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let m = mesh();
    m.server
        .router()
        .bind_request(GAME, 1, Policy::Go, |pkt| {
            // Never answered before the client closes.
            std::mem::forget(pkt);
            Ok(())
        })
        .unwrap();
    m.client.connect(PeerInfo::new(GAME, 1, "node-1")).unwrap();
    eventually("link to node 1", || m.client.is_connected(1)).await;

    let client = Arc::clone(&m.client);
    let call = tokio::spawn(async move {
        let mut res = Joined::default();
        client.call(Head::new(), Join { player: "di".into() }, &mut res).await
    });
    eventually("pending request", || m.client.router().pending_count() == 1).await;
    m.client.close().await;
    assert_eq!(call.await.unwrap(), codes::CLOSED);
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let options = AgentOptions::default();
    let server = Node::new(
        config(1, vec![GAME]),
        codec(),
        Arc::new(TcpConnector::new(options, Shutdown::never())),
        Shutdown::never(),
    )
    .unwrap();
    bind_join(&server);
    let listener = Listener::bind("127.0.0.1:0", options, Shutdown::never())
        .await
        .unwrap();
    let addr = listener.local_addr().to_string();
    let _accept = listener.run(server.acceptor());

    let client = Node::new(
        config(2, vec![LOBBY]),
        codec(),
        Arc::new(TcpConnector::new(options, Shutdown::never())),
        Shutdown::never(),
    )
    .unwrap();
    client.connect(PeerInfo::new(GAME, 1, addr)).unwrap();
    eventually("tcp link", || client.is_connected(1)).await;

    let mut res = Joined::default();
    let code = client
        .call(Head::new(), Join { player: "eve".into() }, &mut res)
        .await;
    assert_eq!(code, codes::SUCCESS);
    assert_eq!(res.greeting, "welcome eve");

    client.close().await;
    server.close().await;
}
