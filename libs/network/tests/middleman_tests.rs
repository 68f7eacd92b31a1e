//! Multi-node tests over loopback TCP
//!
//! Every node is a separate `ActorSystem` with its own node id and
//! middleman inside this process; they only talk through sockets.

use bytes::{BufMut, BytesMut};
use lattice_actors::{AbstractActor, ActorHandle, ActorSystem, Behavior, RequestError, SpawnOptions};
use lattice_codec::{message, FrameHeader, Serializer, TAG_NAME, TUPLE_PREFIX};
use lattice_network::basp::encode_client_handshake;
use lattice_network::{NetworkError, Node};
use lattice_types::{ActorAddr, ActorId, Atom, DownMsg, ExitMsg, ExitReason, MessageId, NodeId};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);
const LOCALHOST: &str = "127.0.0.1";

static NEXT_NODE: AtomicU32 = AtomicU32::new(500);

fn node() -> Node {
    lattice_config::logging::init_for_tests();
    let pid = NEXT_NODE.fetch_add(1, Ordering::Relaxed);
    let system = ActorSystem::builder()
        .node_id(NodeId::new(pid, [0xCD; 20]))
        .build()
        .unwrap();
    Node::start(system).unwrap()
}

fn atom(name: &str) -> Atom {
    Atom::from(name)
}

fn pong_actor(node: &Node) -> ActorHandle {
    node.system().spawn(|_| {
        Behavior::new().on_atom("ping", |_, msg| {
            let n = *msg.get::<i32>(1)?;
            Some(message![atom("pong"), n + 1])
        })
    })
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_remote_ping_pong() {
    let server = node();
    let client = node();
    let pong = pong_actor(&server);
    let port = server.publish_on(&pong, LOCALHOST, 0).unwrap();

    let remote = client.remote_actor(LOCALHOST, port).unwrap();
    assert!(remote.is_remote());
    assert_eq!(remote.address(), pong.address());

    let mut me = client.system().scoped();
    let reply = me
        .request(&remote, message![atom("ping"), 41i32], WAIT)
        .unwrap();
    assert_eq!(reply, message![atom("pong"), 42i32]);

    assert_eq!(client.peers().unwrap(), vec![server.id()]);
    assert_eq!(server.peers().unwrap(), vec![client.id()]);
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_remote_fifo_per_sender() {
    let server = node();
    let client = node();
    let echo = server
        .system()
        .spawn(|_| Behavior::new().others(|_, msg| Some(msg.clone())));
    let port = server.publish_on(&echo, LOCALHOST, 0).unwrap();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();

    let mut me = client.system().scoped();
    for n in 0..500u32 {
        me.send(&remote, message![n]);
    }
    for expected in 0..500u32 {
        let env = me.receive(Some(WAIT)).unwrap().unwrap();
        assert_eq!(env.content.get::<u32>(0), Some(&expected));
    }
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_interface_mismatch_fails_lookup() {
    let server = node();
    let client = node();
    let typed = server
        .system()
        .spawn_with(SpawnOptions::new().interface(["ping", "stop"]), |_| {
            Behavior::new().on_atom("ping", |_, _| Some(message![atom("pong")]))
        })
        .unwrap();
    let port = server.publish_on(&typed, LOCALHOST, 0).unwrap();

    match client.remote_actor(LOCALHOST, port) {
        Err(NetworkError::InterfaceMismatch { expected, actual }) => {
            assert!(expected.is_empty());
            assert_eq!(actual.len(), 2);
        }
        other => panic!("expected InterfaceMismatch, got {other:?}"),
    }

    // Order does not matter
    let remote = client
        .remote_typed_actor(LOCALHOST, port, &["stop", "ping"])
        .unwrap();
    assert_eq!(remote.address(), typed.address());
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_duplicate_lookups_share_proxy_and_connection() {
    let server = node();
    let client = node();
    let pong = pong_actor(&server);
    let port = server.publish_on(&pong, LOCALHOST, 0).unwrap();

    let first = client.remote_actor(LOCALHOST, port).unwrap();
    let second = client.remote_actor(LOCALHOST, port).unwrap();
    let (a, b) = (first.as_proxy().unwrap(), second.as_proxy().unwrap());
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(client.peers().unwrap(), vec![server.id()]);
    assert_eq!(
        client.system().namespace().count_proxies(server.id()),
        1
    );
    // The redundant connection is closed again
    assert!(eventually(|| client.stats().connections_open == 1));
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_lookup_of_own_node_returns_local_actor() {
    let node = node();
    let pong = pong_actor(&node);
    let port = node.publish_on(&pong, LOCALHOST, 0).unwrap();

    let handle = node.remote_actor(LOCALHOST, port).unwrap();
    assert!(handle.as_local().is_some());
    assert!(node.peers().unwrap().is_empty());
    node.shutdown();
}

#[test]
fn test_remote_exit_kills_proxy_once() {
    let server = node();
    let client = node();
    let target = server.system().spawn(|_| {
        Behavior::new().on_atom("die", |ctx, _| {
            ctx.quit(ExitReason::new(42));
            None
        })
    });
    let port = server.publish_on(&target, LOCALHOST, 0).unwrap();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();

    let mut me = client.system().scoped();
    me.monitor(&remote);
    me.send(&remote, message![atom("die")]);

    let env = me
        .receive_matching(|env| env.content.is_single::<DownMsg>(), Some(WAIT))
        .unwrap()
        .unwrap();
    let down = env.content.get::<DownMsg>(0).unwrap();
    assert_eq!(down.source, target.address());
    assert_eq!(down.reason, ExitReason::new(42));

    let again = me
        .receive_matching(
            |env| env.content.is_single::<DownMsg>(),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
    assert!(again.is_none());
    assert!(eventually(|| {
        client.system().namespace().count_proxies(server.id()) == 0
    }));

    // The dead proxy answers on its own from now on
    assert_eq!(remote.exit_reason(), ExitReason::new(42));
    let result = me.request(&remote, message![atom("ping"), 1i32], WAIT);
    assert!(matches!(result, Err(RequestError::Exited(r)) if r == ExitReason::new(42)));
    me.monitor(&remote);
    let late = me
        .receive_matching(
            |env| env.content.is_single::<DownMsg>(),
            Some(Duration::from_millis(500)),
        )
        .unwrap()
        .unwrap();
    assert_eq!(late.content.get::<DownMsg>(0).unwrap().reason, ExitReason::new(42));
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_remote_link_delivers_exit_once() {
    let server = node();
    let client = node();
    let target = server.system().spawn(|_| {
        Behavior::new().on_atom("die", |ctx, _| {
            ctx.quit(ExitReason::new(7));
            None
        })
    });
    let port = server.publish_on(&target, LOCALHOST, 0).unwrap();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();

    let mut me = client.system().scoped();
    me.trap_exit(true);
    me.link_to(&remote);
    me.send(&remote, message![atom("die")]);

    let env = me
        .receive_matching(|env| env.content.is_single::<ExitMsg>(), Some(WAIT))
        .unwrap()
        .unwrap();
    let exit = env.content.get::<ExitMsg>(0).unwrap();
    assert_eq!(exit.source, target.address());
    assert_eq!(exit.reason, ExitReason::new(7));

    let again = me
        .receive_matching(
            |env| env.content.is_single::<ExitMsg>(),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
    assert!(again.is_none());
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_request_to_exited_remote_actor_bounces() {
    let server = node();
    let client = node();
    let target = server.system().spawn(|_| {
        Behavior::new().on_atom("die", |ctx, _| {
            ctx.quit(ExitReason::NORMAL);
            None
        })
    });
    let port = server.publish_on(&target, LOCALHOST, 0).unwrap();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();

    let mut me = client.system().scoped();
    me.send(&remote, message![atom("die")]);
    assert!(eventually(|| target.exit_reason().is_exited()));

    let result = me.request(&remote, message![atom("ping"), 1i32], WAIT);
    assert!(matches!(result, Err(RequestError::Exited(_))), "got {result:?}");
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_connection_loss_kills_proxies() {
    let server = node();
    let client = node();
    let pong = pong_actor(&server);
    let port = server.publish_on(&pong, LOCALHOST, 0).unwrap();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();

    let mut me = client.system().scoped();
    me.monitor(&remote);
    server.middleman().shutdown();

    let env = me
        .receive_matching(|env| env.content.is_single::<DownMsg>(), Some(WAIT))
        .unwrap()
        .unwrap();
    let down = env.content.get::<DownMsg>(0).unwrap();
    assert_eq!(down.reason, ExitReason::REMOTE_LINK_UNREACHABLE);
    assert!(eventually(|| client.peers().unwrap().is_empty()));
    drop(me);
    client.shutdown();
    server.shutdown();
}

#[test]
fn test_three_node_relay() {
    let first = node();
    let middle = node();
    let last = node();

    let pong = pong_actor(&first);
    let pong_port = first.publish_on(&pong, LOCALHOST, 0).unwrap();
    let via_middle = middle.remote_actor(LOCALHOST, pong_port).unwrap();

    // Hands out the handle of `pong` to whoever asks
    let directory = middle.system().spawn(move |_| {
        let pong = via_middle.clone();
        Behavior::new().on_atom("lookup", move |_, _| Some(message![pong.clone()]))
    });
    let directory_port = middle.publish_on(&directory, LOCALHOST, 0).unwrap();
    let directory = last.remote_actor(LOCALHOST, directory_port).unwrap();

    let mut me = last.system().scoped();
    let reply = me.request(&directory, message![atom("lookup")], WAIT).unwrap();
    let relayed = reply.get::<ActorHandle>(0).unwrap().clone();
    assert_eq!(relayed.address(), pong.address());
    assert!(relayed.is_remote());

    let pong_reply = me
        .request(&relayed, message![atom("ping"), 1i32], WAIT)
        .unwrap();
    assert_eq!(pong_reply, message![atom("pong"), 2i32]);

    // No direct connection between the outer nodes
    assert_eq!(last.peers().unwrap(), vec![middle.id()]);
    let route = last.middleman().route(first.id()).unwrap().unwrap();
    assert_eq!(route.next_hop, middle.id());
    assert!(middle.stats().frames_relayed >= 2);
    drop(me);
    last.shutdown();
    middle.shutdown();
    first.shutdown();
}

#[test]
fn test_publish_same_port_twice_fails() {
    let node = node();
    let pong = pong_actor(&node);
    let port = node.publish_on(&pong, LOCALHOST, 0).unwrap();
    let err = node.publish_on(&pong, LOCALHOST, port).unwrap_err();
    assert!(matches!(err, NetworkError::BindFailure { .. }));

    assert!(node.unpublish(port).unwrap());
    assert!(!node.unpublish(port).unwrap());
    node.shutdown();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let node = node();
    let pong = pong_actor(&node);
    let port = node.publish_on(&pong, LOCALHOST, 0).unwrap();
    node.unpublish(port).unwrap();
    // Give the aborted acceptor a moment to release the listener
    thread::sleep(Duration::from_millis(50));
    assert!(node.remote_actor(LOCALHOST, port).is_err());
    node.shutdown();
}

#[test]
fn test_undecodable_frame_closes_only_its_connection() {
    let server = node();
    let pong = pong_actor(&server);
    let port = server.publish_on(&pong, LOCALHOST, 0).unwrap();

    let mut raw = std::net::TcpStream::connect((LOCALHOST, port)).unwrap();
    raw.set_read_timeout(Some(WAIT)).unwrap();
    let mut size = [0u8; 4];
    raw.read_exact(&mut size).unwrap();
    let mut hello = vec![0u8; u32::from_be_bytes(size) as usize];
    raw.read_exact(&mut hello).unwrap();
    let intruder = NodeId::new(NEXT_NODE.fetch_add(1, Ordering::Relaxed), [0xEE; 20]);
    raw.write_all(&encode_client_handshake(&intruder)).unwrap();

    // Messages nested far deeper than any decoder follows
    let mut body = BytesMut::new();
    FrameHeader::new(
        ActorAddr::new(ActorId::from_raw(1), intruder),
        pong.address(),
        MessageId::ASYNC,
    )
    .write_to(&mut Serializer::new(&mut body, server.system().types()))
    .unwrap();
    for name in std::iter::repeat("@<>+@msg").take(50_000).chain([TUPLE_PREFIX]) {
        body.put_u8(TAG_NAME);
        body.put_u32(name.len() as u32);
        body.put_slice(name.as_bytes());
    }
    let mut frame = BytesMut::new();
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    raw.write_all(&frame).unwrap();

    let mut rest = Vec::new();
    let closed = raw.read_to_end(&mut rest);
    assert!(
        !matches!(&closed, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
            || e.kind() == std::io::ErrorKind::TimedOut),
        "connection stayed open: {closed:?}"
    );
    assert!(eventually(|| server.peers().unwrap().is_empty()));

    // The node keeps serving everyone else
    let client = node();
    let remote = client.remote_actor(LOCALHOST, port).unwrap();
    let mut me = client.system().scoped();
    let reply = me
        .request(&remote, message![atom("ping"), 1i32], WAIT)
        .unwrap();
    assert_eq!(reply, message![atom("pong"), 2i32]);
    drop(me);
    client.shutdown();
    server.shutdown();
}
