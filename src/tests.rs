//! Multi-node rings on localhost.

use super::*;
use std::{future::Future, path::Path, sync::atomic::Ordering};
use tempfile::TempDir;
use tokio::time;

const PING_INTERVAL_MS: u64 = 50;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn test_config(dir: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        join: None,
        bits: 16,
        ping_interval_ms: PING_INTERVAL_MS,
        ping_timeout_ms: 1000,
        data_dir: dir.join("nodes"),
        source_dir: dir.to_path_buf(),
    }
}

async fn wait_for<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if condition().await {
            return;
        }
        if time::Instant::now() >= deadline {
            panic!("{what}: not reached within {SETTLE_TIMEOUT:?}");
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

async fn pause_rounds(rounds: u64) {
    time::sleep(Duration::from_millis(PING_INTERVAL_MS * rounds)).await;
}

fn live(nodes: &[Node]) -> Vec<&Node> {
    nodes.iter().filter(|n| !n.is_stopped()).collect()
}

// every live node points at its neighbours in key order
async fn settled(nodes: &[Node]) -> bool {
    let mut ring: Vec<&Node> = live(nodes);
    ring.sort_by_key(|n| n.key());
    let n = ring.len();
    for (i, node) in ring.iter().enumerate() {
        let state = node.state().await;
        if state.successor != *ring[(i + 1) % n].address()
            || state.predecessor != *ring[(i + n - 1) % n].address()
            || state.backup_successor != *ring[(i + 2) % n].address()
        {
            return false;
        }
    }
    true
}

async fn ring_of(size: usize) -> (TempDir, Vec<Node>) {
    let tmp = tempfile::tempdir().unwrap();
    let mut nodes = vec![Node::start(&test_config(tmp.path())).await.unwrap()];
    nodes[0].join(None).await.unwrap();

    for _ in 1..size {
        let node = Node::start(&test_config(tmp.path())).await.unwrap();
        node.join(Some(nodes[0].address())).await.unwrap();
        nodes.push(node);
        let ring = &nodes;
        wait_for("ring to settle", move || async move { settled(ring).await }).await;
    }
    (tmp, nodes)
}

fn node_at<'a>(nodes: &'a [Node], addr: &Address) -> &'a Node {
    nodes
        .iter()
        .find(|n| n.address() == addr)
        .expect("address belongs to a test node")
}

async fn owner_of<'a>(nodes: &'a [Node], filename: &str) -> &'a Node {
    let mut owners = Vec::new();
    for node in live(nodes) {
        if node.lookup_file(filename).await {
            owners.push(node);
        }
    }
    assert_eq!(owners.len(), 1, "{filename} should have exactly one owner");
    owners[0]
}

// names not owned by `avoid`, with their sources written to disk
async fn make_files(tmp: &TempDir, nodes: &[Node], avoid: &Node, count: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut i = 0;
    while names.len() < count {
        let name = format!("file-{i}");
        i += 1;
        if owner_of(nodes, &name).await.address() != avoid.address() {
            std::fs::write(tmp.path().join(&name), format!("contents of {name}")).unwrap();
            names.push(name);
        }
    }
    names
}

async fn make_file(tmp: &TempDir, nodes: &[Node], avoid: &Node) -> String {
    make_files(tmp, nodes, avoid, 1).await.remove(0)
}

async fn raw_exchange(to: &Address, frame: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut stream = tokio::net::TcpStream::connect((to.host.as_str(), to.port)).await?;
    net::write_frame(&mut stream, frame).await?;
    net::read_frame(&mut stream).await
}

#[tokio::test]
async fn test_fresh_node_is_its_own_ring() {
    let tmp = tempfile::tempdir().unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();
    node.join(None).await.unwrap();

    let state = node.state().await;
    assert_eq!(state.successor, *node.address());
    assert_eq!(state.predecessor, *node.address());
    assert_eq!(state.backup_successor, *node.address());
    assert!(node.key() < node.space().size());
    assert_eq!(
        node.key(),
        node.space().hash(&node.address().ring_name())
    );

    for name in ["a", "b", "c"] {
        assert!(node.lookup_file(name).await);
    }
    assert!(tmp.path().join("nodes").join(format!(
        "{}_{}",
        node.address().host,
        node.address().port
    ))
    .is_dir());
}

#[tokio::test]
async fn test_single_node_put_and_get() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f1"), "payload").unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();

    node.put("f1").await.unwrap();
    assert_eq!(node.get("f1").await.unwrap(), Some("f1".to_string()));
    // lookup of a missing name goes to ourselves and comes straight back
    assert_eq!(node.get("f2").await.unwrap(), None);

    let stored = node.shared.store.path_of("f1").unwrap();
    assert_eq!(std::fs::read_to_string(stored).unwrap(), "payload");
}

#[tokio::test]
async fn test_put_records_name_even_when_payload_is_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();

    node.put("ghost").await.unwrap();
    assert!(node.state().await.files.contains("ghost"));
    assert!(!node.shared.store.path_of("ghost").unwrap().exists());
}

#[tokio::test]
async fn test_successors_close_the_ring() {
    let (_tmp, nodes) = ring_of(4).await;

    let start = nodes[0].address().clone();
    let mut seen = vec![start.clone()];
    let mut current = nodes[0].successor().await;
    while current != start {
        assert!(!seen.contains(&current), "revisited {current}");
        seen.push(current.clone());
        current = node_at(&nodes, &current).successor().await;
    }
    assert_eq!(seen.len(), nodes.len());
}

#[tokio::test]
async fn test_two_node_ring() {
    let (_tmp, nodes) = ring_of(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    assert_eq!(a.successor().await, *b.address());
    assert_eq!(a.predecessor().await, *b.address());
    assert_eq!(b.successor().await, *a.address());
    assert_eq!(b.predecessor().await, *a.address());
}

#[tokio::test]
async fn test_each_key_has_one_owner() {
    let (_tmp, nodes) = ring_of(4).await;
    for i in 0..64 {
        owner_of(&nodes, &format!("key-{i}")).await;
    }
    // a joining key lands between exactly one node and its successor
    for key in [0, 1, 12345, nodes[2].space().size() - 1] {
        let mut placers = 0;
        for node in &nodes {
            if node.lookup_node(key).await {
                placers += 1;
            }
        }
        assert_eq!(placers, 1, "key {key}");
    }
}

#[tokio::test]
async fn test_put_then_get_from_every_node() {
    let (tmp, nodes) = ring_of(4).await;
    let names = make_files(&tmp, &nodes, &nodes[0], 3).await;
    for name in &names {
        nodes[0].put(name).await.unwrap();
    }

    for name in &names {
        let owner = owner_of(&nodes, name).await;
        let name_ref = name.as_str();
        wait_for("put to reach its owner", move || async move {
            owner.state().await.files.contains(name_ref)
        })
        .await;
        let stored = owner.shared.store.path_of(name).unwrap();
        assert_eq!(
            std::fs::read_to_string(stored).unwrap(),
            format!("contents of {name}")
        );

        for node in &nodes {
            assert_eq!(node.get(name).await.unwrap(), Some(name.clone()));
        }
    }
}

fn reset_get_counts(nodes: &[Node]) {
    for node in nodes {
        node.shared.gets_seen.store(0, Ordering::SeqCst);
    }
}

fn get_counts(nodes: &[Node]) -> Vec<usize> {
    nodes
        .iter()
        .map(|n| n.shared.gets_seen.load(Ordering::SeqCst))
        .collect()
}

#[tokio::test]
async fn test_get_of_unknown_file_is_not_found_everywhere() {
    let (_tmp, nodes) = ring_of(3).await;
    for node in &nodes {
        reset_get_counts(&nodes);
        assert_eq!(node.get("never-stored").await.unwrap(), None);

        // one lap: every node sees the request once, the requester last
        let counts = get_counts(&nodes);
        assert!(counts.iter().all(|&c| c == 1), "hops per node {counts:?}");
        assert_eq!(counts.iter().sum::<usize>(), nodes.len());
    }
}

#[tokio::test]
async fn test_left_node_refuses_put_and_get() {
    let (tmp, nodes) = ring_of(3).await;
    let name = make_file(&tmp, &nodes, &nodes[0]).await;
    nodes[0].leave().await.unwrap();
    reset_get_counts(&nodes);

    let got = time::timeout(Duration::from_secs(3), nodes[0].get("never-stored"))
        .await
        .expect("get on a left node returns at once");
    assert!(got.is_err());
    let put = time::timeout(Duration::from_secs(3), nodes[0].put(&name))
        .await
        .expect("put on a left node returns at once");
    assert!(put.is_err());

    pause_rounds(4).await;
    assert!(get_counts(&nodes).iter().all(|&c| c == 0));
    for node in live(&nodes) {
        assert!(!node.state().await.files.contains(&name));
    }
}

#[tokio::test]
async fn test_concurrent_joins_close_the_ring() {
    let tmp = tempfile::tempdir().unwrap();
    let bootstrap = Node::start(&test_config(tmp.path())).await.unwrap();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(Node::start(&test_config(tmp.path())).await.unwrap());
    }
    // every join is in flight before any placement comes back
    for node in &nodes {
        node.join(Some(bootstrap.address())).await.unwrap();
    }
    nodes.push(bootstrap);

    let ring = &nodes;
    wait_for("ring to settle after concurrent joins", move || async move {
        settled(ring).await
    })
    .await;
    for i in 0..32 {
        owner_of(&nodes, &format!("key-{i}")).await;
    }
}

#[tokio::test]
async fn test_killed_owner_is_covered_by_its_successor() {
    let (tmp, nodes) = ring_of(4).await;
    let name = make_file(&tmp, &nodes, &nodes[0]).await;
    nodes[0].put(&name).await.unwrap();

    let owner = owner_of(&nodes, &name).await;
    let heir = node_at(&nodes, &owner.successor().await);
    let name_ref = name.as_str();
    wait_for("successor to back up the file", move || async move {
        heir.state().await.backup_files.contains(name_ref)
    })
    .await;

    owner.kill();
    let ring = &nodes;
    wait_for("ring to heal around the dead node", move || async move {
        settled(ring).await
    })
    .await;

    assert!(heir.state().await.files.contains(&name));
    for node in live(&nodes) {
        assert_eq!(node.get(&name).await.unwrap(), Some(name.clone()));
    }
}

#[tokio::test]
async fn test_lone_survivor_takes_everything_back() {
    let (tmp, nodes) = ring_of(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let name = make_file(&tmp, &nodes, a).await;
    a.put(&name).await.unwrap();
    let name_ref = name.as_str();
    wait_for("survivor to back up the file", move || async move {
        a.state().await.backup_files.contains(name_ref)
    })
    .await;

    b.kill();
    wait_for("survivor to be alone", move || async move {
        a.state().await.is_alone(a.address())
    })
    .await;
    assert_eq!(a.get(&name).await.unwrap(), Some(name.clone()));
}

#[tokio::test]
async fn test_leave_hands_files_to_successor() {
    let (tmp, nodes) = ring_of(3).await;
    let name = make_file(&tmp, &nodes, &nodes[0]).await;
    nodes[0].put(&name).await.unwrap();

    let owner = owner_of(&nodes, &name).await;
    let name_ref = name.as_str();
    wait_for("put to reach its owner", move || async move {
        owner.state().await.files.contains(name_ref)
    })
    .await;
    let heir = node_at(&nodes, &owner.successor().await);

    owner.leave().await.unwrap();
    assert!(owner.is_stopped());
    let ring = &nodes;
    wait_for("ring to close over the gap", move || async move {
        settled(ring).await
    })
    .await;

    assert!(heir.state().await.files.contains(&name));
    for node in live(&nodes) {
        assert_eq!(node.get(&name).await.unwrap(), Some(name.clone()));
    }
}

#[tokio::test]
async fn test_last_node_can_leave() {
    let tmp = tempfile::tempdir().unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();
    let addr = node.address().clone();
    node.leave().await.unwrap();
    node.wait().await.unwrap();

    assert!(tokio::net::TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .is_err());
}

#[tokio::test]
async fn test_ping_rounds_are_idempotent() {
    let (tmp, nodes) = ring_of(3).await;
    for name in make_files(&tmp, &nodes, &nodes[0], 2).await {
        nodes[1].put(&name).await.unwrap();
    }
    pause_rounds(20).await;

    let mut before = Vec::new();
    for node in &nodes {
        before.push(node.state().await);
    }
    pause_rounds(10).await;
    for (node, earlier) in nodes.iter().zip(&before) {
        assert_eq!(node.state().await, *earlier);
    }
}

#[tokio::test]
async fn test_ping_reply_reports_files_and_successor() {
    let (_tmp, nodes) = ring_of(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    b.shared.state.lock().await.files.insert("held-by-b".into());

    let ping = RingMessage::Ping {
        files: vec![],
        sender: a.address().clone(),
    };
    let reply = raw_exchange(b.address(), &ping.encode().unwrap())
        .await
        .unwrap();
    let RingMessage::PingResponse {
        files,
        successor,
        sender,
    } = RingMessage::decode(&reply).unwrap()
    else {
        panic!("expected a ping_response");
    };
    assert!(files.contains(&"held-by-b".to_string()));
    assert_eq!(successor, *a.address());
    assert_eq!(sender, *b.address());
}

#[tokio::test]
async fn test_get_that_returns_to_requester_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();
    let get = RingMessage::Get {
        filename: "anything".into(),
        sender: node.address().clone(),
    };
    let reply = raw_exchange(node.address(), &get.encode().unwrap())
        .await
        .unwrap();
    assert!(matches!(
        RingMessage::decode(&reply).unwrap(),
        RingMessage::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_unknown_message_type_is_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let node = Node::start(&test_config(tmp.path())).await.unwrap();

    let reply = raw_exchange(node.address(), br#"["gossip", ["127.0.0.1", 1]]"#).await;
    assert!(reply.is_err(), "connection should close without a reply");

    // still serving
    assert_eq!(node.get("x").await.unwrap(), None);
    assert!(!node.is_stopped());
}

#[tokio::test]
async fn test_put_that_laps_the_ring_is_kept_by_its_origin() {
    let (tmp, nodes) = ring_of(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let name = make_file(&tmp, &nodes, a).await;
    assert!(!a.lookup_file(&name).await);

    // as if the put had been forwarded all the way round back to `a`
    let put = RingMessage::Put {
        filename: name.clone(),
        sender: a.address().clone(),
    };
    net::notify(a.address(), &put).await.unwrap();

    let name_ref = name.as_str();
    wait_for("origin to keep the put", move || async move {
        a.state().await.files.contains(name_ref)
    })
    .await;
    // the real owner picks the name up from our ping replies
    wait_for("owner to claim the name", move || async move {
        b.state().await.files.contains(name_ref)
    })
    .await;
}

#[tokio::test]
async fn test_failover_uses_backup_successor() {
    let (_tmp, nodes) = ring_of(3).await;
    let mut ring: Vec<&Node> = nodes.iter().collect();
    ring.sort_by_key(|n| n.key());
    let (first, second, third) = (ring[0], ring[1], ring[2]);

    second.kill();
    second_is_gone(second.address()).await;
    ping::ping_round(&first.shared).await.unwrap();

    let state = first.state().await;
    assert_eq!(state.successor, *third.address());
    assert_eq!(third.predecessor().await, *first.address());
}

async fn second_is_gone(addr: &Address) {
    let addr = addr.clone();
    wait_for("listener to close", move || {
        let addr = addr.clone();
        async move {
            tokio::net::TcpStream::connect((addr.host.as_str(), addr.port))
                .await
                .is_err()
        }
    })
    .await;
}
