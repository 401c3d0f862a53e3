//! Deterministic simulations of whole clusters.
//!
//! Every test runs on a paused current-thread runtime over the in-memory
//! network, so the interleaving of deliveries is reproducible.

use ricart_mutex::{
    Config, Coordinator, CsState, MembershipView, MemoryNetwork, Message, MutexError, Peer,
    RequestRecord, Transport,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

const LATENCY: Duration = Duration::from_millis(1);

type Node = Coordinator<MemoryNetwork>;

struct Cluster {
    network: MemoryNetwork,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, |id| Config::new(id, address(id))).await
    }

    async fn with_config(ids: &[&str], config: impl Fn(&str) -> Config) -> Self {
        let network = MemoryNetwork::with_latency(LATENCY);
        let peers: Vec<Peer> = ids.iter().map(|id| Peer::new(*id, address(id))).collect();

        let mut nodes = Vec::new();
        for id in ids {
            let node = Coordinator::new(
                &config(id),
                MembershipView::from_peers(peers.clone()).await,
                network.clone(),
            );
            network.register(address(id), node.responder()).await;
            nodes.push(node);
        }

        Self { network, nodes }
    }

    fn node(&self, id: &str) -> Node {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .cloned()
            .unwrap()
    }
}

fn address(id: &str) -> String {
    format!("mem://{id}")
}

/// Watches who is inside the critical section.
#[derive(Clone, Default)]
struct Monitor {
    inside: Arc<Mutex<Vec<String>>>,
    max_inside: Arc<Mutex<usize>>,
    entries: Arc<Mutex<Vec<RequestRecord>>>,
}

impl Monitor {
    async fn visit(&self, node: &Node, hold: Duration) {
        let record = node.request().await.unwrap();
        {
            let mut inside = self.inside.lock().unwrap();
            inside.push(record.owner.clone());
            let mut max_inside = self.max_inside.lock().unwrap();
            *max_inside = (*max_inside).max(inside.len());
        }
        self.entries.lock().unwrap().push(record.clone());

        tokio::time::sleep(hold).await;

        self.inside.lock().unwrap().retain(|id| *id != record.owner);
    }

    fn max_inside(&self) -> usize {
        *self.max_inside.lock().unwrap()
    }

    fn entries(&self) -> Vec<RequestRecord> {
        self.entries.lock().unwrap().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn at_most_one_holder_and_everyone_gets_in() {
    let cluster = Cluster::new(&["a", "b", "c", "d", "e"]).await;
    let monitor = Monitor::default();
    let rounds = 4;

    let mut handles = Vec::new();
    for (i, node) in cluster.nodes.iter().cloned().enumerate() {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..rounds {
                let pause = Duration::from_millis(((i * 3 + round * 7) % 5) as u64);
                tokio::time::sleep(pause).await;

                node.run_exclusive(|| monitor.visit(&node, Duration::from_millis(2)))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(monitor.max_inside(), 1);

    let entries = monitor.entries();
    assert_eq!(entries.len(), 5 * rounds);
    for node in &cluster.nodes {
        let visits = entries.iter().filter(|e| e.owner == node.id()).count();
        assert_eq!(visits, rounds);
        assert_eq!(node.state().await, CsState::Idle);
        assert!(node.deferred().await.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn entries_follow_request_priority() {
    let cluster = Cluster::new(&["a", "b", "c", "d"]).await;
    let monitor = Monitor::default();

    let mut handles = Vec::new();
    for (node, start) in cluster.nodes.iter().cloned().zip([3u64, 0, 0, 1]) {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(start)).await;
            node.run_exclusive(|| monitor.visit(&node, Duration::from_millis(5)))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let order: Vec<_> = monitor
        .entries()
        .into_iter()
        .map(|record| (record.timestamp, record.owner))
        .collect();
    let mut sorted = order.clone();
    sorted.sort();

    assert_eq!(order.len(), 4);
    assert_eq!(order, sorted);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_requests_break_ties_on_identity() {
    let cluster = Cluster::new(&["A", "B", "C"]).await;
    let (a, b, c) = (cluster.node("A"), cluster.node("B"), cluster.node("C"));

    let a_task = tokio::spawn({
        let a = a.clone();
        async move { a.request_entry().await }
    });
    let b_task = tokio::spawn({
        let b = b.clone();
        async move { b.request_entry().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // both asked at timestamp 1, A wins on identity
    assert_eq!(a.request().await.unwrap(), RequestRecord::new(1, "A"));
    assert_eq!(b.request().await.unwrap(), RequestRecord::new(1, "B"));
    assert_eq!(a.state().await, CsState::Held);
    assert_eq!(b.state().await, CsState::Requesting);
    assert_eq!(a.deferred().await, ["B"]);
    assert!(b.deferred().await.is_empty());
    assert!(c.deferred().await.is_empty());
    a_task.await.unwrap().unwrap();

    a.release_entry().await.unwrap();
    b_task.await.unwrap().unwrap();
    assert_eq!(b.state().await, CsState::Held);
    assert_eq!(a.state().await, CsState::Idle);

    b.release_entry().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn late_joiner_is_not_waited_on() {
    let cluster = Cluster::new(&["a", "b"]).await;
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    // a third node that a only learns about mid-request
    let c = Coordinator::new(
        &Config::new("c", address("c")),
        MembershipView::new(),
        cluster.network.clone(),
    );
    cluster.network.register(address("c"), c.responder()).await;

    b.request_entry().await.unwrap();
    let waiter = tokio::spawn({
        let a = a.clone();
        async move { a.request_entry().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(a.membership().upsert(Peer::new("c", address("c"))).await);
    b.release_entry().await.unwrap();
    waiter.await.unwrap().unwrap();

    assert_eq!(a.state().await, CsState::Held);
    let to_c = cluster
        .network
        .delivered()
        .await
        .into_iter()
        .filter(|(to, _)| *to == address("c"))
        .count();
    assert_eq!(to_c, 0);
    assert_eq!(c.clock().await, 0);
}

#[tokio::test(start_paused = true)]
async fn lost_peer_times_out_then_recovers() {
    let cluster = Cluster::with_config(&["a", "b", "c"], |id| Config {
        reply_timeout_ms: 200,
        ..Config::new(id, address(id))
    })
    .await;
    let a = cluster.node("a");
    cluster.network.disconnect(&address("c")).await;

    assert_eq!(
        a.request_entry().await,
        Err(MutexError::Timeout {
            missing: vec!["c".to_string()]
        })
    );
    assert_eq!(a.state().await, CsState::Idle);

    cluster.network.reconnect(&address("c")).await;
    a.run_exclusive(|| async {}).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reply_owed_to_an_aborted_request_grants_nothing() {
    let cluster = Cluster::with_config(&["a", "b", "c"], |id| Config {
        reply_timeout_ms: 200,
        ..Config::new(id, address(id))
    })
    .await;
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    // b holds the section, so a gives up and b still owes it a reply
    b.request_entry().await.unwrap();
    assert_eq!(
        a.request_entry().await,
        Err(MutexError::Timeout {
            missing: vec!["b".to_string()]
        })
    );
    assert_eq!(b.deferred().await, ["a"]);

    // a asks again, but this request never reaches b
    cluster.network.disconnect(&address("b")).await;
    let retry = tokio::spawn({
        let a = a.clone();
        async move { a.request_entry().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(a.state().await, CsState::Requesting);

    // the reply b sends on release answers the abandoned request
    b.release_entry().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(a.state().await, CsState::Requesting);

    // b asks with the older timestamp and is granted, a is still waiting
    b.request_entry().await.unwrap();
    assert_eq!(b.state().await, CsState::Held);
    assert_ne!(a.state().await, CsState::Held);

    assert_eq!(
        retry.await.unwrap(),
        Err(MutexError::Timeout {
            missing: vec!["b".to_string()]
        })
    );
    b.release_entry().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stray_reply_changes_nothing() {
    let cluster = Cluster::new(&["a", "b"]).await;
    let a = cluster.node("a");

    cluster
        .network
        .notify(
            &address("a"),
            Message::Reply {
                owner: "b".into(),
                timestamp: 4,
                request: 1,
            },
        )
        .await
        .unwrap();

    assert_eq!(a.state().await, CsState::Idle);
    assert!(a.request().await.is_none());
    assert_eq!(a.clock().await, 5);
}
