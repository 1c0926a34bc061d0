use std::collections::HashSet;
use std::sync::mpsc::channel;
use std::thread;
use std::time::{Duration, Instant};

use super::Node;
use crate::config::Config;
use crate::error::{Error, RpcError};
use crate::key::{Key, NodeId};
use crate::node::contact::Contact;
use crate::node::lookup::LookupValue;
use crate::protocol::{Body, Message, Response};
use crate::transport::{MemoryNetwork, Transport};
use crate::KEY_LENGTH;

fn id_from(byte: u8) -> NodeId {
    let mut data = [0u8; KEY_LENGTH];
    data[0] = byte;
    NodeId(data)
}

fn config() -> Config {
    Config {
        rpc_timeout_ms: 200,
        ..Config::default()
    }
}

fn config_with_id(byte: u8) -> Config {
    Config {
        local_id: Some(id_from(byte)),
        ..config()
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn spawn_network(network: &MemoryNetwork, count: usize) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    for i in 0..count {
        let node = Node::attach(config(), network, &format!("node-{}", i)).unwrap();
        if i > 0 {
            node.bootstrap(&["node-0".to_string()]).unwrap();
        }
        nodes.push(node);
    }
    nodes
}

fn kill_all(nodes: &[Node]) {
    for node in nodes {
        node.kill();
    }
}

#[test]
fn test_invalid_config_refuses_to_start() {
    let network = MemoryNetwork::new();
    let config = Config {
        k: 0,
        ..Config::default()
    };
    match Node::attach(config, &network, "bad") {
        Err(Error::InvalidConfig(_)) => {},
        Err(err) => panic!("unexpected error {}", err),
        Ok(_) => panic!("node started with an invalid config"),
    }
}

#[test]
fn test_local_id_is_masked_to_width() {
    let network = MemoryNetwork::new();
    let config = Config {
        id_bits: 8,
        local_id: Some(NodeId([0xAB; KEY_LENGTH])),
        ..config()
    };
    let node = Node::attach(config, &network, "narrow").unwrap();
    assert_eq!(node.id(), id_from(0xAB));
    assert_eq!(node.routing_table().bucket_count(), 8);
    node.kill();
}

#[test]
fn test_store_then_find_value_returns_value() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    let key = Key::hash(b"greeting");

    b.rpc_store(&a.contact(), key, b"hello".to_vec()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    match b.rpc_find_value(&a.contact(), &key, deadline).unwrap() {
        Response::Value(value) => assert_eq!(value, b"hello".to_vec()),
        other => panic!("unexpected response {:?}", other),
    }
    assert!(!a.record(&key).unwrap().origin);

    kill_all(&[a, b]);
}

#[test]
fn test_find_value_falls_back_to_nodes() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    match b.rpc_find_value(&a.contact(), &Key::hash(b"absent"), deadline).unwrap() {
        Response::Nodes(contacts) => assert_eq!(contacts, vec![b.contact()]),
        other => panic!("unexpected response {:?}", other),
    }

    kill_all(&[a, b]);
}

#[test]
fn test_inbound_traffic_populates_routing_table() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();

    let answered = b.rpc_ping("a").unwrap();
    assert_eq!(answered, a.contact());
    assert!(a.routing_table().contains(&b.id()));
    assert!(b.routing_table().contains(&a.id()));

    kill_all(&[a, b]);
}

#[test]
fn test_malformed_datagram_is_dropped() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    let (raw_tx, _raw_rx) = channel();
    let raw = network.attach("raw", raw_tx);

    raw.send("a", b"definitely not a message").unwrap();
    b.rpc_ping("a").unwrap();
    assert_eq!(a.routing_table().all_contacts(), vec![b.contact()]);

    kill_all(&[a, b]);
}

#[test]
fn test_uncorrelated_response_is_not_recorded() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    let (raw_tx, _raw_rx) = channel();
    let raw = network.attach("raw", raw_tx);

    let stray = Message {
        id: NodeId::random(),
        sender: Contact::new(id_from(0x77), "raw"),
        body: Body::Response(Response::Pong),
    };
    raw.send("a", &stray.encode().unwrap()).unwrap();
    b.rpc_ping("a").unwrap();
    assert!(!a.routing_table().contains(&id_from(0x77)));
    assert_eq!(a.routing_table().all_contacts(), vec![b.contact()]);

    kill_all(&[a, b]);
}

#[test]
fn test_bootstrap_fails_without_live_seeds() {
    let network = MemoryNetwork::new();
    let node = Node::attach(config(), &network, "lonely").unwrap();
    match node.bootstrap(&["nowhere".to_string()]) {
        Err(Error::BootstrapFailed) => {},
        other => panic!("unexpected result {:?}", other),
    }
    node.kill();
}

#[test]
fn test_bootstrap_five_nodes() {
    let network = MemoryNetwork::new();
    let nodes = spawn_network(&network, 5);
    for node in &nodes {
        node.lookup_node(&node.id());
    }

    for node in &nodes {
        assert!(!node.routing_table().is_empty());
    }
    // every node pinged node 0 while bootstrapping and heard back from it
    for node in &nodes[1..] {
        assert!(nodes[0].routing_table().contains(&node.id()));
        assert!(node.routing_table().contains(&nodes[0].id()));
    }

    kill_all(&nodes);
}

#[test]
fn test_lookup_with_fewer_than_k_contacts_returns_all() {
    let network = MemoryNetwork::new();
    let nodes: Vec<Node> = (0..4)
        .map(|i| Node::attach(config(), &network, &format!("node-{}", i)).unwrap())
        .collect();
    for a in &nodes {
        for b in &nodes {
            if a.id() != b.id() {
                a.rpc_ping(&b.contact().addr).unwrap();
            }
        }
    }

    let found: HashSet<NodeId> = nodes[0]
        .lookup_node(&NodeId::random())
        .into_iter()
        .map(|contact| contact.id)
        .collect();
    let expected: HashSet<NodeId> = nodes[1..].iter().map(|node| node.id()).collect();
    assert_eq!(found, expected);

    kill_all(&nodes);
}

#[test]
fn test_lookup_on_empty_table_terminates() {
    let network = MemoryNetwork::new();
    let node = Node::attach(config(), &network, "alone").unwrap();
    assert!(node.lookup_node(&NodeId::random()).is_empty());
    assert_eq!(
        node.lookup_value(&Key::hash(b"anything")),
        LookupValue::NotFound(Vec::new())
    );
    node.kill();
}

#[test]
fn test_lookup_value_two_nodes() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    let key = Key::hash(b"module");
    a.store_local(key, b"wasm bytes".to_vec(), true);
    b.bootstrap(&["a".to_string()]).unwrap();

    assert_eq!(
        b.lookup_value(&key),
        LookupValue::Found(b"wasm bytes".to_vec())
    );
    assert!(a.record(&key).unwrap().origin);

    kill_all(&[a, b]);
}

#[test]
fn test_lookup_value_caches_at_closest_node_lacking_it() {
    let network = MemoryNetwork::new();
    let holder = Node::attach(config_with_id(0x40), &network, "holder").unwrap();
    let near = Node::attach(config_with_id(0x01), &network, "near").unwrap();
    let searcher_config = Config {
        alpha: 1,
        ..config_with_id(0xF0)
    };
    let searcher = Node::attach(searcher_config, &network, "searcher").unwrap();
    searcher.rpc_ping("holder").unwrap();
    searcher.rpc_ping("near").unwrap();

    let key = id_from(0x00);
    holder.store_local(key, b"value".to_vec(), true);

    assert_eq!(
        searcher.lookup_value(&key),
        LookupValue::Found(b"value".to_vec())
    );
    let cached = near.record(&key).unwrap();
    assert_eq!(cached.value, b"value".to_vec());
    assert!(!cached.origin);
    assert!(holder.record(&key).unwrap().origin);
    assert!(searcher.record(&key).is_none());

    kill_all(&[holder, near, searcher]);
}

#[test]
fn test_lookup_value_miss_returns_closest_contacts() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    b.rpc_ping("a").unwrap();

    match b.lookup_value(&Key::hash(b"absent")) {
        LookupValue::NotFound(contacts) => assert_eq!(contacts, vec![a.contact()]),
        found => panic!("unexpected {:?}", found),
    }

    kill_all(&[a, b]);
}

#[test]
fn test_timed_out_contacts_are_excluded_but_kept() {
    let network = MemoryNetwork::new();
    let node = Node::attach(config(), &network, "node").unwrap();
    let live = Node::attach(config(), &network, "live").unwrap();
    let dead = Contact::new(NodeId::random(), "dead");
    node.rpc_ping("live").unwrap();
    node.record_contact(dead.clone());

    let found = node.lookup_node(&dead.id);
    assert_eq!(found, vec![live.contact()]);
    assert!(node.routing_table().contains(&dead.id));
    assert_eq!(node.pending_count(), 0);

    kill_all(&[node, live]);
}

#[test]
fn test_repeated_timeouts_evict_contact() {
    let network = MemoryNetwork::new();
    let local_config = Config {
        k: 2,
        rpc_timeout_ms: 50,
        ..config_with_id(0x00)
    };
    let local = Node::attach(local_config, &network, "local").unwrap();
    let live = Node::attach(config_with_id(0x80), &network, "live").unwrap();
    local.rpc_ping("live").unwrap();
    let dead = Contact::new(id_from(0xC0), "dead");
    local.record_contact(dead.clone());
    assert_eq!(local.routing_table().len(), 2);

    for attempt in 1..=3 {
        assert_eq!(local.lookup_node(&dead.id), vec![live.contact()]);
        let failures = local.routing_table().bucket(0).map(|b| b.failures(&dead.id));
        if attempt < 3 {
            assert!(local.routing_table().contains(&dead.id));
            assert_eq!(failures, Some(attempt));
        }
    }
    assert!(!local.routing_table().contains(&dead.id));
    assert!(local.routing_table().contains(&live.id()));

    kill_all(&[local, live]);
}

#[test]
fn test_converged_lookup_queries_remaining_candidates_once() {
    let network = MemoryNetwork::new();
    let remotes: Vec<Node> = (1..=5)
        .map(|byte| {
            Node::attach(config_with_id(byte), &network, &format!("remote-{}", byte)).unwrap()
        })
        .collect();
    let searcher_config = Config {
        k: 5,
        alpha: 1,
        max_lookup_rounds: 2,
        ..config_with_id(0xF0)
    };
    let searcher = Node::attach(searcher_config, &network, "searcher").unwrap();
    for remote in &remotes {
        searcher.routing_table().record_contact(remote.contact());
    }

    // the first round learns nothing closer, so the second round is the final one and queries
    // the four candidates left in a single batch
    let found: Vec<u8> = searcher
        .lookup_node(&id_from(0x00))
        .iter()
        .map(|contact| contact.id.0[0])
        .collect();
    assert_eq!(found, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
    for remote in &remotes {
        assert_eq!(remote.routing_table().all_contacts(), vec![searcher.contact()]);
    }

    kill_all(&remotes);
    searcher.kill();
}

#[test]
fn test_refresh_stale_bucket_discovers_empty_range() {
    let network = MemoryNetwork::new();
    let local_config = Config {
        refresh_interval_secs: 1,
        ..config_with_id(0x00)
    };
    let local = Node::attach(local_config, &network, "local").unwrap();
    let far = Node::attach(config_with_id(0x80), &network, "far").unwrap();
    let near = Node::attach(config_with_id(0x40), &network, "near").unwrap();
    local.routing_table().record_contact(far.contact());
    far.routing_table().record_contact(near.contact());

    assert_eq!(local.routing_table().bucket(1).map(|b| b.len()), Some(0));
    thread::sleep(Duration::from_millis(1100));
    local.refresh_stale_buckets();

    assert!(local.routing_table().contains(&near.id()));
    assert_eq!(local.routing_table().bucket(1).map(|b| b.len()), Some(1));

    kill_all(&[local, far, near]);
}

#[test]
fn test_lookup_deadline_abandons_requests() {
    let network = MemoryNetwork::new();
    let config = Config {
        rpc_timeout_ms: 5000,
        ..Config::default()
    };
    let node = Node::attach(config, &network, "node").unwrap();
    for i in 0..5 {
        node.record_contact(Contact::new(NodeId::random(), format!("dead-{}", i)));
    }

    let start = Instant::now();
    let deadline = start + Duration::from_millis(200);
    assert!(node.lookup_node_until(&NodeId::random(), Some(deadline)).is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(node.pending_count(), 0);

    node.kill();
}

#[test]
fn test_unresponsive_lrs_is_evicted_after_failed_probes() {
    let network = MemoryNetwork::new();
    let local_config = Config {
        k: 2,
        alpha: 1,
        rpc_timeout_ms: 50,
        ..config_with_id(0x00)
    };
    let local = Node::attach(local_config, &network, "local").unwrap();
    local.record_contact(Contact::new(id_from(0x80), "dead-1"));
    local.record_contact(Contact::new(id_from(0xC0), "dead-2"));

    let newcomer = Node::attach(config_with_id(0xA0), &network, "newcomer").unwrap();
    let start = Instant::now();
    newcomer.rpc_ping("local").unwrap();
    assert!(!local.routing_table().contains(&id_from(0xA0)));

    assert!(wait_until(Duration::from_secs(3), || local
        .routing_table()
        .contains(&id_from(0xA0))));
    assert!(start.elapsed() >= Duration::from_millis(3 * 50));
    assert!(!local.routing_table().contains(&id_from(0x80)));
    assert!(local.routing_table().contains(&id_from(0xC0)));
    assert_eq!(local.routing_table().len(), 2);

    kill_all(&[local, newcomer]);
}

#[test]
fn test_responsive_lrs_is_kept() {
    let network = MemoryNetwork::new();
    let local_config = Config {
        k: 2,
        alpha: 1,
        ..config_with_id(0x00)
    };
    let local = Node::attach(local_config, &network, "local").unwrap();
    let first = Node::attach(config_with_id(0x80), &network, "first").unwrap();
    let second = Node::attach(config_with_id(0xC0), &network, "second").unwrap();
    first.rpc_ping("local").unwrap();
    second.rpc_ping("local").unwrap();

    let newcomer = Node::attach(config_with_id(0xA0), &network, "newcomer").unwrap();
    newcomer.rpc_ping("local").unwrap();

    // the probe's answer moves the least recently seen contact to the back
    assert!(wait_until(Duration::from_secs(3), || {
        let order: Vec<u8> = local
            .routing_table()
            .bucket(0)
            .map(|bucket| bucket.contacts().iter().map(|c| c.id.0[0]).collect())
            .unwrap_or_default();
        order == vec![0xC0, 0x80]
    }));
    assert!(!local.routing_table().contains(&id_from(0xA0)));

    kill_all(&[local, first, second, newcomer]);
}

#[test]
fn test_put_and_get_across_network() {
    let network = MemoryNetwork::new();
    let nodes = spawn_network(&network, 8);
    let key = Key::hash(b"artifact");

    assert!(nodes[3].put(key, b"payload".to_vec()) > 0);
    assert!(nodes[3].record(&key).unwrap().origin);
    assert_eq!(nodes[7].get(&key), Some(b"payload".to_vec()));
    assert_eq!(nodes[5].get(&Key::hash(b"missing")), None);

    kill_all(&nodes);
}

#[test]
fn test_concurrent_lookups() {
    let network = MemoryNetwork::new();
    let nodes = spawn_network(&network, 10);
    let searcher = nodes[4].clone();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let searcher = searcher.clone();
            thread::spawn(move || searcher.lookup_node(&NodeId::random()))
        })
        .collect();
    for handle in handles {
        let found = handle.join().unwrap();
        assert!(!found.is_empty());
        assert!(found.len() <= searcher.config().k);
        assert!(found.iter().all(|contact| contact.id != searcher.id()));
    }

    kill_all(&nodes);
}

#[test]
fn test_republish_pushes_origin_records() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    b.bootstrap(&["a".to_string()]).unwrap();

    let key = Key::hash(b"mine");
    a.store_local(key, b"value".to_vec(), true);
    a.store_local(Key::hash(b"cached"), b"other".to_vec(), false);
    a.republish();

    assert_eq!(a.records().len(), 2);
    assert_eq!(b.record(&key).map(|record| record.value), Some(b"value".to_vec()));
    assert!(b.record(&Key::hash(b"cached")).is_none());
    assert_eq!(b.records().len(), 1);

    kill_all(&[a, b]);
}

#[test]
fn test_killed_node_stops_answering() {
    let network = MemoryNetwork::new();
    let a = Node::attach(config(), &network, "a").unwrap();
    let b = Node::attach(config(), &network, "b").unwrap();
    b.kill();
    assert!(!b.is_active());
    thread::sleep(Duration::from_millis(300));

    match a.rpc_ping("b") {
        Err(RpcError::Timeout) => {},
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(a.pending_count(), 0);

    a.kill();
}
