pub mod contact;
pub mod lookup;
mod maintenance;
mod rpc;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::{Key, NodeId};
use crate::node::contact::Contact;
use crate::node::lookup::LookupValue;
use crate::protocol::{Message, RequestId};
use crate::routing::RoutingTable;
use crate::storage::{LocalStore, Record};
use crate::transport::{Datagram, MemoryNetwork, Transport, UdpTransport};

/// How often long-running threads check whether the node was killed.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A node in the Kademlia DHT.
///
/// `Node` is a cheap handle; clones share the same routing table, store and transport.
#[derive(Clone)]
pub struct Node {
    contact: Arc<Contact>,
    config: Arc<Config>,
    routing_table: Arc<RoutingTable>,
    storage: Arc<Mutex<LocalStore>>,
    pending_requests: Arc<Mutex<HashMap<RequestId, Sender<Message>>>>,
    transport: Arc<dyn Transport>,
    is_active: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Node {
    /// Constructs a new `Node` sending through `transport` and handling every datagram received
    /// on `inbound`. The node knows no peers until it is bootstrapped or contacted.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        inbound: Receiver<Datagram>,
    ) -> Result<Self> {
        config.validate()?;
        let id = config
            .local_id
            .unwrap_or_else(NodeId::random)
            .masked(config.id_bits);
        let contact = Arc::new(Contact::new(id, transport.local_addr()));
        let routing_table = RoutingTable::new(id, config.k, config.id_bits);

        let node = Node {
            contact,
            config: Arc::new(config),
            routing_table: Arc::new(routing_table),
            storage: Arc::new(Mutex::new(LocalStore::new())),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            transport,
            is_active: Arc::new(AtomicBool::new(true)),
        };

        info!("{} - Started node {:?}", node.contact.addr, node.contact.id);
        node.start_message_handler(inbound);
        node.start_maintenance();
        Ok(node)
    }

    /// Constructs a new `Node` on a UDP socket bound to `addr`.
    pub fn bind_udp(config: Config, addr: &str) -> Result<Self> {
        let (inbound_tx, inbound_rx) = channel();
        let transport = UdpTransport::bind(addr, inbound_tx)?;
        Node::new(config, Arc::new(transport), inbound_rx)
    }

    /// Constructs a new `Node` attached to an in-process network at `addr`.
    pub fn attach(config: Config, network: &MemoryNetwork, addr: &str) -> Result<Self> {
        let (inbound_tx, inbound_rx) = channel();
        let transport = network.attach(addr, inbound_tx);
        Node::new(config, transport, inbound_rx)
    }

    /// Starts a thread that handles inbound datagrams.
    fn start_message_handler(&self, rx: Receiver<Datagram>) {
        let node = self.clone();
        thread::spawn(move || {
            while node.is_active.load(Ordering::Acquire) {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(datagram) => node.handle_datagram(datagram),
                    Err(RecvTimeoutError::Timeout) => {},
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("{} - Killed message handler", node.contact.addr);
        });
    }

    /// Joins the network through the nodes listening at `seeds`. Every seed is pinged, then the
    /// node looks up its own id to learn its neighbours and refreshes every bucket farther than
    /// the closest neighbour. Returns the number of seeds that answered.
    pub fn bootstrap(&self, seeds: &[String]) -> Result<usize> {
        let mut reached = 0;
        for seed in seeds {
            match self.rpc_ping(seed) {
                Ok(contact) => {
                    info!("{} - Bootstrapped from {:?}", self.contact.addr, contact);
                    reached += 1;
                },
                Err(err) => warn!(
                    "{} - Bootstrap seed {} did not answer: {}",
                    self.contact.addr, seed, err
                ),
            }
        }
        if reached == 0 {
            return Err(Error::BootstrapFailed);
        }

        let target = self.contact.id;
        self.lookup_node(&target);

        if let Some(closest) = self.routing_table.closest_occupied_index() {
            for index in 0..closest {
                self.lookup_node(&self.random_id_in_bucket(index));
            }
        }
        Ok(reached)
    }

    /// Publishes a key-value pair: the node keeps it as an origin record and stores it at the `k`
    /// closest nodes it can find. Returns the number of nodes that acknowledged the store.
    pub fn put(&self, key: Key, value: Vec<u8>) -> usize {
        lock(&self.storage).put(key, value.clone(), true);
        self.replicate(key, value)
    }

    /// Stores `value` at the `k` closest nodes to `key` and returns how many acknowledged.
    fn replicate(&self, key: Key, value: Vec<u8>) -> usize {
        let closest = self.lookup_node(&key);
        let (tx, rx) = channel();
        for dest in closest {
            let node = self.clone();
            let value = value.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let stored = match node.rpc_store(&dest, key, value) {
                    Ok(()) => true,
                    Err(err) => {
                        node.record_failure(&dest, &err);
                        false
                    },
                };
                if tx.send(stored).is_err() {
                    warn!("Receiver closed channel before rpc returned.");
                }
            });
        }
        drop(tx);
        let acks = rx.iter().filter(|stored| *stored).count();
        debug!("{} - Replicated {:?} to {} nodes", self.contact.addr, key, acks);
        acks
    }

    /// Gets the value associated with `key`, from the local store if present and otherwise from
    /// the network. Returns `None` if the key was not found.
    pub fn get(&self, key: &Key) -> Option<Vec<u8>> {
        if let Some(value) = lock(&self.storage).get(key) {
            return Some(value.to_vec());
        }
        match self.lookup_value(key) {
            LookupValue::Found(value) => Some(value),
            LookupValue::NotFound(_) => None,
        }
    }

    /// Returns the record held locally under `key`.
    pub fn record(&self, key: &Key) -> Option<Record> {
        lock(&self.storage).record(key).cloned()
    }

    /// Returns a snapshot of every record held locally.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.storage).iter().cloned().collect()
    }

    /// Stores a record locally without contacting the network.
    pub fn store_local(&self, key: Key, value: Vec<u8>, origin: bool) {
        lock(&self.storage).put(key, value, origin);
    }

    /// Returns a random id in the range covered by bucket `index`.
    fn random_id_in_bucket(&self, index: usize) -> NodeId {
        self.contact
            .id
            .rand_in_bucket(index)
            .masked(self.config.id_bits)
    }

    /// Returns the `Contact` other nodes know this node by.
    pub fn contact(&self) -> Contact {
        (*self.contact).clone()
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` until the node is killed.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Stops the message handler and maintenance threads and closes the transport. Requests
    /// already in flight run until their deadline.
    pub fn kill(&self) {
        self.is_active.store(false, Ordering::Release);
        self.transport.close();
    }

    fn rpc_deadline(&self, limit: Option<Instant>) -> Instant {
        let deadline = Instant::now() + self.config.rpc_timeout();
        match limit {
            Some(limit) if limit < deadline => limit,
            _ => deadline,
        }
    }
}
