use std::sync::mpsc::channel;
use std::thread;
use std::time::Instant;

use super::{lock, Node};
use crate::error::RpcError;
use crate::key::{Key, NodeId};
use crate::node::contact::Contact;
use crate::protocol::{Body, Message, Request, Response};
use crate::routing::InsertOutcome;
use crate::transport::Datagram;

impl Node {
    /// Decodes and dispatches one inbound datagram. Undecodable datagrams are dropped without
    /// touching the routing table.
    pub(super) fn handle_datagram(&self, datagram: Datagram) {
        let message = match Message::decode(&datagram.bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    "{} - Dropped malformed datagram from {}: {}",
                    self.contact.addr, datagram.src, err
                );
                return;
            },
        };

        // the observed source address is what we can actually reach the sender at
        let sender = Contact::new(message.sender.id, datagram.src);
        match message.body {
            Body::Request(request) => self.handle_request(sender, message.id, request),
            Body::Response(response) => self.handle_response(sender, message.id, response),
        }
    }

    /// Handles a request RPC.
    fn handle_request(&self, sender: Contact, id: NodeId, request: Request) {
        debug!(
            "{} - Receiving request from {} {:?}",
            self.contact.addr, sender.addr, request
        );
        self.record_contact(sender.clone());
        let k = self.config.k;
        let payload = match request {
            Request::Ping => Response::Pong,
            Request::Store(key, value) => {
                lock(&self.storage).put(key, value, false);
                Response::StoreOk
            },
            Request::FindNode(target) => {
                Response::Nodes(self.routing_table.find_closest(&target, k))
            },
            Request::FindValue(key) => {
                let value = lock(&self.storage).get(&key).map(|value| value.to_vec());
                match value {
                    Some(value) => Response::Value(value),
                    None => Response::Nodes(self.routing_table.find_closest(&key, k)),
                }
            },
        };

        let reply = Message {
            id,
            sender: (*self.contact).clone(),
            body: Body::Response(payload),
        };
        match reply.encode() {
            Ok(bytes) => {
                if let Err(err) = self.transport.send(&sender.addr, &bytes) {
                    warn!("{} - Could not reply to {}: {}", self.contact.addr, sender.addr, err);
                }
            },
            Err(err) => warn!("{} - Could not encode reply: {}", self.contact.addr, err),
        }
    }

    /// Handles a response RPC. If the id in the response does not match any outgoing request, then
    /// the response will be ignored and the sender is not recorded.
    fn handle_response(&self, sender: Contact, id: NodeId, response: Response) {
        let tx = lock(&self.pending_requests).get(&id).cloned();
        if let Some(tx) = tx {
            self.record_contact(sender.clone());
            debug!(
                "{} - Receiving response from {} {:?}",
                self.contact.addr, sender.addr, response
            );
            let message = Message {
                id,
                sender,
                body: Body::Response(response),
            };
            if tx.send(message).is_err() {
                debug!("{} - Requester gave up on {:?}", self.contact.addr, id);
            }
        } else {
            warn!(
                "{} - Original request not found; irrelevant response or expired request.",
                self.contact.addr
            );
        }
    }

    /// Records that `contact` was heard from. If its bucket is full, a thread pings the least
    /// recently seen contact and evicts it in favor of `contact` only if it stays silent.
    pub(crate) fn record_contact(&self, contact: Contact) {
        match self.routing_table.record_contact(contact.clone()) {
            InsertOutcome::Full { lrs } => self.spawn_eviction_probe(lrs, contact),
            InsertOutcome::Dropped => debug!(
                "{} - Dropped {:?}; bucket is full and already probing",
                self.contact.addr, contact
            ),
            _ => {},
        }
    }

    /// Records that a request to `contact` went unanswered. A contact that misses
    /// `eviction_probe_attempts` requests in a row is evicted from the routing table.
    pub(crate) fn record_failure(&self, contact: &Contact, err: &RpcError) {
        match err {
            RpcError::Timeout | RpcError::Transport(_) => {},
            _ => return,
        }
        let limit = self.config.eviction_probe_attempts;
        if let Some(evicted) = self.routing_table.record_failure(&contact.id, limit) {
            info!(
                "{} - Evicted {:?} after {} unanswered requests",
                self.contact.addr, evicted, limit
            );
        }
    }

    fn spawn_eviction_probe(&self, lrs: Contact, candidate: Contact) {
        let node = self.clone();
        thread::spawn(move || {
            let attempts = node.config.eviction_probe_attempts;
            let mut alive = false;
            for attempt in 1..=attempts {
                match node.rpc_ping(&lrs.addr) {
                    Ok(contact) if contact.id == lrs.id => {
                        alive = true;
                        break;
                    },
                    Ok(contact) => {
                        warn!(
                            "{} - {} answered as {:?} instead of {:?}",
                            node.contact.addr, lrs.addr, contact.id, lrs.id
                        );
                        break;
                    },
                    Err(err) => warn!(
                        "{} - Probe {}/{} of {:?} failed: {}",
                        node.contact.addr, attempt, attempts, lrs, err
                    ),
                }
            }

            if node.routing_table.complete_probe(&lrs, candidate.clone(), alive) {
                info!(
                    "{} - Evicted {:?} in favor of {:?}",
                    node.contact.addr, lrs, candidate
                );
            }
        });
    }

    /// Sends a request RPC to `addr` and waits for the correlated response until `deadline`. The
    /// pending entry is removed on every path, so abandoned requests never leak.
    pub(crate) fn send_request(
        &self,
        addr: &str,
        request: Request,
        deadline: Instant,
    ) -> Result<Message, RpcError> {
        debug!(
            "{} - Sending request to {} {:?}",
            self.contact.addr, addr, request
        );
        let (response_tx, response_rx) = channel();
        let mut pending_requests = lock(&self.pending_requests);
        let mut token = NodeId::random();

        while pending_requests.contains_key(&token) {
            token = NodeId::random();
        }
        pending_requests.insert(token, response_tx);
        drop(pending_requests);

        let message = Message {
            id: token,
            sender: (*self.contact).clone(),
            body: Body::Request(request),
        };
        let sent = message
            .encode()
            .map_err(RpcError::from)
            .and_then(|bytes| self.transport.send(addr, &bytes).map_err(RpcError::from));
        if let Err(err) = sent {
            lock(&self.pending_requests).remove(&token);
            return Err(err);
        }

        let timeout = deadline.saturating_duration_since(Instant::now());
        let response = response_rx.recv_timeout(timeout);
        lock(&self.pending_requests).remove(&token);

        response.map_err(|_| {
            debug!(
                "{} - Request to {} timed out after waiting for {:?}",
                self.contact.addr, addr, timeout
            );
            RpcError::Timeout
        })
    }

    /// Sends a `PING` RPC to `addr` and returns the contact that answered.
    pub fn rpc_ping(&self, addr: &str) -> Result<Contact, RpcError> {
        let deadline = self.rpc_deadline(None);
        let message = self.send_request(addr, Request::Ping, deadline)?;
        match message.body {
            Body::Response(Response::Pong) => Ok(message.sender),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Sends a `STORE` RPC.
    pub(crate) fn rpc_store(&self, dest: &Contact, key: Key, value: Vec<u8>) -> Result<(), RpcError> {
        let deadline = self.rpc_deadline(None);
        let message = self.send_request(&dest.addr, Request::Store(key, value), deadline)?;
        match message.body {
            Body::Response(Response::StoreOk) => Ok(()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Sends a `FIND_NODE` RPC.
    pub(crate) fn rpc_find_node(
        &self,
        dest: &Contact,
        target: &NodeId,
        deadline: Instant,
    ) -> Result<Response, RpcError> {
        let message = self.send_request(&dest.addr, Request::FindNode(*target), deadline)?;
        match message.body {
            Body::Response(response @ Response::Nodes(_)) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Sends a `FIND_VALUE` RPC.
    pub(crate) fn rpc_find_value(
        &self,
        dest: &Contact,
        key: &Key,
        deadline: Instant,
    ) -> Result<Response, RpcError> {
        let message = self.send_request(&dest.addr, Request::FindValue(*key), deadline)?;
        match message.body {
            Body::Response(response @ Response::Nodes(_))
            | Body::Response(response @ Response::Value(_)) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.pending_requests).len()
    }
}
