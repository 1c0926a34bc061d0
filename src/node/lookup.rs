use std::collections::HashSet;
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Instant;

use super::Node;
use crate::error::RpcError;
use crate::key::{Key, NodeId};
use crate::node::contact::{sort_by_distance, Contact};
use crate::protocol::Response;

/// The outcome of a value lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupValue {
    Found(Vec<u8>),
    /// No queried node held the value; carries the closest live contacts to the key instead.
    NotFound(Vec<Contact>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupKind {
    Node,
    Value,
}

type FindResult = (Contact, Result<Response, RpcError>);

/// The bookkeeping of one iterative lookup.
#[derive(Debug)]
struct LookupState {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    /// Every contact seen so far and not known to have failed, closest first. Only the first `k`
    /// are queried or returned; the rest stand in when closer contacts fail.
    shortlist: Vec<Contact>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    /// Queried contacts that answered a `FIND_VALUE` with contacts instead of the value.
    lacking_value: Vec<Contact>,
}

impl LookupState {
    fn new(target: NodeId, local_id: NodeId, k: usize, seed: Vec<Contact>) -> Self {
        let mut state = LookupState {
            target,
            local_id,
            k,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            lacking_value: Vec::new(),
        };
        state.merge(seed);
        state
    }

    /// Returns the `k` closest contacts not known to have failed.
    fn candidates(&self) -> impl Iterator<Item = &Contact> {
        self.shortlist.iter().take(self.k)
    }

    /// Returns up to `count` candidates that were not queried yet, closest first.
    fn next_batch(&self, count: usize) -> Vec<Contact> {
        self.candidates()
            .filter(|contact| !self.queried.contains(&contact.id))
            .take(count)
            .cloned()
            .collect()
    }

    /// Merges `contacts` into the shortlist, dropping duplicates, the local node and contacts that
    /// already failed.
    fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            let known = contact.id == self.local_id
                || self.failed.contains(&contact.id)
                || self.shortlist.iter().any(|c| c.id == contact.id);
            if !known {
                self.shortlist.push(contact);
            }
        }
        let shortlist = std::mem::replace(&mut self.shortlist, Vec::new());
        self.shortlist = sort_by_distance(shortlist, &self.target);
    }

    fn mark_failed(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.shortlist.retain(|contact| contact.id != *id);
    }

    fn closest(&self) -> Option<NodeId> {
        self.shortlist.first().map(|contact| contact.id)
    }

    /// Returns `true` if the closest contact is `before` and has already been queried.
    fn is_converged(&self, before: Option<NodeId>) -> bool {
        let after = self.closest();
        after == before && after.map_or(true, |id| self.queried.contains(&id))
    }

    /// Returns the candidates that answered, closest first.
    fn live_contacts(&self) -> Vec<Contact> {
        self.candidates()
            .filter(|contact| self.queried.contains(&contact.id))
            .cloned()
            .collect()
    }

    /// Returns the closest queried contact that did not hold the value.
    fn closest_lacking_value(&self) -> Option<Contact> {
        sort_by_distance(self.lacking_value.clone(), &self.target)
            .into_iter()
            .next()
    }
}

impl Node {
    /// Iteratively looks up the `k` closest live nodes to `target`.
    pub fn lookup_node(&self, target: &NodeId) -> Vec<Contact> {
        self.lookup_node_until(target, None)
    }

    /// Like `lookup_node`, but abandons outstanding requests once `deadline` passes and returns
    /// what was learned so far.
    pub fn lookup_node_until(&self, target: &NodeId, deadline: Option<Instant>) -> Vec<Contact> {
        match self.lookup(target, LookupKind::Node, deadline) {
            LookupValue::NotFound(contacts) => contacts,
            LookupValue::Found(_) => Vec::new(),
        }
    }

    /// Iteratively looks up the value stored under `key`, or the `k` closest live nodes to `key`
    /// if no queried node holds it.
    pub fn lookup_value(&self, key: &Key) -> LookupValue {
        self.lookup_value_until(key, None)
    }

    /// Like `lookup_value`, but bounded by `deadline`.
    pub fn lookup_value_until(&self, key: &Key, deadline: Option<Instant>) -> LookupValue {
        self.lookup(key, LookupKind::Value, deadline)
    }

    /// Spawns a thread that sends either a `FIND_NODE` or a `FIND_VALUE` RPC.
    fn spawn_find_rpc(
        &self,
        dest: Contact,
        target: NodeId,
        kind: LookupKind,
        deadline: Instant,
        tx: Sender<FindResult>,
    ) {
        let node = self.clone();
        thread::spawn(move || {
            let result = match kind {
                LookupKind::Node => node.rpc_find_node(&dest, &target, deadline),
                LookupKind::Value => node.rpc_find_value(&dest, &target, deadline),
            };
            if tx.send((dest, result)).is_err() {
                debug!("Receiver closed channel before rpc returned.");
            }
        });
    }

    /// Iteratively looks up nodes to determine the closest nodes to `target`. The shortlist is
    /// seeded with the `k` closest contacts in the routing table. Every round sends either
    /// `FIND_NODE` or `FIND_VALUE` RPCs in parallel to up to `alpha` of the `k` closest contacts
    /// not yet queried and merges the returned contacts. Once a round fails to produce a closer
    /// contact, one final round queries every remaining unqueried contact among the `k` closest
    /// and the lookup ends. Contacts that fail are dropped from this lookup and reported to the
    /// routing table.
    fn lookup(&self, target: &NodeId, kind: LookupKind, deadline: Option<Instant>) -> LookupValue {
        let seed = self.routing_table.find_closest(target, self.config.k);
        let mut state = LookupState::new(*target, self.contact.id, self.config.k, seed);
        let mut converged = false;

        for round in 0..self.config.max_lookup_rounds {
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                debug!("{} - Lookup of {:?} hit its deadline", self.contact.addr, target);
                break;
            }

            let width = if converged {
                self.config.k
            } else {
                self.config.alpha
            };
            let batch = state.next_batch(width);
            if batch.is_empty() {
                break;
            }
            let closest_before = state.closest();

            if let Some(value) = self.run_round(&mut state, batch, target, kind, deadline) {
                debug!(
                    "{} - Found value for {:?} in round {}",
                    self.contact.addr, target, round
                );
                self.cache_value(&state, target, &value);
                return LookupValue::Found(value);
            }

            if converged {
                break;
            }
            if state.is_converged(closest_before) {
                debug!(
                    "{} - Lookup of {:?} converged after round {}",
                    self.contact.addr, target, round
                );
                converged = true;
            }
        }

        let contacts = state.live_contacts();
        debug!(
            "{} - Closest nodes to {:?} are {:?}",
            self.contact.addr, target, contacts
        );
        LookupValue::NotFound(contacts)
    }

    /// Queries every contact in `batch` in parallel and merges the answers into `state`. Returns
    /// the value as soon as a `FIND_VALUE` finds it.
    fn run_round(
        &self,
        state: &mut LookupState,
        batch: Vec<Contact>,
        target: &NodeId,
        kind: LookupKind,
        deadline: Option<Instant>,
    ) -> Option<Vec<u8>> {
        let rpc_deadline = self.rpc_deadline(deadline);
        let (tx, rx) = channel();
        for dest in batch {
            state.queried.insert(dest.id);
            self.spawn_find_rpc(dest, *target, kind, rpc_deadline, tx.clone());
        }
        drop(tx);

        for (contact, result) in rx.iter() {
            match result {
                Ok(Response::Value(value)) if kind == LookupKind::Value => {
                    debug!("{} - {:?} holds {:?}", self.contact.addr, contact, target);
                    return Some(value);
                },
                Ok(Response::Nodes(contacts)) => {
                    if kind == LookupKind::Value {
                        state.lacking_value.push(contact);
                    }
                    state.merge(contacts);
                },
                Ok(response) => {
                    warn!(
                        "{} - Unexpected response from {:?}: {:?}",
                        self.contact.addr, contact, response
                    );
                    state.mark_failed(&contact.id);
                },
                Err(err) => {
                    debug!("{} - {:?} failed: {}", self.contact.addr, contact, err);
                    self.record_failure(&contact, &err);
                    state.mark_failed(&contact.id);
                },
            }
        }
        None
    }

    /// Stores a found value at the closest queried node that did not have it, so later lookups
    /// for the key end sooner.
    fn cache_value(&self, state: &LookupState, key: &Key, value: &[u8]) {
        if let Some(dest) = state.closest_lacking_value() {
            match self.rpc_store(&dest, *key, value.to_vec()) {
                Ok(()) => debug!("{} - Cached {:?} at {:?}", self.contact.addr, key, dest),
                Err(err) => {
                    debug!(
                        "{} - Could not cache {:?} at {:?}: {}",
                        self.contact.addr, key, dest, err
                    );
                    self.record_failure(&dest, &err);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LookupState;
    use crate::key::NodeId;
    use crate::node::contact::Contact;
    use crate::KEY_LENGTH;

    fn id_from(byte: u8) -> NodeId {
        let mut data = [0u8; KEY_LENGTH];
        data[0] = byte;
        NodeId(data)
    }

    fn contact(byte: u8) -> Contact {
        Contact::new(id_from(byte), format!("node-{}", byte))
    }

    fn ids(contacts: &[Contact]) -> Vec<u8> {
        contacts.iter().map(|c| c.id.0[0]).collect()
    }

    #[test]
    fn test_merge_dedupes_and_sorts() {
        let mut state = LookupState::new(id_from(0x00), id_from(0xFF), 3, vec![contact(0x40)]);
        state.merge(vec![contact(0x10), contact(0x40), contact(0x80), contact(0x20)]);
        assert_eq!(ids(&state.shortlist), vec![0x10, 0x20, 0x40, 0x80]);
        assert_eq!(ids(&state.next_batch(20)), vec![0x10, 0x20, 0x40]);
    }

    #[test]
    fn test_failed_candidate_is_replaced_by_next_closest() {
        let seed = vec![contact(0x01), contact(0x02), contact(0x03)];
        let mut state = LookupState::new(id_from(0x00), id_from(0xFF), 2, seed);
        for id in &[0x01, 0x02] {
            state.queried.insert(id_from(*id));
        }
        assert!(state.next_batch(2).is_empty());

        state.mark_failed(&id_from(0x01));
        assert_eq!(ids(&state.next_batch(2)), vec![0x03]);
        state.queried.insert(id_from(0x03));
        assert_eq!(ids(&state.live_contacts()), vec![0x02, 0x03]);
    }

    #[test]
    fn test_merge_skips_local_and_failed() {
        let mut state = LookupState::new(id_from(0x00), id_from(0x01), 20, vec![contact(0x02)]);
        state.mark_failed(&id_from(0x02));
        state.merge(vec![contact(0x01), contact(0x02), contact(0x03)]);
        assert_eq!(ids(&state.shortlist), vec![0x03]);
    }

    #[test]
    fn test_next_batch_skips_queried() {
        let seed = vec![contact(0x01), contact(0x02), contact(0x03), contact(0x04)];
        let mut state = LookupState::new(id_from(0x00), id_from(0xFF), 20, seed);
        state.queried.insert(id_from(0x01));
        assert_eq!(ids(&state.next_batch(2)), vec![0x02, 0x03]);
    }

    #[test]
    fn test_convergence() {
        let mut state = LookupState::new(id_from(0x00), id_from(0xFF), 20, vec![contact(0x08)]);
        let before = state.closest();
        assert!(!state.is_converged(before));

        state.queried.insert(id_from(0x08));
        assert!(state.is_converged(before));

        state.merge(vec![contact(0x04)]);
        assert!(!state.is_converged(before));
    }

    #[test]
    fn test_live_contacts_and_lacking_value() {
        let seed = vec![contact(0x01), contact(0x02), contact(0x03)];
        let mut state = LookupState::new(id_from(0x00), id_from(0xFF), 20, seed);
        state.queried.insert(id_from(0x02));
        state.queried.insert(id_from(0x03));
        state.lacking_value.push(contact(0x03));
        state.lacking_value.push(contact(0x02));
        assert_eq!(ids(&state.live_contacts()), vec![0x02, 0x03]);
        assert_eq!(state.closest_lacking_value(), Some(contact(0x02)));
    }
}
