use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result};
use std::hash::{Hash, Hasher};

use time::OffsetDateTime;

use crate::key::{Distance, NodeId};

/// A remote peer as known to the local node: its id, its transport address, and the last time
/// the local node heard from it.
///
/// Only `id` and `addr` travel on the wire; `last_seen` is local bookkeeping and compares equal
/// regardless of value.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: String,
    #[serde(skip, default = "OffsetDateTime::now_utc")]
    pub last_seen: OffsetDateTime,
}

impl Contact {
    /// Constructs a `Contact` last seen now.
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Contact {
            id,
            addr: addr.into(),
            last_seen: OffsetDateTime::now_utc(),
        }
    }

    /// Marks the contact as seen now.
    pub fn touch(&mut self) {
        self.last_seen = OffsetDateTime::now_utc();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.addr.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {:?}", self.addr, self.id)
    }
}

/// A contact paired with its distance to some target.
///
/// Pairs order by ascending distance with ties broken by ascending raw id, which makes every
/// closest-first list deterministic.
#[derive(Eq, Clone, Debug)]
pub struct ContactDistancePair(pub Contact, pub Distance);

impl ContactDistancePair {
    pub fn new(contact: Contact, target: &NodeId) -> Self {
        let distance = contact.id.distance(target);
        ContactDistancePair(contact, distance)
    }
}

impl PartialEq for ContactDistancePair {
    fn eq(&self, other: &ContactDistancePair) -> bool {
        self.0.id == other.0.id && self.1 == other.1
    }
}

impl PartialOrd for ContactDistancePair {
    fn partial_cmp(&self, other: &ContactDistancePair) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContactDistancePair {
    fn cmp(&self, other: &ContactDistancePair) -> Ordering {
        self.1.cmp(&other.1).then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Sorts `contacts` closest-first to `target`.
pub(crate) fn sort_by_distance(contacts: Vec<Contact>, target: &NodeId) -> Vec<Contact> {
    let mut pairs: Vec<ContactDistancePair> = contacts
        .into_iter()
        .map(|contact| ContactDistancePair::new(contact, target))
        .collect();
    pairs.sort();
    pairs.into_iter().map(|pair| pair.0).collect()
}
