use std::cmp;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use time::{Duration, OffsetDateTime};

use crate::key::NodeId;
use crate::node::contact::{sort_by_distance, Contact};

/// The result of offering a contact to a k-bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The contact was appended to a bucket with free space.
    Inserted,
    /// The contact was already present and moved to the most recently seen position.
    Refreshed,
    /// The bucket is at capacity. `lrs` is the eviction candidate, which must be pinged before it
    /// may be evicted in favor of the new contact: the contact with the most unanswered requests,
    /// or the least recently seen one if every contact answered.
    Full { lrs: Contact },
    /// The bucket is at capacity and its least recently seen contact is already being probed; the
    /// new contact is discarded.
    Dropped,
    /// The contact carries the local node's own id.
    RejectedSelf,
}

/// A k-bucket in a node's routing table that has a maximum capacity of `k`.
///
/// The contacts in the k-bucket are sorted by the time of the most recent communication with those
/// which have been most recently communicated at the end of the list.
#[derive(Clone, Debug)]
pub struct KBucket {
    contacts: Vec<Contact>,
    capacity: usize,
    last_update_time: OffsetDateTime,
    probing: bool,
    /// Consecutive unanswered requests per contact, cleared whenever the contact is heard from.
    failures: HashMap<NodeId, usize>,
}

impl KBucket {
    /// Constructs a new, empty `KBucket` holding at most `capacity` contacts.
    pub fn new(capacity: usize) -> Self {
        KBucket {
            contacts: Vec::with_capacity(capacity),
            capacity,
            last_update_time: OffsetDateTime::now_utc(),
            probing: false,
            failures: HashMap::new(),
        }
    }

    /// Upserts a contact. A present contact is moved to the end of the list; an absent one is
    /// appended if there is room. Otherwise an eviction candidate is returned and the bucket is
    /// left unchanged.
    pub fn insert(&mut self, mut contact: Contact) -> InsertOutcome {
        if let Some(index) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(index);
            self.failures.remove(&contact.id);
            contact.touch();
            self.contacts.push(contact);
            self.last_update_time = OffsetDateTime::now_utc();
            return InsertOutcome::Refreshed;
        }

        if !self.is_full() {
            contact.touch();
            self.contacts.push(contact);
            self.last_update_time = OffsetDateTime::now_utc();
            return InsertOutcome::Inserted;
        }

        match self.eviction_candidate() {
            Some(lrs) => InsertOutcome::Full { lrs: lrs.clone() },
            None => InsertOutcome::Dropped,
        }
    }

    /// Returns the contact with the most unanswered requests, earliest seen first among equals.
    fn eviction_candidate(&self) -> Option<&Contact> {
        let failures = |c: &Contact| self.failures.get(&c.id).cloned().unwrap_or(0);
        let most = self.contacts.iter().map(failures).max()?;
        self.contacts.iter().find(|c| failures(*c) == most)
    }

    /// Removes the contact with `id`, if any.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id == *id)?;
        self.failures.remove(id);
        Some(self.contacts.remove(index))
    }

    /// Counts an unanswered request to the contact with `id`. Once `limit` consecutive requests
    /// went unanswered the contact is evicted and returned.
    pub fn record_failure(&mut self, id: &NodeId, limit: usize) -> Option<Contact> {
        if !self.contains(id) {
            return None;
        }
        let count = self.failures.entry(*id).or_insert(0);
        *count += 1;
        if *count >= limit {
            self.remove(id)
        } else {
            None
        }
    }

    /// Returns the number of consecutive unanswered requests to the contact with `id`.
    pub fn failures(&self, id: &NodeId) -> usize {
        self.failures.get(id).cloned().unwrap_or(0)
    }

    /// Returns up to `limit` contacts ordered by ascending distance to `target`.
    pub fn closest(&self, target: &NodeId, limit: usize) -> Vec<Contact> {
        let mut ret = sort_by_distance(self.contacts.clone(), target);
        ret.truncate(limit);
        ret
    }

    /// Evicts `lrs` and inserts `candidate` in its place. Returns `false` if `lrs` was already
    /// gone and the bucket has no room, in which case the candidate is discarded.
    fn replace(&mut self, lrs: &NodeId, candidate: Contact) -> bool {
        self.remove(lrs);
        match self.insert(candidate) {
            InsertOutcome::Inserted | InsertOutcome::Refreshed => true,
            _ => false,
        }
    }

    /// Returns the least recently seen contact.
    pub fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Returns `true` if the bucket holds a contact with `id`.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    /// Returns a slice of the contacts, least recently seen first.
    pub fn contacts(&self) -> &[Contact] {
        self.contacts.as_slice()
    }

    /// Returns `true` if the bucket has not been updated within `interval`.
    pub fn is_stale(&self, interval: Duration) -> bool {
        OffsetDateTime::now_utc() - self.last_update_time > interval
    }

    /// Returns the number of contacts in the bucket.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }
}

fn read(lock: &RwLock<KBucket>) -> RwLockReadGuard<KBucket> {
    match lock.read() {
        Ok(bucket) => bucket,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write(lock: &RwLock<KBucket>) -> RwLockWriteGuard<KBucket> {
    match lock.write() {
        Ok(bucket) => bucket,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A node's routing table.
///
/// Bucket `i` holds the contacts that share exactly `i` leading bits with the local id. Every
/// bucket sits behind its own lock, so writes to one bucket never block reads or writes of
/// another, and the table itself needs no outer lock.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    /// Constructs a new, empty `RoutingTable` with `bucket_count` buckets of capacity `k`.
    pub fn new(local_id: NodeId, k: usize, bucket_count: usize) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| RwLock::new(KBucket::new(k)))
            .collect();
        RoutingTable { local_id, buckets }
    }

    /// Returns the index of the bucket `id` belongs to, or `None` for the local id.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.local_id
            .bucket_index(id)
            .map(|index| cmp::min(index, self.buckets.len() - 1))
    }

    /// Records that `contact` was heard from. A full bucket reports its least recently seen
    /// contact so the caller can run the ping-before-evict probe; only one probe per bucket is
    /// reported at a time, and contacts arriving while it runs are dropped.
    pub fn record_contact(&self, contact: Contact) -> InsertOutcome {
        let index = match self.bucket_index(&contact.id) {
            Some(index) => index,
            None => return InsertOutcome::RejectedSelf,
        };
        let mut bucket = write(&self.buckets[index]);
        match bucket.insert(contact) {
            InsertOutcome::Full { lrs } => {
                if bucket.probing {
                    InsertOutcome::Dropped
                } else {
                    bucket.probing = true;
                    InsertOutcome::Full { lrs }
                }
            },
            outcome => outcome,
        }
    }

    /// Finishes a ping-before-evict probe started by `record_contact`. If `lrs` answered, the
    /// candidate is discarded; otherwise `lrs` is evicted and the candidate takes its place.
    /// Returns `true` if the candidate was inserted.
    pub fn complete_probe(&self, lrs: &Contact, candidate: Contact, lrs_alive: bool) -> bool {
        let index = match self.bucket_index(&candidate.id) {
            Some(index) => index,
            None => return false,
        };
        let mut bucket = write(&self.buckets[index]);
        bucket.probing = false;
        if lrs_alive {
            false
        } else {
            bucket.replace(&lrs.id, candidate)
        }
    }

    /// Returns up to `limit` contacts closest to `target`, sorted by ascending distance with ties
    /// broken by ascending raw id.
    ///
    /// Contacts in the target's own bucket are the closest. Every bucket past it is equally far
    /// in the most significant differing bit, so all of them are gathered; buckets before it grow
    /// strictly farther and are walked only until `limit` contacts are collected.
    pub fn find_closest(&self, target: &NodeId, limit: usize) -> Vec<Contact> {
        if limit == 0 {
            return Vec::new();
        }
        let last = self.buckets.len() - 1;
        let index = self.bucket_index(target).unwrap_or(last);
        let mut ret = Vec::new();

        ret.extend_from_slice(read(&self.buckets[index]).contacts());

        if ret.len() < limit {
            for i in (index + 1)..self.buckets.len() {
                ret.extend_from_slice(read(&self.buckets[i]).contacts());
            }
        }

        if ret.len() < limit {
            for i in (0..index).rev() {
                ret.extend_from_slice(read(&self.buckets[i]).contacts());
                if ret.len() >= limit {
                    break;
                }
            }
        }

        let mut ret = sort_by_distance(ret, target);
        ret.truncate(limit);
        ret
    }

    /// Returns a snapshot of every contact in the table.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| read(bucket).contacts().to_vec())
            .collect()
    }

    /// Counts an unanswered request to the contact with `id` and evicts it once `limit`
    /// consecutive requests went unanswered. Returns the evicted contact.
    pub fn record_failure(&self, id: &NodeId, limit: usize) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        write(&self.buckets[index]).record_failure(id, limit)
    }

    /// Returns `true` if the table holds a contact with `id`.
    pub fn contains(&self, id: &NodeId) -> bool {
        match self.bucket_index(id) {
            Some(index) => read(&self.buckets[index]).contains(id),
            None => false,
        }
    }

    /// Removes the contact with `id` from the routing table.
    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        write(&self.buckets[index]).remove(id)
    }

    /// Returns the indexes of every bucket not updated within `interval`.
    pub fn stale_indexes(&self, interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| read(bucket).is_stale(interval))
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the index of the non-empty bucket sharing the longest prefix with the local id.
    pub fn closest_occupied_index(&self) -> Option<usize> {
        (0..self.buckets.len())
            .rev()
            .find(|i| !read(&self.buckets[*i]).is_empty())
    }

    /// Returns a copy of bucket `index`.
    pub fn bucket(&self, index: usize) -> Option<KBucket> {
        self.buckets.get(index).map(|bucket| read(bucket).clone())
    }

    /// Returns the number of contacts in the table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| read(bucket).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the routing table.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}
