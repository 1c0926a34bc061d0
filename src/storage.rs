use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::key::Key;

/// A locally held key-value pair.
///
/// `origin` is `true` if this node published the value itself and `false` if it holds the value
/// on behalf of another node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub value: Vec<u8>,
    pub origin: bool,
    pub stored_at: OffsetDateTime,
}

/// The records held by one node.
#[derive(Default, Debug)]
pub struct LocalStore {
    data: HashMap<Key, Record>,
}

impl LocalStore {
    pub fn new() -> Self {
        LocalStore {
            data: HashMap::new(),
        }
    }

    /// Stores `value` under `key`, replacing any existing record.
    pub fn put(&mut self, key: Key, value: Vec<u8>, origin: bool) {
        let record = Record {
            key,
            value,
            origin,
            stored_at: OffsetDateTime::now_utc(),
        };
        if self.data.insert(key, record).is_some() {
            debug!("Overwrote record {:?}", key);
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &Key) -> Option<&[u8]> {
        self.data.get(key).map(|record| record.value.as_slice())
    }

    /// Returns the record stored under `key`.
    pub fn record(&self, key: &Key) -> Option<&Record> {
        self.data.get(key)
    }

    /// Returns an iterator over every record. The order is unspecified but does not change while
    /// the iterator is alive.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.data.values()
    }

    /// Removes cached records stored longer than `ttl` ago. Origin records never expire.
    pub fn remove_expired(&mut self, ttl: Duration) -> usize {
        let expiration_cutoff = OffsetDateTime::now_utc() - ttl;
        let before = self.data.len();
        self.data.retain(|key, record| {
            let expired = !record.origin && record.stored_at < expiration_cutoff;
            if expired {
                info!("Removed {:?}", key);
            }
            !expired
        });
        before - self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
