use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use time::Duration;

use super::{lock, Node, POLL_INTERVAL};

impl Node {
    /// Starts a thread that refreshes stale routing buckets, expires cached records and
    /// republishes the records this node originated.
    pub(super) fn start_maintenance(&self) {
        let node = self.clone();
        thread::spawn(move || {
            let mut last_refresh = Instant::now();
            let mut last_republish = Instant::now();
            while node.is_active.load(Ordering::Acquire) {
                thread::sleep(POLL_INTERVAL);

                if last_refresh.elapsed() >= node.config.refresh_interval() {
                    node.refresh_stale_buckets();
                    node.expire_records();
                    last_refresh = Instant::now();
                }

                if last_republish.elapsed() >= node.config.republish_interval() {
                    node.republish();
                    last_republish = Instant::now();
                }
            }
            warn!("{} - Killed maintenance thread", node.contact.addr);
        });
    }

    /// Looks up a random id in the range of every bucket that saw no traffic during the last
    /// refresh interval. Buckets closer than the closest known neighbour are skipped; they can
    /// only be empty.
    pub(crate) fn refresh_stale_buckets(&self) {
        let closest = match self.routing_table.closest_occupied_index() {
            Some(closest) => closest,
            None => return,
        };
        let interval = Duration::seconds(self.config.refresh_interval_secs as i64);
        let stale_indexes = self.routing_table.stale_indexes(interval);
        for index in stale_indexes.into_iter().filter(|index| *index <= closest) {
            if !self.is_active() {
                break;
            }
            debug!("{} - Refreshing bucket {}", self.contact.addr, index);
            self.lookup_node(&self.random_id_in_bucket(index));
        }
    }

    pub(crate) fn expire_records(&self) {
        let ttl = Duration::seconds(self.config.record_ttl_secs as i64);
        let removed = lock(&self.storage).remove_expired(ttl);
        if removed > 0 {
            info!("{} - Expired {} cached records", self.contact.addr, removed);
        }
    }

    /// Pushes every origin record to the `k` closest nodes to its key.
    pub(crate) fn republish(&self) {
        let origin_records: Vec<_> = lock(&self.storage)
            .iter()
            .filter(|record| record.origin)
            .map(|record| (record.key, record.value.clone()))
            .collect();
        for (key, value) in origin_records {
            if !self.is_active() {
                break;
            }
            let acks = self.replicate(key, value);
            debug!("{} - Republished {:?} to {} nodes", self.contact.addr, key, acks);
        }
    }
}
