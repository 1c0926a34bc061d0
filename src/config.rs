use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::NodeId;
use crate::{
    BUCKET_REFRESH_INTERVAL, CONCURRENCY_PARAM, EVICTION_PROBE_ATTEMPTS, KEY_EXPIRATION,
    KEY_LENGTH, MAX_LOOKUP_ROUNDS, REPLICATION_PARAM, REPUBLISH_INTERVAL, REQUEST_TIMEOUT,
};

/// Tunable parameters of a `Node`.
///
/// Missing fields take their defaults when deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of every k-bucket, and the number of contacts a lookup converges on.
    pub k: usize,
    /// Number of RPCs a lookup keeps in flight per round.
    pub alpha: usize,
    /// Width of node identifiers in bits, at most 160.
    pub id_bits: usize,
    /// How long a single RPC waits for its response, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// How long a bucket may go without traffic before it is refreshed, in seconds.
    pub refresh_interval_secs: u64,
    /// How long records cached on behalf of other nodes are kept, in seconds.
    pub record_ttl_secs: u64,
    /// How often records this node published are pushed to the closest nodes again, in seconds.
    pub republish_interval_secs: u64,
    /// Upper bound on rounds per lookup.
    pub max_lookup_rounds: usize,
    /// Consecutive unanswered pings after which a least recently seen contact is evicted.
    pub eviction_probe_attempts: usize,
    /// Fixed identifier for the node; a random one is generated if `None`.
    pub local_id: Option<NodeId>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            k: REPLICATION_PARAM,
            alpha: CONCURRENCY_PARAM,
            id_bits: KEY_LENGTH * 8,
            rpc_timeout_ms: REQUEST_TIMEOUT,
            refresh_interval_secs: BUCKET_REFRESH_INTERVAL,
            record_ttl_secs: KEY_EXPIRATION,
            republish_interval_secs: REPUBLISH_INTERVAL,
            max_lookup_rounds: MAX_LOOKUP_ROUNDS,
            eviction_probe_attempts: EVICTION_PROBE_ATTEMPTS,
            local_id: None,
        }
    }
}

impl Config {
    /// Checks that the parameters describe a usable node.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(invalid("k must be at least 1"));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(invalid("alpha must be between 1 and k"));
        }
        if self.id_bits == 0 || self.id_bits > KEY_LENGTH * 8 {
            return Err(invalid(&format!(
                "id_bits must be between 1 and {}",
                KEY_LENGTH * 8
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(invalid("rpc_timeout_ms must be positive"));
        }
        if self.refresh_interval_secs == 0
            || self.record_ttl_secs == 0
            || self.republish_interval_secs == 0
        {
            return Err(invalid("maintenance intervals must be positive"));
        }
        if self.max_lookup_rounds == 0 {
            return Err(invalid("max_lookup_rounds must be at least 1"));
        }
        if self.eviction_probe_attempts == 0 {
            return Err(invalid("eviction_probe_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig(reason.to_string())
}
