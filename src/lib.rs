//! A Kademlia distributed hash table for overlay networks.
//!
//! Nodes locate each other and store opaque values (typically references to, or the bytes of,
//! WebAssembly artifacts) without a central directory. The crate is transport-agnostic: a
//! [`Transport`] only has to send bytes to an address and deliver received [`Datagram`]s back to
//! the [`Node`].
extern crate bincode;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate sha3;
extern crate thiserror;
extern crate time;

mod config;
mod error;
mod key;
mod node;
mod protocol;
mod routing;
pub mod runtime;
mod storage;
pub mod transport;

pub use self::config::Config;
pub use self::error::{Error, Result, RpcError};
pub use self::key::{Distance, Key, NodeId};
pub use self::node::contact::Contact;
pub use self::node::lookup::LookupValue;
pub use self::node::Node;
pub use self::routing::{InsertOutcome, KBucket, RoutingTable};
pub use self::storage::{LocalStore, Record};
pub use self::transport::{Datagram, MemoryNetwork, MemoryTransport, Transport, UdpTransport};

/// The number of bytes in a key.
pub const KEY_LENGTH: usize = 20;

/// The maximum length of an encoded message in bytes.
const MAX_MESSAGE_LENGTH: usize = 65_507;

/// The default maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// The default maximum number of in-flight RPCs per lookup round.
const CONCURRENCY_PARAM: usize = 3;

/// Request timeout time in milliseconds.
const REQUEST_TIMEOUT: u64 = 5000;

/// Bucket refresh interval in seconds.
const BUCKET_REFRESH_INTERVAL: u64 = 3600;

/// Expiration time of cached key-value pairs in seconds.
const KEY_EXPIRATION: u64 = 86_400;

/// Republish interval of origin key-value pairs in seconds.
const REPUBLISH_INTERVAL: u64 = 3600;

/// Upper bound on the number of rounds a single lookup may run.
const MAX_LOOKUP_ROUNDS: usize = 32;

/// Number of consecutive unanswered pings before a least recently seen contact is evicted.
const EVICTION_PROBE_ATTEMPTS: usize = 3;
