#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod config;
mod error;
mod identity;
mod node;
mod node_id;
mod protocol;
mod registry;
mod routing;

pub use self::config::Config;
pub use self::error::{DhtError, Result};
pub use self::identity::Identity;
pub use self::node::contact::Contact;
pub use self::node::Node;
pub use self::node_id::NodeId;
pub use self::protocol::ErrorStatus;
pub use self::registry::{NodeRole, ServiceInfo, ServiceRegistry};
pub use self::routing::{KBucket, RoutingTable, UpsertResult};

/// The number of bytes in a node id.
pub const KEY_LENGTH: usize = 20;

/// The maximum length of a datagram in bytes.
const MESSAGE_LENGTH: usize = 65_507;

/// The number of k-buckets in the routing table, one per bit of the id.
pub const ROUTING_TABLE_SIZE: usize = KEY_LENGTH * 8;

/// The maximum number of entries in a k-bucket.
pub const REPLICATION_PARAM: usize = 20;

/// The maximum number of active RPCs during a lookup.
pub const CONCURRENCY_PARAM: usize = 3;

/// Default request timeout in seconds.
const REQUEST_TIMEOUT: u64 = 10;

/// Default bucket refresh interval in seconds.
const BUCKET_REFRESH_INTERVAL: u64 = 3600;

/// Default service republish interval in seconds.
const REPUBLISH_INTERVAL: u64 = 3600;

/// Default contact expiration time in seconds.
const CONTACT_EXPIRATION: u64 = 24 * 3600;

/// Interval of the contact expiry sweep in seconds.
const EXPIRY_SWEEP_INTERVAL: u64 = 3600;

/// Default age in seconds after which a service is no longer considered active.
const SERVICE_TTL: u64 = 5 * 60;

/// Version advertised in this node's own service info.
const VERSION: &str = env!("CARGO_PKG_VERSION");
