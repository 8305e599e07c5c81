use std::convert::TryFrom;
use std::fmt::{Debug, Formatter, Result};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use time::OffsetDateTime;

use crate::node_id::NodeId;

/// An address-bearing reference to a peer. Two contacts are equal when their ids are equal,
/// regardless of address or timestamp.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    #[serde(with = "time::serde::timestamp")]
    pub last_seen: OffsetDateTime,
}

impl Contact {
    /// Constructs a new `Contact` last seen now.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Contact {
            id,
            addr,
            last_seen: OffsetDateTime::now_utc(),
        }
    }

    /// Marks the contact as seen now.
    pub fn touch(&mut self) {
        self.last_seen = OffsetDateTime::now_utc();
    }

    /// Returns `true` if the contact has not been seen for longer than `max_age`.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        match ago(max_age) {
            Some(cutoff) => self.last_seen < cutoff,
            None => false,
        }
    }
}

/// Returns the time `age` before now, or `None` if that is not representable.
pub(crate) fn ago(age: Duration) -> Option<OffsetDateTime> {
    let age = time::Duration::try_from(age).ok()?;
    OffsetDateTime::now_utc().checked_sub(age)
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {}", self.addr, self.id)
    }
}
