use std::cmp;
use std::time::Duration;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::node::contact::{ago, Contact};
use crate::node_id::NodeId;
use crate::{REPLICATION_PARAM, ROUTING_TABLE_SIZE};

/// Outcome of upserting a contact into a `KBucket`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertResult {
    Accepted,
    RejectedFull,
}

/// A k-bucket in a node's routing table that has a maximum capacity of `REPLICATION_PARAM`.
///
/// The contacts in the k-bucket are sorted by the time of the most recent communication with those
/// which have been most recently communicated at the end of the list.
#[derive(Clone, Debug)]
pub struct KBucket {
    contacts: Vec<Contact>,
    last_update_time: OffsetDateTime,
    range: Option<(NodeId, NodeId)>,
}

impl KBucket {
    /// Constructs a new, empty `KBucket`.
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::new(),
            last_update_time: OffsetDateTime::now_utc(),
            range: None,
        }
    }

    /// Upserts a contact in the k-bucket. If the contact already exists, its timestamp is
    /// refreshed and it is moved to the end of the list. A new contact is appended if there is
    /// room; otherwise it is rejected and the bucket is left untouched. The least recently seen
    /// contact is never evicted.
    pub fn upsert(&mut self, mut contact: Contact) -> UpsertResult {
        if let Some(index) = self.contacts.iter().position(|c| *c == contact) {
            let existing = self.contacts.remove(index);
            contact.last_seen = cmp::max(contact.last_seen, existing.last_seen);
            self.contacts.push(contact);
            self.last_update_time = OffsetDateTime::now_utc();
            return UpsertResult::Accepted;
        }

        if self.contacts.len() >= REPLICATION_PARAM {
            return UpsertResult::RejectedFull;
        }

        self.range = Some(match self.range {
            Some((min, max)) => (cmp::min(min, contact.id), cmp::max(max, contact.id)),
            None => (contact.id, contact.id),
        });
        self.contacts.push(contact);
        self.last_update_time = OffsetDateTime::now_utc();
        UpsertResult::Accepted
    }

    /// Returns up to `count` contacts starting from the least recently seen one.
    pub fn take(&self, count: usize) -> Vec<Contact> {
        self.contacts.iter().take(count).cloned().collect()
    }

    /// Returns a slice of the contacts contained by the k-bucket.
    pub fn contacts(&self) -> &[Contact] {
        self.contacts.as_slice()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.iter().any(|contact| contact.id == *id)
    }

    /// Returns the lowest and highest ids ever accepted into the bucket.
    pub fn range(&self) -> Option<(NodeId, NodeId)> {
        self.range
    }

    /// Removes every contact that has not been seen for longer than `max_age` and returns how
    /// many were removed.
    pub fn remove_expired(&mut self, max_age: Duration) -> usize {
        let before = self.contacts.len();
        self.contacts.retain(|contact| !contact.is_expired(max_age));
        before - self.contacts.len()
    }

    /// Returns `true` if the k-bucket has not been updated in `interval`.
    pub fn is_stale(&self, interval: Duration) -> bool {
        match ago(interval) {
            Some(cutoff) => self.last_update_time < cutoff,
            None => false,
        }
    }

    /// Returns the number of contacts in the k-bucket.
    pub fn size(&self) -> usize {
        self.contacts.len()
    }
}

impl Default for KBucket {
    fn default() -> Self {
        KBucket::new()
    }
}

/// A node's routing table.
///
/// `RoutingTable` holds one `KBucket` per possible shared-prefix length with the local id. Every
/// bucket sits behind its own lock, so no operation holds more than one bucket lock at a time.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
}

impl RoutingTable {
    /// Constructs a new, empty `RoutingTable`.
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..ROUTING_TABLE_SIZE)
            .map(|_| RwLock::new(KBucket::new()))
            .collect();
        RoutingTable { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Returns the index of the first bit in which `id` differs from the local id. The local id
    /// itself maps to the last bucket.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        cmp::min(
            self.local_id.distance(id).leading_zeros(),
            ROUTING_TABLE_SIZE - 1,
        )
    }

    /// Upserts a contact into the bucket it belongs to. A contact rejected by a full bucket is
    /// dropped. The local id is never inserted. Returns `true` if the contact is in the table
    /// afterwards.
    pub fn insert(&self, contact: Contact) -> bool {
        if contact.id == self.local_id {
            return false;
        }
        let index = self.bucket_index(&contact.id);
        let result = self.buckets[index].write().upsert(contact);
        result == UpsertResult::Accepted
    }

    /// Returns the closest `count` contacts to `target`.
    ///
    /// Contacts are collected from the target's bucket and then from its neighbours, alternating
    /// below and above, until `count` have been found. The collected pool is then sorted by
    /// distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let index = self.bucket_index(target);
        let mut ret = self.buckets[index].read().take(count);

        let mut offset = 1;
        while ret.len() < count && (offset <= index || index + offset < ROUTING_TABLE_SIZE) {
            if offset <= index {
                let remaining = count - ret.len();
                ret.extend(self.buckets[index - offset].read().take(remaining));
            }
            if index + offset < ROUTING_TABLE_SIZE && ret.len() < count {
                let remaining = count - ret.len();
                ret.extend(self.buckets[index + offset].read().take(remaining));
            }
            offset += 1;
        }

        ret.sort_by_key(|contact| contact.id.distance(target));
        ret.truncate(count);
        ret
    }

    /// Returns an id that falls into the bucket at `index`: the local id with that bit flipped.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        self.local_id.flip_bit(index)
    }

    /// Returns the indexes of the non-empty buckets that have not been updated in `interval`.
    pub fn stale_indexes(&self, interval: Duration) -> Vec<usize> {
        let mut ret = Vec::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read();
            if bucket.size() > 0 && bucket.is_stale(interval) {
                ret.push(i);
            }
        }
        ret
    }

    /// Removes every contact not seen for longer than `max_age`. Returns the number removed.
    pub fn expire_contacts(&self, max_age: Duration) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.write().remove_expired(max_age))
            .sum()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets[self.bucket_index(id)].read().contains(id)
    }

    /// Returns a copy of every contact in the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut ret = Vec::new();
        for bucket in &self.buckets {
            ret.extend_from_slice(bucket.read().contacts());
        }
        ret
    }

    /// Returns the number of contacts in the bucket at `index`.
    pub fn bucket_size(&self, index: usize) -> usize {
        self.buckets[index].read().size()
    }

    /// Returns the number of contacts in the routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().size()).sum()
    }
}
