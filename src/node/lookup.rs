use std::collections::HashSet;
use std::panic;
use std::thread;

use super::Node;
use crate::error::{DhtError, Result};
use crate::node::contact::Contact;
use crate::node_id::NodeId;
use crate::{CONCURRENCY_PARAM, REPLICATION_PARAM};

impl Node {
    /// Iteratively looks up the nodes closest to `target`, filling the routing table as it goes.
    ///
    /// The search is seeded with the `CONCURRENCY_PARAM` closest contacts in the routing table.
    /// Each round sends `FIND_NODE` to at most `CONCURRENCY_PARAM` contacts of the shortlist that
    /// have not been queried yet and waits for all of them. Returned contacts are recorded in the
    /// routing table and merged into the shortlist, which is kept sorted by distance to `target`
    /// and cut to `REPLICATION_PARAM` entries. The lookup ends once every contact of the shortlist
    /// has been queried.
    ///
    /// Failed RPCs are logged and contribute nothing; they are not retried. The only error is
    /// `NoContacts`, returned when the routing table has nothing to start from.
    pub fn lookup(&self, target: &NodeId) -> Result<()> {
        let mut shortlist = self.routing_table.closest(target, CONCURRENCY_PARAM);
        if shortlist.is_empty() {
            return Err(DhtError::NoContacts);
        }

        let mut queried: HashSet<NodeId> = HashSet::new();
        queried.insert(self.contact.id);
        let mut rounds = 0;

        loop {
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|contact| !queried.contains(&contact.id))
                .take(CONCURRENCY_PARAM)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|contact| contact.id));
            rounds += 1;

            for (dest, result) in batch.iter().zip(self.query_batch(&batch, target)) {
                match result {
                    Ok(contacts) => {
                        for contact in contacts {
                            self.routing_table.insert(contact.clone());
                            if !shortlist.contains(&contact) {
                                shortlist.push(contact);
                            }
                        }
                    },
                    Err(err) => warn!(
                        "{} - FIND_NODE to {:?} failed: {}",
                        self.contact.addr, dest, err
                    ),
                }
            }

            shortlist.sort_by_key(|contact| contact.id.distance(target));
            shortlist.truncate(REPLICATION_PARAM);
        }

        debug!(
            "{} - Lookup of {} finished after {} rounds, closest nodes are {:?}",
            self.contact.addr, target, rounds, shortlist,
        );
        Ok(())
    }

    /// Sends `FIND_NODE` to every contact of `batch` in parallel and returns the results in the
    /// same order once all of them have completed.
    fn query_batch(&self, batch: &[Contact], target: &NodeId) -> Vec<Result<Vec<Contact>>> {
        let target = target.to_string();
        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|dest| {
                    let target = &target;
                    scope.spawn(move || self.find_node(dest.addr, target))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|err| panic::resume_unwind(err)))
                .collect()
        })
    }
}
