// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-global directory of live clients and named groups.
//!
//! All mutable broker state lives in one [`Registry`] behind a single
//! `tokio::sync::Mutex` ([`SharedRegistry`]); every operation runs start to
//! finish under that lock, which is what makes membership mutation and fanout
//! linearizable. Fanout never copies payload bytes: recipients' mailboxes
//! hold clones of one `Arc<Envelope>`.
//!
//! Invariants maintained here:
//!
//! - every (group → client) edge has a matching (client → group) edge;
//! - a group exists in the forward map iff it has at least one member, so
//!   `devices` output is exactly the non-empty groups;
//! - a client id is present iff its session registered it and has not yet
//!   unregistered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::envelope::Envelope;

/// Opaque client identifier, unique for the lifetime of the broker process.
/// Ids start at 1; 0 is never assigned (sessions use it as "not yet
/// registered").
pub type ClientId = u64;

/// Registry shared across all session actors.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Per-client record: identity, group membership (reverse index), and the
/// mailbox with its wake condition.
struct ClientEntry {
    name: Option<String>,
    groups: HashSet<String>,
    mailbox: VecDeque<Arc<Envelope>>,
    /// Envelopes discarded by the overflow policy, for diagnostics.
    dropped: u64,
    wake: Arc<Notify>,
}

/// The broker's directory of clients and groups.
pub struct Registry {
    next_id: ClientId,
    /// Per-client mailbox cap in envelopes; 0 means unbounded. On overflow
    /// the oldest undelivered envelope is dropped.
    mailbox_cap: usize,
    clients: HashMap<ClientId, ClientEntry>,
    groups: HashMap<String, HashSet<ClientId>>,
}

impl Registry {
    /// Create a registry with the given per-client mailbox cap (0 = unbounded).
    pub fn new(mailbox_cap: usize) -> Self {
        Self {
            next_id: 1,
            mailbox_cap,
            clients: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Create a registry ready to share across sessions.
    pub fn shared(mailbox_cap: usize) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(mailbox_cap)))
    }

    /// Admit a handshake-complete client and return its fresh id.
    pub fn register(&mut self, name: Option<String>) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(
            id,
            ClientEntry {
                name,
                groups: HashSet::new(),
                mailbox: VecDeque::new(),
                dropped: 0,
                wake: Arc::new(Notify::new()),
            },
        );
        id
    }

    /// Remove a client: drop it from every group it belongs to (destroying
    /// groups it leaves empty), discard its mailbox, and wake any parked
    /// waiter so it can observe the removal.
    pub fn unregister(&mut self, id: ClientId) {
        let Some(entry) = self.clients.remove(&id) else {
            return;
        };
        for group in &entry.groups {
            if let Some(members) = self.groups.get_mut(group) {
                members.remove(&id);
                if members.is_empty() {
                    self.groups.remove(group);
                }
            }
        }
        entry.wake.notify_waiters();
    }

    /// Add a client to each named group, creating groups as needed. Joining
    /// a group the client already belongs to is idempotent.
    pub fn join(&mut self, id: ClientId, names: &[String]) {
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        for name in names {
            entry.groups.insert(name.clone());
            self.groups.entry(name.clone()).or_default().insert(id);
        }
    }

    /// Remove a client from each named group, destroying groups left empty.
    /// Leaving a group the client is not in is silently ignored.
    pub fn leave(&mut self, id: ClientId, names: &[String]) {
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        for name in names {
            if !entry.groups.remove(name) {
                continue;
            }
            if let Some(members) = self.groups.get_mut(name) {
                members.remove(&id);
                if members.is_empty() {
                    self.groups.remove(name);
                }
            }
        }
    }

    /// Fan an envelope out to every current member of `group` other than the
    /// sender. A missing or effectively-empty group enqueues nothing; the
    /// caller still reports success.
    ///
    /// The recipient snapshot is taken under the registry lock, so a client
    /// that has fully left before this call gets nothing and every member at
    /// snapshot time gets the envelope exactly once.
    pub fn route_group(&mut self, group: &str, envelope: &Arc<Envelope>) {
        let Some(members) = self.groups.get(group) else {
            return;
        };
        let recipients: Vec<ClientId> = members
            .iter()
            .copied()
            .filter(|&m| m != envelope.sender())
            .collect();
        for recipient in recipients {
            self.enqueue(recipient, Arc::clone(envelope));
        }
    }

    /// Fan an envelope out to every registered client other than the sender.
    pub fn route_broadcast(&mut self, envelope: &Arc<Envelope>) {
        let recipients: Vec<ClientId> = self
            .clients
            .keys()
            .copied()
            .filter(|&c| c != envelope.sender())
            .collect();
        for recipient in recipients {
            self.enqueue(recipient, Arc::clone(envelope));
        }
    }

    /// Drain up to `n` envelopes (negative = all queued right now) from a
    /// client's mailbox, preserving FIFO order.
    pub fn drain(&mut self, id: ClientId, n: i64) -> Vec<Arc<Envelope>> {
        let Some(entry) = self.clients.get_mut(&id) else {
            return Vec::new();
        };
        let queued = entry.mailbox.len();
        let take = if n < 0 {
            queued
        } else {
            queued.min(usize::try_from(n).unwrap_or(usize::MAX))
        };
        entry.mailbox.drain(..take).collect()
    }

    /// Mailbox length and wake handle for a client, or `None` once it has
    /// unregistered. `wait` parks on the handle and re-checks the length.
    pub fn mailbox_status(&self, id: ClientId) -> Option<(usize, Arc<Notify>)> {
        self.clients
            .get(&id)
            .map(|entry| (entry.mailbox.len(), Arc::clone(&entry.wake)))
    }

    /// Sorted names of all currently non-empty groups.
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn enqueue(&mut self, id: ClientId, envelope: Arc<Envelope>) {
        let cap = self.mailbox_cap;
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        if cap > 0 && entry.mailbox.len() >= cap {
            entry.mailbox.pop_front();
            entry.dropped += 1;
            warn!(
                client = id,
                dropped = entry.dropped,
                cap,
                name = entry.name.as_deref().unwrap_or(""),
                "mailbox overflow; dropping oldest undelivered envelope"
            );
        }
        let was_empty = entry.mailbox.is_empty();
        entry.mailbox.push_back(envelope);
        if was_empty {
            entry.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dime_proto::frame::MetaMap;
    use serde_json::json;

    fn envelope(sender: ClientId, varname: &str) -> Arc<Envelope> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), json!("send"));
        meta.insert("varname".into(), json!(varname));
        Arc::new(Envelope::from_request(
            meta,
            Bytes::from_static(b"\x01\x02\x03"),
            sender,
            None,
        ))
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn join_is_idempotent() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        reg.join(a, &groups(&["g1"]));
        reg.join(a, &groups(&["g1"]));
        assert_eq!(reg.devices(), vec!["g1"]);

        let b = reg.register(None);
        reg.route_group("g1", &envelope(b, "x"));
        assert_eq!(reg.drain(a, -1).len(), 1, "duplicate join must not double-deliver");
    }

    #[test]
    fn leave_without_membership_is_a_no_op() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        reg.leave(a, &groups(&["nowhere"]));
        assert!(reg.devices().is_empty());
    }

    #[test]
    fn devices_lists_exactly_nonempty_groups_sorted() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        reg.join(a, &groups(&["zeta", "alpha"]));
        reg.join(b, &groups(&["alpha"]));
        assert_eq!(reg.devices(), vec!["alpha", "zeta"]);

        reg.leave(a, &groups(&["zeta"]));
        assert_eq!(reg.devices(), vec!["alpha"]);

        reg.leave(a, &groups(&["alpha"]));
        reg.leave(b, &groups(&["alpha"]));
        assert!(reg.devices().is_empty());
    }

    #[test]
    fn group_fanout_excludes_sender() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        let c = reg.register(None);
        reg.join(a, &groups(&["g1"]));
        reg.join(b, &groups(&["g1"]));
        reg.join(c, &groups(&["g1"]));

        reg.route_group("g1", &envelope(a, "x"));
        assert!(reg.drain(a, -1).is_empty());
        assert_eq!(reg.drain(b, -1).len(), 1);
        assert_eq!(reg.drain(c, -1).len(), 1);
    }

    #[test]
    fn send_to_missing_group_enqueues_nothing() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        reg.route_group("ghost", &envelope(a, "x"));
        assert!(reg.drain(a, -1).is_empty());
    }

    #[test]
    fn broadcast_reaches_everyone_but_sender() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        let c = reg.register(None);

        reg.route_broadcast(&envelope(a, "y"));
        assert!(reg.drain(a, -1).is_empty());
        assert_eq!(reg.drain(b, -1).len(), 1);
        assert_eq!(reg.drain(c, -1).len(), 1);
    }

    #[test]
    fn drain_respects_limit_and_fifo_order() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        reg.join(b, &groups(&["g1"]));
        for varname in ["v0", "v1", "v2"] {
            reg.route_group("g1", &envelope(a, varname));
        }

        let first = reg.drain(b, 2);
        let names: Vec<_> = first.iter().map(|e| e.meta()["varname"].clone()).collect();
        assert_eq!(names, vec![json!("v0"), json!("v1")]);

        let rest = reg.drain(b, -1);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].meta()["varname"], json!("v2"));
        assert!(reg.drain(b, -1).is_empty());
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        let c = reg.register(None);
        reg.join(b, &groups(&["g1"]));
        reg.join(c, &groups(&["g1"]));

        let env = envelope(a, "x");
        reg.route_group("g1", &env);
        // one Arc here + one per recipient mailbox
        assert_eq!(Arc::strong_count(&env), 3);
    }

    #[test]
    fn unregister_cleans_groups_and_destroys_empty_ones() {
        let mut reg = Registry::new(0);
        let a = reg.register(None);
        let b = reg.register(None);
        reg.join(a, &groups(&["g1", "g2"]));
        reg.join(b, &groups(&["g1"]));

        reg.unregister(a);
        assert_eq!(reg.devices(), vec!["g1"], "g2 emptied and must vanish");
        assert_eq!(reg.client_count(), 1);

        // routing after unregister must not attempt delivery to the ghost
        reg.route_group("g1", &envelope(b, "x"));
        assert!(reg.mailbox_status(a).is_none());
    }

    #[test]
    fn mailbox_cap_drops_oldest() {
        let mut reg = Registry::new(2);
        let a = reg.register(None);
        let b = reg.register(None);
        reg.join(b, &groups(&["g1"]));
        for varname in ["v0", "v1", "v2"] {
            reg.route_group("g1", &envelope(a, varname));
        }

        let got = reg.drain(b, -1);
        let names: Vec<_> = got.iter().map(|e| e.meta()["varname"].clone()).collect();
        assert_eq!(names, vec![json!("v1"), json!("v2")], "v0 was the oldest and must go");
    }

    #[tokio::test]
    async fn wake_fires_on_empty_to_nonempty_transition() {
        let reg = Registry::shared(0);
        let (a, b) = {
            let mut r = reg.lock().await;
            let a = r.register(None);
            let b = r.register(None);
            r.join(b, &groups(&["g1"]));
            (a, b)
        };

        let (len, wake) = reg.lock().await.mailbox_status(b).expect("registered");
        assert_eq!(len, 0);

        let waiter = tokio::spawn(async move {
            wake.notified().await;
        });

        reg.lock().await.route_group("g1", &envelope(a, "z"));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wake within deadline")
            .expect("waiter task");
        assert_eq!(reg.lock().await.mailbox_status(b).expect("registered").0, 1);
    }
}
