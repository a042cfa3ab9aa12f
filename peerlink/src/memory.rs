//! In-memory collaborators. Good enough for a single process demo and for tests; nothing survives a restart.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    api::{Envelope, GroupId, Uid},
    outbox::ClientHandle,
    peer_client::PeerClient,
    services::{GroupDirectory, OfflineStore, PresenceDirectory, RoutingTable, Services},
};

/// All four in-memory collaborators, kept typed so callers can seed them.
#[derive(Clone, Default)]
pub struct Memory {
    pub route: Arc<MemoryRoute>,
    pub groups: Arc<MemoryGroups>,
    pub storage: Arc<MemoryStorage>,
    pub state_center: Arc<MemoryStateCenter>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Services {
        Services {
            route: self.route.clone(),
            groups: self.groups.clone(),
            storage: self.storage.clone(),
            state_center: self.state_center.clone(),
        }
    }
}

#[derive(Default)]
pub struct MemoryRoute {
    clients: DashMap<Uid, ClientHandle>,
    peer_clients: Mutex<Vec<Arc<PeerClient>>>,
}

impl MemoryRoute {
    /// Registers a local session, replacing any previous one for the same uid.
    pub fn add_client(&self, client: ClientHandle) {
        self.clients.insert(client.uid, client);
    }

    pub fn remove_client(&self, uid: Uid) -> Option<ClientHandle> {
        self.clients.remove(&uid).map(|(_, client)| client)
    }

    /// Removes `session` unless a newer session of the same user has replaced it.
    pub fn remove_session(&self, session: &ClientHandle) -> bool {
        self.clients
            .remove_if(&session.uid, |_, current| current.outbox.same_queue(&session.outbox))
            .is_some()
    }

    pub fn peer_client_count(&self) -> usize {
        self.peer_clients.lock().len()
    }
}

impl RoutingTable for MemoryRoute {
    fn find_client(&self, uid: Uid) -> Option<ClientHandle> {
        self.clients.get(&uid).map(|client| client.clone())
    }

    fn client_uids(&self) -> HashMap<Uid, i64> {
        self.clients
            .iter()
            .map(|client| (*client.key(), client.last_active))
            .collect()
    }

    fn register_peer_client(&self, link: Arc<PeerClient>) {
        self.peer_clients.lock().push(link);
    }

    fn remove_peer_client(&self, link_id: u64) {
        self.peer_clients.lock().retain(|link| link.id() != link_id);
    }

    fn find_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>> {
        self.peer_clients
            .lock()
            .iter()
            .rev()
            .find(|link| link.contains_uid(uid))
            .cloned()
    }
}

#[derive(Default)]
pub struct MemoryGroups {
    groups: DashMap<GroupId, HashSet<Uid>>,
}

impl MemoryGroups {
    pub fn add_member(&self, group: GroupId, uid: Uid) {
        self.groups.entry(group).or_default().insert(uid);
    }

    pub fn remove_member(&self, group: GroupId, uid: Uid) {
        if let Some(mut members) = self.groups.get_mut(&group) {
            members.remove(&uid);
        }
    }
}

impl GroupDirectory for MemoryGroups {
    fn members_of(&self, group: GroupId) -> Option<HashSet<Uid>> {
        self.groups.get(&group).map(|members| members.clone())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    queues: DashMap<Uid, Vec<Envelope>>,
}

impl MemoryStorage {
    /// Number of envelopes waiting for `uid`.
    pub fn pending(&self, uid: Uid) -> usize {
        self.queues.get(&uid).map_or(0, |queue| queue.len())
    }
}

impl OfflineStore for MemoryStorage {
    fn save(&self, uid: Uid, envelope: Envelope) {
        self.queues.entry(uid).or_default().push(envelope);
    }

    fn load_and_clear(&self, uid: Uid) -> Vec<Envelope> {
        self.queues
            .remove(&uid)
            .map(|(_, queue)| queue)
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MemoryStateCenter {
    subscribers: DashMap<Uid, HashSet<Uid>>,
}

impl PresenceDirectory for MemoryStateCenter {
    fn subscribers_of(&self, uid: Uid) -> HashSet<Uid> {
        self.subscribers
            .get(&uid)
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self, uid: Uid, subscriber: Uid) {
        self.subscribers.entry(uid).or_default().insert(subscriber);
    }

    fn unsubscribe(&self, uid: Uid, subscribers: &HashSet<Uid>) {
        if let Some(mut subs) = self.subscribers.get_mut(&uid) {
            subs.retain(|sub| !subscribers.contains(sub));
        }
        self.subscribers.remove_if(&uid, |_, subs| subs.is_empty());
    }
}
