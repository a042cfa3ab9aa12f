//! The collaborators the peer layer consults.
//!
//! Each is injected into the links as a trait object so that deployments can back them with real storage and tests
//! can swap in the in-memory versions from [crate::memory].
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    api::{Envelope, GroupId, Uid},
    outbox::ClientHandle,
    peer_client::PeerClient,
};

/// Where users live: locally, or behind one of the inbound peer links.
pub trait RoutingTable: Send + Sync + 'static {
    /// The local session of `uid`, if any.
    fn find_client(&self, uid: Uid) -> Option<ClientHandle>;

    /// Every locally served uid with its session's last activity time.
    fn client_uids(&self) -> HashMap<Uid, i64>;

    fn register_peer_client(&self, link: Arc<PeerClient>);

    fn remove_peer_client(&self, link_id: u64);

    /// The inbound peer link currently claiming `uid`. When more than one claims it, the latest registered wins.
    fn find_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>>;
}

pub trait GroupDirectory: Send + Sync + 'static {
    /// Members of `group`, or `None` when the group does not exist.
    fn members_of(&self, group: GroupId) -> Option<HashSet<Uid>>;
}

/// Durable per-user queue of undelivered envelopes.
pub trait OfflineStore: Send + Sync + 'static {
    fn save(&self, uid: Uid, envelope: Envelope);

    /// Removes and returns everything queued for `uid`, oldest first.
    fn load_and_clear(&self, uid: Uid) -> Vec<Envelope>;
}

/// Who wants to hear about whose online state.
pub trait PresenceDirectory: Send + Sync + 'static {
    fn subscribers_of(&self, uid: Uid) -> HashSet<Uid>;

    fn subscribe(&self, uid: Uid, subscriber: Uid);

    fn unsubscribe(&self, uid: Uid, subscribers: &HashSet<Uid>);
}

/// The collaborator set handed to every link.
#[derive(Clone)]
pub struct Services {
    pub route: Arc<dyn RoutingTable>,
    pub groups: Arc<dyn GroupDirectory>,
    pub storage: Arc<dyn OfflineStore>,
    pub state_center: Arc<dyn PresenceDirectory>,
}
