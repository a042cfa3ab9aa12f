//! Fan out of online/offline transitions to subscribers.
use std::collections::HashSet;

use tracing::debug;

use crate::{
    api::{Body, Envelope, OnlineState, Uid},
    services::Services,
};

/// Tells every subscriber of `uid` that it went online or offline.
///
/// Subscribers without a local session are pruned from `uid`'s subscriber set in a single call. Subscribers are
/// never pruned any other way.
pub fn publish_state(services: &Services, uid: Uid, online: bool) {
    let subscribers = services.state_center.subscribers_of(uid);
    let envelope = Envelope::new(Body::OnlineStateChange(OnlineState { uid, online }));
    debug!(uid, online, subscribers = subscribers.len(), "publish online state");

    let mut unreachable = HashSet::new();
    for sub in subscribers {
        match services.route.find_client(sub) {
            Some(client) if client.outbox.push(envelope.clone()) => {}
            _ => {
                unreachable.insert(sub);
            }
        }
    }

    if !unreachable.is_empty() {
        services.state_center.unsubscribe(uid, &unreachable);
    }
}
