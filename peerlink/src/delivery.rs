//! Handing envelopes to local sessions.
use tracing::debug;

use crate::{
    api::{Envelope, Uid},
    services::Services,
};

/// Pushes `envelope` to the local session of `uid`, or saves it offline when there is none.
///
/// Returns true when the envelope reached a live session.
pub fn deliver_or_store(services: &Services, uid: Uid, envelope: Envelope) -> bool {
    if let Some(client) = services.route.find_client(uid) {
        if client.outbox.push(envelope.clone()) {
            return true;
        }
    }
    debug!(uid, "can't find client, storing offline");
    services.storage.save(uid, envelope);
    false
}

/// Pushes `envelope` to the local session of `uid`, dropping it when there is none.
pub fn deliver_if_present(services: &Services, uid: Uid, envelope: Envelope) -> bool {
    match services.route.find_client(uid) {
        Some(client) => client.outbox.push(envelope),
        None => false,
    }
}
