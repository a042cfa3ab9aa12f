//! The accepting side of a peer link.
//!
//! A remote node dials us and announces, one `AddClient` at a time, every user it serves. The [PeerClient] keeps that
//! served-set so the routing table can send envelopes for those users down this link, and tears the whole set down
//! (publishing each user offline) once the link goes quiet for longer than the idle timeout.
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::sink::SinkExt;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    api::{AddClient, Body, Envelope, Uid},
    codec::EnvelopeCodec,
    config::Timing,
    outbox::{Outbox, Outgoing},
    presence,
    services::Services,
};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// A connection accepted from another node.
pub struct PeerClient {
    id: u64,
    outbox: Outbox,
    /// Users the remote node currently serves.
    uids: Mutex<HashSet<Uid>>,
    services: Services,
    idle_timeout: Duration,
}

impl PeerClient {
    fn new(services: Services, timing: Timing) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, queue) = Outbox::channel();
        let link = Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            outbox,
            uids: Mutex::new(HashSet::new()),
            services,
            idle_timeout: timing.idle_timeout,
        });
        (link, queue)
    }

    /// Registers a link over `stream` with the routing table and spawns its read and write tasks.
    ///
    /// The returned handle belongs to the read task. It completes once the link has failed and the served users have
    /// been published offline. A failure of the write task fails the link too.
    pub fn spawn<S>(stream: S, services: Services, timing: Timing) -> (Arc<Self>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, queue) = Self::new(services, timing);
        let (reader, writer) = tokio::io::split(stream);
        let token = CancellationToken::new();

        link.services.route.register_peer_client(link.clone());
        info!(link = link.id, "peer client connected");

        tokio::spawn(write_loop(
            link.id,
            queue,
            FramedWrite::new(writer, EnvelopeCodec::new()),
            token.clone(),
        ));
        let handle = tokio::spawn(
            link.clone()
                .read_loop(FramedRead::new(reader, EnvelopeCodec::new()), token),
        );
        (link, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The queue of envelopes relayed to the remote node.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn contains_uid(&self, uid: Uid) -> bool {
        self.uids.lock().contains(&uid)
    }

    /// A snapshot of the served-set.
    pub fn uids(&self) -> HashSet<Uid> {
        self.uids.lock().clone()
    }

    async fn read_loop<S>(
        self: Arc<Self>,
        mut stream: FramedRead<ReadHalf<S>, EnvelopeCodec>,
        token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            // Any silence longer than the idle timeout, heartbeats included, ends the link.
            let read = tokio::select! {
                _ = token.cancelled() => {
                    warn!(link = self.id, "peer client writer stopped");
                    break;
                }
                read = tokio::time::timeout(self.idle_timeout, stream.next()) => read,
            };
            let envelope = match read {
                Ok(Some(Ok(envelope))) => envelope,
                Ok(Some(Err(err))) => {
                    warn!(link = self.id, %err, "peer client read failed");
                    break;
                }
                Ok(None) => {
                    info!(link = self.id, "peer client disconnected");
                    break;
                }
                Err(_) => {
                    warn!(link = self.id, timeout = ?self.idle_timeout, "peer client timed out");
                    break;
                }
            };
            self.handle_message(envelope);
        }

        self.services.route.remove_peer_client(self.id);
        self.outbox.close(self.id);
        self.publish_offline();
    }

    fn handle_message(&self, envelope: Envelope) {
        debug!(link = self.id, command = envelope.body.code(), seq = envelope.seq, "peer client message");
        match envelope.body {
            Body::AddClient(ac) => self.handle_add_client(ac),
            Body::RemoveClient(uid) => self.handle_remove_client(uid),
            Body::Heartbeat => debug!(link = self.id, "peer heartbeat"),
            other => warn!(link = self.id, command = other.code(), "unexpected command from peer, ignoring"),
        }
    }

    /// Takes responsibility for `ac.uid` on behalf of the remote node.
    ///
    /// A uid already in the served-set is ignored, since every reconnect of the remote node replays its whole
    /// served-set. Otherwise, in order: an older local session of the same user is reset, the user is published
    /// online, and its offline queue is relayed down this link. All three run on the link's read task, so they never
    /// interleave with another uid's handling on the same link; the set lock covers only the insertion.
    pub(crate) fn handle_add_client(&self, ac: AddClient) {
        let uid = ac.uid;
        if !self.uids.lock().insert(uid) {
            info!(link = self.id, uid, "uid exists");
            return;
        }
        info!(link = self.id, uid, "add uid");

        self.reset_client(uid, ac.timestamp);
        presence::publish_state(&self.services, uid, true);

        let pending = self.services.storage.load_and_clear(uid);
        if pending.is_empty() {
            return;
        }
        debug!(link = self.id, uid, count = pending.len(), "relaying offline messages");
        for envelope in pending {
            if !self.outbox.push(envelope.clone()) {
                self.services.storage.save(uid, envelope);
            }
        }
    }

    pub(crate) fn handle_remove_client(&self, uid: Uid) {
        self.uids.lock().remove(&uid);
        presence::publish_state(&self.services, uid, false);
        info!(link = self.id, uid, "remove uid");
    }

    /// Single sign-on: a local session no newer than the remote one is told to go away.
    fn reset_client(&self, uid: Uid, timestamp: i64) {
        let Some(client) = self.services.route.find_client(uid) else {
            return;
        };
        if client.last_active <= timestamp {
            info!(link = self.id, uid, "resetting stale local session");
            client.outbox.push(Body::SessionReset);
        }
    }

    fn publish_offline(&self) {
        for uid in self.uids() {
            presence::publish_state(&self.services, uid, false);
        }
    }
}

async fn write_loop<S>(
    id: u64,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut sink: FramedWrite<WriteHalf<S>, EnvelopeCodec>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut seq = 0u32;
    while let Some(item) = queue.recv().await {
        let mut envelope = match item {
            Outgoing::Send(envelope) => envelope,
            Outgoing::Closed { .. } => {
                debug!(link = id, "socket closed");
                break;
            }
        };
        let next = seq.wrapping_add(1);
        envelope.seq = next;
        match sink.send(envelope).await {
            Ok(()) => seq = next,
            Err(err) if err.is_envelope_error() => warn!(link = id, %err, "dropping envelope"),
            Err(err) => {
                warn!(link = id, %err, "peer client write failed");
                break;
            }
        }
    }
    token.cancel();
}
