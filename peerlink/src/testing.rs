//! Collaborators that log the calls the links make, so tests can assert on ordering.
use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::{
    api::Uid,
    memory::{Memory, MemoryRoute, MemoryStateCenter},
    outbox::ClientHandle,
    peer_client::PeerClient,
    services::{PresenceDirectory, RoutingTable, Services},
};

#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct JournaledRoute {
    inner: Arc<MemoryRoute>,
    journal: Journal,
}

impl RoutingTable for JournaledRoute {
    fn find_client(&self, uid: Uid) -> Option<ClientHandle> {
        self.inner.find_client(uid)
    }

    fn client_uids(&self) -> HashMap<Uid, i64> {
        self.inner.client_uids()
    }

    fn register_peer_client(&self, link: Arc<PeerClient>) {
        self.journal.record("register_peer_client");
        self.inner.register_peer_client(link)
    }

    fn remove_peer_client(&self, link_id: u64) {
        self.journal.record("remove_peer_client");
        self.inner.remove_peer_client(link_id)
    }

    fn find_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>> {
        self.inner.find_peer_client(uid)
    }
}

struct JournaledCenter {
    inner: Arc<MemoryStateCenter>,
    journal: Journal,
}

impl PresenceDirectory for JournaledCenter {
    fn subscribers_of(&self, uid: Uid) -> HashSet<Uid> {
        self.journal.record(format!("publish {uid}"));
        self.inner.subscribers_of(uid)
    }

    fn subscribe(&self, uid: Uid, subscriber: Uid) {
        self.inner.subscribe(uid, subscriber)
    }

    fn unsubscribe(&self, uid: Uid, subscribers: &HashSet<Uid>) {
        let mut subs: Vec<_> = subscribers.iter().collect();
        subs.sort();
        self.journal.record(format!("unsubscribe {uid} {subs:?}"));
        self.inner.unsubscribe(uid, subscribers)
    }
}

/// In-memory services whose route and presence directory write to a shared journal.
pub(crate) struct Harness {
    pub memory: Memory,
    pub journal: Journal,
    pub services: Services,
}

pub(crate) fn harness() -> Harness {
    let memory = Memory::new();
    let journal = Journal::default();
    let mut services = memory.services();
    services.route = Arc::new(JournaledRoute {
        inner: memory.route.clone(),
        journal: journal.clone(),
    });
    services.state_center = Arc::new(JournaledCenter {
        inner: memory.state_center.clone(),
        journal: journal.clone(),
    });
    Harness {
        memory,
        journal,
        services,
    }
}

/// A stream whose reads come from `inner` and whose writes always fail.
pub(crate) struct BrokenWrites {
    pub inner: DuplexStream,
}

impl AsyncRead for BrokenWrites {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokenWrites {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
