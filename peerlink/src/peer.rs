//! The dialing side of a peer link.
//!
//! A [Peer] keeps one connection to another node alive for the life of the process. Every time the connection comes
//! up it replays an `AddClient` for each locally served user so the remote node knows to route them here, then relays
//! the messages the remote node forwards for those users.
use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures_util::sink::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    api::{AddClient, Body, Envelope, ImMessage, PeerAck, Typing},
    codec::EnvelopeCodec,
    config::{PeerAddr, Timing},
    delivery,
    outbox::{Outbox, Outgoing},
    services::Services,
};

/// An outbound link to another node.
pub struct Peer {
    addr: PeerAddr,
    /// Whether the reconnect loop should dial.
    alive: AtomicBool,
    started: AtomicBool,
    /// Id of the current connection, 0 while disconnected.
    connection: AtomicU64,
    next_connection: AtomicU64,
    outbox: Outbox,
    /// Outlives individual connections; each connection's writer holds it while running.
    queue: Mutex<mpsc::UnboundedReceiver<Outgoing>>,
    /// Cancelled by [Self::close]. Every connection gets a child token.
    closing: CancellationToken,
    services: Services,
    timing: Timing,
}

impl Peer {
    pub fn new(addr: PeerAddr, services: Services, timing: Timing) -> Arc<Self> {
        let (outbox, queue) = Outbox::channel();
        Arc::new(Self {
            addr,
            alive: AtomicBool::new(false),
            started: AtomicBool::new(false),
            connection: AtomicU64::new(0),
            next_connection: AtomicU64::new(1),
            outbox,
            queue: Mutex::new(queue),
            closing: CancellationToken::new(),
            services,
            timing,
        })
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    /// Identity of the remote node: its IPv4 address in the upper 32 bits, its port in the lower ones. `None` when the
    /// host is not an IPv4 literal.
    pub fn peer_id(&self) -> Option<u64> {
        let ip: Ipv4Addr = self.addr.host.parse().ok()?;
        Some((u64::from(u32::from(ip)) << 32) | u64::from(self.addr.port))
    }

    pub fn connected(&self) -> bool {
        self.connection.load(Ordering::SeqCst) != 0
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queues an envelope for the remote node. Envelopes queued while disconnected go out after the next connect.
    pub fn send(&self, envelope: impl Into<Envelope>) -> bool {
        self.outbox.push(envelope)
    }

    /// Marks the link as wanted and launches the reconnect loop.
    ///
    /// Only the first call spawns the loop; the returned handle is `None` afterwards.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.alive.store(true, Ordering::SeqCst);
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(tokio::spawn(self.clone().connect_loop()))
    }

    /// Stops future reconnect attempts. A live connection is left alone.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Ends the reconnect loop and any live connection.
    pub fn close(&self) {
        self.stop();
        self.closing.cancel();
    }

    /// Queues an `AddClient` for every locally served user. Returns how many were queued.
    pub fn add_all_client(&self) -> usize {
        let uids = self.services.route.client_uids();
        let count = uids.len();
        for (uid, timestamp) in uids {
            self.outbox.push(Body::AddClient(AddClient { uid, timestamp }));
        }
        info!(peer = %self.addr, count, "resync");
        count
    }

    async fn connect_loop(self: Arc<Self>) {
        loop {
            if self.is_alive() && !self.connected() {
                let dial = TcpStream::connect((self.addr.host.as_str(), self.addr.port));
                let result = tokio::select! {
                    _ = self.closing.cancelled() => break,
                    result = dial => result,
                };
                match result {
                    Ok(stream) => {
                        info!(peer = %self.addr, "peer connected");
                        self.attach(stream);
                    }
                    Err(err) => warn!(peer = %self.addr, %err, "connect error"),
                }
            }

            // The wait happens whether or not the dial succeeded.
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = tokio::time::sleep(self.timing.reconnect_interval) => {}
            }
        }
    }

    /// Runs a fresh connection over `stream` and resyncs the remote node's view of our users.
    fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.connection.store(connection, Ordering::SeqCst);

        let token = self.closing.child_token();
        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(self.clone().read_loop(
            connection,
            FramedRead::new(reader, EnvelopeCodec::new()),
            token.clone(),
        ));
        tokio::spawn(self.clone().write_loop(
            connection,
            FramedWrite::new(writer, EnvelopeCodec::new()),
            token,
        ));

        self.add_all_client();
    }

    async fn read_loop<S>(
        self: Arc<Self>,
        connection: u64,
        mut stream: FramedRead<ReadHalf<S>, EnvelopeCodec>,
        token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            let envelope = tokio::select! {
                _ = token.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(err)) => {
                        warn!(peer = %self.addr, %err, "peer read failed");
                        break;
                    }
                    None => {
                        info!(peer = %self.addr, "peer disconnected");
                        break;
                    }
                },
            };
            self.handle_message(envelope);
        }
        self.outbox.close(connection);
    }

    fn handle_message(&self, envelope: Envelope) {
        debug!(peer = %self.addr, command = envelope.body.code(), seq = envelope.seq, "peer message");
        match envelope.body {
            Body::InstantMessage(im) => self.handle_im(im),
            Body::GroupInstantMessage(im) => self.handle_group_im(im),
            Body::PeerAcknowledge(ack) => self.handle_peer_ack(ack),
            Body::TypingIndicator(typing) => self.handle_typing(typing),
            other => warn!(peer = %self.addr, command = other.code(), "unexpected command from peer, ignoring"),
        }
    }

    fn handle_im(&self, im: ImMessage) {
        let receiver = im.receiver;
        delivery::deliver_or_store(&self.services, receiver, Body::InstantMessage(im).into());
    }

    fn handle_group_im(&self, im: ImMessage) {
        let Some(members) = self.services.groups.members_of(im.receiver) else {
            info!(peer = %self.addr, group = im.receiver, "can't find group");
            return;
        };
        for member in members {
            delivery::deliver_or_store(
                &self.services,
                member,
                Body::GroupInstantMessage(im.clone()).into(),
            );
        }
    }

    fn handle_peer_ack(&self, ack: PeerAck) {
        let receiver = ack.receiver;
        delivery::deliver_or_store(&self.services, receiver, Body::PeerAcknowledge(ack).into());
    }

    fn handle_typing(&self, typing: Typing) {
        let receiver = typing.receiver;
        delivery::deliver_if_present(&self.services, receiver, Body::TypingIndicator(typing).into());
    }

    async fn write_loop<S>(
        self: Arc<Self>,
        connection: u64,
        mut sink: FramedWrite<WriteHalf<S>, EnvelopeCodec>,
        token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut queue = self.queue.lock().await;
        let period = self.timing.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 0u32;

        loop {
            let mut envelope = tokio::select! {
                _ = token.cancelled() => break,
                item = queue.recv() => match item {
                    Some(Outgoing::Send(envelope)) => envelope,
                    Some(Outgoing::Closed { connection: closed }) if closed == connection => {
                        info!(peer = %self.addr, "socket closed");
                        break;
                    }
                    // Left over from a previous connection.
                    Some(Outgoing::Closed { .. }) => continue,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    debug!(peer = %self.addr, "peer send heartbeat");
                    Envelope::new(Body::Heartbeat)
                }
            };
            let next = seq.wrapping_add(1);
            envelope.seq = next;
            match sink.send(envelope).await {
                Ok(()) => seq = next,
                Err(err) if err.is_envelope_error() => warn!(peer = %self.addr, %err, "dropping envelope"),
                Err(err) => {
                    warn!(peer = %self.addr, %err, "peer write failed");
                    break;
                }
            }
        }

        token.cancel();
        let _ = self
            .connection
            .compare_exchange(connection, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{codec::MAX_FRAME_SIZE, memory::Memory, outbox::ClientHandle, services::OfflineStore};

    fn fast() -> Timing {
        Timing {
            reconnect_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(3600),
            ..Timing::default()
        }
    }

    async fn listen() -> (TcpListener, PeerAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PeerAddr::new("127.0.0.1", port))
    }

    async fn accept(listener: &TcpListener) -> Framed<TcpStream, EnvelopeCodec> {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        Framed::new(stream, EnvelopeCodec::new())
    }

    async fn recv(framed: &mut Framed<TcpStream, EnvelopeCodec>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    fn im(receiver: i64, msgid: i32) -> ImMessage {
        ImMessage {
            sender: 1,
            receiver,
            timestamp: 0,
            msgid,
            content: "hi".into(),
        }
    }

    #[test]
    fn peer_id_packs_ipv4_and_port() {
        let memory = Memory::new();
        let peer = Peer::new(PeerAddr::new("10.0.0.1", 23000), memory.services(), Timing::default());
        assert_eq!(peer.peer_id(), Some((0x0A00_0001u64 << 32) | 23000));

        let named = Peer::new(PeerAddr::new("im-2.local", 23000), memory.services(), Timing::default());
        assert_eq!(named.peer_id(), None);
    }

    #[test]
    fn add_all_client_queues_one_add_per_local_user() {
        let memory = Memory::new();
        for uid in 1..=4 {
            memory.route.add_client(ClientHandle::new(uid, uid * 10).0);
        }
        let peer = Peer::new(PeerAddr::new("127.0.0.1", 1), memory.services(), Timing::default());
        assert_eq!(peer.add_all_client(), 4);
    }

    #[tokio::test]
    async fn every_connect_resyncs_all_local_users() {
        let memory = Memory::new();
        let mut sessions = Vec::new();
        for uid in 1..=3 {
            let (client, rx) = ClientHandle::new(uid, 100 + uid);
            memory.route.add_client(client);
            sessions.push(rx);
        }
        let (listener, addr) = listen().await;
        let peer = Peer::new(addr, memory.services(), fast());
        assert!(peer.start().is_some());
        assert!(peer.start().is_none());

        for _ in 0..2 {
            let mut remote = accept(&listener).await;
            let mut announced = HashSet::new();
            for expected_seq in 1..=3 {
                let envelope = recv(&mut remote).await;
                assert_eq!(envelope.seq, expected_seq);
                match envelope.body {
                    Body::AddClient(ac) => {
                        assert_eq!(ac.timestamp, 100 + ac.uid);
                        announced.insert(ac.uid);
                    }
                    other => panic!("expected AddClient, got {other:?}"),
                }
            }
            assert_eq!(announced, HashSet::from([1, 2, 3]));
            // Dropping the remote end forces a reconnect.
        }
        peer.close();
    }

    #[tokio::test]
    async fn writer_sends_heartbeats() {
        let memory = Memory::new();
        let (listener, addr) = listen().await;
        let timing = Timing {
            heartbeat_interval: Duration::from_millis(20),
            ..fast()
        };
        let peer = Peer::new(addr, memory.services(), timing);
        peer.start();

        let mut remote = accept(&listener).await;
        for expected_seq in 1..=2 {
            let envelope = recv(&mut remote).await;
            assert_eq!(envelope, Envelope { seq: expected_seq, body: Body::Heartbeat });
        }
        assert!(peer.connected());
        peer.close();
    }

    #[tokio::test]
    async fn forwarded_messages_reach_local_users_or_storage() {
        let memory = Memory::new();
        let (client, mut session) = ClientHandle::new(7, 0);
        memory.route.add_client(client);
        memory.groups.add_member(30, 7);
        memory.groups.add_member(30, 8);

        let (listener, addr) = listen().await;
        let peer = Peer::new(addr, memory.services(), fast());
        peer.start();
        let mut remote = accept(&listener).await;
        let _resync = recv(&mut remote).await;

        let sends = [
            Body::InstantMessage(im(7, 1)),
            Body::TypingIndicator(Typing { sender: 1, receiver: 8 }),
            Body::PeerAcknowledge(PeerAck { sender: 1, receiver: 8, msgid: 4 }),
            Body::GroupInstantMessage(im(30, 2)),
            Body::InstantMessage(im(8, 3)),
        ];
        for body in sends {
            remote.send(Envelope::new(body)).await.unwrap();
        }

        let storage = memory.storage.clone();
        eventually(|| storage.pending(8) == 3).await;

        let mut delivered = Vec::new();
        while let Ok(Outgoing::Send(envelope)) = session.try_recv() {
            delivered.push(envelope.body);
        }
        assert_eq!(
            delivered,
            vec![
                Body::InstantMessage(im(7, 1)),
                Body::GroupInstantMessage(im(30, 2)),
            ]
        );

        let stored: Vec<_> = memory.storage.load_and_clear(8).into_iter().map(|e| e.body).collect();
        assert_eq!(
            stored,
            vec![
                Body::PeerAcknowledge(PeerAck { sender: 1, receiver: 8, msgid: 4 }),
                Body::GroupInstantMessage(im(30, 2)),
                Body::InstantMessage(im(8, 3)),
            ]
        );
        peer.close();
    }

    #[tokio::test]
    async fn oversized_envelope_does_not_drop_the_connection() {
        let memory = Memory::new();
        let peer = Peer::new(PeerAddr::new("127.0.0.1", 1), memory.services(), fast());
        let huge = ImMessage {
            content: "x".repeat(2 * MAX_FRAME_SIZE),
            ..im(7, 1)
        };
        assert!(peer.send(Body::InstantMessage(huge)));
        assert!(peer.send(Body::InstantMessage(im(7, 2))));

        let (near, far) = tokio::io::duplex(64 * 1024);
        peer.attach(near);
        let mut remote = Framed::new(far, EnvelopeCodec::new());

        let envelope = tokio::time::timeout(Duration::from_secs(5), remote.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope, Envelope { seq: 1, body: Body::InstantMessage(im(7, 2)) });
        assert!(peer.connected());
        peer.close();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_sends_one_catch_up_heartbeat() {
        let memory = Memory::new();
        let peer = Peer::new(PeerAddr::new("127.0.0.1", 1), memory.services(), Timing::default());
        let bulky = ImMessage {
            content: "x".repeat(4096),
            ..im(7, 1)
        };
        peer.send(Body::InstantMessage(bulky.clone()));

        // Nobody reads the far end yet, so the writer blocks on the first frame while heartbeats fall due.
        let (near, far) = tokio::io::duplex(64);
        peer.attach(near);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut remote = Framed::new(far, EnvelopeCodec::new());
        let first = remote.next().await.unwrap().unwrap();
        assert_eq!(first.body, Body::InstantMessage(bulky));
        let second = remote.next().await.unwrap().unwrap();
        assert_eq!(second, Envelope { seq: 2, body: Body::Heartbeat });

        let burst = tokio::time::timeout(Duration::from_secs(5), remote.next()).await;
        assert!(burst.is_err(), "missed heartbeats were sent back to back");
        peer.close();
    }

    #[tokio::test]
    async fn stopped_peer_does_not_reconnect() {
        let memory = Memory::new();
        let (listener, addr) = listen().await;
        let peer = Peer::new(addr, memory.services(), fast());
        peer.start();
        let remote = accept(&listener).await;

        peer.stop();
        assert!(peer.connected());
        drop(remote);

        let link = peer.clone();
        eventually(move || !link.connected()).await;
        let again = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(again.is_err(), "stopped peer dialed again");
        peer.close();
    }
}
