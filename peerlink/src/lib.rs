#![doc = include_str!("../../README.md")]

pub mod api;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod outbox;
pub mod peer;
pub mod peer_client;
pub mod presence;
pub mod services;

#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api::{AddClient, Body, Envelope, Uid},
    config::{Config, Timing},
    peer::Peer,
    peer_client::PeerClient,
    services::Services,
};

/// Where [Node::deliver] put an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed to a session on this node.
    Local,
    /// Forwarded to the node currently serving the user.
    Peer,
    /// Saved until the user shows up somewhere.
    Offline,
}

/// A cluster member: one listener accepting inbound peer links plus one outbound link per configured peer.
pub struct Node {
    services: Services,
    peers: Vec<Arc<Peer>>,
    peer_loops: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    /// A token to signal to the accept task to shutdown.
    token: CancellationToken,
    /// The running accept task's join handle.
    handle: JoinHandle<()>,
}

impl Node {
    /// Binds the peer listener and starts every configured outbound link.
    pub async fn bind(config: Config, services: Services) -> error::Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, peers = config.peers.len(), "node listening");

        let token = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            services.clone(),
            config.timing,
            token.clone(),
        ));

        let peers: Vec<_> = config
            .peers
            .into_iter()
            .map(|addr| Peer::new(addr, services.clone(), config.timing))
            .collect();
        let peer_loops = peers.iter().filter_map(|peer| peer.start()).collect();

        Ok(Self {
            services,
            peers,
            peer_loops,
            local_addr,
            token,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Tells every peer that `uid` is now served here.
    pub fn announce_online(&self, uid: Uid, timestamp: i64) {
        for peer in &self.peers {
            peer.send(Body::AddClient(AddClient { uid, timestamp }));
        }
    }

    /// Tells every peer that `uid` is no longer served here.
    pub fn announce_offline(&self, uid: Uid) {
        for peer in &self.peers {
            peer.send(Body::RemoveClient(uid));
        }
    }

    /// Pushes `envelope` down the inbound link of the node serving `uid`. Returns false when no peer claims `uid`.
    pub fn forward(&self, uid: Uid, envelope: impl Into<Envelope>) -> bool {
        match self.services.route.find_peer_client(uid) {
            Some(link) => link.outbox().push(envelope),
            None => false,
        }
    }

    /// Routes `envelope` to `uid` wherever it is: a local session first, then a peer, then the offline store.
    pub fn deliver(&self, uid: Uid, envelope: impl Into<Envelope>) -> Delivery {
        let envelope = envelope.into();
        if delivery::deliver_if_present(&self.services, uid, envelope.clone()) {
            return Delivery::Local;
        }
        if self.forward(uid, envelope.clone()) {
            return Delivery::Peer;
        }
        self.services.storage.save(uid, envelope);
        Delivery::Offline
    }

    /// Stops accepting peers and closes every outbound link.
    ///
    /// Inbound links already accepted keep running until their remote end goes away.
    pub async fn shutdown(self) {
        self.token.cancel();
        for peer in &self.peers {
            peer.close();
        }
        futures::future::join_all(self.peer_loops).await;
        let _ = self.handle.await;
    }
}

async fn accept_loop(listener: TcpListener, services: Services, timing: Timing, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                break;
            }
            // Handle a new peer connection
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(%addr, "peer connection accepted");
                    PeerClient::spawn(stream, services.clone(), timing);
                }
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }
}
