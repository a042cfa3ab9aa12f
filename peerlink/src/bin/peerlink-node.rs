use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use peerlink::{
    Node,
    api::{Body, ImMessage, Uid},
    config::{Config, PeerAddr, Timing},
    memory::{Memory, MemoryRoute},
    outbox::{ClientHandle, Outgoing},
    presence,
    services::{GroupDirectory, OfflineStore, PresenceDirectory},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};

#[derive(clap::Parser, Debug)]
struct Args {
    /// Address the peer listener binds to.
    #[arg(long, default_value = "127.0.0.1:4444")]
    listen: String,
    /// Another node to keep a link with, as host:port. May be repeated.
    #[arg(long = "peer")]
    peers: Vec<PeerAddr>,
    #[arg(long, default_value_t = 20)]
    reconnect_secs: u64,
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 20)]
    idle_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> Config {
        let timing = Timing {
            reconnect_interval: Duration::from_secs(self.reconnect_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        };
        self.peers
            .iter()
            .cloned()
            .fold(Config::new(&self.listen).timing(timing), Config::peer)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Prints everything sent to a local session until it is reset or closed.
async fn print_session(
    session: ClientHandle,
    rx: tokio::sync::mpsc::UnboundedReceiver<Outgoing>,
    route: Arc<MemoryRoute>,
) {
    let uid = session.uid;
    let mut stream = UnboundedReceiverStream::new(rx);
    while let Some(Outgoing::Send(envelope)) = stream.next().await {
        println!("[{uid}] {:?}", envelope.body);
        if envelope.body == Body::SessionReset {
            route.remove_session(&session);
            break;
        }
    }
}

/// Drops the local session of `uid`, if any, and stops its printer.
fn end_session(memory: &Memory, uid: Uid) {
    if let Some(client) = memory.route.remove_client(uid) {
        client.outbox.close(0);
    }
}

fn parse<T: std::str::FromStr>(part: &str) -> Option<T> {
    part.parse().ok()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let memory = Memory::new();
    let node = match Node::bind(args.config(), memory.services()).await {
        Ok(node) => node,
        Err(err) => {
            tracing::error!("failed to start node: {err}");
            std::process::exit(1);
        }
    };
    println!("Listening for peers on {}", node.local_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut msgid = 0;
    while let Ok(Some(input)) = lines.next_line().await {
        let parts: Vec<&str> = input.split_whitespace().collect();
        match parts.as_slice() {
            ["exit"] => break,
            ["login", uid] => {
                let Some(uid) = parse::<Uid>(uid) else {
                    println!("Usage: login <uid>");
                    continue;
                };
                let ts = now();
                end_session(&memory, uid);
                let (client, rx) = ClientHandle::new(uid, ts);
                for envelope in memory.storage.load_and_clear(uid) {
                    client.outbox.push(envelope);
                }
                memory.route.add_client(client.clone());
                tokio::spawn(print_session(client, rx, memory.route.clone()));
                node.announce_online(uid, ts);
                presence::publish_state(node.services(), uid, true);
            }
            ["logout", uid] => {
                let Some(uid) = parse::<Uid>(uid) else {
                    println!("Usage: logout <uid>");
                    continue;
                };
                end_session(&memory, uid);
                node.announce_offline(uid);
                presence::publish_state(node.services(), uid, false);
            }
            ["subscribe", uid, subscriber] => {
                match (parse::<Uid>(uid), parse::<Uid>(subscriber)) {
                    (Some(uid), Some(subscriber)) => memory.state_center.subscribe(uid, subscriber),
                    _ => println!("Usage: subscribe <uid> <subscriber>"),
                }
            }
            ["group", gid, members @ ..] => {
                let Some(gid) = parse::<i64>(gid) else {
                    println!("Usage: group <gid> <uid>...");
                    continue;
                };
                for member in members.iter().filter_map(|m| parse::<Uid>(m)) {
                    memory.groups.add_member(gid, member);
                }
            }
            ["send", from, to, text @ ..] | ["sendgroup", from, to, text @ ..] => {
                let (Some(sender), Some(receiver)) = (parse::<Uid>(from), parse::<i64>(to)) else {
                    println!("Usage: send <from> <to> <text> | sendgroup <from> <gid> <text>");
                    continue;
                };
                msgid += 1;
                let im = ImMessage {
                    sender,
                    receiver,
                    timestamp: now(),
                    msgid,
                    content: text.join(" "),
                };
                if parts[0] == "send" {
                    let route = node.deliver(receiver, Body::InstantMessage(im));
                    println!("message {msgid} -> {receiver}: {route:?}");
                } else {
                    let Some(members) = memory.groups.members_of(receiver) else {
                        println!("No group {receiver}");
                        continue;
                    };
                    for member in members {
                        let route = node.deliver(member, Body::GroupInstantMessage(im.clone()));
                        println!("message {msgid} -> {member}: {route:?}");
                    }
                }
            }
            [] => {}
            _ => println!("Unknown command"),
        }
    }

    node.shutdown().await;
}
