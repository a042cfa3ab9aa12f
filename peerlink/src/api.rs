//! This module contains the envelopes exchanged between nodes and handed to local sessions.
//!
//! Every envelope carries a [Command] code, a per-connection sequence number and a command specific [Body]. Command
//! codes are part of the wire format and must never be renumbered.
use serde_derive::*;

/// A user identifier, unique across the cluster.
pub type Uid = i64;

/// A group identifier.
pub type GroupId = i64;

/// The stable command codes of the wire protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Heartbeat = 1,
    Authentication = 2,
    InstantMessage = 4,
    Acknowledge = 5,
    SessionReset = 6,
    GroupInstantMessage = 8,
    PeerAcknowledge = 9,
    TypingIndicator = 10,
    OnlineStateChange = 12,
    AddClient = 128,
    RemoveClient = 129,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Heartbeat,
            2 => Self::Authentication,
            4 => Self::InstantMessage,
            5 => Self::Acknowledge,
            6 => Self::SessionReset,
            8 => Self::GroupInstantMessage,
            9 => Self::PeerAcknowledge,
            10 => Self::TypingIndicator,
            12 => Self::OnlineStateChange,
            128 => Self::AddClient,
            129 => Self::RemoveClient,
            other => return Err(other),
        })
    }
}

/// A client authenticating itself on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub uid: Uid,
}

/// Acknowledges the envelope sent with sequence number `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub seq: u32,
}

/// A chat message. For group messages `receiver` is the group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImMessage {
    pub sender: Uid,
    pub receiver: i64,
    /// Unix seconds at which the sender's node accepted the message.
    pub timestamp: i64,
    /// Sender assigned id, echoed back in [PeerAck].
    pub msgid: i32,
    pub content: String,
}

/// Tells `sender` that `receiver` got message `msgid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAck {
    pub sender: Uid,
    pub receiver: Uid,
    pub msgid: i32,
}

/// `sender` is typing to `receiver`. Never stored offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub sender: Uid,
    pub receiver: Uid,
}

/// `uid` went online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineState {
    pub uid: Uid,
    pub online: bool,
}

/// The sending node now serves `uid`, whose session became active at `timestamp` (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddClient {
    pub uid: Uid,
    pub timestamp: i64,
}

/// The command specific part of an [Envelope].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Heartbeat,
    Authentication(Authentication),
    InstantMessage(ImMessage),
    Acknowledge(Ack),
    SessionReset,
    GroupInstantMessage(ImMessage),
    PeerAcknowledge(PeerAck),
    TypingIndicator(Typing),
    OnlineStateChange(OnlineState),
    AddClient(AddClient),
    RemoveClient(Uid),
    /// A command code this build does not know. Kept verbatim so it can be logged or relayed.
    Unknown { command: u8, payload: Vec<u8> },
}

impl Body {
    /// The wire code of this body.
    pub fn code(&self) -> u8 {
        match self {
            Body::Unknown { command, .. } => *command,
            known => known.command().map_or(0, |command| command as u8),
        }
    }

    /// The command of this body, or `None` for [Body::Unknown].
    pub fn command(&self) -> Option<Command> {
        Some(match self {
            Body::Heartbeat => Command::Heartbeat,
            Body::Authentication(_) => Command::Authentication,
            Body::InstantMessage(_) => Command::InstantMessage,
            Body::Acknowledge(_) => Command::Acknowledge,
            Body::SessionReset => Command::SessionReset,
            Body::GroupInstantMessage(_) => Command::GroupInstantMessage,
            Body::PeerAcknowledge(_) => Command::PeerAcknowledge,
            Body::TypingIndicator(_) => Command::TypingIndicator,
            Body::OnlineStateChange(_) => Command::OnlineStateChange,
            Body::AddClient(_) => Command::AddClient,
            Body::RemoveClient(_) => Command::RemoveClient,
            Body::Unknown { .. } => return None,
        })
    }
}

/// A sequenced unit of communication.
///
/// `seq` is assigned by the writing task right before the envelope hits the wire; envelopes built locally carry `0`
/// until then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub seq: u32,
    pub body: Body,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self { seq: 0, body }
    }
}

impl From<Body> for Envelope {
    fn from(body: Body) -> Self {
        Self::new(body)
    }
}
