//! Framing of [Envelope]s on a byte stream.
//!
//! Each frame is length delimited and laid out as `[u8 command][u32 BE seq][body]`, where the body is the postcard
//! encoding of the command's payload struct. Heartbeat and SessionReset have an empty body.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{
    api::{Body, Command, Envelope},
    error::{Error, Result},
};

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

const HEADER_LEN: usize = 5;

/// A codec turning a byte stream into [Envelope]s and back.
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.frames.decode(src)? {
            Some(frame) => decode_frame(frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let frame = encode_frame(&envelope)?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge { len: frame.len() });
        }
        self.frames.encode(frame.freeze(), dst)?;
        Ok(())
    }
}

fn encode_frame(envelope: &Envelope) -> Result<BytesMut> {
    let mut frame = BytesMut::with_capacity(64);
    frame.put_u8(envelope.body.code());
    frame.put_u32(envelope.seq);

    match &envelope.body {
        Body::Heartbeat | Body::SessionReset => Ok(frame),
        Body::Authentication(auth) => put_body(frame, Command::Authentication, auth),
        Body::InstantMessage(im) => put_body(frame, Command::InstantMessage, im),
        Body::Acknowledge(ack) => put_body(frame, Command::Acknowledge, ack),
        Body::GroupInstantMessage(im) => put_body(frame, Command::GroupInstantMessage, im),
        Body::PeerAcknowledge(ack) => put_body(frame, Command::PeerAcknowledge, ack),
        Body::TypingIndicator(typing) => put_body(frame, Command::TypingIndicator, typing),
        Body::OnlineStateChange(state) => put_body(frame, Command::OnlineStateChange, state),
        Body::AddClient(ac) => put_body(frame, Command::AddClient, ac),
        Body::RemoveClient(uid) => put_body(frame, Command::RemoveClient, uid),
        Body::Unknown { payload, .. } => {
            frame.extend_from_slice(payload);
            Ok(frame)
        }
    }
}

fn put_body<T: Serialize>(frame: BytesMut, command: Command, body: &T) -> Result<BytesMut> {
    postcard::to_extend(body, frame).map_err(|source| Error::Encode { command, source })
}

fn decode_frame(mut frame: BytesMut) -> Result<Envelope> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Truncated { len: frame.len() });
    }
    let code = frame.get_u8();
    let seq = frame.get_u32();
    let payload = frame.freeze();

    let command = match Command::try_from(code) {
        Ok(command) => command,
        Err(command) => {
            let payload = payload.to_vec();
            return Ok(Envelope {
                seq,
                body: Body::Unknown { command, payload },
            });
        }
    };

    let body = match command {
        Command::Heartbeat => Body::Heartbeat,
        Command::SessionReset => Body::SessionReset,
        Command::Authentication => Body::Authentication(take_body(command, &payload)?),
        Command::InstantMessage => Body::InstantMessage(take_body(command, &payload)?),
        Command::Acknowledge => Body::Acknowledge(take_body(command, &payload)?),
        Command::GroupInstantMessage => Body::GroupInstantMessage(take_body(command, &payload)?),
        Command::PeerAcknowledge => Body::PeerAcknowledge(take_body(command, &payload)?),
        Command::TypingIndicator => Body::TypingIndicator(take_body(command, &payload)?),
        Command::OnlineStateChange => Body::OnlineStateChange(take_body(command, &payload)?),
        Command::AddClient => Body::AddClient(take_body(command, &payload)?),
        Command::RemoveClient => Body::RemoveClient(take_body(command, &payload)?),
    };

    Ok(Envelope { seq, body })
}

fn take_body<T: DeserializeOwned>(command: Command, payload: &Bytes) -> Result<T> {
    postcard::from_bytes(payload).map_err(|source| Error::Decode { command, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AddClient, ImMessage};

    fn roundtrip(envelope: Envelope) -> Envelope {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn im_keeps_sequence_and_body() {
        let envelope = Envelope {
            seq: 42,
            body: Body::InstantMessage(ImMessage {
                sender: 1,
                receiver: 2,
                timestamp: 1_700_000_000,
                msgid: 9,
                content: "hello".into(),
            }),
        };
        assert_eq!(roundtrip(envelope.clone()), envelope);
    }

    #[test]
    fn control_bodies_survive_the_wire() {
        for body in [
            Body::Heartbeat,
            Body::SessionReset,
            Body::RemoveClient(-3),
            Body::AddClient(AddClient {
                uid: 11,
                timestamp: 5,
            }),
        ] {
            let envelope = Envelope { seq: 1, body };
            assert_eq!(roundtrip(envelope.clone()), envelope);
        }
    }

    #[test]
    fn heartbeat_frame_is_header_only() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Envelope {
                    seq: 7,
                    body: Body::Heartbeat,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 5, 1, 0, 0, 0, 7]);
    }

    #[test]
    fn unknown_command_is_decoded_not_rejected() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 7, 200, 0, 0, 0, 3, 0xAA, 0xBB][..]);
        let envelope = EnvelopeCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(envelope.seq, 3);
        assert_eq!(
            envelope.body,
            Body::Unknown {
                command: 200,
                payload: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn short_frame_is_an_error() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 1, 0][..]);
        let err = EnvelopeCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Truncated { len: 2 }));
    }

    #[test]
    fn malformed_known_body_is_an_error() {
        // AddClient with an empty body.
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 128, 0, 0, 0, 1][..]);
        let err = EnvelopeCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Decode {
                command: Command::AddClient,
                ..
            }
        ));
    }

    #[test]
    fn oversized_envelope_is_refused_without_touching_the_buffer() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let envelope = Envelope::new(Body::InstantMessage(ImMessage {
            sender: 1,
            receiver: 2,
            timestamp: 0,
            msgid: 1,
            content: "x".repeat(MAX_FRAME_SIZE),
        }));

        let err = codec.encode(envelope, &mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len } if len > MAX_FRAME_SIZE));
        assert!(buf.is_empty());

        codec.encode(Envelope::new(Body::Heartbeat), &mut buf).unwrap();
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 1, 0][..]);
        assert!(EnvelopeCodec::new().decode(&mut buf).unwrap().is_none());
    }
}
