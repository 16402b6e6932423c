//! Wire protocol.
//!
//! Every frame is an 8-byte big-endian header followed by a bincode payload:
//!
//! ```text
//! +---------+------+-------+----------------+
//! | version | kind | flags | payload length |
//! |   u16   |  u8  |  u8   |      u32       |
//! +---------+------+-------+----------------+
//! ```
//!
//! A receiver checks the version first and rejects anything it does not
//! speak with [`NetError::ProtocolMismatch`]. It never tries to parse a
//! payload from another version.

use serde::{Deserialize, Serialize};

use rts_core::command::{Command, GameTick};
use rts_core::components::PlayerId;
use rts_core::simulation::Checksum;

use crate::error::{NetError, Result};

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest accepted payload.
pub const MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

/// Message discriminant carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Client introduces itself.
    Hello = 1,
    /// Server assigns a slot.
    Welcome = 2,
    /// Server starts the match.
    Start = 3,
    /// Client submits commands.
    Commands = 4,
    /// Server seals a tick.
    TickAdvance = 5,
    /// Client reports a tick's checksum.
    TickAck = 6,
    /// Server reports a lost peer.
    PeerLost = 7,
    /// Session ends with an error.
    Abort = 8,
    /// Session ends normally.
    Goodbye = 9,
}

impl TryFrom<u8> for MessageKind {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Hello,
            2 => Self::Welcome,
            3 => Self::Start,
            4 => Self::Commands,
            5 => Self::TickAdvance,
            6 => Self::TickAck,
            7 => Self::PeerLost,
            8 => Self::Abort,
            9 => Self::Goodbye,
            other => return Err(NetError::UnknownMessageKind(other)),
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u16,
    /// Message kind.
    pub kind: MessageKind,
    /// Reserved, always zero.
    pub flags: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Header for a payload of `length` bytes in this build's version.
    #[must_use]
    pub const fn new(kind: MessageKind, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            flags: 0,
            length,
        }
    }

    /// Big-endian wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.version.to_be_bytes());
        bytes[2] = self.kind as u8;
        bytes[3] = self.flags;
        bytes[4..8].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse and validate wire bytes. Checks run in header order: version,
    /// kind, flags, then length.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::ProtocolMismatch`], [`NetError::UnknownMessageKind`],
    /// [`NetError::UnsupportedFlags`] or [`NetError::FrameTooLarge`].
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != PROTOCOL_VERSION {
            return Err(NetError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }
        let kind = MessageKind::try_from(bytes[2])?;
        let flags = bytes[3];
        if flags != 0 {
            return Err(NetError::UnsupportedFlags(flags));
        }
        let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if length > MAX_PAYLOAD {
            return Err(NetError::FrameTooLarge {
                length,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            version,
            kind,
            flags,
            length,
        })
    }
}

/// Why a session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The peer speaks another protocol version.
    ProtocolMismatch {
        /// Version the sender speaks.
        expected: u16,
    },
    /// Every slot is taken.
    MatchFull,
    /// Acknowledged checksums for a tick disagree.
    Desync {
        /// First divergent tick.
        tick: GameTick,
    },
    /// The handshake broke protocol.
    UnexpectedMessage,
    /// The server is shutting down.
    Shutdown,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolMismatch { expected } => {
                write!(f, "protocol mismatch (server speaks version {expected})")
            }
            Self::MatchFull => write!(f, "match is full"),
            Self::Desync { tick } => write!(f, "desync at tick {tick}"),
            Self::UnexpectedMessage => write!(f, "unexpected message"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// Client to server: first message on a connection.
    Hello {
        /// Display name.
        name: String,
    },
    /// Server to client: slot assignment.
    Welcome {
        /// The client's slot, also its player ID.
        slot: PlayerId,
        /// Number of slots in the match.
        slots: u8,
        /// Ticks between issuing a command and its execution.
        input_delay: u64,
        /// Target ticks per second.
        tick_rate: u32,
    },
    /// Server to client: the match begins from this state.
    Start {
        /// Serialized initial simulation.
        state: Vec<u8>,
    },
    /// Client to server: locally issued commands.
    Commands {
        /// Commands tagged with their target tick.
        commands: Vec<Command>,
    },
    /// Server to client: `tick` is sealed with exactly these commands.
    TickAdvance {
        /// Sealed tick.
        tick: GameTick,
        /// Every command for the tick, from every slot.
        commands: Vec<Command>,
        /// Latest tick every connected slot agreed on, with its checksum.
        confirmed: Option<(GameTick, Checksum)>,
    },
    /// Client to server: `tick` was applied with this checksum.
    TickAck {
        /// Applied tick.
        tick: GameTick,
        /// Checksum after the tick.
        checksum: Checksum,
    },
    /// Server to client: a peer dropped out.
    PeerLost {
        /// Lost slot.
        slot: PlayerId,
        /// First tick without the slot's commands.
        from_tick: GameTick,
    },
    /// Either direction: the session ends with an error.
    Abort {
        /// Cause.
        reason: AbortReason,
    },
    /// Either direction: the session ends normally.
    Goodbye,
}

impl NetworkMessage {
    /// Header discriminant for this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Hello { .. } => MessageKind::Hello,
            Self::Welcome { .. } => MessageKind::Welcome,
            Self::Start { .. } => MessageKind::Start,
            Self::Commands { .. } => MessageKind::Commands,
            Self::TickAdvance { .. } => MessageKind::TickAdvance,
            Self::TickAck { .. } => MessageKind::TickAck,
            Self::PeerLost { .. } => MessageKind::PeerLost,
            Self::Abort { .. } => MessageKind::Abort,
            Self::Goodbye => MessageKind::Goodbye,
        }
    }

    /// Encode as a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Codec`] if serialization fails, or
    /// [`NetError::FrameTooLarge`] if the payload exceeds [`MAX_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD)
            .ok_or(NetError::FrameTooLarge {
                length: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD,
            })?;
        let header = FrameHeader::new(self.kind(), length);
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload read after `header`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Codec`] if the payload does not decode or its kind
    /// disagrees with the header.
    pub fn decode(header: &FrameHeader, payload: &[u8]) -> Result<Self> {
        let message: Self = bincode::deserialize(payload)?;
        if message.kind() != header.kind {
            return Err(NetError::Codec(format!(
                "header kind {:?} does not match payload kind {:?}",
                header.kind,
                message.kind()
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rts_core::command::Action;
    use rts_core::map::GridPos;

    fn decode_frame(frame: &[u8]) -> Result<NetworkMessage> {
        let header_bytes: [u8; HEADER_LEN] = frame[..HEADER_LEN].try_into().unwrap();
        let header = FrameHeader::decode(&header_bytes)?;
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
        NetworkMessage::decode(&header, &frame[HEADER_LEN..])
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FrameHeader::new(MessageKind::TickAck, 0x0102_0304);
        assert_eq!(header.encode(), [0x00, 0x01, 6, 0, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_tick_advance_frame() {
        let message = NetworkMessage::TickAdvance {
            tick: 42,
            commands: vec![Command::new(42, 1, 7, 3, Action::Move { to: GridPos::new(4, 5) })],
            confirmed: Some((40, 0xDEAD_BEEF)),
        };
        let frame = message.encode().unwrap();
        assert_eq!(frame[2], MessageKind::TickAdvance as u8);
        assert_eq!(decode_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_version_mismatch_rejected_before_payload() {
        let mut frame = NetworkMessage::Goodbye.encode().unwrap();
        frame[0..2].copy_from_slice(&7u16.to_be_bytes());
        // Garbage payload is never looked at.
        frame.extend_from_slice(&[0xFF; 16]);
        assert!(matches!(
            decode_frame(&frame),
            Err(NetError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: 7
            })
        ));
    }

    #[test]
    fn test_unknown_kind_and_flags_rejected() {
        let mut bytes = FrameHeader::new(MessageKind::Hello, 0).encode();
        bytes[2] = 200;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(NetError::UnknownMessageKind(200))
        ));

        let mut bytes = FrameHeader::new(MessageKind::Hello, 0).encode();
        bytes[3] = 1;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(NetError::UnsupportedFlags(1))
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let bytes = FrameHeader::new(MessageKind::Start, MAX_PAYLOAD + 1).encode();
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(NetError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_kind_must_match_payload() {
        let mut frame = NetworkMessage::Goodbye.encode().unwrap();
        frame[2] = MessageKind::Hello as u8;
        assert!(matches!(decode_frame(&frame), Err(NetError::Codec(_))));
    }
}
