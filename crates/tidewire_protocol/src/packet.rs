//! Encrypted packets exchanged once a client has sent its connect token.
//!
//! Every packet except the connect token packet has the layout:
//!
//! ```text
//! [0]      packet type
//! [1..9)   sequence, u64 big-endian
//! [9..n)   body, encrypted with ChaCha20-Poly1305
//! [n..n+16) authentication tag
//! ```
//!
//! The nonce is derived from the sequence (see [`crypto::seal`]), and the
//! associated data is [`VERSION_INFO`], the application id, and the packet
//! type. A packet sealed for one application, or with its type byte changed,
//! fails to open.

use {
    crate::{
        MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, VERSION_INFO, VERSION_INFO_SIZE,
        crypto::{self, SymmetricKey, TAG_SIZE},
    },
    derive_more::{Display, Error},
    octs::{BufMut, Bytes, BytesMut},
};

/// Length of the random data in a [`Challenge`].
pub const CHALLENGE_DATA_SIZE: usize = 256;

/// Length of the unencrypted packet type and sequence.
pub const HEADER_SIZE: usize = 1 + 8;

/// Length of the smallest valid encrypted packet.
pub const MIN_SEALED_SIZE: usize = HEADER_SIZE + TAG_SIZE;

const ACCEPTED_BODY_SIZE: usize = 8 + 4 + 4 + 4;
const CHALLENGE_BODY_SIZE: usize = 8 + CHALLENGE_DATA_SIZE;

/// Kind of packet, sent as the first byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Connect token packet, sent unencrypted by the client to start a
    /// handshake.
    ConnectToken = 0,
    /// [`Packet::Accepted`].
    Accepted = 1,
    /// [`Packet::Denied`].
    Denied = 2,
    /// [`Packet::KeepAlive`].
    KeepAlive = 3,
    /// [`Packet::Disconnect`].
    Disconnect = 4,
    /// [`Packet::ChallengeRequest`].
    ChallengeRequest = 5,
    /// [`Packet::ChallengeResponse`].
    ChallengeResponse = 6,
    /// [`Packet::Payload`].
    Payload = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::ConnectToken,
            1 => Self::Accepted,
            2 => Self::Denied,
            3 => Self::KeepAlive,
            4 => Self::Disconnect,
            5 => Self::ChallengeRequest,
            6 => Self::ChallengeResponse,
            7 => Self::Payload,
            packet_type => return Err(PacketError::InvalidType { packet_type }),
        })
    }
}

/// Challenge issued by a server to prove that a client owns the address it
/// sends from.
///
/// The data is opaque to the client, which must echo the challenge back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Sequence the data was sealed with.
    pub seq: u64,
    /// Sealed challenge data.
    pub data: Box<[u8; CHALLENGE_DATA_SIZE]>,
}

/// Decrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Server accepted the client.
    Accepted {
        /// Client id from the connect token.
        client_id: u64,
        /// Slot the client was given.
        client_index: u32,
        /// Number of slots on the server.
        max_clients: u32,
        /// How long either side waits without receiving anything before
        /// dropping the connection, in seconds.
        timeout_secs: u32,
    },
    /// Server is full and denied the client.
    Denied,
    /// Sent when there is nothing else to send, to keep the connection alive.
    KeepAlive,
    /// Connection is being closed.
    Disconnect,
    /// Server asks the client to echo a challenge.
    ChallengeRequest(Challenge),
    /// Client echoes a challenge.
    ChallengeResponse(Challenge),
    /// Transport packet.
    Payload(Bytes),
}

impl Packet {
    /// Gets the [`PacketType`] of this packet.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        match self {
            Self::Accepted { .. } => PacketType::Accepted,
            Self::Denied => PacketType::Denied,
            Self::KeepAlive => PacketType::KeepAlive,
            Self::Disconnect => PacketType::Disconnect,
            Self::ChallengeRequest(_) => PacketType::ChallengeRequest,
            Self::ChallengeResponse(_) => PacketType::ChallengeResponse,
            Self::Payload(_) => PacketType::Payload,
        }
    }
}

/// Failed to seal or open a packet.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum PacketError {
    /// Packet is shorter than [`MIN_SEALED_SIZE`].
    #[display("packet of {len} bytes is too short")]
    TooShort {
        /// Length of the packet.
        len: usize,
    },
    /// Packet is longer than [`MAX_PACKET_SIZE`].
    #[display("packet of {len} bytes is too long")]
    TooLong {
        /// Length of the packet.
        len: usize,
    },
    /// Packet type byte is unknown, or is not an encrypted packet type.
    #[display("invalid packet type {packet_type}")]
    InvalidType {
        /// Type byte read.
        packet_type: u8,
    },
    /// Body is not the right length for its packet type.
    #[display("body of {len} bytes is invalid for {packet_type:?}")]
    InvalidBody {
        /// Type of the packet.
        packet_type: PacketType,
        /// Length of the body.
        len: usize,
    },
    /// Packet failed authentication.
    #[display("failed to decrypt")]
    Decrypt,
}

fn associated_data(application_id: u64, packet_type: PacketType) -> [u8; VERSION_INFO_SIZE + 9] {
    let mut ad = [0; VERSION_INFO_SIZE + 9];
    ad[..VERSION_INFO_SIZE].copy_from_slice(VERSION_INFO);
    ad[VERSION_INFO_SIZE..VERSION_INFO_SIZE + 8].copy_from_slice(&application_id.to_be_bytes());
    ad[VERSION_INFO_SIZE + 8] = packet_type as u8;
    ad
}

/// Encrypts `packet` with `key`, sequence `seq`, for the application
/// `application_id`.
///
/// # Errors
///
/// Errors if a payload is empty or longer than [`MAX_PAYLOAD_SIZE`].
pub fn seal(
    packet: &Packet,
    seq: u64,
    key: &SymmetricKey,
    application_id: u64,
) -> Result<Bytes, PacketError> {
    let packet_type = packet.packet_type();
    let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
    buf.put_u8(packet_type as u8);
    buf.put_u64(seq);
    match packet {
        Packet::Accepted {
            client_id,
            client_index,
            max_clients,
            timeout_secs,
        } => {
            buf.put_u64(*client_id);
            buf.put_u32(*client_index);
            buf.put_u32(*max_clients);
            buf.put_u32(*timeout_secs);
        }
        Packet::Denied | Packet::KeepAlive | Packet::Disconnect => {}
        Packet::ChallengeRequest(challenge) | Packet::ChallengeResponse(challenge) => {
            buf.put_u64(challenge.seq);
            buf.put_slice(&challenge.data[..]);
        }
        Packet::Payload(payload) => {
            if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
                return Err(PacketError::InvalidBody {
                    packet_type,
                    len: payload.len(),
                });
            }
            buf.put_slice(payload);
        }
    }

    let ad = associated_data(application_id, packet_type);
    let tag =
        crypto::seal(key, seq, &ad, &mut buf[HEADER_SIZE..]).map_err(|_| PacketError::Decrypt)?;
    buf.put_slice(&tag);
    Ok(buf.freeze())
}

/// Reads the type of a packet without decrypting it.
///
/// # Errors
///
/// Errors if the packet is empty or the type byte is unknown.
pub fn peek_type(data: &[u8]) -> Result<PacketType, PacketError> {
    let &first = data.first().ok_or(PacketError::TooShort { len: 0 })?;
    PacketType::try_from(first)
}

/// Decrypts a packet sealed by [`seal`], returning its sequence and
/// contents.
///
/// # Errors
///
/// Errors if the packet is malformed, or was not sealed with `key` for
/// `application_id`.
pub fn open(
    data: &[u8],
    key: &SymmetricKey,
    application_id: u64,
) -> Result<(u64, Packet), PacketError> {
    let len = data.len();
    if len < MIN_SEALED_SIZE {
        return Err(PacketError::TooShort { len });
    }
    if len > MAX_PACKET_SIZE {
        return Err(PacketError::TooLong { len });
    }
    let packet_type = PacketType::try_from(data[0])?;
    let body_len = len - MIN_SEALED_SIZE;
    let body_valid = match packet_type {
        PacketType::ConnectToken => {
            return Err(PacketError::InvalidType {
                packet_type: data[0],
            });
        }
        PacketType::Accepted => body_len == ACCEPTED_BODY_SIZE,
        PacketType::Denied | PacketType::KeepAlive | PacketType::Disconnect => body_len == 0,
        PacketType::ChallengeRequest | PacketType::ChallengeResponse => {
            body_len == CHALLENGE_BODY_SIZE
        }
        PacketType::Payload => (1..=MAX_PAYLOAD_SIZE).contains(&body_len),
    };
    if !body_valid {
        return Err(PacketError::InvalidBody {
            packet_type,
            len: body_len,
        });
    }

    let mut seq = [0; 8];
    seq.copy_from_slice(&data[1..HEADER_SIZE]);
    let seq = u64::from_be_bytes(seq);
    let mut tag = [0; TAG_SIZE];
    tag.copy_from_slice(&data[len - TAG_SIZE..]);
    let mut body = BytesMut::from(&data[HEADER_SIZE..len - TAG_SIZE]);
    let ad = associated_data(application_id, packet_type);
    crypto::open(key, seq, &ad, &mut body, &tag).map_err(|_| PacketError::Decrypt)?;

    let packet = match packet_type {
        PacketType::ConnectToken => {
            return Err(PacketError::InvalidType {
                packet_type: data[0],
            });
        }
        PacketType::Accepted => {
            let mut client_id = [0; 8];
            client_id.copy_from_slice(&body[..8]);
            let word = |i: usize| {
                let mut bytes = [0; 4];
                bytes.copy_from_slice(&body[8 + i * 4..12 + i * 4]);
                u32::from_be_bytes(bytes)
            };
            Packet::Accepted {
                client_id: u64::from_be_bytes(client_id),
                client_index: word(0),
                max_clients: word(1),
                timeout_secs: word(2),
            }
        }
        PacketType::Denied => Packet::Denied,
        PacketType::KeepAlive => Packet::KeepAlive,
        PacketType::Disconnect => Packet::Disconnect,
        PacketType::ChallengeRequest | PacketType::ChallengeResponse => {
            let mut challenge_seq = [0; 8];
            challenge_seq.copy_from_slice(&body[..8]);
            let mut data = Box::new([0; CHALLENGE_DATA_SIZE]);
            data.copy_from_slice(&body[8..]);
            let challenge = Challenge {
                seq: u64::from_be_bytes(challenge_seq),
                data,
            };
            if packet_type == PacketType::ChallengeRequest {
                Packet::ChallengeRequest(challenge)
            } else {
                Packet::ChallengeResponse(challenge)
            }
        }
        PacketType::Payload => Packet::Payload(body.freeze()),
    };
    Ok((seq, packet))
}
