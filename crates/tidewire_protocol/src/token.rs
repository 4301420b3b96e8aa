//! Connect token generation and validation.
//!
//! A connect token is 1114 bytes, made of two parts:
//! - a 90-byte section which only the client reads, holding the keys the
//!   client will encrypt its connection with
//! - the 1024-byte *connect token packet*, which the client sends verbatim to
//!   the server as the first packet of the handshake
//!
//! The packet starts with a public section which both sides can read
//! (expiry, handshake timeout, and the list of server endpoints), followed by
//! a secret section sealed with a key only the servers can derive, and an
//! Ed25519 signature over everything before it.
//!
//! ```text
//! client section
//!   [0..10)    version info
//!   [10..18)   application id
//!   [18..26)   creation timestamp
//!   [26..58)   client-to-server key
//!   [58..90)   server-to-client key
//! connect token packet
//!   [0]        packet type (0)
//!   [1..11)    version info
//!   [11..19)   application id
//!   [19..27)   expiration timestamp
//!   [27..31)   handshake timeout in seconds
//!   [31..35)   endpoint count
//!   [35..568)  endpoints, zero padded
//!   [568..592) XChaCha20 nonce
//!   [592..944) sealed: client id, creation timestamp, client-to-server key,
//!              server-to-client key, user data, 16 zero bytes
//!   [944..960) Poly1305 tag, authenticating [0..568) as associated data
//!   [960..1024) Ed25519 signature over [0..960)
//! ```
//!
//! All integers are big-endian. Timestamps are in seconds since the Unix
//! epoch.

use {
    crate::{
        MAX_SERVERS_PER_CONNECT, USER_DATA_SIZE, VERSION_INFO, VERSION_INFO_SIZE,
        crypto::{self, KEY_SIZE, SIGNATURE_SIZE, SecretKey, SymmetricKey, TAG_SIZE, XNONCE_SIZE},
        packet::PacketType,
    },
    core::{
        convert::Infallible,
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    },
    derive_more::{Display, Error},
    octs::{BufMut, BytesMut, Decode, Read},
};

/// Length of a full connect token.
pub const CONNECT_TOKEN_SIZE: usize = CLIENT_SECTION_SIZE + CONNECT_TOKEN_PACKET_SIZE;

/// Length of the part of a connect token which only the client reads.
pub const CLIENT_SECTION_SIZE: usize = 90;

/// Length of the connect token packet sent to the server.
pub const CONNECT_TOKEN_PACKET_SIZE: usize = 1024;

/// Length of the area in the connect token packet which holds the endpoints.
pub const ENDPOINTS_SIZE: usize = 533;

const ENDPOINTS_START: usize = 35;
const SECRET_START: usize = ENDPOINTS_START + ENDPOINTS_SIZE;
const SEALED_START: usize = SECRET_START + XNONCE_SIZE;
const SEALED_SIZE: usize = 8 + 8 + KEY_SIZE + KEY_SIZE + USER_DATA_SIZE + 16;
const TAG_START: usize = SEALED_START + SEALED_SIZE;
const SIGNATURE_START: usize = TAG_START + TAG_SIZE;

const ENDPOINT_IPV4: u8 = 1;
const ENDPOINT_IPV6: u8 = 2;

/// Failed to generate or validate a connect token.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TokenError {
    /// Token is not the expected length.
    #[display("token is {len} bytes, expected {expected}")]
    InvalidSize {
        /// Length of the token.
        len: usize,
        /// Expected length.
        expected: usize,
    },
    /// Packet type byte is not the connect token type.
    #[display("invalid packet type {packet_type}")]
    InvalidPacketType {
        /// Type byte read.
        packet_type: u8,
    },
    /// Version info does not match [`VERSION_INFO`].
    #[display("invalid version info")]
    InvalidVersion,
    /// Token was issued for a different application.
    #[display("application id {found} does not match {expected}")]
    ApplicationIdMismatch {
        /// Application id we expected.
        expected: u64,
        /// Application id in the token.
        found: u64,
    },
    /// Token expired before it was used.
    #[display("token expired at {expiration_timestamp}, now is {current_timestamp}")]
    Expired {
        /// When the token expired.
        expiration_timestamp: u64,
        /// Current time.
        current_timestamp: u64,
    },
    /// Token was created after it expired.
    #[display("token created at {creation_timestamp} after expiring at {expiration_timestamp}")]
    CreatedAfterExpiry {
        /// When the token was created.
        creation_timestamp: u64,
        /// When the token expires.
        expiration_timestamp: u64,
    },
    /// Token lists no endpoints, or more than [`MAX_SERVERS_PER_CONNECT`].
    #[display("invalid endpoint count {count}")]
    InvalidEndpointCount {
        /// Number of endpoints.
        count: usize,
    },
    /// Endpoints do not fit in [`ENDPOINTS_SIZE`] bytes.
    #[display("endpoints take {len} bytes, max is {ENDPOINTS_SIZE}")]
    EndpointsTooLarge {
        /// Number of bytes needed.
        len: usize,
    },
    /// An endpoint could not be decoded.
    #[display("invalid endpoint {index}")]
    InvalidEndpoint {
        /// Index of the endpoint.
        index: usize,
    },
    /// User data is longer than [`USER_DATA_SIZE`].
    #[display("user data is {len} bytes, max is {USER_DATA_SIZE}")]
    UserDataTooLarge {
        /// Length of the user data.
        len: usize,
    },
    /// Signature does not match the token contents.
    #[display("invalid signature")]
    InvalidSignature,
    /// Secret section could not be decrypted.
    #[display("failed to decrypt secret section")]
    DecryptFailed,
}

/// Connect token as read by the client, see [`ConnectToken::read`].
#[derive(Debug, Clone)]
pub struct ConnectToken {
    /// Application this token is for.
    pub application_id: u64,
    /// When this token was created.
    pub creation_timestamp: u64,
    /// When this token expires.
    pub expiration_timestamp: u64,
    /// How long the client may wait for a server response during the
    /// handshake before giving up on an endpoint, in seconds.
    pub handshake_timeout_secs: u32,
    /// Servers the client may connect to, in order of preference.
    pub endpoints: Vec<SocketAddr>,
    /// Key the client encrypts packets to the server with.
    pub client_to_server_key: SymmetricKey,
    /// Key the server encrypts packets to the client with.
    pub server_to_client_key: SymmetricKey,
    /// Connect token packet to send to the server.
    pub packet: Box<[u8; CONNECT_TOKEN_PACKET_SIZE]>,
}

/// Connect token packet as opened by a server, see
/// [`ConnectTokenPacket::open`].
#[derive(Debug, Clone)]
pub struct ConnectTokenPacket {
    /// Application this token is for.
    pub application_id: u64,
    /// When this token expires.
    pub expiration_timestamp: u64,
    /// Handshake timeout in seconds.
    pub handshake_timeout_secs: u32,
    /// Servers the client may connect to.
    pub endpoints: Vec<SocketAddr>,
    /// Unique identifier of the client, assigned by the token issuer.
    pub client_id: u64,
    /// When this token was created.
    pub creation_timestamp: u64,
    /// Key the client encrypts packets to the server with.
    pub client_to_server_key: SymmetricKey,
    /// Key the server encrypts packets to the client with.
    pub server_to_client_key: SymmetricKey,
    /// Opaque data from the token issuer, zero padded.
    pub user_data: Box<[u8; USER_DATA_SIZE]>,
    /// Signature of the token, unique per token.
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Creates a connect token allowing the client `client_id` to connect to any
/// of `endpoints`.
///
/// # Errors
///
/// Errors if the token cannot hold the given endpoints or user data, or if
/// it would expire before being created.
pub fn generate_connect_token(
    application_id: u64,
    creation_timestamp: u64,
    client_to_server_key: &SymmetricKey,
    server_to_client_key: &SymmetricKey,
    expiration_timestamp: u64,
    handshake_timeout_secs: u32,
    endpoints: &[SocketAddr],
    client_id: u64,
    user_data: &[u8],
    secret_key: &SecretKey,
) -> Result<[u8; CONNECT_TOKEN_SIZE], TokenError> {
    if endpoints.is_empty() || endpoints.len() > MAX_SERVERS_PER_CONNECT {
        return Err(TokenError::InvalidEndpointCount {
            count: endpoints.len(),
        });
    }
    let endpoints_len = endpoints.iter().map(|addr| endpoint_len(*addr)).sum::<usize>();
    if endpoints_len > ENDPOINTS_SIZE {
        return Err(TokenError::EndpointsTooLarge { len: endpoints_len });
    }
    if user_data.len() > USER_DATA_SIZE {
        return Err(TokenError::UserDataTooLarge {
            len: user_data.len(),
        });
    }
    if creation_timestamp > expiration_timestamp {
        return Err(TokenError::CreatedAfterExpiry {
            creation_timestamp,
            expiration_timestamp,
        });
    }
    let endpoint_count =
        u32::try_from(endpoints.len()).map_err(|_| TokenError::InvalidEndpointCount {
            count: endpoints.len(),
        })?;

    let mut buf = BytesMut::with_capacity(CONNECT_TOKEN_SIZE);

    // client section
    buf.put_slice(VERSION_INFO);
    buf.put_u64(application_id);
    buf.put_u64(creation_timestamp);
    buf.put_slice(client_to_server_key.as_bytes());
    buf.put_slice(server_to_client_key.as_bytes());

    // public section of the packet
    let packet_start = buf.len();
    buf.put_u8(PacketType::ConnectToken as u8);
    buf.put_slice(VERSION_INFO);
    buf.put_u64(application_id);
    buf.put_u64(expiration_timestamp);
    buf.put_u32(handshake_timeout_secs);
    buf.put_u32(endpoint_count);
    for addr in endpoints {
        write_endpoint(&mut buf, *addr);
    }
    buf.resize(packet_start + SECRET_START, 0);

    // secret section
    let mut nonce = [0; XNONCE_SIZE];
    crypto::random_bytes(&mut nonce);
    buf.put_slice(&nonce);
    buf.put_u64(client_id);
    buf.put_u64(creation_timestamp);
    buf.put_slice(client_to_server_key.as_bytes());
    buf.put_slice(server_to_client_key.as_bytes());
    buf.put_slice(user_data);
    buf.resize(packet_start + TAG_START, 0);

    let mut token = [0; CONNECT_TOKEN_SIZE];
    token[..buf.len()].copy_from_slice(&buf);

    let packet = &mut token[packet_start..];
    let (public, rest) = packet.split_at_mut(SECRET_START);
    let sealed = &mut rest[XNONCE_SIZE..XNONCE_SIZE + SEALED_SIZE];
    let tag = crypto::seal_x(&secret_key.token_key(), &nonce, public, sealed)
        .map_err(|_| TokenError::DecryptFailed)?;
    packet[TAG_START..SIGNATURE_START].copy_from_slice(&tag);

    let signature = secret_key.sign(&packet[..SIGNATURE_START]);
    packet[SIGNATURE_START..].copy_from_slice(&signature);
    Ok(token)
}

impl ConnectToken {
    /// Reads a connect token received from the token issuer.
    ///
    /// This only checks what the client can check; the secret section and
    /// signature are validated by the server.
    ///
    /// # Errors
    ///
    /// Errors if the token is malformed.
    pub fn read(token: &[u8]) -> Result<Self, TokenError> {
        if token.len() != CONNECT_TOKEN_SIZE {
            return Err(TokenError::InvalidSize {
                len: token.len(),
                expected: CONNECT_TOKEN_SIZE,
            });
        }
        let (mut src, packet) = token.split_at(CLIENT_SECTION_SIZE);

        if take::<VERSION_INFO_SIZE>(&mut src)? != *VERSION_INFO {
            return Err(TokenError::InvalidVersion);
        }
        let application_id = read::<u64>(&mut src)?;
        let creation_timestamp = read::<u64>(&mut src)?;
        let client_to_server_key = SymmetricKey::from_bytes(take(&mut src)?);
        let server_to_client_key = SymmetricKey::from_bytes(take(&mut src)?);

        let public = read_public(packet, application_id)?;
        if creation_timestamp > public.expiration_timestamp {
            return Err(TokenError::CreatedAfterExpiry {
                creation_timestamp,
                expiration_timestamp: public.expiration_timestamp,
            });
        }

        let mut packet_bytes = Box::new([0; CONNECT_TOKEN_PACKET_SIZE]);
        packet_bytes.copy_from_slice(packet);
        Ok(Self {
            application_id,
            creation_timestamp,
            expiration_timestamp: public.expiration_timestamp,
            handshake_timeout_secs: public.handshake_timeout_secs,
            endpoints: public.endpoints,
            client_to_server_key,
            server_to_client_key,
            packet: packet_bytes,
        })
    }

    /// Returns `true` if this token has expired at `current_timestamp`.
    #[must_use]
    pub const fn is_expired(&self, current_timestamp: u64) -> bool {
        current_timestamp > self.expiration_timestamp
    }
}

impl ConnectTokenPacket {
    /// Validates and decrypts a connect token packet received from a client.
    ///
    /// # Errors
    ///
    /// Errors if the packet is malformed, was issued for another
    /// application, has expired, was not signed by `secret_key`, or cannot be
    /// decrypted.
    pub fn open(
        packet: &[u8],
        application_id: u64,
        current_timestamp: u64,
        secret_key: &SecretKey,
    ) -> Result<Self, TokenError> {
        if packet.len() != CONNECT_TOKEN_PACKET_SIZE {
            return Err(TokenError::InvalidSize {
                len: packet.len(),
                expected: CONNECT_TOKEN_PACKET_SIZE,
            });
        }
        let public = read_public(packet, application_id)?;
        if current_timestamp > public.expiration_timestamp {
            return Err(TokenError::Expired {
                expiration_timestamp: public.expiration_timestamp,
                current_timestamp,
            });
        }

        let mut signature = [0; SIGNATURE_SIZE];
        signature.copy_from_slice(&packet[SIGNATURE_START..]);
        secret_key
            .public_key()
            .verify(&packet[..SIGNATURE_START], &signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let mut nonce = [0; XNONCE_SIZE];
        nonce.copy_from_slice(&packet[SECRET_START..SEALED_START]);
        let mut tag = [0; TAG_SIZE];
        tag.copy_from_slice(&packet[TAG_START..SIGNATURE_START]);
        let mut sealed = [0; SEALED_SIZE];
        sealed.copy_from_slice(&packet[SEALED_START..TAG_START]);
        crypto::open_x(
            &secret_key.token_key(),
            &nonce,
            &packet[..SECRET_START],
            &mut sealed,
            &tag,
        )
        .map_err(|_| TokenError::DecryptFailed)?;

        let mut src = &sealed[..];
        let client_id = read::<u64>(&mut src)?;
        let creation_timestamp = read::<u64>(&mut src)?;
        let client_to_server_key = SymmetricKey::from_bytes(take(&mut src)?);
        let server_to_client_key = SymmetricKey::from_bytes(take(&mut src)?);
        let user_data = Box::new(take::<USER_DATA_SIZE>(&mut src)?);
        if creation_timestamp > public.expiration_timestamp {
            return Err(TokenError::CreatedAfterExpiry {
                creation_timestamp,
                expiration_timestamp: public.expiration_timestamp,
            });
        }

        Ok(Self {
            application_id,
            expiration_timestamp: public.expiration_timestamp,
            handshake_timeout_secs: public.handshake_timeout_secs,
            endpoints: public.endpoints,
            client_id,
            creation_timestamp,
            client_to_server_key,
            server_to_client_key,
            user_data,
            signature,
        })
    }
}

struct PublicSection {
    expiration_timestamp: u64,
    handshake_timeout_secs: u32,
    endpoints: Vec<SocketAddr>,
}

fn read_public(packet: &[u8], application_id: u64) -> Result<PublicSection, TokenError> {
    let mut src = &packet[..ENDPOINTS_START];
    let packet_type = read::<u8>(&mut src)?;
    if packet_type != PacketType::ConnectToken as u8 {
        return Err(TokenError::InvalidPacketType { packet_type });
    }
    if take::<VERSION_INFO_SIZE>(&mut src)? != *VERSION_INFO {
        return Err(TokenError::InvalidVersion);
    }
    let found = read::<u64>(&mut src)?;
    if found != application_id {
        return Err(TokenError::ApplicationIdMismatch {
            expected: application_id,
            found,
        });
    }
    let expiration_timestamp = read::<u64>(&mut src)?;
    let handshake_timeout_secs = read::<u32>(&mut src)?;
    let count = usize::try_from(read::<u32>(&mut src)?).unwrap_or(usize::MAX);
    if count == 0 || count > MAX_SERVERS_PER_CONNECT {
        return Err(TokenError::InvalidEndpointCount { count });
    }

    let mut src = &packet[ENDPOINTS_START..SECRET_START];
    let endpoints = (0..count)
        .map(|index| read_endpoint(&mut src).ok_or(TokenError::InvalidEndpoint { index }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PublicSection {
        expiration_timestamp,
        handshake_timeout_secs,
        endpoints,
    })
}

const fn endpoint_len(addr: SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

fn write_endpoint(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(ENDPOINT_IPV4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(ENDPOINT_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn read_endpoint(src: &mut &[u8]) -> Option<SocketAddr> {
    let ip = match src.read::<u8>().ok()? {
        ENDPOINT_IPV4 => IpAddr::V4(Ipv4Addr::from(take::<4>(src).ok()?)),
        ENDPOINT_IPV6 => IpAddr::V6(Ipv6Addr::from(take::<16>(src).ok()?)),
        _ => return None,
    };
    let port = src.read::<u16>().ok()?;
    Some(SocketAddr::new(ip, port))
}

// lengths are checked up front, so running out of bytes means the layout
// itself is inconsistent
fn read<T: Decode<Error = Infallible>>(src: &mut &[u8]) -> Result<T, TokenError> {
    src.read::<T>().map_err(|_| TokenError::InvalidSize {
        len: 0,
        expected: CONNECT_TOKEN_SIZE,
    })
}

fn take<const N: usize>(src: &mut &[u8]) -> Result<[u8; N], TokenError> {
    let (head, rest) = src
        .split_first_chunk::<N>()
        .ok_or(TokenError::InvalidSize {
            len: src.len(),
            expected: N,
        })?;
    *src = rest;
    Ok(*head)
}
