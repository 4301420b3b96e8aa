//! See [`Client`].

use {
    crate::{
        DISCONNECT_REDUNDANCY, HANDSHAKE_SEND_INTERVAL, KEEP_ALIVE_INTERVAL, MAX_PACKET_SIZE,
        link::Link,
        packet::{Challenge, Packet},
        token::{ConnectToken, TokenError},
    },
    core::{net::SocketAddr, time::Duration},
    derive_more::{Display, Error},
    octs::Bytes,
    tidewire_io::DatagramSocket,
    tidewire_transport::{
        seq::PacketSeq,
        transport::{SendError, Transport, TransportConfig, TransportConfigError},
    },
    tracing::{debug, info, trace, trace_span, warn},
};

/// Configuration for a [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Config of the transport used once connected.
    ///
    /// Must match the server's transport config.
    pub transport: TransportConfig,
    /// If nothing has been sent to the server for this long, a keepalive
    /// packet is sent.
    ///
    /// Default: [`KEEP_ALIVE_INTERVAL`].
    pub keep_alive_interval: Duration,
    /// How often the current handshake packet is resent while connecting.
    ///
    /// Default: [`HANDSHAKE_SEND_INTERVAL`].
    pub handshake_send_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            handshake_send_interval: HANDSHAKE_SEND_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Sets [`ClientConfig::transport`].
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets [`ClientConfig::keep_alive_interval`].
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, keep_alive_interval: Duration) -> Self {
        self.keep_alive_interval = keep_alive_interval;
        self
    }

    /// Sets [`ClientConfig::handshake_send_interval`].
    #[must_use]
    pub const fn with_handshake_send_interval(mut self, handshake_send_interval: Duration) -> Self {
        self.handshake_send_interval = handshake_send_interval;
        self
    }

    /// Checks that this config can be used to build a [`Client`].
    ///
    /// # Errors
    ///
    /// Errors if the transport config is invalid.
    pub fn validate(&self) -> Result<(), TransportConfigError> {
        self.transport.validate()
    }
}

/// Connection state of a [`Client`].
///
/// Every state has a stable integer code, see [`ClientState::code`]. Negative
/// codes are error states, which the client stays in until
/// [`Client::connect`] is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Connect token expired before the handshake completed.
    ConnectTokenExpired,
    /// Connect token could not be read.
    InvalidConnectToken,
    /// Server stopped responding while connected.
    ConnectionTimedOut,
    /// Server did not accept the challenge response in time.
    ChallengeResponseTimedOut,
    /// No server responded to the connect token in time.
    ConnectionRequestTimedOut,
    /// Server is full.
    ConnectionDenied,
    /// Not connected, and not trying to connect.
    Disconnected,
    /// Sending the connect token to the server.
    SendingConnectionRequest,
    /// Echoing the server's challenge back to it.
    SendingChallengeResponse,
    /// Connected, and able to exchange messages.
    Connected,
}

impl ClientState {
    /// Gets the stable integer code of this state.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ConnectTokenExpired => -6,
            Self::InvalidConnectToken => -5,
            Self::ConnectionTimedOut => -4,
            Self::ChallengeResponseTimedOut => -3,
            Self::ConnectionRequestTimedOut => -2,
            Self::ConnectionDenied => -1,
            Self::Disconnected => 0,
            Self::SendingConnectionRequest => 1,
            Self::SendingChallengeResponse => 2,
            Self::Connected => 3,
        }
    }

    /// Returns `true` if this is an error state.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.code() < 0
    }

    /// Returns `true` if the handshake is in progress.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::SendingConnectionRequest | Self::SendingChallengeResponse
        )
    }
}

/// Failed to start connecting with [`Client::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ConnectError {
    /// Connect token could not be read.
    #[display("invalid connect token")]
    InvalidToken(TokenError),
    /// Connect token has already expired.
    #[display("connect token expired at {expiration_timestamp}, now is {current_timestamp}")]
    Expired {
        /// When the token expired.
        expiration_timestamp: u64,
        /// Current time.
        current_timestamp: u64,
    },
}

/// Failed to send a message with [`Client::send`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ClientSendError {
    /// Client is not connected.
    #[display("not connected")]
    NotConnected,
    /// Transport refused the message.
    #[display("transport refused message")]
    Transport(SendError),
}

impl From<SendError> for ClientSendError {
    fn from(value: SendError) -> Self {
        Self::Transport(value)
    }
}

/// Estimated bandwidth of a connection, in kilobits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bandwidth {
    /// Bandwidth used by packets we sent.
    pub outgoing_kbps: f32,
    /// Bandwidth used by packets we received.
    pub incoming_kbps: f32,
}

#[derive(Debug, Clone, Copy)]
struct Accepted {
    client_id: u64,
    client_index: u32,
    max_clients: u32,
    timeout: Duration,
}

/// Client side of a connection to a server.
///
/// The client is driven by calling [`Client::update`] regularly, which
/// receives everything waiting on the socket, advances the handshake or the
/// transport, and sends whatever needs sending. Nothing happens between
/// updates.
///
/// # Usage
///
/// ```no_run
/// use {core::time::Duration, tidewire_io::udp::UdpDatagramSocket};
/// use tidewire_protocol::client::{Client, ClientConfig, ClientState};
///
/// # fn run(token: &[u8], now: impl Fn() -> u64) -> Result<(), Box<dyn core::error::Error>> {
/// let socket = UdpDatagramSocket::bind("0.0.0.0:0")?;
/// let mut client = Client::new(socket, ClientConfig::default())?;
/// client.connect(token, now())?;
///
/// let dt = Duration::from_millis(16);
/// while client.state().is_connecting() {
///     client.update(dt, now());
///     // sleep for `dt`
/// }
/// if client.state() == ClientState::Connected {
///     client.send(b"hello", true)?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client<S> {
    socket: S,
    config: ClientConfig,
    state: ClientState,
    time: Duration,
    token: Option<ConnectToken>,
    endpoint_index: usize,
    link: Option<Link>,
    // never reset, as a token may be reused across endpoints and connects
    next_seq: u64,
    last_progress_at: Duration,
    challenge: Option<Challenge>,
    accepted: Option<Accepted>,
    transport: Transport,
    recv_buf: Box<[u8; MAX_PACKET_SIZE]>,
}

impl<S: DatagramSocket> Client<S> {
    /// Creates a disconnected client which sends and receives on `socket`.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid.
    pub fn new(socket: S, config: ClientConfig) -> Result<Self, TransportConfigError> {
        let transport = Transport::new(config.transport.clone())?;
        Ok(Self {
            socket,
            config,
            state: ClientState::Disconnected,
            time: Duration::ZERO,
            token: None,
            endpoint_index: 0,
            link: None,
            next_seq: 0,
            last_progress_at: Duration::ZERO,
            challenge: None,
            accepted: None,
            transport,
            recv_buf: Box::new([0; MAX_PACKET_SIZE]),
        })
    }

    /// Gets the config this client was created with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Gets the socket this client uses.
    #[must_use]
    pub const fn socket(&self) -> &S {
        &self.socket
    }

    /// Gets mutable access to the socket this client uses.
    #[must_use]
    pub const fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Gets the current state.
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Gets the total time passed into [`Client::update`].
    #[must_use]
    pub const fn time(&self) -> Duration {
        self.time
    }

    /// Gets the slot the server assigned us, if connected.
    #[must_use]
    pub fn client_index(&self) -> Option<usize> {
        self.accepted
            .and_then(|accepted| usize::try_from(accepted.client_index).ok())
    }

    /// Gets the client id our connect token was issued for, if connected.
    #[must_use]
    pub fn client_id(&self) -> Option<u64> {
        self.accepted.map(|accepted| accepted.client_id)
    }

    /// Gets the number of slots on the server, if connected.
    #[must_use]
    pub fn max_clients(&self) -> Option<usize> {
        self.accepted
            .and_then(|accepted| usize::try_from(accepted.max_clients).ok())
    }

    /// Gets the address of the server we are connecting or connected to.
    #[must_use]
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|link| link.addr)
    }

    /// Gets the transport which carries messages once connected.
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Gets the smoothed round-trip time to the server.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.transport.ack_system().rtt()
    }

    /// Gets the smoothed fraction of packets sent which were lost, from 0 to
    /// 1.
    #[must_use]
    pub const fn packet_loss(&self) -> f32 {
        self.transport.ack_system().packet_loss()
    }

    /// Gets the estimated bandwidth of the connection.
    #[must_use]
    pub const fn bandwidth(&self) -> Bandwidth {
        let acks = self.transport.ack_system();
        Bandwidth {
            outgoing_kbps: acks.outgoing_bandwidth_kbps(),
            incoming_kbps: acks.incoming_bandwidth_kbps(),
        }
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Client state changed");
            self.state = state;
        }
    }

    fn reset_connection(&mut self) {
        self.link = None;
        self.challenge = None;
        self.accepted = None;
        self.transport.reset();
    }

    fn fail(&mut self, state: ClientState) {
        info!(code = state.code(), "Connection failed: {state:?}");
        self.reset_connection();
        self.token = None;
        self.set_state(state);
    }

    /// Starts connecting with a connect token given by the token issuer.
    ///
    /// Any existing connection is dropped without notifying the server; call
    /// [`Client::disconnect`] first to disconnect cleanly.
    ///
    /// `current_timestamp` is the current time in seconds since the Unix
    /// epoch.
    ///
    /// # Errors
    ///
    /// Errors if the token is invalid or expired. The client moves to
    /// [`ClientState::InvalidConnectToken`] or
    /// [`ClientState::ConnectTokenExpired`] in this case.
    pub fn connect(&mut self, token: &[u8], current_timestamp: u64) -> Result<(), ConnectError> {
        self.reset_connection();
        self.token = None;
        let token = match ConnectToken::read(token) {
            Ok(token) => token,
            Err(err) => {
                self.fail(ClientState::InvalidConnectToken);
                return Err(ConnectError::InvalidToken(err));
            }
        };
        if token.is_expired(current_timestamp) {
            self.fail(ClientState::ConnectTokenExpired);
            return Err(ConnectError::Expired {
                expiration_timestamp: token.expiration_timestamp,
                current_timestamp,
            });
        }

        self.token = Some(token);
        self.endpoint_index = 0;
        self.begin_endpoint();
        Ok(())
    }

    fn begin_endpoint(&mut self) {
        let Some(token) = &self.token else {
            return;
        };
        let Some(&addr) = token.endpoints.get(self.endpoint_index) else {
            return;
        };
        info!(%addr, "Connecting to server {}/{}", self.endpoint_index + 1, token.endpoints.len());
        let link = Link::new(
            addr,
            token.client_to_server_key.clone(),
            token.server_to_client_key.clone(),
            token.application_id,
            self.time,
        );
        self.reset_connection();
        self.link = Some(link);
        self.last_progress_at = self.time;
        self.set_state(ClientState::SendingConnectionRequest);
        self.send_handshake();
    }

    fn send_handshake(&mut self) {
        let (Some(link), Some(token)) = (&mut self.link, &self.token) else {
            return;
        };
        match self.state {
            ClientState::SendingConnectionRequest => {
                if let Err(err) = self.socket.send_to(&token.packet[..], link.addr) {
                    warn!("Failed to send connect token to {}: {err}", link.addr);
                }
                link.last_sent_at = self.time;
            }
            ClientState::SendingChallengeResponse => {
                if let Some(challenge) = &self.challenge {
                    let packet = Packet::ChallengeResponse(challenge.clone());
                    link.send(&mut self.socket, &mut self.next_seq, &packet, self.time);
                }
            }
            _ => {}
        }
    }

    /// Disconnects from the server.
    ///
    /// If connected, the server is notified with a burst of
    /// [`DISCONNECT_REDUNDANCY`] disconnect packets.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Connected {
            if let Some(link) = &mut self.link {
                for _ in 0..DISCONNECT_REDUNDANCY {
                    link.send(
                        &mut self.socket,
                        &mut self.next_seq,
                        &Packet::Disconnect,
                        self.time,
                    );
                }
            }
            info!("Disconnected from server");
        }
        self.reset_connection();
        self.token = None;
        self.set_state(ClientState::Disconnected);
    }

    /// Sends a message to the server.
    ///
    /// Reliable messages are received in the order they were sent, and
    /// resent until acknowledged. Unreliable messages must fit in a single
    /// packet.
    ///
    /// # Errors
    ///
    /// Errors if not connected, or if the transport refused the message.
    pub fn send(&mut self, msg: &[u8], reliable: bool) -> Result<(), ClientSendError> {
        if self.state != ClientState::Connected {
            return Err(ClientSendError::NotConnected);
        }
        let Self {
            socket,
            link,
            next_seq,
            transport,
            time,
            ..
        } = self;
        let link = link.as_mut().ok_or(ClientSendError::NotConnected)?;
        let send = |_: PacketSeq, packet: &[u8]| {
            let packet = Packet::Payload(Bytes::copy_from_slice(packet));
            link.send(socket, next_seq, &packet, *time);
        };
        if reliable {
            transport.send_reliably_and_in_order(msg, send)?;
        } else {
            transport.send_unreliable(msg, send)?;
        }
        Ok(())
    }

    /// Takes the next message received from the server.
    ///
    /// Reliable messages are returned in order before any unreliable ones.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.transport
            .receive()
            .or_else(|| self.transport.receive_unreliable())
    }

    /// Advances time by `dt`, processing everything received and sending
    /// whatever is due.
    ///
    /// `current_timestamp` is the current time in seconds since the Unix
    /// epoch, used to check token expiry.
    pub fn update(&mut self, dt: Duration, current_timestamp: u64) {
        let span = trace_span!("client", server = ?self.server_address());
        let _span = span.enter();

        self.time += dt;
        self.socket.update(dt);
        self.receive_packets();

        if self.state.is_connecting() {
            self.update_handshake(current_timestamp);
        } else if self.state == ClientState::Connected {
            self.update_connected(dt);
        }
    }

    fn receive_packets(&mut self) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf[..]) {
                Ok(Some(recv)) => recv,
                Ok(None) => break,
                Err(err) => {
                    warn!("Failed to receive: {err}");
                    break;
                }
            };
            let data = Bytes::copy_from_slice(&self.recv_buf[..len]);
            self.handle_packet(from, &data);
        }
    }

    fn handle_packet(&mut self, from: SocketAddr, data: &[u8]) {
        let Some(link) = &mut self.link else {
            return;
        };
        if from != link.addr {
            trace!(%from, "Dropped packet from unknown address");
            return;
        }
        let packet = match link.open(data, self.time) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(%from, "Dropped packet: {err}");
                return;
            }
        };

        match (self.state, packet) {
            (ClientState::SendingConnectionRequest, Packet::ChallengeRequest(challenge)) => {
                debug!(seq = challenge.seq, "Received challenge");
                self.challenge = Some(challenge);
                self.last_progress_at = self.time;
                self.set_state(ClientState::SendingChallengeResponse);
                self.send_handshake();
            }
            (
                ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse,
                Packet::Denied,
            ) => {
                self.fail(ClientState::ConnectionDenied);
            }
            (
                ClientState::SendingChallengeResponse,
                Packet::Accepted {
                    client_id,
                    client_index,
                    max_clients,
                    timeout_secs,
                },
            ) => {
                info!(client_id, client_index, "Connected to {from}");
                self.accepted = Some(Accepted {
                    client_id,
                    client_index,
                    max_clients,
                    timeout: Duration::from_secs(u64::from(timeout_secs)),
                });
                self.challenge = None;
                self.set_state(ClientState::Connected);
            }
            (ClientState::Connected, Packet::Payload(payload)) => {
                if let Err(err) = self.transport.receive_packet(payload) {
                    trace!("Dropped payload: {err}");
                }
            }
            (ClientState::Connected, Packet::Disconnect) => {
                info!("Server disconnected us");
                self.reset_connection();
                self.token = None;
                self.set_state(ClientState::Disconnected);
            }
            (state, packet) => {
                trace!(?state, "Ignored {:?} packet", packet.packet_type());
            }
        }
    }

    fn update_handshake(&mut self, current_timestamp: u64) {
        let Some(token) = &self.token else {
            return;
        };
        if token.is_expired(current_timestamp) {
            self.fail(ClientState::ConnectTokenExpired);
            return;
        }

        let timeout = Duration::from_secs(u64::from(token.handshake_timeout_secs));
        if self.time.saturating_sub(self.last_progress_at) >= timeout {
            if self.endpoint_index + 1 < token.endpoints.len() {
                debug!("Handshake timed out, trying next server");
                self.endpoint_index += 1;
                self.begin_endpoint();
            } else if self.state == ClientState::SendingConnectionRequest {
                self.fail(ClientState::ConnectionRequestTimedOut);
            } else {
                self.fail(ClientState::ChallengeResponseTimedOut);
            }
            return;
        }

        let due = self
            .link
            .as_ref()
            .is_some_and(|link| link.quiet_for(self.time) >= self.config.handshake_send_interval);
        if due {
            self.send_handshake();
        }
    }

    fn update_connected(&mut self, dt: Duration) {
        let Self {
            socket,
            link,
            next_seq,
            transport,
            time,
            config,
            accepted,
            ..
        } = self;
        let (Some(link), Some(accepted)) = (link.as_mut(), accepted.as_ref()) else {
            return;
        };
        let now = *time;

        transport.update(dt, |_, packet| {
            let packet = Packet::Payload(Bytes::copy_from_slice(packet));
            link.send(socket, next_seq, &packet, now);
        });
        if link.quiet_for(now) >= config.keep_alive_interval {
            link.send(socket, next_seq, &Packet::KeepAlive, now);
        }
        if link.idle_for(now) > accepted.timeout {
            self.fail(ClientState::ConnectionTimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {
        super::*,
        crate::{
            crypto::{SymmetricKey, sign_keygen},
            packet::{self, CHALLENGE_DATA_SIZE, HEADER_SIZE, PacketType},
            token::generate_connect_token,
        },
        assert_matches::assert_matches,
        tidewire_io::memory::{MemoryNetwork, MemorySocket},
    };

    const NOW: u64 = 1_000;

    fn token(endpoints: &[SocketAddr], expiration: u64) -> [u8; crate::token::CONNECT_TOKEN_SIZE] {
        let (_, secret) = sign_keygen();
        generate_connect_token(
            1,
            NOW,
            &SymmetricKey::generate(),
            &SymmetricKey::generate(),
            expiration,
            1,
            endpoints,
            5,
            b"",
            &secret,
        )
        .unwrap()
    }

    fn client(net: &MemoryNetwork) -> Client<MemorySocket> {
        let socket = net.bind("10.0.0.1:1".parse().unwrap()).unwrap();
        Client::new(socket, ClientConfig::default()).unwrap()
    }

    #[test]
    fn state_codes() {
        assert_eq!(-6, ClientState::ConnectTokenExpired.code());
        assert_eq!(-1, ClientState::ConnectionDenied.code());
        assert_eq!(0, ClientState::Disconnected.code());
        assert_eq!(3, ClientState::Connected.code());
        assert!(ClientState::ConnectionTimedOut.is_error());
        assert!(!ClientState::Disconnected.is_error());
        assert!(ClientState::SendingChallengeResponse.is_connecting());
    }

    #[test]
    fn invalid_token() {
        let net = MemoryNetwork::new();
        let mut client = client(&net);
        assert_matches!(
            client.connect(&[0; 100], NOW),
            Err(ConnectError::InvalidToken(_))
        );
        assert_eq!(ClientState::InvalidConnectToken, client.state());
    }

    #[test]
    fn expired_token() {
        let net = MemoryNetwork::new();
        let mut client = client(&net);
        let token = token(&["10.0.0.2:1".parse().unwrap()], NOW + 10);
        assert_matches!(
            client.connect(&token, NOW + 11),
            Err(ConnectError::Expired { .. })
        );
        assert_eq!(ClientState::ConnectTokenExpired, client.state());
    }

    #[test]
    fn token_expires_during_handshake() {
        let net = MemoryNetwork::new();
        let mut client = client(&net);
        let token = token(&["10.0.0.2:1".parse().unwrap()], NOW + 10);
        client.connect(&token, NOW).unwrap();
        client.update(Duration::from_millis(100), NOW + 11);
        assert_eq!(ClientState::ConnectTokenExpired, client.state());
    }

    #[test]
    fn sends_token_until_timeout() {
        let net = MemoryNetwork::new();
        let server_addr: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let mut server = net.bind(server_addr).unwrap();
        let mut client = client(&net);
        client.connect(&token(&[server_addr], NOW + 30), NOW).unwrap();
        assert_eq!(ClientState::SendingConnectionRequest, client.state());
        assert_eq!(Some(server_addr), client.server_address());

        for _ in 0..5 {
            client.update(Duration::from_millis(100), NOW);
        }
        let mut buf = [0; MAX_PACKET_SIZE];
        let mut count = 0;
        while let Some((len, _)) = server.recv_from(&mut buf).unwrap() {
            assert_eq!(1024, len);
            count += 1;
        }
        assert_eq!(6, count);

        for _ in 0..5 {
            client.update(Duration::from_millis(100), NOW);
        }
        assert_eq!(ClientState::ConnectionRequestTimedOut, client.state());
        assert_eq!(None, client.server_address());

        // stays failed, and quiet, until told to connect again
        while server.recv_from(&mut buf).unwrap().is_some() {}
        for _ in 0..20 {
            client.update(Duration::from_millis(100), NOW);
        }
        assert_eq!(ClientState::ConnectionRequestTimedOut, client.state());
        assert_eq!(None, server.recv_from(&mut buf).unwrap());

        client.connect(&token(&[server_addr], NOW + 30), NOW).unwrap();
        assert_eq!(ClientState::SendingConnectionRequest, client.state());
        assert!(server.recv_from(&mut buf).unwrap().is_some());
    }

    #[test]
    fn challenge_responses_never_share_sequence_across_endpoints() {
        let net = MemoryNetwork::new();
        let endpoints: [SocketAddr; 2] =
            ["10.0.0.2:1".parse().unwrap(), "10.0.0.3:1".parse().unwrap()];
        let mut servers = endpoints.map(|addr| net.bind(addr).unwrap());
        let client_addr = "10.0.0.1:1".parse().unwrap();
        let mut client = client(&net);

        let (_, secret) = sign_keygen();
        let s2c = SymmetricKey::generate();
        let token = generate_connect_token(
            1,
            NOW,
            &SymmetricKey::generate(),
            &s2c,
            NOW + 30,
            1,
            &endpoints,
            5,
            b"",
            &secret,
        )
        .unwrap();
        client.connect(&token, NOW).unwrap();

        let mut buf = [0; MAX_PACKET_SIZE];
        let mut response_seqs = Vec::new();
        for (server, server_seq) in servers.iter_mut().zip([0, 1]) {
            // each endpoint answers with its own challenge, then goes silent
            let challenge = Challenge {
                seq: server_seq,
                data: Box::new([0; CHALLENGE_DATA_SIZE]),
            };
            let sealed =
                packet::seal(&Packet::ChallengeRequest(challenge), server_seq, &s2c, 1).unwrap();
            server.send_to(&sealed, client_addr).unwrap();
            for _ in 0..11 {
                client.update(Duration::from_millis(100), NOW);
            }
            while let Some((len, _)) = server.recv_from(&mut buf).unwrap() {
                if packet::peek_type(&buf[..len]).unwrap() == PacketType::ChallengeResponse {
                    let seq = u64::from_be_bytes(buf[1..HEADER_SIZE].try_into().unwrap());
                    response_seqs.push(seq);
                }
            }
        }
        assert_eq!(ClientState::ChallengeResponseTimedOut, client.state());

        assert!(response_seqs.len() > 2);
        let mut unique = response_seqs.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(response_seqs.len(), unique.len());
    }

    #[test]
    fn fails_over_to_next_endpoint() {
        let net = MemoryNetwork::new();
        let first: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let second: SocketAddr = "10.0.0.3:1".parse().unwrap();
        let mut client = client(&net);
        client.connect(&token(&[first, second], NOW + 30), NOW).unwrap();
        assert_eq!(Some(first), client.server_address());

        for _ in 0..10 {
            client.update(Duration::from_millis(100), NOW);
        }
        assert_eq!(ClientState::SendingConnectionRequest, client.state());
        assert_eq!(Some(second), client.server_address());

        for _ in 0..10 {
            client.update(Duration::from_millis(100), NOW);
        }
        assert_eq!(ClientState::ConnectionRequestTimedOut, client.state());
    }

    #[test]
    fn send_requires_connection() {
        let net = MemoryNetwork::new();
        let mut client = client(&net);
        assert_matches!(client.send(b"hi", true), Err(ClientSendError::NotConnected));
        assert_eq!(None, client.recv());
        client.disconnect();
        assert_eq!(ClientState::Disconnected, client.state());
    }
}
