//! See [`Server`].

use {
    crate::{
        DISCONNECT_REDUNDANCY, KEEP_ALIVE_INTERVAL, MAX_CLIENTS, MAX_PACKET_SIZE, USER_DATA_SIZE,
        crypto::{self, SecretKey, SymmetricKey, TAG_SIZE},
        link::Link,
        packet::{self, CHALLENGE_DATA_SIZE, Challenge, Packet, PacketType},
        token::ConnectTokenPacket,
    },
    core::{fmt, net::SocketAddr, time::Duration},
    derive_more::{Display, Error},
    octs::Bytes,
    ringbuf::{
        HeapRb,
        traits::{Consumer, Observer, Producer},
    },
    std::collections::HashMap,
    tidewire_io::DatagramSocket,
    tidewire_transport::{
        seq::PacketSeq,
        transport::{SendError, Transport, TransportConfig, TransportConfigError},
    },
    tracing::{debug, info, trace, trace_span, warn},
};

/// Configuration for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application id which connect tokens must be issued for.
    pub application_id: u64,
    /// Key shared with the token issuer, used to validate connect tokens.
    pub secret_key: SecretKey,
    /// Number of client slots, from 1 to [`MAX_CLIENTS`].
    ///
    /// Default: [`MAX_CLIENTS`].
    pub max_clients: usize,
    /// Number of [`ServerEvent`]s which can be queued before new events are
    /// dropped.
    ///
    /// Default: 1024.
    pub event_capacity: usize,
    /// Number of handshakes which can be in progress at once.
    ///
    /// Default: 256.
    pub max_pending_handshakes: usize,
    /// Number of connect tokens remembered to stop them being used from
    /// another address.
    ///
    /// Default: 1024.
    pub token_history_capacity: usize,
    /// If nothing has been sent to a client for this long, a keepalive packet
    /// is sent.
    ///
    /// Default: [`KEEP_ALIVE_INTERVAL`].
    pub keep_alive_interval: Duration,
    /// Config of the transport of each client.
    ///
    /// Must match the clients' transport config.
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new(application_id: u64, secret_key: SecretKey) -> Self {
        Self {
            application_id,
            secret_key,
            max_clients: MAX_CLIENTS,
            event_capacity: 1024,
            max_pending_handshakes: 256,
            token_history_capacity: 1024,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            transport: TransportConfig::default(),
        }
    }

    /// Sets [`ServerConfig::max_clients`].
    #[must_use]
    pub const fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Sets [`ServerConfig::event_capacity`].
    #[must_use]
    pub const fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    /// Sets [`ServerConfig::max_pending_handshakes`].
    #[must_use]
    pub const fn with_max_pending_handshakes(mut self, max_pending_handshakes: usize) -> Self {
        self.max_pending_handshakes = max_pending_handshakes;
        self
    }

    /// Sets [`ServerConfig::token_history_capacity`].
    #[must_use]
    pub const fn with_token_history_capacity(mut self, token_history_capacity: usize) -> Self {
        self.token_history_capacity = token_history_capacity;
        self
    }

    /// Sets [`ServerConfig::keep_alive_interval`].
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, keep_alive_interval: Duration) -> Self {
        self.keep_alive_interval = keep_alive_interval;
        self
    }

    /// Sets [`ServerConfig::transport`].
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Checks that this config can be used to build a [`Server`].
    ///
    /// # Errors
    ///
    /// Errors if any of the values are out of range.
    pub fn validate(&self) -> Result<(), ServerConfigError> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(ServerConfigError::MaxClients {
                max_clients: self.max_clients,
            });
        }
        if self.event_capacity == 0 {
            return Err(ServerConfigError::EventCapacity);
        }
        if self.max_pending_handshakes == 0 {
            return Err(ServerConfigError::MaxPendingHandshakes);
        }
        self.transport
            .validate()
            .map_err(ServerConfigError::Transport)
    }
}

/// [`ServerConfig`] has an out-of-range value.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ServerConfigError {
    /// [`ServerConfig::max_clients`] is out of range.
    #[display("max clients {max_clients} is not between 1 and {MAX_CLIENTS}")]
    MaxClients {
        /// Configured value.
        max_clients: usize,
    },
    /// [`ServerConfig::event_capacity`] is zero.
    #[display("event capacity is zero")]
    EventCapacity,
    /// [`ServerConfig::max_pending_handshakes`] is zero.
    #[display("max pending handshakes is zero")]
    MaxPendingHandshakes,
    /// [`ServerConfig::transport`] is invalid.
    #[display("invalid transport config")]
    Transport(TransportConfigError),
}

/// Something that happened on a [`Server`], taken out with
/// [`Server::pop_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Client completed the handshake.
    NewConnection {
        /// Slot the client was given.
        index: usize,
        /// Client id from the client's connect token.
        client_id: u64,
        /// Address of the client.
        endpoint: SocketAddr,
    },
    /// Client disconnected, timed out, or was disconnected by us.
    Disconnected {
        /// Slot the client was in.
        index: usize,
    },
    /// Client sent a message.
    Payload {
        /// Slot of the client.
        index: usize,
        /// Message sent.
        data: Bytes,
    },
}

/// Failed to send a message to a client.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ServerSendError {
    /// No client is connected in this slot.
    #[display("no client connected at {index}")]
    NotConnected {
        /// Slot index.
        index: usize,
    },
    /// Transport refused the message.
    #[display("transport refused message")]
    Transport(SendError),
}

#[derive(Debug, Clone, Copy)]
struct Running {
    address: SocketAddr,
    connection_timeout: Duration,
}

#[derive(Debug)]
struct ClientSlot {
    client_id: u64,
    link: Link,
    transport: Transport,
    user_data: Box<[u8; USER_DATA_SIZE]>,
}

#[derive(Debug)]
struct PendingHandshake {
    client_id: u64,
    link: Link,
    challenge: Challenge,
    user_data: Box<[u8; USER_DATA_SIZE]>,
    expiration_timestamp: u64,
    expires_at: Duration,
}

#[derive(Debug, Clone, Copy)]
struct TokenUse {
    endpoint: SocketAddr,
    expiration_timestamp: u64,
}

/// Server side of the protocol, managing up to [`MAX_CLIENTS`] clients.
///
/// Like [`Client`], the server is driven by calling [`Server::update`]
/// regularly. Connections, disconnections and messages received are reported
/// as [`ServerEvent`]s.
///
/// # Handshake
///
/// When a client sends its connect token, the server:
/// 1. checks the token was issued for this application and this server, has
///    not expired, and was signed with [`ServerConfig::secret_key`]
/// 2. ignores it if the client id or address is already connected, or if the
///    same token was already used from another address
/// 3. replies with [`Packet::Denied`] if full, otherwise with a challenge
///    sealed with a key only this server knows
///
/// When the client echoes the challenge back, the server verifies it,
/// allocates a slot, and replies with [`Packet::Accepted`].
///
/// [`Client`]: crate::client::Client
pub struct Server<S> {
    socket: S,
    config: ServerConfig,
    running: Option<Running>,
    time: Duration,
    clients: Vec<Option<ClientSlot>>,
    pending: HashMap<SocketAddr, PendingHandshake>,
    token_history: HashMap<[u8; crypto::SIGNATURE_SIZE], TokenUse>,
    challenge_key: SymmetricKey,
    next_challenge_seq: u64,
    // shared by every packet this server seals, and never reset
    next_seq: u64,
    events: HeapRb<ServerEvent>,
    recv_buf: Box<[u8; MAX_PACKET_SIZE]>,
}

impl<S: fmt::Debug> fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("socket", &self.socket)
            .field("config", &self.config)
            .field("running", &self.running)
            .field("time", &self.time)
            .field("clients", &self.clients)
            .field("pending", &self.pending.len())
            .field("events", &self.events.occupied_len())
            .finish_non_exhaustive()
    }
}

const CHALLENGE_PLAINTEXT_SIZE: usize = CHALLENGE_DATA_SIZE - TAG_SIZE;

impl<S: DatagramSocket> Server<S> {
    /// Creates a stopped server which sends and receives on `socket`.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid.
    pub fn new(socket: S, config: ServerConfig) -> Result<Self, ServerConfigError> {
        config.validate()?;
        let events = HeapRb::new(config.event_capacity);
        Ok(Self {
            socket,
            running: None,
            time: Duration::ZERO,
            clients: Vec::new(),
            pending: HashMap::new(),
            token_history: HashMap::new(),
            challenge_key: SymmetricKey::generate(),
            next_challenge_seq: 0,
            next_seq: 0,
            events,
            recv_buf: Box::new([0; MAX_PACKET_SIZE]),
            config,
        })
    }

    /// Gets the config this server was created with.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gets the socket this server uses.
    #[must_use]
    pub const fn socket(&self) -> &S {
        &self.socket
    }

    /// Gets mutable access to the socket this server uses.
    #[must_use]
    pub const fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Gets the total time passed into [`Server::update`].
    #[must_use]
    pub const fn time(&self) -> Duration {
        self.time
    }

    /// Returns `true` if the server has been started and not stopped.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Gets the number of client slots.
    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    /// Starts accepting clients.
    ///
    /// `address` is the address clients reach this server on, which must be
    /// one of the endpoints in their connect token. Clients which send
    /// nothing for longer than `connection_timeout` are disconnected.
    ///
    /// If the server is already running, it is stopped first.
    pub fn start(&mut self, address: SocketAddr, connection_timeout: Duration) {
        if self.is_running() {
            self.stop();
        }
        info!(%address, "Server started with {} slots", self.config.max_clients);
        self.running = Some(Running {
            address,
            connection_timeout,
        });
        self.clients = (0..self.config.max_clients).map(|_| None).collect();
        self.challenge_key = SymmetricKey::generate();
        self.next_challenge_seq = 0;
    }

    /// Disconnects every client and stops accepting new ones.
    ///
    /// Each connected client is sent a burst of [`DISCONNECT_REDUNDANCY`]
    /// disconnect packets. All server state, including queued events, is
    /// cleared.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        for slot in self.clients.iter_mut().filter_map(Option::as_mut) {
            for _ in 0..DISCONNECT_REDUNDANCY {
                slot.link.send(
                    &mut self.socket,
                    &mut self.next_seq,
                    &Packet::Disconnect,
                    self.time,
                );
            }
        }
        self.clients.clear();
        self.pending.clear();
        self.token_history.clear();
        while self.events.try_pop().is_some() {}
        self.running = None;
        info!("Server stopped");
    }

    /// Takes the oldest event which has not been taken yet.
    pub fn pop_event(&mut self) -> Option<ServerEvent> {
        self.events.try_pop()
    }

    fn push_event(&mut self, event: ServerEvent) {
        if let Err(event) = self.events.try_push(event) {
            warn!("Event queue is full, dropping {event:?}");
        }
    }

    fn slot(&self, index: usize) -> Option<&ClientSlot> {
        self.clients.get(index).and_then(Option::as_ref)
    }

    /// Returns `true` if a client is connected in slot `index`.
    #[must_use]
    pub fn is_client_connected(&self, index: usize) -> bool {
        self.slot(index).is_some()
    }

    /// Gets the number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// Gets the client id of the client in slot `index`.
    #[must_use]
    pub fn client_id(&self, index: usize) -> Option<u64> {
        self.slot(index).map(|slot| slot.client_id)
    }

    /// Gets the address of the client in slot `index`.
    #[must_use]
    pub fn client_endpoint(&self, index: usize) -> Option<SocketAddr> {
        self.slot(index).map(|slot| slot.link.addr)
    }

    /// Gets the transport of the client in slot `index`, for reading its
    /// statistics.
    #[must_use]
    pub fn client_transport(&self, index: usize) -> Option<&Transport> {
        self.slot(index).map(|slot| &slot.transport)
    }

    /// Gets the user data from the connect token of the client in slot
    /// `index`.
    #[must_use]
    pub fn client_user_data(&self, index: usize) -> Option<&[u8; USER_DATA_SIZE]> {
        self.slot(index).map(|slot| &*slot.user_data)
    }

    fn find_client(&self, pred: impl Fn(&ClientSlot) -> bool) -> Option<usize> {
        self.clients
            .iter()
            .position(|slot| slot.as_ref().is_some_and(&pred))
    }

    /// Disconnects the client in slot `index`, emitting
    /// [`ServerEvent::Disconnected`].
    ///
    /// If `notify` is set, the client is sent a burst of
    /// [`DISCONNECT_REDUNDANCY`] disconnect packets first.
    pub fn disconnect_client(&mut self, index: usize, notify: bool) {
        let Some(mut slot) = self.clients.get_mut(index).and_then(Option::take) else {
            debug!(index, "No client to disconnect");
            return;
        };
        if notify {
            for _ in 0..DISCONNECT_REDUNDANCY {
                slot.link.send(
                    &mut self.socket,
                    &mut self.next_seq,
                    &Packet::Disconnect,
                    self.time,
                );
            }
        }
        info!(index, client_id = slot.client_id, "Client disconnected");
        self.push_event(ServerEvent::Disconnected { index });
    }

    /// Sends a message to the client in slot `index`.
    ///
    /// # Errors
    ///
    /// Errors if no client is connected in the slot, or the transport refused
    /// the message.
    pub fn send(&mut self, msg: &[u8], index: usize, reliable: bool) -> Result<(), ServerSendError> {
        let slot = self
            .clients
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(ServerSendError::NotConnected { index })?;
        let ClientSlot {
            link, transport, ..
        } = slot;
        let socket = &mut self.socket;
        let next_seq = &mut self.next_seq;
        let now = self.time;
        let send = |_: PacketSeq, packet: &[u8]| {
            let packet = Packet::Payload(Bytes::copy_from_slice(packet));
            link.send(socket, next_seq, &packet, now);
        };
        if reliable {
            transport
                .send_reliably_and_in_order(msg, send)
                .map_err(ServerSendError::Transport)?;
        } else {
            transport
                .send_unreliable(msg, send)
                .map_err(ServerSendError::Transport)?;
        }
        Ok(())
    }

    /// Sends a message to every connected client.
    ///
    /// # Errors
    ///
    /// Errors with the first failure if sending to any client failed. The
    /// message is still sent to every other client.
    pub fn send_to_all(&mut self, msg: &[u8], reliable: bool) -> Result<(), ServerSendError> {
        self.send_to_all_where(msg, reliable, |_| true)
    }

    /// Sends a message to every connected client except the one in slot
    /// `except`.
    ///
    /// # Errors
    ///
    /// See [`Server::send_to_all`].
    pub fn send_to_all_but_one(
        &mut self,
        msg: &[u8],
        except: usize,
        reliable: bool,
    ) -> Result<(), ServerSendError> {
        self.send_to_all_where(msg, reliable, |index| index != except)
    }

    fn send_to_all_where(
        &mut self,
        msg: &[u8],
        reliable: bool,
        filter: impl Fn(usize) -> bool,
    ) -> Result<(), ServerSendError> {
        let mut result = Ok(());
        for index in 0..self.clients.len() {
            if !self.is_client_connected(index) || !filter(index) {
                continue;
            }
            if let Err(err) = self.send(msg, index, reliable) {
                debug!(index, "Failed to send to client: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Advances time by `dt`, processing everything received and sending
    /// whatever is due.
    ///
    /// `current_timestamp` is the current time in seconds since the Unix
    /// epoch, used to check token expiry.
    pub fn update(&mut self, dt: Duration, current_timestamp: u64) {
        let Some(running) = self.running else {
            return;
        };
        self.time += dt;
        self.socket.update(dt);
        self.receive_packets(running, current_timestamp);

        for index in 0..self.clients.len() {
            let span = trace_span!("client", index);
            let _span = span.enter();
            self.update_client(index, dt, running.connection_timeout);
        }

        let now = self.time;
        self.pending.retain(|addr, pending| {
            let keep = now < pending.expires_at && current_timestamp <= pending.expiration_timestamp;
            if !keep {
                trace!(%addr, "Handshake timed out");
            }
            keep
        });
        self.token_history
            .retain(|_, token| current_timestamp <= token.expiration_timestamp);
    }

    fn receive_packets(&mut self, running: Running, current_timestamp: u64) {
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
            match packet::peek_type(&data) {
                Ok(PacketType::ConnectToken) => {
                    self.handle_connect_token(from, &data, running, current_timestamp);
                }
                Ok(_) => {
                    if let Some(index) = self.find_client(|slot| slot.link.addr == from) {
                        self.handle_client_packet(index, &data, running);
                    } else if self.pending.contains_key(&from) {
                        self.handle_pending_packet(from, &data, running);
                    } else {
                        trace!(%from, "Dropped packet from unknown address");
                    }
                }
                Err(err) => {
                    trace!(%from, "Dropped packet: {err}");
                }
            }
        }
    }

    fn handle_connect_token(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        running: Running,
        current_timestamp: u64,
    ) {
        let token = match ConnectTokenPacket::open(
            data,
            self.config.application_id,
            current_timestamp,
            &self.config.secret_key,
        ) {
            Ok(token) => token,
            Err(err) => {
                trace!(%from, "Rejected connect token: {err}");
                return;
            }
        };
        if !token.endpoints.contains(&running.address) {
            trace!(%from, "Rejected connect token not issued for this server");
            return;
        }
        if self
            .find_client(|slot| slot.link.addr == from || slot.client_id == token.client_id)
            .is_some()
        {
            trace!(%from, client_id = token.client_id, "Ignored connect token from connected client");
            return;
        }

        match self.token_history.get(&token.signature) {
            Some(used) if used.endpoint != from => {
                trace!(%from, used_by = %used.endpoint, "Rejected connect token used from another address");
                return;
            }
            Some(_) => {}
            None => {
                if self.token_history.len() >= self.config.token_history_capacity {
                    trace!(%from, "Token history is full, ignoring connect token");
                    return;
                }
                self.token_history.insert(
                    token.signature,
                    TokenUse {
                        endpoint: from,
                        expiration_timestamp: token.expiration_timestamp,
                    },
                );
            }
        }

        let now = self.time;
        if let Some(pending) = self.pending.get_mut(&from) {
            if pending.client_id == token.client_id {
                let packet = Packet::ChallengeRequest(pending.challenge.clone());
                pending
                    .link
                    .send(&mut self.socket, &mut self.next_seq, &packet, now);
                return;
            }
        }

        let mut link = Link::new(
            from,
            token.server_to_client_key,
            token.client_to_server_key,
            self.config.application_id,
            now,
        );
        if self.client_count() >= self.config.max_clients {
            debug!(%from, client_id = token.client_id, "Server is full, denying client");
            link.send(&mut self.socket, &mut self.next_seq, &Packet::Denied, now);
            return;
        }
        if self.pending.len() >= self.config.max_pending_handshakes
            && !self.pending.contains_key(&from)
        {
            trace!(%from, "Too many pending handshakes, ignoring connect token");
            return;
        }

        let Some(challenge) = self.seal_challenge(token.client_id) else {
            return;
        };
        debug!(%from, client_id = token.client_id, "Sending challenge");
        let packet = Packet::ChallengeRequest(challenge.clone());
        link.send(&mut self.socket, &mut self.next_seq, &packet, now);
        self.pending.insert(
            from,
            PendingHandshake {
                client_id: token.client_id,
                link,
                challenge,
                user_data: token.user_data,
                expiration_timestamp: token.expiration_timestamp,
                expires_at: now + Duration::from_secs(u64::from(token.handshake_timeout_secs)),
            },
        );
    }

    fn seal_challenge(&mut self, client_id: u64) -> Option<Challenge> {
        let seq = self.next_challenge_seq;
        self.next_challenge_seq += 1;
        let mut data = Box::new([0; CHALLENGE_DATA_SIZE]);
        data[..8].copy_from_slice(&client_id.to_be_bytes());
        let (plain, tag) = data.split_at_mut(CHALLENGE_PLAINTEXT_SIZE);
        match crypto::seal(&self.challenge_key, seq, &[], plain) {
            Ok(sealed_tag) => {
                tag.copy_from_slice(&sealed_tag);
                Some(Challenge { seq, data })
            }
            Err(err) => {
                warn!("Failed to seal challenge: {err}");
                None
            }
        }
    }

    fn open_challenge(&self, challenge: &Challenge) -> Option<u64> {
        let mut plain = [0; CHALLENGE_PLAINTEXT_SIZE];
        plain.copy_from_slice(&challenge.data[..CHALLENGE_PLAINTEXT_SIZE]);
        let mut tag = [0; TAG_SIZE];
        tag.copy_from_slice(&challenge.data[CHALLENGE_PLAINTEXT_SIZE..]);
        crypto::open(&self.challenge_key, challenge.seq, &[], &mut plain, &tag).ok()?;
        let mut client_id = [0; 8];
        client_id.copy_from_slice(&plain[..8]);
        Some(u64::from_be_bytes(client_id))
    }

    fn handle_pending_packet(&mut self, from: SocketAddr, data: &[u8], running: Running) {
        let now = self.time;
        let Some(pending) = self.pending.get_mut(&from) else {
            return;
        };
        let challenge = match pending.link.open(data, now) {
            Ok(Packet::ChallengeResponse(challenge)) => challenge,
            Ok(packet) => {
                trace!(%from, "Ignored {:?} packet during handshake", packet.packet_type());
                return;
            }
            Err(err) => {
                trace!(%from, "Dropped packet: {err}");
                return;
            }
        };
        if challenge != pending.challenge {
            trace!(%from, "Challenge response does not match");
            return;
        }
        let client_id = pending.client_id;
        if self.open_challenge(&challenge) != Some(client_id) {
            trace!(%from, "Challenge response failed to open");
            return;
        }
        if self.find_client(|slot| slot.client_id == client_id).is_some() {
            trace!(%from, client_id, "Ignored challenge response from connected client id");
            return;
        }

        let Some(mut pending) = self.pending.remove(&from) else {
            return;
        };
        let Some(index) = self.clients.iter().position(Option::is_none) else {
            debug!(%from, client_id, "Server is full, denying client");
            pending
                .link
                .send(&mut self.socket, &mut self.next_seq, &Packet::Denied, now);
            return;
        };
        let transport = match Transport::new(self.config.transport.clone()) {
            Ok(transport) => transport,
            Err(err) => {
                warn!("Failed to create transport: {err}");
                return;
            }
        };

        let mut slot = ClientSlot {
            client_id,
            link: pending.link,
            transport,
            user_data: pending.user_data,
        };
        Self::send_accepted(
            &mut self.socket,
            &mut self.next_seq,
            &mut slot,
            index,
            self.config.max_clients,
            running,
            now,
        );
        self.clients[index] = Some(slot);
        info!(index, client_id, %from, "Client connected");
        self.push_event(ServerEvent::NewConnection {
            index,
            client_id,
            endpoint: from,
        });
    }

    fn send_accepted(
        socket: &mut S,
        next_seq: &mut u64,
        slot: &mut ClientSlot,
        index: usize,
        max_clients: usize,
        running: Running,
        now: Duration,
    ) {
        let timeout_secs = running.connection_timeout.as_secs_f64().ceil();
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "clamped to the range of `u32`"
        )]
        let timeout_secs = timeout_secs.clamp(1.0, f64::from(u32::MAX)) as u32;
        let packet = Packet::Accepted {
            client_id: slot.client_id,
            client_index: u32::try_from(index).unwrap_or(u32::MAX),
            max_clients: u32::try_from(max_clients).unwrap_or(u32::MAX),
            timeout_secs,
        };
        slot.link.send(socket, next_seq, &packet, now);
    }

    fn handle_client_packet(&mut self, index: usize, data: &[u8], running: Running) {
        let now = self.time;
        let max_clients = self.config.max_clients;
        let Some(slot) = self.clients.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        let packet = match slot.link.open(data, now) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(index, "Dropped packet: {err}");
                return;
            }
        };
        match packet {
            Packet::ChallengeResponse(_) => {
                // the client did not get our accept yet
                Self::send_accepted(
                    &mut self.socket,
                    &mut self.next_seq,
                    slot,
                    index,
                    max_clients,
                    running,
                    now,
                );
            }
            Packet::KeepAlive => {}
            Packet::Payload(payload) => {
                if let Err(err) = slot.transport.receive_packet(payload) {
                    trace!(index, "Dropped payload: {err}");
                }
            }
            Packet::Disconnect => {
                self.disconnect_client(index, false);
            }
            packet => {
                trace!(index, "Ignored {:?} packet", packet.packet_type());
            }
        }
    }

    fn update_client(&mut self, index: usize, dt: Duration, connection_timeout: Duration) {
        let now = self.time;
        let Some(slot) = self.clients.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        let ClientSlot {
            link, transport, ..
        } = slot;
        let socket = &mut self.socket;
        let next_seq = &mut self.next_seq;
        transport.update(dt, |_, packet| {
            let packet = Packet::Payload(Bytes::copy_from_slice(packet));
            link.send(socket, next_seq, &packet, now);
        });
        if link.quiet_for(now) >= self.config.keep_alive_interval {
            link.send(socket, next_seq, &Packet::KeepAlive, now);
        }

        let mut received = Vec::new();
        while let Some(data) = transport.receive().or_else(|| transport.receive_unreliable()) {
            received.push(data);
        }
        let timed_out = link.idle_for(now) > connection_timeout;

        for data in received {
            self.push_event(ServerEvent::Payload { index, data });
        }
        if timed_out {
            info!(index, "Client timed out");
            self.disconnect_client(index, false);
        }
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {
        super::*,
        crate::{
            client::{Client, ClientConfig, ClientState},
            crypto::sign_keygen,
            packet::HEADER_SIZE,
            token::{CLIENT_SECTION_SIZE, CONNECT_TOKEN_SIZE, generate_connect_token},
        },
        assert_matches::assert_matches,
        tidewire_io::memory::{MemoryNetwork, MemorySocket},
    };

    const NOW: u64 = 1_000;
    const DT: Duration = Duration::from_millis(100);

    fn server(net: &MemoryNetwork) -> Server<MemorySocket> {
        let (_, secret) = sign_keygen();
        let socket = net.bind("10.0.0.1:40000".parse().unwrap()).unwrap();
        Server::new(socket, ServerConfig::new(1, secret).with_max_clients(4)).unwrap()
    }

    fn started_server(
        net: &MemoryNetwork,
        max_clients: usize,
    ) -> (Server<MemorySocket>, SecretKey) {
        let (_, secret) = sign_keygen();
        let addr = "10.0.0.1:40000".parse().unwrap();
        let config = ServerConfig::new(1, secret.clone()).with_max_clients(max_clients);
        let mut server = Server::new(net.bind(addr).unwrap(), config).unwrap();
        server.start(addr, Duration::from_secs(5));
        (server, secret)
    }

    fn token(secret: &SecretKey, client_id: u64) -> [u8; CONNECT_TOKEN_SIZE] {
        generate_connect_token(
            1,
            NOW,
            &SymmetricKey::generate(),
            &SymmetricKey::generate(),
            NOW + 60,
            1,
            &["10.0.0.1:40000".parse().unwrap()],
            client_id,
            b"",
            secret,
        )
        .unwrap()
    }

    /// Type and sequence of every packet waiting on `socket`.
    fn headers(socket: &mut MemorySocket) -> Vec<(PacketType, u64)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let mut headers = Vec::new();
        while let Some((len, _)) = socket.recv_from(&mut buf).unwrap() {
            let packet_type = packet::peek_type(&buf[..len]).unwrap();
            let seq = u64::from_be_bytes(buf[1..HEADER_SIZE].try_into().unwrap());
            headers.push((packet_type, seq));
        }
        headers
    }

    #[test]
    fn invalid_configs_rejected() {
        let (_, secret) = sign_keygen();
        let config = ServerConfig::new(1, secret);
        config.validate().unwrap();
        assert_matches!(
            config.clone().with_max_clients(0).validate(),
            Err(ServerConfigError::MaxClients { max_clients: 0 })
        );
        assert_matches!(
            config.clone().with_max_clients(MAX_CLIENTS + 1).validate(),
            Err(ServerConfigError::MaxClients { .. })
        );
        assert_matches!(
            config.clone().with_event_capacity(0).validate(),
            Err(ServerConfigError::EventCapacity)
        );
        assert_matches!(
            config
                .with_transport(TransportConfig::default().with_fragment_size(0))
                .validate(),
            Err(ServerConfigError::Transport(_))
        );
    }

    #[test]
    fn start_stop() {
        let net = MemoryNetwork::new();
        let mut server = server(&net);
        assert!(!server.is_running());
        server.start("10.0.0.1:40000".parse().unwrap(), Duration::from_secs(5));
        assert!(server.is_running());
        assert_eq!(0, server.client_count());
        assert!(!server.is_client_connected(0));
        assert_eq!(None, server.client_id(0));
        server.stop();
        assert!(!server.is_running());
        assert_eq!(None, server.pop_event());
    }

    #[test]
    fn send_to_empty_slot() {
        let net = MemoryNetwork::new();
        let mut server = server(&net);
        server.start("10.0.0.1:40000".parse().unwrap(), Duration::from_secs(5));
        assert_matches!(
            server.send(b"hi", 2, true),
            Err(ServerSendError::NotConnected { index: 2 })
        );
        assert_matches!(
            server.send(b"hi", 99, false),
            Err(ServerSendError::NotConnected { index: 99 })
        );
        server.send_to_all(b"hi", true).unwrap();
        server.disconnect_client(0, true);
        assert_eq!(None, server.pop_event());
    }

    #[test]
    fn challenge_round_trip() {
        let net = MemoryNetwork::new();
        let mut server = server(&net);
        let challenge = server.seal_challenge(77).unwrap();
        assert_eq!(Some(77), server.open_challenge(&challenge));

        let mut tampered = challenge;
        tampered.data[0] ^= 1;
        assert_eq!(None, server.open_challenge(&tampered));
    }

    #[test]
    fn retried_token_is_answered_with_new_sequence() {
        let net = MemoryNetwork::new();
        let (mut server, secret) = started_server(&net, 4);
        let server_addr = "10.0.0.1:40000".parse().unwrap();
        let mut client = net.bind("10.0.0.2:1".parse().unwrap()).unwrap();
        let token = token(&secret, 1);

        client.send_to(&token[CLIENT_SECTION_SIZE..], server_addr).unwrap();
        server.update(DT, NOW);
        let first = headers(&mut client);
        assert_matches!(first.as_slice(), [(PacketType::ChallengeRequest, _)]);

        // let the pending handshake expire, then start over with the same token
        for _ in 0..15 {
            server.update(DT, NOW);
        }
        client.send_to(&token[CLIENT_SECTION_SIZE..], server_addr).unwrap();
        server.update(DT, NOW);
        let second = headers(&mut client);
        assert_matches!(second.as_slice(), [(PacketType::ChallengeRequest, _)]);
        assert_ne!(first[0].1, second[0].1);
    }

    #[test]
    fn denied_and_challenged_with_distinct_sequences() {
        let net = MemoryNetwork::new();
        let (mut server, secret) = started_server(&net, 1);
        let server_addr = "10.0.0.1:40000".parse().unwrap();

        let mut occupant = Client::new(
            net.bind("10.0.0.3:1".parse().unwrap()).unwrap(),
            ClientConfig::default(),
        )
        .unwrap();
        occupant.connect(&token(&secret, 1), NOW).unwrap();
        for _ in 0..5 {
            occupant.update(DT, NOW);
            server.update(DT, NOW);
        }
        assert_eq!(ClientState::Connected, occupant.state());

        let mut late = net.bind("10.0.0.2:1".parse().unwrap()).unwrap();
        let token = token(&secret, 2);
        late.send_to(&token[CLIENT_SECTION_SIZE..], server_addr).unwrap();
        server.update(DT, NOW);
        let denied = headers(&mut late);
        assert_matches!(denied.as_slice(), [(PacketType::Denied, _)]);

        server.disconnect_client(0, false);
        late.send_to(&token[CLIENT_SECTION_SIZE..], server_addr).unwrap();
        server.update(DT, NOW);
        let challenged = headers(&mut late);
        assert_matches!(challenged.as_slice(), [(PacketType::ChallengeRequest, _)]);
        assert_ne!(denied[0].1, challenged[0].1);
    }

    #[test]
    fn ignores_garbage() {
        let net = MemoryNetwork::new();
        let mut server = server(&net);
        let addr = "10.0.0.1:40000".parse().unwrap();
        server.start(addr, Duration::from_secs(5));
        let mut attacker = net.bind("10.0.0.9:1".parse().unwrap()).unwrap();
        for packet in [&[][..], &[0; 1024][..], &[0; 10][..], &[7; 100][..], &[99; 50][..]] {
            attacker.send_to(packet, addr).unwrap();
        }
        server.update(Duration::from_millis(100), 0);
        assert_eq!(None, server.pop_event());
        assert_eq!(0, server.client_count());
        let mut buf = [0; 64];
        assert_eq!(None, attacker.recv_from(&mut buf).unwrap());
    }
}
