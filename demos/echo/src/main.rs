//! Echo server and client built on `tidewire`.
//!
//! Start a server:
//!
//! ```sh
//! tidewire_echo server --bind 127.0.0.1:40000
//! ```
//!
//! Then connect a client, which sends a few messages and waits for them to
//! come back:
//!
//! ```sh
//! tidewire_echo client --server 127.0.0.1:40000 --loss 0.2
//! ```
//!
//! Both sides derive the token signing key from `--key`, standing in for the
//! backend which would normally issue connect tokens.

use {
    anyhow::{Context, Result, bail},
    clap::{Args, Parser, Subcommand},
    core::{net::SocketAddr, time::Duration},
    sha2::{Digest, Sha256},
    std::{
        thread,
        time::{Instant, SystemTime, UNIX_EPOCH},
    },
    tidewire::{
        Client, ClientConfig, ClientState, Server, ServerConfig, ServerEvent,
        io::{
            DatagramSocket,
            condition::{ConditionedSocket, ConditionerConfig},
            udp::UdpDatagramSocket,
        },
        protocol::{
            crypto::{SecretKey, SymmetricKey},
            token::generate_connect_token,
        },
    },
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

const APPLICATION_ID: u64 = 0x7469_6465_7769_7265;
const TICK: Duration = Duration::from_millis(16);
const UNRELIABLE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(about = "Echo server and client built on tidewire")]
struct Cli {
    /// Passphrase which the token signing key is derived from
    #[arg(long, global = true, default_value = "tidewire echo")]
    key: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Echo every message back to the client which sent it
    Server(ServerArgs),
    /// Connect, send messages, and wait for their echoes
    Client(ClientArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Address to bind the UDP socket to
    #[arg(long, default_value = "127.0.0.1:40000")]
    bind: SocketAddr,
    /// Address clients reach this server on, if different from `--bind`
    #[arg(long)]
    public: Option<SocketAddr>,
    /// Seconds of silence after which a client is dropped
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Servers to try, in order
    #[arg(long, required = true, num_args = 1..)]
    server: Vec<SocketAddr>,
    /// Id the server will know this client by
    #[arg(long, default_value_t = 1)]
    client_id: u64,
    /// Number of messages to send
    #[arg(long, default_value_t = 10)]
    count: usize,
    /// Send messages unreliably
    #[arg(long)]
    unreliable: bool,
    /// Fraction of incoming datagrams to drop
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Extra latency added to incoming datagrams, in milliseconds
    #[arg(long, default_value_t = 0)]
    latency: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let secret_key = secret_key(&cli.key);
    match cli.command {
        Command::Server(args) => run_server(args, secret_key),
        Command::Client(args) => run_client(args, &secret_key),
    }
}

fn secret_key(passphrase: &str) -> SecretKey {
    let seed: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
    SecretKey::from_bytes(&seed)
}

fn unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Sleeps until the next tick and returns how long the last one took.
fn tick(last: &mut Instant) -> Duration {
    thread::sleep(TICK);
    let now = Instant::now();
    let dt = now - *last;
    *last = now;
    dt
}

fn run_server(args: ServerArgs, secret_key: SecretKey) -> Result<()> {
    let socket = UdpDatagramSocket::bind(args.bind)
        .with_context(|| format!("failed to bind to {}", args.bind))?;
    let mut server = Server::new(socket, ServerConfig::new(APPLICATION_ID, secret_key))?;
    let public = args.public.unwrap_or(args.bind);
    server.start(public, Duration::from_secs(args.timeout));

    let mut last = Instant::now();
    loop {
        let dt = tick(&mut last);
        server.update(dt, unix_timestamp()?);
        while let Some(event) = server.pop_event() {
            match event {
                ServerEvent::NewConnection {
                    index,
                    client_id,
                    endpoint,
                } => {
                    info!(index, client_id, "{endpoint} connected");
                }
                ServerEvent::Disconnected { index } => {
                    info!(index, "Client disconnected");
                }
                ServerEvent::Payload { index, data } => {
                    if let Err(err) = server.send(&data, index, true) {
                        warn!(index, "Failed to echo message: {err}");
                    }
                }
            }
        }
    }
}

fn run_client(args: ClientArgs, secret_key: &SecretKey) -> Result<()> {
    let socket = UdpDatagramSocket::bind("0.0.0.0:0").context("failed to bind client socket")?;
    let socket = ConditionedSocket::new(
        socket,
        ConditionerConfig::default()
            .with_loss_rate(args.loss)
            .with_latency(Duration::from_millis(args.latency)),
    )?;
    info!("Client bound on {}", socket.local_addr()?);
    let mut client = Client::new(socket, ClientConfig::default())?;

    let now = unix_timestamp()?;
    let token = generate_connect_token(
        APPLICATION_ID,
        now,
        &SymmetricKey::generate(),
        &SymmetricKey::generate(),
        now + 30,
        5,
        &args.server,
        args.client_id,
        format!("echo client {}", args.client_id).as_bytes(),
        secret_key,
    )?;
    client.connect(&token, now)?;

    let mut sent = 0;
    let mut echoed = 0;
    let mut all_sent_at = None;
    let mut last = Instant::now();
    while echoed < args.count {
        let dt = tick(&mut last);
        client.update(dt, unix_timestamp()?);
        match client.state() {
            ClientState::Connected => {}
            state if state.is_connecting() => continue,
            state => bail!("connection ended: {state:?} (code {})", state.code()),
        }

        if sent < args.count {
            let msg = format!("message {sent}");
            client.send(msg.as_bytes(), !args.unreliable)?;
            sent += 1;
            if sent == args.count {
                all_sent_at = Some(last);
            }
        }
        while let Some(msg) = client.recv() {
            info!("Echo: {}", String::from_utf8_lossy(&msg));
            echoed += 1;
        }
        // lost unreliable messages never come back
        if args.unreliable && all_sent_at.is_some_and(|at| last - at > UNRELIABLE_GRACE) {
            break;
        }
    }

    info!(
        rtt = ?client.rtt(),
        packet_loss = client.packet_loss(),
        "Received {echoed}/{} echoes",
        args.count
    );
    client.disconnect();
    Ok(())
}
