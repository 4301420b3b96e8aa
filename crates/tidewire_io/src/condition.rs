//! Socket wrapper which randomly drops, duplicates and delays datagrams.
//!
//! **This is for testing purposes only!** You should never be using a
//! conditioner in the release build of your app.
//!
//! # Conditioning
//!
//! A useful strategy for testing networking code is to induce artificial packet
//! loss and delays, and see how your app copes with it.
//!
//! A [`ConditionedSocket`] adds unreliability to the datagrams received on the
//! socket it wraps. Each datagram may be dropped entirely, delivered twice, or
//! held back for a random amount of time, which also reorders datagrams.
//! Outgoing datagrams are not affected; condition both ends to make both
//! directions lossy.
//!
//! Delays are measured in the time passed to [`DatagramSocket::update`], so a
//! conditioned socket behaves identically between runs given the same seed
//! and the same sequence of calls.
//!
//! # Usage
//!
//! ```
//! use {
//!     core::time::Duration,
//!     tidewire_io::{
//!         condition::{ConditionedSocket, ConditionerConfig},
//!         memory::MemoryNetwork,
//!     },
//! };
//!
//! let net = MemoryNetwork::new();
//! let socket = net.bind("127.0.0.1:5000".parse().unwrap()).unwrap();
//! let config = ConditionerConfig::default()
//!     .with_loss_rate(0.2)
//!     .with_latency(Duration::from_millis(50))
//!     .with_jitter(Duration::from_millis(20))
//!     .with_seed(1234);
//! let socket = ConditionedSocket::new(socket, config).unwrap();
//! ```

use {
    crate::DatagramSocket,
    core::{net::SocketAddr, num::Saturating, time::Duration},
    derive_more::{Add, AddAssign, Display, Error, Sub, SubAssign},
    rand::{Rng, SeedableRng, rngs::StdRng},
    std::io,
    tracing::trace,
};

/// Configuration for a [`ConditionedSocket`].
///
/// A datagram is delayed by [`ConditionerConfig::latency`] plus a uniformly
/// random extra delay of up to [`ConditionerConfig::jitter`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConditionerConfig {
    /// Chance of a datagram being dropped, in `0.0..=1.0`.
    pub loss_rate: f64,
    /// Chance of a datagram which was not dropped being delivered twice, in
    /// `0.0..=1.0`.
    pub duplicate_rate: f64,
    /// Minimum time a datagram is held back for.
    pub latency: Duration,
    /// Maximum extra time a datagram is held back for, on top of
    /// [`ConditionerConfig::latency`].
    pub jitter: Duration,
    /// Seed of the random number generator.
    ///
    /// If [`None`], the generator is seeded from the OS.
    pub seed: Option<u64>,
}

impl ConditionerConfig {
    /// Sets [`ConditionerConfig::loss_rate`].
    #[must_use]
    pub const fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }

    /// Sets [`ConditionerConfig::duplicate_rate`].
    #[must_use]
    pub const fn with_duplicate_rate(mut self, duplicate_rate: f64) -> Self {
        self.duplicate_rate = duplicate_rate;
        self
    }

    /// Sets [`ConditionerConfig::latency`].
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets [`ConditionerConfig::jitter`].
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets [`ConditionerConfig::seed`].
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks that this config can be used to build a [`ConditionedSocket`].
    ///
    /// # Errors
    ///
    /// Errors if a rate is not in `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), ConditionerConfigError> {
        let valid = |rate: f64| (0.0..=1.0).contains(&rate);
        if !valid(self.loss_rate) {
            return Err(ConditionerConfigError::LossRate {
                rate: self.loss_rate,
            });
        }
        if !valid(self.duplicate_rate) {
            return Err(ConditionerConfigError::DuplicateRate {
                rate: self.duplicate_rate,
            });
        }
        Ok(())
    }
}

/// [`ConditionerConfig`] has an out-of-range value.
#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum ConditionerConfigError {
    /// [`ConditionerConfig::loss_rate`] is not in `0.0..=1.0`.
    #[display("loss rate {rate} is not in 0.0..=1.0")]
    LossRate {
        /// Configured rate.
        rate: f64,
    },
    /// [`ConditionerConfig::duplicate_rate`] is not in `0.0..=1.0`.
    #[display("duplicate rate {rate} is not in 0.0..=1.0")]
    DuplicateRate {
        /// Configured rate.
        rate: f64,
    },
}

/// Counters of what a [`ConditionedSocket`] did to incoming datagrams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)] // force `#[derive]` on multiple lines
#[derive(Add, AddAssign, Sub, SubAssign)]
pub struct ConditionerStats {
    /// Datagrams received from the wrapped socket.
    pub packets_received: Saturating<u64>,
    /// Datagrams dropped.
    pub packets_dropped: Saturating<u64>,
    /// Extra copies of datagrams delivered.
    pub packets_duplicated: Saturating<u64>,
}

#[derive(Debug, Clone)]
struct Scheduled {
    deliver_at: Duration,
    from: SocketAddr,
    packet: Box<[u8]>,
}

/// [`DatagramSocket`] which conditions the datagrams received by another
/// socket.
///
/// See the [module-level documentation](self).
#[derive(Debug)]
pub struct ConditionedSocket<S> {
    inner: S,
    config: ConditionerConfig,
    rng: StdRng,
    time: Duration,
    scheduled: Vec<Scheduled>,
    scratch: Box<[u8]>,
    stats: ConditionerStats,
}

/// Largest datagram a [`ConditionedSocket`] reads from the socket it wraps.
pub const MAX_DATAGRAM_LEN: usize = 2048;

impl<S: DatagramSocket> ConditionedSocket<S> {
    /// Wraps `inner` in a conditioner.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, see [`ConditionerConfig::validate`].
    pub fn new(inner: S, config: ConditionerConfig) -> Result<Self, ConditionerConfigError> {
        config.validate()?;
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Ok(Self {
            inner,
            config,
            rng,
            time: Duration::ZERO,
            scheduled: Vec::new(),
            scratch: vec![0; MAX_DATAGRAM_LEN].into_boxed_slice(),
            stats: ConditionerStats::default(),
        })
    }

    /// Gets the wrapped socket.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Gets the config in use.
    #[must_use]
    pub const fn config(&self) -> &ConditionerConfig {
        &self.config
    }

    /// Replaces the config, keeping every datagram already held back.
    ///
    /// # Errors
    ///
    /// Errors if the config is invalid, see [`ConditionerConfig::validate`].
    pub fn set_config(&mut self, config: ConditionerConfig) -> Result<(), ConditionerConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Gets the counters of what happened to incoming datagrams.
    #[must_use]
    pub const fn stats(&self) -> ConditionerStats {
        self.stats
    }

    /// Gets the number of datagrams currently held back.
    #[must_use]
    pub fn num_scheduled(&self) -> usize {
        self.scheduled.len()
    }

    /// Unwraps this, dropping every datagram still held back.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn delay(&mut self) -> Duration {
        let jitter = if self.config.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.rng.gen_range(Duration::ZERO..=self.config.jitter)
        };
        self.config.latency + jitter
    }

    fn pull(&mut self) -> io::Result<()> {
        while let Some((len, from)) = self.inner.recv_from(&mut self.scratch)? {
            self.stats.packets_received += 1;
            if self.rng.gen_bool(self.config.loss_rate) {
                trace!("Dropping {len} byte datagram from {from}");
                self.stats.packets_dropped += 1;
                continue;
            }

            let copies = if self.rng.gen_bool(self.config.duplicate_rate) {
                self.stats.packets_duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                let deliver_at = self.time + self.delay();
                self.scheduled.push(Scheduled {
                    deliver_at,
                    from,
                    packet: Box::from(&self.scratch[..len]),
                });
            }
        }
        Ok(())
    }
}

impl<S: DatagramSocket> DatagramSocket for ConditionedSocket<S> {
    fn send_to(&mut self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.inner.send_to(packet, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.pull()?;

        let now = self.time;
        let Some((index, _)) = self
            .scheduled
            .iter()
            .enumerate()
            .filter(|(_, scheduled)| scheduled.deliver_at <= now)
            .min_by_key(|(_, scheduled)| scheduled.deliver_at)
        else {
            return Ok(None);
        };
        let Scheduled { from, packet, .. } = self.scheduled.remove(index);
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn update(&mut self, dt: Duration) {
        self.inner.update(dt);
        self.time += dt;
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {super::*, crate::memory::MemoryNetwork, assert_matches::assert_matches};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn drain(socket: &mut impl DatagramSocket) -> Vec<Vec<u8>> {
        let mut buf = [0; 64];
        let mut out = Vec::new();
        while let Some((len, _)) = socket.recv_from(&mut buf).unwrap() {
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn invalid_rates_rejected() {
        assert_matches!(
            ConditionerConfig::default().with_loss_rate(1.5).validate(),
            Err(ConditionerConfigError::LossRate { .. })
        );
        assert_matches!(
            ConditionerConfig::default()
                .with_duplicate_rate(f64::NAN)
                .validate(),
            Err(ConditionerConfigError::DuplicateRate { .. })
        );
    }

    #[test]
    fn passthrough_by_default() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        let b = net.bind(addr(2)).unwrap();
        let mut b = ConditionedSocket::new(b, ConditionerConfig::default()).unwrap();

        a.send_to(b"x", addr(2)).unwrap();
        a.send_to(b"y", addr(2)).unwrap();
        assert_eq!(vec![b"x".to_vec(), b"y".to_vec()], drain(&mut b));
    }

    #[test]
    fn total_loss() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        let b = net.bind(addr(2)).unwrap();
        let config = ConditionerConfig::default().with_loss_rate(1.0).with_seed(0);
        let mut b = ConditionedSocket::new(b, config).unwrap();

        for _ in 0..10 {
            a.send_to(b"x", addr(2)).unwrap();
        }
        assert!(drain(&mut b).is_empty());
        assert_eq!(10, b.stats().packets_dropped.0);
    }

    #[test]
    fn always_duplicates() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        let b = net.bind(addr(2)).unwrap();
        let config = ConditionerConfig::default()
            .with_duplicate_rate(1.0)
            .with_seed(0);
        let mut b = ConditionedSocket::new(b, config).unwrap();

        a.send_to(b"x", addr(2)).unwrap();
        assert_eq!(2, drain(&mut b).len());
    }

    #[test]
    fn latency_holds_back() {
        let net = MemoryNetwork::new();
        let mut a = net.bind(addr(1)).unwrap();
        let b = net.bind(addr(2)).unwrap();
        let config = ConditionerConfig::default()
            .with_latency(Duration::from_millis(50))
            .with_seed(0);
        let mut b = ConditionedSocket::new(b, config).unwrap();

        a.send_to(b"x", addr(2)).unwrap();
        assert!(drain(&mut b).is_empty());
        assert_eq!(1, b.num_scheduled());

        b.update(Duration::from_millis(40));
        assert!(drain(&mut b).is_empty());
        b.update(Duration::from_millis(10));
        assert_eq!(vec![b"x".to_vec()], drain(&mut b));
    }

    #[test]
    fn same_seed_same_outcome() {
        let run = || {
            let net = MemoryNetwork::new();
            let mut a = net.bind(addr(1)).unwrap();
            let b = net.bind(addr(2)).unwrap();
            let config = ConditionerConfig::default()
                .with_loss_rate(0.3)
                .with_jitter(Duration::from_millis(30))
                .with_seed(42);
            let mut b = ConditionedSocket::new(b, config).unwrap();
            for i in 0..50u8 {
                a.send_to(&[i], addr(2)).unwrap();
            }
            let mut out = Vec::new();
            for _ in 0..10 {
                b.update(Duration::from_millis(5));
                out.extend(drain(&mut b));
            }
            out
        };
        assert_eq!(run(), run());
    }
}
