//! Liveness probing collaborator.
//!
//! The manager only sees the [`Prober`]/[`ProbeHandle`] traits: start a
//! probe at admission, snapshot its cumulative statistics on each tick,
//! stop it on removal. The ICMP implementation runs one background task
//! per destination on surge-ping.

use parking_lot::Mutex;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

const PROBE_PAYLOAD: [u8; 56] = [0; 56];
const MAX_REPLY_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unable to resolve {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("no address records for {0}")]
    NoAddress(String),
    #[error("icmp socket setup failed: {0}")]
    Socket(std::io::Error),
}

/// Cumulative probe statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeStats {
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub avg_rtt: Duration,
    pub loss_pct: f64,
}

/// One live probe. Exactly one exists per active destination.
pub trait ProbeHandle: Send {
    fn statistics(&self) -> ProbeStats;
    fn ip(&self) -> IpAddr;
    fn stop(&self);
}

/// Probe factory. Failures here are admission errors: the destination is
/// rejected and logged, nothing else happens.
pub trait Prober: Send {
    fn start(
        &self,
        name: &str,
        address: &str,
        interval: Duration,
    ) -> Result<Box<dyn ProbeHandle>, ProbeError>;
}

#[derive(Default)]
struct Counters {
    sent: u64,
    recv: u64,
    rtt_sum: Duration,
}

pub struct IcmpProber {
    next_ident: AtomicU16,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self {
            // seed from the pid so concurrent bridges on one host differ
            next_ident: AtomicU16::new(std::process::id() as u16),
        }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober for IcmpProber {
    fn start(
        &self,
        name: &str,
        address: &str,
        interval: Duration,
    ) -> Result<Box<dyn ProbeHandle>, ProbeError> {
        let ip = resolve(address)?;
        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config).map_err(ProbeError::Socket)?;
        let ident = PingIdentifier(self.next_ident.fetch_add(1, Ordering::Relaxed));
        let counters: Arc<Mutex<Counters>> = Arc::new(Mutex::new(Counters::default()));

        let task = tokio::spawn(probe_loop(
            client,
            ip,
            ident,
            interval,
            counters.clone(),
            name.to_string(),
        ));

        Ok(Box::new(IcmpProbe { ip, counters, task }))
    }
}

async fn probe_loop(
    client: Client,
    ip: IpAddr,
    ident: PingIdentifier,
    interval: Duration,
    counters: Arc<Mutex<Counters>>,
    name: String,
) {
    let mut pinger = client.pinger(ip, ident).await;
    pinger.timeout(interval.min(MAX_REPLY_WAIT));

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u16 = 0;

    loop {
        ticker.tick().await;
        counters.lock().sent += 1;
        match pinger.ping(PingSequence(seq), &PROBE_PAYLOAD).await {
            Ok((_packet, rtt)) => {
                let mut c = counters.lock();
                c.recv += 1;
                c.rtt_sum += rtt;
            }
            Err(e) => trace!("{name} probe seq {seq}: no reply ({e})"),
        }
        seq = seq.wrapping_add(1);
    }
}

struct IcmpProbe {
    ip: IpAddr,
    counters: Arc<Mutex<Counters>>,
    task: JoinHandle<()>,
}

impl ProbeHandle for IcmpProbe {
    fn statistics(&self) -> ProbeStats {
        let c = self.counters.lock();
        let avg_rtt = if c.recv > 0 {
            c.rtt_sum / c.recv as u32
        } else {
            Duration::ZERO
        };
        let loss_pct = if c.sent > 0 {
            (c.sent - c.recv) as f64 * 100.0 / c.sent as f64
        } else {
            0.0
        };
        ProbeStats {
            packets_sent: c.sent,
            packets_recv: c.recv,
            avg_rtt,
            loss_pct,
        }
    }

    fn ip(&self) -> IpAddr {
        self.ip
    }

    fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for IcmpProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn resolve(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (address, 0u16)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Resolve(address.to_string(), e))?;
    addrs
        .next()
        .map(|sock| sock.ip())
        .ok_or_else(|| ProbeError::NoAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_addresses() {
        assert_eq!(resolve("127.0.0.1").unwrap(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(resolve("::1").unwrap(), "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(resolve("definitely.not.a.real.host.invalid").is_err());
    }

    #[test]
    fn test_distinct_identifiers() {
        let prober = IcmpProber::new();
        let a = prober.next_ident.fetch_add(1, Ordering::Relaxed);
        let b = prober.next_ident.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}
