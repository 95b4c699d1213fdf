//! Destination manager.
//!
//! One task owns the destination table and everything that mutates it:
//! admission from the static config, add/remove/replace over the bus,
//! the periodic liveness evaluation and the telemetry publishing. The
//! table is never touched from anywhere else, so it needs no lock.

use crate::config::{AppConfig, DestinationDef};
use crate::mqtt::Msg;
use crate::probe::{ProbeHandle, Prober};
use crate::topics::{first_n, TopicScheme};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant};
use tracing::{info, trace, warn};

const DEFAULT_INTERVAL_SECS: u64 = 3;
const DEFAULT_UPDATE_STATUS_SECS: u64 = 5;

/// Smallest value we can safely use as the liveness evaluation period.
const MIN_UPDATE_STATUS_SECS: u64 = 2;

/// Offline transitions publish only after this many consecutive offline
/// ticks; online transitions publish immediately.
const OFFLINE_DEBOUNCE_TICKS: u32 = 3;

const ADVERTISE_DISABLED: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);
const IDLE_LOG_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Structured form of a `destination/<name>` payload. Capitalized aliases
/// accept payloads produced by Go-style publishers.
#[derive(Debug, Deserialize)]
struct DestinationPayload {
    #[serde(default, alias = "Address")]
    address: String,
    #[serde(default, alias = "Interval")]
    interval: u64,
}

struct Destination {
    name: String,
    address: String,
    interval_secs: u64,
    probe: Box<dyn ProbeHandle>,
    last_packets_sent: u64,
    last_packets_recv: u64,
    last_online: bool,
    consecutive_offlines: u32,
}

pub struct Manager {
    default_interval_secs: u64,
    advertisements_secs: i64,
    update_status_secs: u64,
    destinations: HashMap<String, Destination>,
    topics: TopicScheme,
    prober: Box<dyn Prober>,
    pub_tx: mpsc::Sender<Msg>,
    /// Telemetry key order, computed on the first publish and reused for
    /// every later one so payloads stay byte-comparable.
    info_keys: Option<Vec<String>>,
}

/// Builds the manager from the static config and spawns its event loop.
/// The returned receiver fires once the loop has stopped every probe.
pub fn start(
    cfg: AppConfig,
    topics: TopicScheme,
    prober: Box<dyn Prober>,
    pub_tx: mpsc::Sender<Msg>,
    sub_rx: mpsc::Receiver<Msg>,
    shutdown: watch::Receiver<bool>,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let mut mgr = Manager::new(cfg, topics, prober, pub_tx);
    tokio::spawn(async move {
        mgr.run(sub_rx, shutdown).await;
        let _ = done_tx.send(());
    });
    done_rx
}

impl Manager {
    fn new(
        cfg: AppConfig,
        topics: TopicScheme,
        prober: Box<dyn Prober>,
        pub_tx: mpsc::Sender<Msg>,
    ) -> Self {
        let mut mgr = Self {
            default_interval_secs: if cfg.interval > 0 { cfg.interval } else { DEFAULT_INTERVAL_SECS },
            advertisements_secs: cfg.advertisements,
            update_status_secs: if cfg.update_interval > 0 {
                cfg.update_interval
            } else {
                DEFAULT_UPDATE_STATUS_SECS
            },
            destinations: HashMap::new(),
            topics,
            prober,
            pub_tx,
            info_keys: None,
        };
        for def in cfg.destinations {
            mgr.add_destination(def);
        }
        if mgr.destinations.is_empty() {
            warn!("no valid destinations from config: use the destination topic to add some");
        }
        mgr
    }

    async fn run(&mut self, mut sub_rx: mpsc::Receiver<Msg>, mut shutdown: watch::Receiver<bool>) {
        let advertise_period = if self.advertisements_secs > 0 {
            info!("advertisements will be sent every {} seconds", self.advertisements_secs);
            Duration::from_secs(self.advertisements_secs as u64)
        } else {
            ADVERTISE_DISABLED
        };
        let mut advertise = interval_at(Instant::now() + advertise_period, advertise_period);

        let status_secs = self.update_status_secs.max(MIN_UPDATE_STATUS_SECS);
        info!("checking for probe updates every {status_secs} seconds");
        let status_period = Duration::from_secs(status_secs);
        let mut status = interval_at(Instant::now() + status_period, status_period);

        let mut idle = interval_at(Instant::now() + IDLE_LOG_PERIOD, IDLE_LOG_PERIOD);

        info!(
            "for destination liveness, subscribe to topic {}",
            self.topics.state_topic("#")
        );
        info!(
            "for destination details, subscribe to topic {}",
            self.topics.info_topic("#")
        );

        loop {
            tokio::select! {
                maybe = sub_rx.recv() => match maybe {
                    Some(msg) => self.handle_msg(msg).await,
                    None => {
                        warn!("inbound queue closed, stopping manager");
                        break;
                    }
                },
                _ = advertise.tick() => self.publish_all_destinations().await,
                _ = status.tick() => self.handle_update_status_tick().await,
                _ = idle.tick() => trace!("manager happy loop"),
                _ = shutdown.changed() => break,
            }
        }

        for destination in self.destinations.values() {
            trace!("stopping probe {}", destination.name);
            destination.probe.stop();
        }
        info!("manager main loop is finished");
    }

    async fn handle_msg(&mut self, msg: Msg) {
        if let Some(name) = self.topics.parse_status(&msg.topic) {
            self.msg_parse_status(&name, &msg.payload).await;
        } else if let Some(name) = self.topics.parse_config(&msg.topic) {
            self.msg_parse_config(&name, &msg.payload).await;
        } else {
            info!(
                "unhandled: topic {} payload {:?}...",
                msg.topic,
                first_n(&msg.payload, 10)
            );
        }
    }

    async fn msg_parse_status(&mut self, name: &str, payload: &str) {
        if !payload.is_empty() {
            warn!("ignoring unused payload: {:?}", first_n(payload, 10));
        }
        if name.is_empty() {
            self.publish_all_destinations().await;
            return;
        }
        if self.destinations.contains_key(name) {
            self.publish_destination(name).await;
        } else {
            warn!("no status for destination {name}: not-found");
        }
    }

    async fn msg_parse_config(&mut self, name: &str, payload: &str) {
        if !payload.is_empty() {
            self.handle_destination_add(name, payload);
        } else {
            self.remove_destination(name, true);
        }
    }

    /// Add-or-replace from a bus payload: a JSON object must decode as
    /// `{address, interval}`; anything else is a bare address string.
    fn handle_destination_add(&mut self, name: &str, payload: &str) {
        let def = if payload.trim_start().starts_with('{') {
            match serde_json::from_str::<DestinationPayload>(payload) {
                Ok(parsed) => DestinationDef {
                    name: name.to_string(),
                    address: parsed.address,
                    interval: parsed.interval,
                },
                Err(e) => {
                    warn!("unparsable destination payload {:?}: {e}", first_n(payload, 40));
                    return;
                }
            }
        } else {
            DestinationDef {
                name: name.to_string(),
                address: payload.trim().to_string(),
                interval: 0,
            }
        };
        // replace-in-place: drop any existing entry first
        self.remove_destination(name, false);
        self.add_destination(def);
    }

    fn add_destination(&mut self, mut def: DestinationDef) {
        if def.address.is_empty() {
            warn!("ignoring destination with no address: {def:?}");
            return;
        }
        if def.name.is_empty() {
            def.name = def.address.clone();
        }
        if self.destinations.contains_key(&def.name) {
            warn!("ignoring duplicate destination name: {}", def.name);
            return;
        }
        if def.interval == 0 {
            def.interval = self.default_interval_secs;
        }

        let probe = match self
            .prober
            .start(&def.name, &def.address, Duration::from_secs(def.interval))
        {
            Ok(probe) => probe,
            Err(e) => {
                warn!("ignoring invalid destination {}: {e}", def.name);
                return;
            }
        };

        info!("added destination {} ({})", def.name, probe.ip());
        self.destinations.insert(
            def.name.clone(),
            Destination {
                name: def.name,
                address: def.address,
                interval_secs: def.interval,
                probe,
                last_packets_sent: 0,
                last_packets_recv: 0,
                last_online: false,
                consecutive_offlines: 0,
            },
        );
    }

    fn remove_destination(&mut self, name: &str, log_not_found: bool) {
        match self.destinations.remove(name) {
            None => {
                if log_not_found {
                    warn!("ignoring removal of destination {name}: not-found");
                }
            }
            Some(destination) => {
                destination.probe.stop();
                info!("removed destination {name} ({})", destination.probe.ip());
            }
        }
    }

    /// Liveness evaluation against the last snapshot. A tick where the
    /// received count did not move and at most one new packet went out is
    /// inconclusive (a probe may be in flight) and changes nothing.
    async fn handle_update_status_tick(&mut self) {
        let mut transitions = Vec::new();
        for destination in self.destinations.values_mut() {
            let stats = destination.probe.statistics();
            let delta_sent = stats.packets_sent - destination.last_packets_sent;

            let online = if stats.packets_recv != destination.last_packets_recv {
                true
            } else if delta_sent <= 1 {
                continue;
            } else {
                false
            };

            let changed = online != destination.last_online;
            destination.last_packets_recv = stats.packets_recv;
            destination.last_packets_sent = stats.packets_sent;
            destination.last_online = online;

            trace!(
                "{} probe {} sent: {} received: {} ({:.0}% loss) online: {} changed: {} consecutive offline: {}",
                destination.name,
                destination.probe.ip(),
                destination.last_packets_sent,
                destination.last_packets_recv,
                stats.loss_pct,
                online,
                changed,
                destination.consecutive_offlines,
            );

            if online {
                if changed {
                    info!("{} probe is now online", destination.name);
                    transitions.push(destination.name.clone());
                }
                destination.consecutive_offlines = 0;
            } else {
                // the counter keeps growing past the threshold, so the
                // transition cannot refire until an online flip resets it
                destination.consecutive_offlines += 1;
                if destination.consecutive_offlines == OFFLINE_DEBOUNCE_TICKS {
                    info!("{} probe is now offline", destination.name);
                    transitions.push(destination.name.clone());
                }
            }
        }
        for name in transitions {
            self.publish_destination(&name).await;
        }
    }

    async fn publish_all_destinations(&mut self) {
        info!("publishing {} destinations", self.destinations.len());
        let names: Vec<String> = self.destinations.keys().cloned().collect();
        for name in names {
            self.publish_destination(&name).await;
        }
    }

    /// Emits the liveness message followed by the telemetry message.
    async fn publish_destination(&mut self, name: &str) {
        let Some(destination) = self.destinations.get(name) else {
            return;
        };
        let state_msg = self.topics.state_message(&destination.name, destination.last_online);
        let state_payload = state_msg.payload.clone();

        let stats = destination.probe.statistics();
        let ip = destination.probe.ip().to_string();
        let values: HashMap<&str, String> = HashMap::from([
            ("name", destination.name.clone()),
            ("address", destination.address.clone()),
            ("ip", ip.clone()),
            ("packets_sent", destination.last_packets_sent.to_string()),
            ("packets_received", destination.last_packets_recv.to_string()),
            ("interval_in_seconds", destination.interval_secs.to_string()),
            ("is_online", destination.last_online.to_string()),
            ("consecutive_offline", destination.consecutive_offlines.to_string()),
            ("rtt_in_milliseconds", stats.avg_rtt.as_millis().to_string()),
            ("packets_loss_percent", format!("{:.0}%", stats.loss_pct)),
        ]);

        // assembled once, reused for the process lifetime
        if self.info_keys.is_none() {
            let mut keys: Vec<String> = values.keys().map(|k| k.to_string()).collect();
            keys.sort();
            info!("assembled publish info keys cache: {keys:?}");
            self.info_keys = Some(keys);
        }
        let mut object = serde_json::Map::new();
        if let Some(keys) = &self.info_keys {
            for key in keys {
                let value = values.get(key.as_str()).cloned().unwrap_or_default();
                object.insert(key.clone(), serde_json::Value::String(value));
            }
        }
        let info_msg = self
            .topics
            .info_message(&destination.name, serde_json::Value::Object(object).to_string());

        if self.pub_tx.send(state_msg).await.is_err() || self.pub_tx.send(info_msg).await.is_err() {
            warn!("outbound queue closed, dropping publish for {name}");
            return;
        }
        info!("published destination {name} ({ip}): {state_payload}");
    }
}
