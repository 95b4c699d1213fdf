//! Connection supervisor: keeps exactly one live, subscribed MQTT
//! connection, retrying forever on a fixed cooldown, and pumps messages
//! between the broker and the manager.
//!
//! Two tasks run here. The state machine task owns the rumqttc event loop
//! and walks `Disconnected -> Connecting -> Subscribing -> Connected`
//! (`Draining` on shutdown), rebuilding the client every cycle instead of
//! relying on rumqttc's built-in reconnect. The pump task forwards inbound
//! publishes to the manager and drains the manager's outbound queue into
//! the current live client. Nothing in this module can take the process
//! down; every expired wait is a soft failure back to the cooldown.

use crate::config::MqttSettings;
use crate::topics::{first_n, TopicScheme};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the manager-facing inbound queue (created by main).
pub const SUB_QUEUE_CAP: usize = 1024;

const PUB_QUEUE_CAP: usize = 512;
const RAW_QUEUE_CAP: usize = 1024;

const KEEP_ALIVE: Duration = Duration::from_secs(61);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const SUBACK_TIMEOUT: Duration = Duration::from_secs(20);
const RETRY_COOLDOWN: Duration = Duration::from_secs(15);
const DISCONNECT_QUIESCE: Duration = Duration::from_millis(500);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_PACING: Duration = Duration::from_millis(500);
const IDLE_LOG_PERIOD: Duration = Duration::from_secs(180);

/// A bus message, either direction.
#[derive(Debug, Clone)]
pub struct Msg {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Subscribing,
    Connected,
    Draining,
}

enum CycleEnd {
    Lost,
    Shutdown,
}

type LiveClient = Arc<Mutex<Option<AsyncClient>>>;

/// Starts the supervisor tasks. Returns the outbound queue the manager
/// publishes into; inbound messages arrive on `sub_tx`'s receiving end.
pub fn start(
    settings: MqttSettings,
    topics: TopicScheme,
    sub_tx: mpsc::Sender<Msg>,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Sender<Msg> {
    let (pub_tx, pub_rx) = mpsc::channel(PUB_QUEUE_CAP);
    let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAP);
    let live: LiveClient = Arc::new(Mutex::new(None));

    tokio::spawn(connection_task(
        settings,
        topics,
        raw_tx,
        live.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(pump_task(raw_rx, sub_tx, pub_rx, live, shutdown));

    pub_tx
}

/// One connection cycle per iteration; the loop itself is the retry
/// mechanism (fixed cooldown, no backoff escalation).
async fn connection_task(
    settings: MqttSettings,
    topics: TopicScheme,
    raw_tx: mpsc::Sender<Msg>,
    live: LiveClient,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = ConnState::Disconnected;
    loop {
        if *shutdown.borrow() {
            break;
        }
        transition(&mut state, ConnState::Connecting);
        info!("connecting to mqtt {}:{}", settings.host, settings.port);

        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(KEEP_ALIVE);
        if !settings.user.is_empty() {
            opts.set_credentials(&settings.user, &settings.pass);
        }
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        *live.lock() = Some(client.clone());

        let end = run_cycle(
            &client,
            &mut eventloop,
            &mut state,
            &topics,
            &raw_tx,
            &mut shutdown,
        )
        .await;

        *live.lock() = None;
        let _ = client.disconnect().await;
        sleep(DISCONNECT_QUIESCE).await;
        transition(&mut state, ConnState::Disconnected);

        match end {
            CycleEnd::Shutdown => break,
            CycleEnd::Lost => {
                // settle delay before any new cycle; throttles reconnect storms
                tokio::select! {
                    _ = sleep(RETRY_COOLDOWN) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    debug!("connection supervisor finished");
}

async fn run_cycle(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    state: &mut ConnState,
    topics: &TopicScheme,
    raw_tx: &mpsc::Sender<Msg>,
    shutdown: &mut watch::Receiver<bool>,
) -> CycleEnd {
    // Connecting: the connect attempt itself, then the broker's ack.
    let first = match timeout(CONNECT_TIMEOUT, eventloop.poll()).await {
        Err(_) => {
            warn!("supervisor was unable to connect: timed out");
            return CycleEnd::Lost;
        }
        Ok(Err(e)) => {
            warn!("supervisor was unable to connect: {e}");
            return CycleEnd::Lost;
        }
        Ok(Ok(event)) => event,
    };
    if !matches!(first, Event::Incoming(Incoming::ConnAck(_))) {
        match timeout(CONNACK_TIMEOUT, await_connack(eventloop)).await {
            Err(_) => {
                warn!("supervisor connect ack timeout");
                return CycleEnd::Lost;
            }
            Ok(Err(e)) => {
                warn!("supervisor connection failed before ack: {e}");
                return CycleEnd::Lost;
            }
            Ok(Ok(())) => {}
        }
    }
    trace!("supervisor connected and got connect ack");

    // Subscribing: all filters must be acknowledged before Connected.
    transition(state, ConnState::Subscribing);
    let filters = topics.subscriptions();
    for filter in &filters {
        if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
            warn!("supervisor was unable to subscribe to {filter}: {e}");
            return CycleEnd::Lost;
        }
    }
    let mut pending = filters.len();
    while pending > 0 {
        match timeout(SUBACK_TIMEOUT, eventloop.poll()).await {
            Err(_) => {
                warn!("supervisor subscribe ack timeout ({pending} outstanding)");
                return CycleEnd::Lost;
            }
            Ok(Err(e)) => {
                warn!("supervisor connection failed while subscribing: {e}");
                return CycleEnd::Lost;
            }
            Ok(Ok(Event::Incoming(Incoming::SubAck(_)))) => {
                pending -= 1;
                trace!("supervisor subscription acked ({pending} outstanding)");
            }
            Ok(Ok(Event::Incoming(Incoming::Publish(p)))) => forward(raw_tx, p).await,
            Ok(Ok(_)) => {}
        }
    }

    // Connected: forward publishes until the connection dies or we drain.
    transition(state, ConnState::Connected);
    let mut idle = interval_at(Instant::now() + IDLE_LOG_PERIOD, IDLE_LOG_PERIOD);
    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::Publish(p))) => forward(raw_tx, p).await,
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    info!("supervisor got disconnect from broker");
                    return CycleEnd::Lost;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("supervisor lost connection: {e}");
                    return CycleEnd::Lost;
                }
            },
            _ = idle.tick() => trace!("supervisor happy loop"),
            _ = shutdown.changed() => {
                transition(state, ConnState::Draining);
                return CycleEnd::Shutdown;
            }
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn forward(raw_tx: &mpsc::Sender<Msg>, publish: rumqttc::Publish) {
    let msg = Msg {
        topic: publish.topic.clone(),
        payload: String::from_utf8_lossy(&publish.payload).to_string(),
    };
    // bounded queue: a slow manager stalls delivery rather than dropping
    if raw_tx.send(msg).await.is_err() {
        debug!("inbound queue closed, dropping message from {}", publish.topic);
    }
}

/// Forwards inbound messages to the manager and publishes outbound ones on
/// the current live client. Publish failures are logged and dropped, never
/// retried.
async fn pump_task(
    mut raw_rx: mpsc::Receiver<Msg>,
    sub_tx: mpsc::Sender<Msg>,
    mut pub_rx: mpsc::Receiver<Msg>,
    live: LiveClient,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = raw_rx.recv() => match maybe {
                Some(msg) => {
                    trace!("pump received {} {:?}...", msg.topic, first_n(&msg.payload, 10));
                    if sub_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            maybe = pub_rx.recv() => match maybe {
                Some(msg) => publish_outbound(&live, msg).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("message pump finished");
}

async fn publish_outbound(live: &LiveClient, msg: Msg) {
    let client = live.lock().clone();
    let Some(client) = client else {
        warn!("dropping publish while disconnected: {}", msg.topic);
        return;
    };
    match timeout(
        PUBLISH_TIMEOUT,
        client.publish(msg.topic.clone(), QoS::AtMostOnce, false, msg.payload.clone()),
    )
    .await
    {
        Ok(Ok(())) => {
            trace!("pump sent {} {:?}...", msg.topic, first_n(&msg.payload, 10));
            // small pacing delay so we never overrun the client's send path
            sleep(PUBLISH_PACING).await;
        }
        Ok(Err(e)) => error!("pump failed sending to {}: {e}", msg.topic),
        Err(_) => error!("pump timed out sending to {}", msg.topic),
    }
}

fn transition(state: &mut ConnState, next: ConnState) {
    if *state != next {
        debug!("connection state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_forwards_inbound_in_order() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        let (_pub_tx, pub_rx) = mpsc::channel::<Msg>(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let live: LiveClient = Arc::new(Mutex::new(None));

        tokio::spawn(pump_task(raw_rx, sub_tx, pub_rx, live, shutdown_rx));

        for i in 0..3 {
            raw_tx
                .send(Msg { topic: format!("t/{i}"), payload: format!("p{i}") })
                .await
                .unwrap();
        }
        for i in 0..3 {
            let msg = sub_rx.recv().await.unwrap();
            assert_eq!(msg.topic, format!("t/{i}"));
            assert_eq!(msg.payload, format!("p{i}"));
        }
    }

    #[tokio::test]
    async fn test_pump_drops_outbound_without_live_client() {
        let (_raw_tx, raw_rx) = mpsc::channel(8);
        let (sub_tx, _sub_rx) = mpsc::channel(8);
        let (pub_tx, pub_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let live: LiveClient = Arc::new(Mutex::new(None));

        let pump = tokio::spawn(pump_task(raw_rx, sub_tx, pub_rx, live, shutdown_rx));

        pub_tx
            .send(Msg { topic: "x/state/a".into(), payload: "online".into() })
            .await
            .unwrap();
        // message is consumed and dropped; the pump keeps running
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pump.is_finished());

        shutdown_tx.send(true).unwrap();
        pump.await.unwrap();
    }
}
