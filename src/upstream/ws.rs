//! Streaming push client for the exchange's ticker WebSocket.
//!
//! One supervised connection: a reader task drains the socket while a pinger
//! task owns the write half and watches for missed pongs. Both hang off a
//! shared cancellation token, so `close()` and a dead-connection verdict use
//! the same teardown path. Lost connections are re-dialed with exponential
//! backoff and the last-known subscription set is replayed.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LtpError, Result};
use crate::pairs::PairMapper;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(120);

/// Invoked for every accepted price update with the standard pair name.
/// Must be cheap and non-blocking: it runs on the reader task.
pub type UpdateCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// Extra grace beyond `ping_interval` before the link counts as dead.
    pub pong_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_tries: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.kraken.com/".to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(45),
            pong_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_tries: 5,
        }
    }
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
    Reconnecting,
    Closed,
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    event: &'static str,
    pair: &'a [String],
    subscription: SubscriptionSpec,
}

#[derive(Debug, Serialize)]
struct SubscriptionSpec {
    name: &'static str,
}

pub struct PushClient {
    config: PushConfig,
    mapper: Arc<PairMapper>,
    callback: Option<UpdateCallback>,

    state: RwLock<ConnState>,
    /// Last traded price per standard pair, fed by the reader.
    prices: RwLock<HashMap<String, f64>>,
    last_update: RwLock<Option<Instant>>,
    /// Any inbound traffic counts as proof of life. Shared with the pinger,
    /// which runs past `&self` borrows.
    last_activity: Arc<RwLock<Instant>>,
    /// Push-format names replayed after every reconnect.
    subscriptions: RwLock<Vec<String>>,
    reconnect_attempts: AtomicU32,
    cancel: CancellationToken,
}

impl PushClient {
    pub fn new(
        config: PushConfig,
        mapper: Arc<PairMapper>,
        callback: Option<UpdateCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            mapper,
            callback,
            state: RwLock::new(ConnState::Disconnected),
            prices: RwLock::new(HashMap::new()),
            last_update: RwLock::new(None),
            last_activity: Arc::new(RwLock::new(Instant::now())),
            subscriptions: RwLock::new(Vec::new()),
            reconnect_attempts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Begin streaming the given standard pairs. Spawns the supervisor and
    /// returns immediately; connection failures surface through
    /// `is_connected()` and the reconnect loop rather than this call.
    pub fn start(self: &Arc<Self>, std_pairs: &[String]) -> Result<()> {
        if *self.state.read() == ConnState::Closed {
            return Err(LtpError::Internal(anyhow::anyhow!(
                "push client already closed"
            )));
        }

        let push_names: Vec<String> = std_pairs
            .iter()
            .filter_map(|pair| {
                let name = self.mapper.to_push(pair);
                if name.is_none() {
                    warn!(pair = %pair, "no streaming name for pair, skipping subscription");
                }
                name
            })
            .collect();
        *self.subscriptions.write() = push_names;

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run().await;
        });

        Ok(())
    }

    /// Latest prices by standard pair name. Returns a copy.
    pub fn latest_prices(&self) -> HashMap<String, f64> {
        self.prices.read().clone()
    }

    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.read()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state.read(),
            ConnState::Connected | ConnState::Subscribing | ConnState::Subscribed
        )
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    /// Tear down the connection and stop both loops. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        *self.state.write() = ConnState::Closed;
    }

    /// Supervisor: dial, stream, back off, retry. Gives up for good after
    /// `max_reconnect_tries` consecutive failures.
    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_stream().await {
                Ok(()) => break,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }

                    let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > self.config.max_reconnect_tries {
                        error!(
                            tries = self.config.max_reconnect_tries,
                            error = %e,
                            "giving up on streaming connection"
                        );
                        *self.state.write() = ConnState::Disconnected;
                        return;
                    }

                    let delay = backoff_delay(self.config.reconnect_delay, attempt);
                    *self.state.write() = ConnState::Reconnecting;
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "streaming connection lost, reconnecting"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        *self.state.write() = ConnState::Closed;
        info!("streaming client stopped");
    }

    async fn connect_and_stream(&self) -> Result<()> {
        *self.state.write() = ConnState::Connecting;
        info!(url = %self.config.url, "🔌 connecting to streaming endpoint");

        let connected = timeout(self.config.connect_timeout, connect_async(&self.config.url))
            .await
            .map_err(|_| {
                LtpError::UpstreamUnavailable(format!(
                    "websocket connect exceeded {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| LtpError::UpstreamUnavailable(format!("websocket connect: {e}")))?;

        let (ws, response) = connected;
        info!(status = %response.status(), "✅ streaming endpoint connected");
        *self.state.write() = ConnState::Connected;

        let (mut sink, source) = ws.split();

        let pairs = self.subscriptions.read().clone();
        if !pairs.is_empty() {
            *self.state.write() = ConnState::Subscribing;
            let frame = SubscribeFrame {
                event: "subscribe",
                pair: &pairs,
                subscription: SubscriptionSpec { name: "ticker" },
            };
            let payload = serde_json::to_string(&frame)
                .map_err(|e| LtpError::Internal(anyhow::anyhow!("encode subscribe frame: {e}")))?;

            sink.send(Message::Text(payload))
                .await
                .map_err(|e| LtpError::UpstreamUnavailable(format!("subscribe write: {e}")))?;
            info!(pairs = ?pairs, "📡 subscribed to ticker stream");
        }

        // Subscription is ack-implicit: the write succeeded, updates follow.
        *self.state.write() = ConnState::Subscribed;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.last_activity.write() = Instant::now();

        // The pinger owns the write half for the life of this connection;
        // tripping `conn_cancel` is how either side declares it dead.
        let conn_cancel = self.cancel.child_token();
        let pinger = tokio::spawn(ping_loop(
            sink,
            conn_cancel.clone(),
            PingProbe {
                interval: self.config.ping_interval,
                grace: self.config.pong_timeout,
            },
            Arc::clone(&self.last_activity),
        ));

        let result = self.read_loop(source, &conn_cancel).await;

        conn_cancel.cancel();
        let _ = pinger.await;
        result
    }

    async fn read_loop(&self, mut source: WsSource, conn_cancel: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    return if self.cancel.is_cancelled() {
                        Ok(())
                    } else {
                        Err(LtpError::UpstreamUnavailable(
                            "no pong within grace period".to_string(),
                        ))
                    };
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            *self.last_activity.write() = Instant::now();
                            self.handle_message(message);
                        }
                        Some(Err(e)) => {
                            return Err(LtpError::UpstreamUnavailable(format!(
                                "websocket read: {e}"
                            )));
                        }
                        None => {
                            return Err(LtpError::UpstreamUnavailable(
                                "websocket stream ended".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Text(text) => self.handle_text(&text),
            Message::Pong(_) => debug!("pong received"),
            // The protocol library answers pings on its own.
            Message::Ping(_) => {}
            Message::Close(frame) => info!(?frame, "close frame received"),
            _ => {}
        }
    }

    fn handle_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "undecodable streaming frame");
                return;
            }
        };

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            if let Some(message) = value.get("errorMessage").and_then(Value::as_str) {
                if !message.is_empty() {
                    warn!(event, error = %message, "exchange reported a streaming error");
                    return;
                }
            }
            match event {
                "systemStatus" => debug!(payload = %text, "system status"),
                "subscriptionStatus" => info!(payload = %text, "subscription status"),
                "heartbeat" => debug!("heartbeat"),
                "pong" => debug!("protocol pong"),
                other => debug!(event = other, "unhandled event"),
            }
            return;
        }

        let Some((push_pair, price)) = parse_ticker_frame(&value) else {
            return;
        };

        let Some(std_pair) = self.mapper.from_push(&push_pair) else {
            debug!(pair = %push_pair, "ticker update for unmapped pair");
            return;
        };

        self.prices.write().insert(std_pair.clone(), price);
        *self.last_update.write() = Some(Instant::now());

        if let Some(callback) = &self.callback {
            callback(&std_pair, price);
        }
    }
}

struct PingProbe {
    interval: Duration,
    grace: Duration,
}

async fn ping_loop(
    mut sink: WsSink,
    conn_cancel: CancellationToken,
    probe: PingProbe,
    last_activity: Arc<RwLock<Instant>>,
) {
    let mut tick = tokio::time::interval(probe.interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; the connection just opened, so
    // skip straight to the cadence.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            _ = tick.tick() => {
                let idle = last_activity.read().elapsed();
                if idle > probe.interval + probe.grace {
                    warn!(idle_secs = idle.as_secs(), "connection silent past grace period");
                    let _ = sink.close().await;
                    conn_cancel.cancel();
                    return;
                }

                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    conn_cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Exponential backoff for reconnect attempt `n` (1-based), capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(MAX_RECONNECT_BACKOFF)
}

/// Extract `(push pair name, last price)` from an array-form data frame.
/// Only the `ticker` channel is considered.
fn parse_ticker_frame(value: &Value) -> Option<(String, f64)> {
    let array = value.as_array()?;
    if array.len() < 4 {
        return None;
    }
    if array[2].as_str()? != "ticker" {
        return None;
    }

    let pair = array[3].as_str()?;
    let close = array.get(1)?.get("c")?.get(0)?.as_str()?;
    let price: f64 = close.parse().ok()?;
    if !price.is_finite() || price < 0.0 {
        return None;
    }

    Some((pair.to_string(), price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn legacy_mapper() -> Arc<PairMapper> {
        Arc::new(PairMapper::new(
            reqwest::Client::new(),
            "http://localhost:1".to_string(),
            Duration::from_secs(3600),
        ))
    }

    #[test]
    fn parses_ticker_array_frames() {
        let frame: Value = serde_json::from_str(
            r#"[42, {"c":["50123.5","0.01317184"], "v":["10.1","20.2"]}, "ticker", "XBT/USD"]"#,
        )
        .unwrap();

        assert_eq!(
            parse_ticker_frame(&frame),
            Some(("XBT/USD".to_string(), 50123.5))
        );
    }

    #[test]
    fn ignores_non_ticker_channels_and_short_frames() {
        let trade: Value =
            serde_json::from_str(r#"[7, [["1.0","2.0","3.0","s","m",""]], "trade", "XBT/USD"]"#)
                .unwrap();
        assert_eq!(parse_ticker_frame(&trade), None);

        let short: Value = serde_json::from_str(r#"[7, {"c":["1.0","2.0"]}]"#).unwrap();
        assert_eq!(parse_ticker_frame(&short), None);

        let object: Value = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(parse_ticker_frame(&object), None);
    }

    #[test]
    fn rejects_unparsable_prices() {
        let frame: Value =
            serde_json::from_str(r#"[42, {"c":["not-a-price","0"]}, "ticker", "XBT/USD"]"#)
                .unwrap();
        assert_eq!(parse_ticker_frame(&frame), None);

        let negative: Value =
            serde_json::from_str(r#"[42, {"c":["-5.0","0"]}, "ticker", "XBT/USD"]"#).unwrap();
        assert_eq!(parse_ticker_frame(&negative), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff_delay(base, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);

        assert_eq!(backoff_delay(base, 6), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 30), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn accepted_updates_land_in_the_snapshot_and_callback() {
        let seen: Arc<Mutex<Vec<(String, f64)>>> = Arc::new(Mutex::new(Vec::new()));
        let callback: UpdateCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |pair: &str, price: f64| {
                seen.lock().push((pair.to_string(), price));
            })
        };

        let client = PushClient::new(PushConfig::default(), legacy_mapper(), Some(callback));
        client.handle_text(r#"[42, {"c":["50123.5","0.1"]}, "ticker", "XBT/USD"]"#);

        assert_eq!(client.latest_prices().get("BTC/USD"), Some(&50123.5));
        assert!(client.last_update().is_some());
        assert_eq!(seen.lock().as_slice(), &[("BTC/USD".to_string(), 50123.5)]);
    }

    #[tokio::test]
    async fn unmapped_pairs_are_dropped() {
        let client = PushClient::new(PushConfig::default(), legacy_mapper(), None);
        client.handle_text(r#"[42, {"c":["1.23","0"]}, "ticker", "DOGE/MARS"]"#);

        assert!(client.latest_prices().is_empty());
        assert!(client.last_update().is_none());
    }

    #[tokio::test]
    async fn event_frames_do_not_touch_the_snapshot() {
        let client = PushClient::new(PushConfig::default(), legacy_mapper(), None);
        client.handle_text(r#"{"event":"systemStatus","status":"online","version":"1.9.0"}"#);
        client.handle_text(r#"{"event":"heartbeat"}"#);
        client.handle_text(
            r#"{"event":"subscriptionStatus","status":"error","errorMessage":"Subscription depth not supported"}"#,
        );

        assert!(client.latest_prices().is_empty());
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let client = PushClient::new(PushConfig::default(), legacy_mapper(), None);
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(!client.is_connected());

        client.close();
        assert_eq!(client.state(), ConnState::Closed);
        client.close();
        assert_eq!(client.state(), ConnState::Closed);

        assert!(client.start(&["BTC/USD".to_string()]).is_err());
    }
}

