//! Streaming connection lifecycle for one exchange.
//!
//! [`ConnectionStateMachine`] holds every decision (state, epochs, backoff, circuit breaker,
//! missed pongs) and takes the current instant as input. [`ConnectionManager`] drives it with
//! tokio timers and a socket task. Every timer and socket task carries the epoch it was armed
//! for; inputs from an older epoch are ignored by the machine, and `disconnect()` aborts and
//! joins all tasks before returning.

use crate::config::ResilienceConfig;
use crate::core::{GatewayEvent, Ticker};
use crate::exchanges::error::{ErrorKind, GatewayError, GatewayResult};
use crate::exchanges::transport::{StreamConnection, StreamTransport, WsFrame};
use crate::market_data::MarketDataCache;
use crate::realtime::{BackoffPolicy, CircuitBreaker, CircuitState};
use log::{debug, error, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};

/// Connection state of a streaming adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    ReconnectWait,
    CircuitOpen,
}

impl ConnectionState {
    /// Connected or degraded: the socket is up and ticks may still arrive
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Outcome of a connect request or a due retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Open a socket for this epoch
    Open { epoch: u64 },
    /// A socket is already up or being opened
    AlreadyActive,
    /// Refused locally by the open circuit breaker
    Rejected { retry_in: Duration },
    /// Input belonged to an older epoch
    Stale,
}

/// Next step after a failed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Scheduled {
        epoch: u64,
        delay: Duration,
        circuit_open: bool,
    },
    /// Terminal error, no automatic retry
    GiveUp,
    Stale,
}

/// Next step after a health-check tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    SendPing,
    Reconnect { epoch: u64, delay: Duration },
    Stale,
}

/// Pure connection state machine
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    epoch: u64,
    attempt: u32,
    missed_pongs: u32,
    awaiting_pong: bool,
    max_missed_pings: u32,
    rate_limit_min_delay: Duration,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    rng: StdRng,
}

impl ConnectionStateMachine {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests
    pub fn with_seed(config: &ResilienceConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ResilienceConfig, rng: StdRng) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempt: 0,
            missed_pongs: 0,
            awaiting_pong: false,
            max_missed_pings: config.max_missed_pings.max(1),
            rate_limit_min_delay: config.rate_limit_min_delay,
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            ),
            backoff: BackoffPolicy::new(
                config.initial_delay,
                config.multiplier,
                config.max_delay,
                config.jitter_factor,
            ),
            rng,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Consecutive failed or dropped connections since the last successful handshake
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// User-initiated connect
    pub fn request_connect(&mut self, now: Instant) -> ConnectDecision {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Degraded
        ) {
            return ConnectDecision::AlreadyActive;
        }
        self.begin_attempt(now)
    }

    /// Retry timer armed for `epoch` has fired
    pub fn retry_due(&mut self, epoch: u64, now: Instant) -> ConnectDecision {
        if epoch != self.epoch
            || !matches!(
                self.state,
                ConnectionState::ReconnectWait | ConnectionState::CircuitOpen
            )
        {
            return ConnectDecision::Stale;
        }
        self.begin_attempt(now)
    }

    fn begin_attempt(&mut self, now: Instant) -> ConnectDecision {
        match self.breaker.try_acquire(now) {
            Ok(()) => {
                self.epoch += 1;
                self.state = ConnectionState::Connecting;
                self.missed_pongs = 0;
                self.awaiting_pong = false;
                ConnectDecision::Open { epoch: self.epoch }
            }
            Err(retry_in) => {
                self.state = ConnectionState::CircuitOpen;
                ConnectDecision::Rejected { retry_in }
            }
        }
    }

    /// Returns false when the handshake belongs to an abandoned epoch
    pub fn handshake_succeeded(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }
        self.breaker.record_success();
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.missed_pongs = 0;
        self.awaiting_pong = false;
        true
    }

    pub fn handshake_failed(&mut self, epoch: u64, kind: ErrorKind, now: Instant) -> FailureOutcome {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return FailureOutcome::Stale;
        }
        self.breaker.record_failure(now);
        self.epoch += 1;
        if kind.is_terminal() {
            self.state = ConnectionState::Disconnected;
            return FailureOutcome::GiveUp;
        }
        self.attempt = self.attempt.saturating_add(1);

        if self.breaker.state() == CircuitState::Open {
            self.state = ConnectionState::CircuitOpen;
            return FailureOutcome::Scheduled {
                epoch: self.epoch,
                delay: self.breaker.remaining(now),
                circuit_open: true,
            };
        }

        let mut delay = self.backoff.delay(self.attempt, &mut self.rng);
        if kind == ErrorKind::RateLimit {
            delay = delay.max(self.rate_limit_min_delay);
        }
        self.state = ConnectionState::ReconnectWait;
        FailureOutcome::Scheduled {
            epoch: self.epoch,
            delay,
            circuit_open: false,
        }
    }

    /// Periodic health check. The first unanswered ping degrades the connection,
    /// `max_missed_pings` unanswered pings force a reconnect.
    pub fn health_tick(&mut self, epoch: u64) -> HealthOutcome {
        if epoch != self.epoch || !self.state.is_live() {
            return HealthOutcome::Stale;
        }
        if self.awaiting_pong {
            self.missed_pongs += 1;
            if self.missed_pongs >= self.max_missed_pings {
                let (epoch, delay) = self.schedule_reconnect();
                return HealthOutcome::Reconnect { epoch, delay };
            }
            self.state = ConnectionState::Degraded;
        }
        self.awaiting_pong = true;
        HealthOutcome::SendPing
    }

    pub fn pong_received(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || !self.state.is_live() {
            return false;
        }
        self.missed_pongs = 0;
        self.awaiting_pong = false;
        self.state = ConnectionState::Connected;
        true
    }

    /// Socket of `epoch` was closed by the peer or failed. Returns the retry to arm.
    pub fn transport_closed(&mut self, epoch: u64) -> Option<(u64, Duration)> {
        if epoch != self.epoch || !self.state.is_live() {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(self.schedule_reconnect())
    }

    fn schedule_reconnect(&mut self) -> (u64, Duration) {
        self.epoch += 1;
        self.attempt = self.attempt.saturating_add(1);
        self.missed_pongs = 0;
        self.awaiting_pong = false;
        self.state = ConnectionState::ReconnectWait;
        (self.epoch, self.backoff.delay(self.attempt, &mut self.rng))
    }

    /// User-requested teardown. Returns whether anything was active.
    pub fn disconnect(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Disconnected;
        self.epoch += 1;
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
        self.missed_pongs = 0;
        self.awaiting_pong = false;
        was_active
    }
}

/// Exchange-specific half of a streaming connection
pub trait StreamHandler: Send + Sync {
    fn stream_url(&self) -> String;

    /// Frames sent right after the handshake
    fn subscribe_frames(&self) -> Vec<WsFrame>;

    fn ping_frame(&self) -> WsFrame;

    fn is_pong(&self, frame: &WsFrame) -> bool;

    /// Map one text message to a canonical ticker; anything else yields `None`
    fn parse_ticker(&self, text: &str) -> Option<Ticker>;
}

struct Inner {
    machine: ConnectionStateMachine,
    outbound: Option<mpsc::UnboundedSender<WsFrame>>,
    /// Attempt started by `connect()`
    handshake: Option<JoinHandle<()>>,
    socket_task: Option<JoinHandle<()>>,
    health_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    ping_sent_at: Option<Instant>,
    last_error: Option<String>,
}

struct Shared {
    exchange: String,
    silent: bool,
    config: ResilienceConfig,
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn StreamHandler>,
    cache: Arc<MarketDataCache>,
    events: broadcast::Sender<GatewayEvent>,
    state_tx: watch::Sender<ConnectionState>,
    latency_ms: AtomicU64,
    inner: Mutex<Inner>,
}

/// Resilience manager for one adapter's WebSocket stream
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        exchange: &str,
        config: ResilienceConfig,
        silent: bool,
        transport: Arc<dyn StreamTransport>,
        handler: Arc<dyn StreamHandler>,
        cache: Arc<MarketDataCache>,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Self {
        let machine = ConnectionStateMachine::new(&config);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                exchange: exchange.to_string(),
                silent,
                config,
                transport,
                handler,
                cache,
                events,
                state_tx,
                latency_ms: AtomicU64::new(0),
                inner: Mutex::new(Inner {
                    machine,
                    outbound: None,
                    handshake: None,
                    socket_task: None,
                    health_timer: None,
                    retry_timer: None,
                    ping_sent_at: None,
                    last_error: None,
                }),
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.shared.exchange
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every published state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Last ping round trip in milliseconds
    pub fn latency_ms(&self) -> Option<u64> {
        match self.shared.latency_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().await.last_error.clone()
    }

    /// Open the stream. The first attempt is awaited; on failure the error is returned
    /// and retries continue in the background.
    pub async fn connect(&self) -> GatewayResult<()> {
        let done = {
            let mut inner = self.shared.inner.lock().await;
            let decision = inner.machine.request_connect(Instant::now());
            self.publish(&inner);
            let epoch = match decision {
                ConnectDecision::Open { epoch } => epoch,
                ConnectDecision::AlreadyActive | ConnectDecision::Stale => return Ok(()),
                ConnectDecision::Rejected { retry_in } => {
                    if inner.retry_timer.as_ref().map_or(true, |t| t.is_finished()) {
                        let epoch = inner.machine.epoch();
                        self.arm_retry(&mut inner, epoch, retry_in);
                    }
                    return Err(self.circuit_rejection(retry_in));
                }
            };
            // detached from the caller so giving up early cannot strand the machine in
            // Connecting; owned by `Inner` so disconnect() cancels it
            let (tx, rx) = oneshot::channel();
            let manager = self.clone();
            inner.handshake = Some(tokio::spawn(async move {
                let _ = tx.send(manager.attempt(epoch).await);
            }));
            rx
        };
        done.await.unwrap_or_else(|_| {
            Err(GatewayError::not_connected(
                &self.shared.exchange,
                "connection attempt cancelled",
            ))
        })
    }

    /// Tear everything down. All timers and the socket task of every epoch are
    /// cancelled and joined before this returns. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let handles = {
            let mut inner = self.shared.inner.lock().await;
            let was_active = inner.machine.disconnect();
            inner.outbound = None;
            inner.ping_sent_at = None;
            self.publish(&inner);
            if was_active {
                self.emit(GatewayEvent::Disconnected {
                    exchange: self.shared.exchange.clone(),
                    reason: Some("disconnect requested".to_string()),
                });
            }
            [
                inner.handshake.take(),
                inner.socket_task.take(),
                inner.health_timer.take(),
                inner.retry_timer.take(),
            ]
        };
        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        crate::quiet_info!(self.shared.silent, "{} stream disconnected", self.shared.exchange);
    }

    async fn attempt(&self, epoch: u64) -> GatewayResult<()> {
        match self.open_and_subscribe().await {
            Ok(connection) => self.on_handshake_ok(epoch, connection).await,
            Err(e) => {
                self.on_handshake_failed(epoch, &e).await;
                Err(e)
            }
        }
    }

    async fn open_and_subscribe(&self) -> GatewayResult<Box<dyn StreamConnection>> {
        let shared = &self.shared;
        let url = shared.handler.stream_url();
        let opened = timeout(
            shared.config.connection_timeout,
            shared.transport.open(&shared.exchange, &url),
        )
        .await
        .map_err(|_| {
            GatewayError::network(
                &shared.exchange,
                format!(
                    "websocket handshake timed out after {}ms",
                    shared.config.connection_timeout.as_millis()
                ),
            )
        })?;
        let mut connection = opened?;
        for frame in shared.handler.subscribe_frames() {
            connection.send(frame).await?;
        }
        Ok(connection)
    }

    async fn on_handshake_ok(
        &self,
        epoch: u64,
        mut connection: Box<dyn StreamConnection>,
    ) -> GatewayResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.machine.handshake_succeeded(epoch) {
            drop(inner);
            connection.close().await;
            return Err(GatewayError::not_connected(
                &self.shared.exchange,
                "connection attempt superseded",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.outbound = Some(tx);
        inner.last_error = None;
        inner.ping_sent_at = None;

        let manager = self.clone();
        inner.socket_task = Some(tokio::spawn(async move {
            manager.run_socket(epoch, connection, rx).await;
        }));

        let interval = self.shared.config.health_check_interval;
        let manager = self.clone();
        if let Some(old) = inner.health_timer.replace(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if !manager.on_health_tick(epoch).await {
                    break;
                }
            }
        })) {
            old.abort();
        }

        self.publish(&inner);
        drop(inner);

        crate::quiet_info!(self.shared.silent, "{} stream connected", self.shared.exchange);
        self.emit(GatewayEvent::Connected {
            exchange: self.shared.exchange.clone(),
        });
        Ok(())
    }

    async fn on_handshake_failed(&self, epoch: u64, error: &GatewayError) {
        let mut inner = self.shared.inner.lock().await;
        let outcome = inner
            .machine
            .handshake_failed(epoch, error.kind, Instant::now());
        if outcome == FailureOutcome::Stale {
            return;
        }
        inner.last_error = Some(error.to_string());
        self.publish(&inner);
        self.emit(GatewayEvent::Error(error.clone()));

        match outcome {
            FailureOutcome::Scheduled {
                epoch,
                delay,
                circuit_open,
            } => {
                if circuit_open {
                    error!(
                        "{} circuit open after {} failures, next trial in {:?}",
                        self.shared.exchange,
                        inner.machine.attempt(),
                        delay
                    );
                    self.emit(GatewayEvent::CircuitOpen {
                        exchange: self.shared.exchange.clone(),
                        retry_in: delay,
                    });
                } else {
                    warn!(
                        "{} stream attempt {} failed: {}; retrying in {:?}",
                        self.shared.exchange,
                        inner.machine.attempt(),
                        error.message,
                        delay
                    );
                }
                self.arm_retry(&mut inner, epoch, delay);
            }
            FailureOutcome::GiveUp => {
                error!(
                    "{} stream stopped on terminal error: {}",
                    self.shared.exchange, error
                );
            }
            FailureOutcome::Stale => {}
        }
    }

    /// Arm the retry timer. A replaced handle is detached, not aborted: it is either
    /// the task currently running this code or a timer whose epoch is already stale.
    fn arm_retry(&self, inner: &mut Inner, epoch: u64, delay: Duration) {
        let manager = self.clone();
        inner.retry_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            manager.on_retry_due(epoch).await;
        }));
    }

    async fn on_retry_due(&self, epoch: u64) {
        let next = {
            let mut inner = self.shared.inner.lock().await;
            let decision = inner.machine.retry_due(epoch, Instant::now());
            self.publish(&inner);
            match decision {
                ConnectDecision::Open { epoch } => epoch,
                ConnectDecision::Rejected { retry_in } => {
                    let epoch = inner.machine.epoch();
                    self.arm_retry(&mut inner, epoch, retry_in);
                    return;
                }
                ConnectDecision::AlreadyActive | ConnectDecision::Stale => return,
            }
        };
        debug!("{} retrying stream connection (epoch {})", self.shared.exchange, next);
        // failures schedule the next retry themselves
        let _ = self.attempt(next).await;
    }

    async fn on_health_tick(&self, epoch: u64) -> bool {
        let mut inner = self.shared.inner.lock().await;
        match inner.machine.health_tick(epoch) {
            HealthOutcome::Stale => false,
            HealthOutcome::SendPing => {
                let ping = self.shared.handler.ping_frame();
                inner.ping_sent_at = Some(Instant::now());
                if let Some(outbound) = &inner.outbound {
                    let _ = outbound.send(ping);
                }
                if inner.machine.missed_pongs() > 0 {
                    warn!(
                        "{} missed {} pong(s)",
                        self.shared.exchange,
                        inner.machine.missed_pongs()
                    );
                }
                self.publish(&inner);
                true
            }
            HealthOutcome::Reconnect { epoch, delay } => {
                let reason = format!(
                    "no pong after {} health checks",
                    self.shared.config.max_missed_pings
                );
                warn!("{} {}; reconnecting in {:?}", self.shared.exchange, reason, delay);
                inner.outbound = None;
                inner.last_error = Some(reason.clone());
                if let Some(socket) = inner.socket_task.take() {
                    socket.abort();
                }
                // this is the running health task; let it return on its own
                inner.health_timer.take();
                self.publish(&inner);
                self.emit(GatewayEvent::Disconnected {
                    exchange: self.shared.exchange.clone(),
                    reason: Some(reason),
                });
                self.arm_retry(&mut inner, epoch, delay);
                false
            }
        }
    }

    async fn run_socket(
        &self,
        epoch: u64,
        mut connection: Box<dyn StreamConnection>,
        mut outbound: mpsc::UnboundedReceiver<WsFrame>,
    ) {
        let reason = loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = connection.send(frame).await {
                            break Some(e.message);
                        }
                    }
                    // sender dropped: the manager tore this socket down
                    None => break None,
                },
                incoming = connection.recv() => match incoming {
                    Some(Ok(WsFrame::Close)) | None => break Some("closed by peer".to_string()),
                    Some(Ok(frame)) => self.on_frame(epoch, frame).await,
                    Some(Err(e)) => break Some(e.message),
                },
            }
        };
        connection.close().await;
        if let Some(reason) = reason {
            self.on_transport_closed(epoch, reason).await;
        }
    }

    async fn on_frame(&self, epoch: u64, frame: WsFrame) {
        if self.shared.handler.is_pong(&frame) {
            let mut inner = self.shared.inner.lock().await;
            if inner.machine.pong_received(epoch) {
                if let Some(sent) = inner.ping_sent_at.take() {
                    let rtt = sent.elapsed().as_millis().max(1) as u64;
                    self.shared.latency_ms.store(rtt, Ordering::Relaxed);
                }
                // notify even when the state is unchanged so watchers see the new latency
                let state = inner.machine.state();
                self.shared.state_tx.send_modify(|current| *current = state);
            }
            return;
        }
        if let WsFrame::Text(text) = frame {
            if let Some(ticker) = self.shared.handler.parse_ticker(&text) {
                self.shared.cache.store(ticker.clone());
                self.emit(GatewayEvent::Ticker(ticker));
            }
        }
    }

    async fn on_transport_closed(&self, epoch: u64, reason: String) {
        let mut inner = self.shared.inner.lock().await;
        let Some((epoch, delay)) = inner.machine.transport_closed(epoch) else {
            return;
        };
        warn!(
            "{} stream closed: {}; reconnecting in {:?}",
            self.shared.exchange, reason, delay
        );
        inner.outbound = None;
        inner.last_error = Some(reason.clone());
        if let Some(health) = inner.health_timer.take() {
            health.abort();
        }
        // this is the running socket task
        inner.socket_task.take();
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        self.emit(GatewayEvent::Disconnected {
            exchange: self.shared.exchange.clone(),
            reason: Some(reason),
        });
        self.publish(&inner);
        self.arm_retry(&mut inner, epoch, delay);
    }

    fn circuit_rejection(&self, retry_in: Duration) -> GatewayError {
        GatewayError::circuit_open(
            &self.shared.exchange,
            format!(
                "circuit breaker open, connection refused locally for another {}ms",
                retry_in.as_millis()
            ),
        )
    }

    fn publish(&self, inner: &Inner) {
        let state = inner.machine.state();
        self.shared.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn emit(&self, event: GatewayEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout: Duration::from_secs(60),
            max_missed_pings: 3,
            ..ResilienceConfig::default()
        }
    }

    fn connected(machine: &mut ConnectionStateMachine, now: Instant) -> u64 {
        let ConnectDecision::Open { epoch } = machine.request_connect(now) else {
            panic!("expected open");
        };
        assert!(machine.handshake_succeeded(epoch));
        epoch
    }

    #[test]
    fn test_failed_handshake_schedules_jittered_backoff() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::with_seed(&config(), 7);
        let ConnectDecision::Open { epoch } = machine.request_connect(now) else {
            panic!("expected open");
        };
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let FailureOutcome::Scheduled {
            epoch: retry_epoch,
            delay,
            circuit_open,
        } = machine.handshake_failed(epoch, ErrorKind::TransientNetwork, now)
        else {
            panic!("expected retry");
        };
        assert!(!circuit_open);
        assert_eq!(machine.state(), ConnectionState::ReconnectWait);
        assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));

        // the socket of the failed epoch can no longer report anything
        assert!(!machine.handshake_succeeded(epoch));
        assert!(matches!(
            machine.retry_due(retry_epoch, now + delay),
            ConnectDecision::Open { .. }
        ));
    }

    #[test]
    fn test_rate_limit_respects_minimum_delay() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::with_seed(&config(), 1);
        let ConnectDecision::Open { epoch } = machine.request_connect(now) else {
            panic!("expected open");
        };
        let FailureOutcome::Scheduled { delay, .. } =
            machine.handshake_failed(epoch, ErrorKind::RateLimit, now)
        else {
            panic!("expected retry");
        };
        assert!(delay >= Duration::from_secs(5));
    }

    #[test]
    fn test_terminal_error_stops_retrying() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::new(&config());
        let ConnectDecision::Open { epoch } = machine.request_connect(now) else {
            panic!("expected open");
        };
        assert_eq!(
            machine.handshake_failed(epoch, ErrorKind::Authentication, now),
            FailureOutcome::GiveUp
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_circuit_opens_and_allows_single_trial() {
        let start = Instant::now();
        let mut machine = ConnectionStateMachine::new(&config());
        let mut outcome = FailureOutcome::Stale;
        let mut decision = machine.request_connect(start);
        for _ in 0..3 {
            let ConnectDecision::Open { epoch } = decision else {
                panic!("expected open, got {:?}", decision);
            };
            outcome = machine.handshake_failed(epoch, ErrorKind::TransientNetwork, start);
            if let FailureOutcome::Scheduled { epoch, .. } = outcome {
                decision = machine.retry_due(epoch, start);
            }
        }
        assert!(matches!(
            outcome,
            FailureOutcome::Scheduled {
                circuit_open: true,
                ..
            }
        ));
        assert_eq!(machine.state(), ConnectionState::CircuitOpen);
        assert_eq!(
            machine.request_connect(start + Duration::from_secs(30)),
            ConnectDecision::Rejected {
                retry_in: Duration::from_secs(30)
            }
        );

        let later = start + Duration::from_secs(60);
        assert!(matches!(
            machine.request_connect(later),
            ConnectDecision::Open { .. }
        ));
        assert_eq!(machine.circuit_state(), CircuitState::HalfOpen);
        // the trial is in flight, nobody else gets through
        assert_eq!(machine.request_connect(later), ConnectDecision::AlreadyActive);
    }

    #[test]
    fn test_missed_pongs_degrade_then_reconnect_once() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::new(&config());
        let epoch = connected(&mut machine, now);

        assert_eq!(machine.health_tick(epoch), HealthOutcome::SendPing);
        assert_eq!(machine.health_tick(epoch), HealthOutcome::SendPing);
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert_eq!(machine.health_tick(epoch), HealthOutcome::SendPing);
        assert_eq!(machine.missed_pongs(), 2);

        let HealthOutcome::Reconnect { epoch: next, .. } = machine.health_tick(epoch) else {
            panic!("expected reconnect");
        };
        assert_eq!(machine.state(), ConnectionState::ReconnectWait);
        // an overlapping tick from the old epoch changes nothing
        assert_eq!(machine.health_tick(epoch), HealthOutcome::Stale);
        assert_eq!(machine.epoch(), next);
    }

    #[test]
    fn test_pong_restores_connected() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::new(&config());
        let epoch = connected(&mut machine, now);

        machine.health_tick(epoch);
        machine.health_tick(epoch);
        assert_eq!(machine.state(), ConnectionState::Degraded);
        assert!(machine.pong_received(epoch));
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.missed_pongs(), 0);
    }

    #[test]
    fn test_transport_close_and_disconnect() {
        let now = Instant::now();
        let mut machine = ConnectionStateMachine::new(&config());
        let epoch = connected(&mut machine, now);

        let (retry_epoch, _) = machine.transport_closed(epoch).unwrap();
        assert_eq!(machine.state(), ConnectionState::ReconnectWait);
        assert!(machine.transport_closed(epoch).is_none());

        assert!(machine.disconnect());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        // timers armed before the disconnect are ignored
        assert_eq!(machine.retry_due(retry_epoch, now), ConnectDecision::Stale);
        assert!(!machine.disconnect());
    }
}
