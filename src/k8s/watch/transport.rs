/**
 * Streaming transport
 *
 * Wraps one logical streaming subscription over a reconnecting socket. Owns
 * connect, reconnect with backoff, the connect timeout, and inbound message
 * buffering. Knows nothing about resources: payloads are opaque text frames.
 *
 * Events are delivered on a single tagged channel (`TransportEvent`), so
 * ordering between open, messages, close and destroy is the channel order.
 * Once the transport is destroyed nothing but the single `Destroy` event is
 * ever delivered.
 */
use super::config::{
    BACKOFF_FACTOR, CLOSE_ABNORMAL, DEFAULT_FLUSH_INTERVAL_MS, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS,
    MIN_FLUSH_INTERVAL_MS, STABLE_STREAM_MS, TRANSPORT_COMMAND_CAPACITY,
};
use super::errors::TransportError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One inbound frame from a physical socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Close { code: u16, reason: String },
    Error(String),
}

/// A connected physical socket.
///
/// `recv` must be cancel safe: the transport drops it whenever a timer or
/// command wins the race.
#[async_trait]
pub trait Socket: Send {
    /// Next inbound frame, `None` when the peer vanished without a close frame
    async fn recv(&mut self) -> Option<SocketFrame>;

    async fn send(&mut self, data: String) -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// Opens physical sockets for a transport
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Socket>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Init,
    Open,
    Closed,
    Error,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// `destroy()` was called by the owner
    Requested,
    /// No successful open before the connect timeout
    ConnectTimeout,
    /// Cumulative reconnect delay exceeded the configured budget
    ReconnectBudgetExhausted,
}

impl DestroyReason {
    /// Whether the owner has to fall back to another sync path
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Requested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// Coalesced messages drained from the buffer in arrival order
    BulkMessage(Vec<String>),
    Close { code: u16, reason: String },
    Error(TransportError),
    Destroy(DestroyReason),
}

/// Geometric reconnect delay: `min(initial * factor^(n-1), max)` for the nth retry
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    max: Duration,
    current: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(INITIAL_BACKOFF_MS),
            BACKOFF_FACTOR,
            Duration::from_millis(MAX_BACKOFF_MS),
        )
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .current
            .map_or(self.initial, |prev| prev.mul_f64(self.factor))
            .min(self.max);
        self.current = Some(delay);
        delay
    }

    pub const fn reset(&mut self) {
        self.current = None;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Inbound messages are queued (oldest dropped past this size) and
    /// drained every `flush_interval`. Zero dispatches every message at once.
    pub buffer_capacity: usize,
    /// Raised to `MIN_FLUSH_INTERVAL_MS` if smaller
    pub flush_interval: Duration,
    /// Deliver drained messages as one `BulkMessage` rather than replaying them
    pub bulk: bool,
    /// Destroy the transport if it has never opened by this deadline
    pub connect_timeout: Option<Duration>,
    /// Destroy the transport once cumulative reconnect delay exceeds this
    pub reconnect_budget: Option<Duration>,
    pub backoff: Backoff,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 0,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            bulk: true,
            connect_timeout: None,
            reconnect_budget: None,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<TransportState>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false once destroyed; destroyed is terminal
    fn set_state(&self, next: TransportState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == TransportState::Destroyed {
            return false;
        }
        *state = next;
        true
    }

    /// Sends under the state lock so nothing can be queued behind `Destroy`
    fn emit(&self, event: TransportEvent) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != TransportState::Destroyed {
            let _ = self.events.send(event);
        }
    }

    fn destroy(&self, reason: DestroyReason) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == TransportState::Destroyed {
            return false;
        }
        *state = TransportState::Destroyed;
        self.cancel.cancel();
        let _ = self.events.send(TransportEvent::Destroy(reason));
        true
    }
}

/// Owner-side control of a running transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<String>,
}

impl TransportHandle {
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state() == TransportState::Destroyed
    }

    /// Queue an outbound message on the open socket.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` unless the transport is currently open, or a socket
    /// error if the outbound queue is full
    pub fn send(&self, data: impl Into<String>) -> Result<(), TransportError> {
        if self.state() != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        self.commands
            .try_send(data.into())
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    /// Idempotent. Clears timers, detaches from the socket and closes it;
    /// only the first call produces a `Destroy` event.
    pub fn destroy(&self) {
        if self.shared.destroy(DestroyReason::Requested) {
            debug!("💥 Transport destroyed by owner");
        }
    }
}

/// Receiving side of a transport's event channel
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<Shared>,
    finished: bool,
}

impl TransportEvents {
    /// Next event; `None` after `Destroy` has been delivered
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        loop {
            let event = self.rx.recv().await?;
            if matches!(event, TransportEvent::Destroy(_)) {
                self.finished = true;
                return Some(event);
            }
            if self.shared.state() != TransportState::Destroyed {
                return Some(event);
            }
        }
    }
}

pub struct Transport;

impl Transport {
    /// Start connecting in the background.
    ///
    /// `url` is evaluated on every connection attempt, so reconnects can
    /// resume from wherever the owner has advanced to.
    pub fn open<F>(
        connector: Arc<dyn Connector>,
        url: F,
        options: TransportOptions,
    ) -> (TransportHandle, TransportEvents)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(TRANSPORT_COMMAND_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(TransportState::Init),
            cancel: CancellationToken::new(),
            events: events_tx,
        });

        let driver = Driver {
            shared: shared.clone(),
            connector,
            url: Box::new(url),
            options,
            commands: commands_rx,
            buffer: VecDeque::new(),
        };
        tokio::spawn(driver.run());

        (
            TransportHandle {
                shared: shared.clone(),
                commands: commands_tx,
            },
            TransportEvents {
                rx: events_rx,
                shared,
                finished: false,
            },
        )
    }
}

enum Ended {
    Cancelled,
    Closed { code: u16, stable: bool },
}

struct Driver {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    url: Box<dyn Fn() -> String + Send + Sync>,
    options: TransportOptions,
    commands: mpsc::Receiver<String>,
    buffer: VecDeque<String>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        let mut backoff = self.options.backoff.clone();
        let connect_deadline = self.options.connect_timeout.map(|t| Instant::now() + t);
        let mut opened_once = false;
        let mut waited = Duration::ZERO;
        // at most one immediate retry between stable streams
        let mut quick_retry = true;

        loop {
            let deadline = if opened_once { None } else { connect_deadline };
            let url = (self.url)();
            debug!("🔌 Connecting {}", url);

            let attempt = tokio::select! {
                () = cancel.cancelled() => break,
                () = wait_until(deadline) => {
                    self.connect_timed_out();
                    break;
                }
                result = self.connector.connect(&url) => result,
            };

            let reconnect_now = match attempt {
                Ok(socket) => {
                    if !self.shared.set_state(TransportState::Open) {
                        break;
                    }
                    opened_once = true;
                    info!("🔗 Stream open: {}", url);
                    self.shared.emit(TransportEvent::Open);

                    match self.pump(socket, &cancel).await {
                        Ended::Cancelled => break,
                        Ended::Closed { code, stable } => {
                            if stable {
                                backoff.reset();
                                waited = Duration::ZERO;
                                quick_retry = true;
                            }
                            let immediate = code == CLOSE_ABNORMAL && quick_retry;
                            if immediate {
                                quick_retry = false;
                            }
                            immediate
                        }
                    }
                }
                Err(e) => {
                    warn!("❌ Stream connect failed: {}", e);
                    self.shared.set_state(TransportState::Error);
                    self.shared.emit(TransportEvent::Error(e));
                    false
                }
            };

            if reconnect_now {
                debug!("⚡ Connection dropped without handshake, reconnecting immediately");
                continue;
            }

            let delay = backoff.next_delay();
            waited += delay;
            if let Some(budget) = self.options.reconnect_budget {
                if waited > budget {
                    warn!(
                        "❌ Reconnect budget of {:?} exhausted after waiting {:?}, giving up",
                        budget, waited
                    );
                    self.shared.destroy(DestroyReason::ReconnectBudgetExhausted);
                    break;
                }
            }

            debug!("⏳ Reconnecting in {:?}", delay);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = wait_until(if opened_once { None } else { connect_deadline }) => {
                    self.connect_timed_out();
                    break;
                }
                () = sleep(delay) => {}
            }
        }

        self.shared.destroy(DestroyReason::Requested);
    }

    fn connect_timed_out(&self) {
        if self.shared.destroy(DestroyReason::ConnectTimeout) {
            warn!(
                "⌛ Stream did not open within {:?}, giving up",
                self.options.connect_timeout.unwrap_or_default()
            );
        }
    }

    async fn pump(&mut self, mut socket: Box<dyn Socket>, cancel: &CancellationToken) -> Ended {
        let buffered = self.options.buffer_capacity > 0;
        let period = self
            .options
            .flush_interval
            .max(Duration::from_millis(MIN_FLUSH_INTERVAL_MS));
        let opened = Instant::now();
        let stable = move |delivered: bool| {
            delivered || opened.elapsed() >= Duration::from_millis(STABLE_STREAM_MS)
        };
        let mut delivered = false;
        let mut flush = interval_at(Instant::now() + period, period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // stop reading before closing so no frame lands after destroy
                    socket.close().await;
                    return Ended::Cancelled;
                }
                _ = flush.tick(), if buffered => self.flush(),
                Some(data) = self.commands.recv() => {
                    if let Err(e) = socket.send(data).await {
                        self.shared.emit(TransportEvent::Error(e));
                    }
                }
                frame = socket.recv() => match frame {
                    Some(SocketFrame::Text(text)) => {
                        delivered = true;
                        if buffered {
                            self.enqueue(text);
                        } else {
                            self.shared.emit(TransportEvent::Message(text));
                        }
                    }
                    Some(SocketFrame::Error(message)) => {
                        self.shared.set_state(TransportState::Error);
                        self.shared.emit(TransportEvent::Error(TransportError::Socket(message)));
                    }
                    Some(SocketFrame::Close { code, reason }) => {
                        socket.close().await;
                        return self.closed(code, reason, stable(delivered));
                    }
                    None => {
                        return self.closed(CLOSE_ABNORMAL, "connection dropped".to_string(), stable(delivered));
                    }
                },
            }
        }
    }

    fn closed(&mut self, code: u16, reason: String, stable: bool) -> Ended {
        self.flush();
        self.shared.set_state(TransportState::Closed);
        debug!("🔒 Stream closed ({}): {}", code, reason);
        self.shared.emit(TransportEvent::Close { code, reason });
        Ended::Closed { code, stable }
    }

    fn enqueue(&mut self, text: String) {
        self.buffer.push_back(text);
        if self.buffer.len() > self.options.buffer_capacity {
            self.buffer.pop_front();
            warn!("🗑️  Buffer full ({}), dropped oldest message", self.options.buffer_capacity);
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch: Vec<String> = self.buffer.drain(..).collect();
        if self.options.bulk {
            self.shared.emit(TransportEvent::BulkMessage(batch));
        } else {
            for message in batch {
                self.shared.emit(TransportEvent::Message(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSocket {
        frames: mpsc::UnboundedReceiver<SocketFrame>,
        sent: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Socket for FakeSocket {
        async fn recv(&mut self) -> Option<SocketFrame> {
            self.frames.recv().await
        }

        async fn send(&mut self, data: String) -> Result<(), TransportError> {
            self.sent
                .send(data)
                .map_err(|e| TransportError::Socket(e.to_string()))
        }

        async fn close(&mut self) {
            self.frames.close();
        }
    }

    /// Hands out pre-built sockets in order, then refuses; records every attempt time
    struct ScriptedConnector {
        sockets: Mutex<VecDeque<FakeSocket>>,
        attempts: mpsc::UnboundedSender<Instant>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Socket>, TransportError> {
            let _ = self.attempts.send(Instant::now());
            let next = self.sockets.lock().unwrap().pop_front();
            next.map_or_else(
                || Err(TransportError::Connect("connection refused".to_string())),
                |socket| Ok(Box::new(socket) as Box<dyn Socket>),
            )
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Socket>, TransportError> {
            std::future::pending().await
        }
    }

    type Frames = mpsc::UnboundedSender<SocketFrame>;
    type Sent = mpsc::UnboundedReceiver<String>;

    fn socket() -> (FakeSocket, Frames, Sent) {
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (sent, sent_rx) = mpsc::unbounded_channel();
        (FakeSocket { frames, sent }, frames_tx, sent_rx)
    }

    fn scripted(
        sockets: Vec<FakeSocket>,
    ) -> (Arc<dyn Connector>, mpsc::UnboundedReceiver<Instant>) {
        let (attempts, attempts_rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector {
            sockets: Mutex::new(sockets.into()),
            attempts,
        };
        (Arc::new(connector), attempts_rx)
    }

    fn url() -> String {
        "/api/v1/pods?watch=true".to_string()
    }

    #[test]
    fn test_backoff_sequence_is_geometric_and_capped() {
        let delays: Vec<Duration> = Backoff::default().take(15).collect();
        for (n, delay) in delays.iter().enumerate() {
            let expected = (1000.0 * 1.5_f64.powi(i32::try_from(n).unwrap())).min(60_000.0);
            let actual = delay.as_secs_f64() * 1000.0;
            assert!((actual - expected).abs() < 1.0, "retry {} was {actual}ms", n + 1);
        }
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[1], Duration::from_millis(1500));
        assert_eq!(delays[14], Duration::from_millis(60_000));

        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_retry_on_backoff_schedule() {
        let (connector, mut attempts) = scripted(vec![]);
        let (handle, mut events) = Transport::open(connector, url, TransportOptions::default());

        let mut times = vec![attempts.recv().await.unwrap()];
        for _ in 0..13 {
            times.push(attempts.recv().await.unwrap());
        }
        let expected: Vec<Duration> = Backoff::default().take(13).collect();
        for (i, pair) in times.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let diff = gap.abs_diff(expected[i]);
            assert!(diff <= Duration::from_millis(1), "retry {} waited {gap:?}", i + 1);
        }

        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
        handle.destroy();
        sleep(Duration::from_secs(600)).await;
        assert!(attempts.try_recv().is_err(), "no retry may happen after destroy");
        assert!(handle.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let (sock, _frames, _sent) = socket();
        let (connector, _attempts) = scripted(vec![sock]);
        let (handle, mut events) = Transport::open(connector, url, TransportOptions::default());

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(handle.state(), TransportState::Open);

        handle.destroy();
        handle.destroy();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Destroy(DestroyReason::Requested))
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(handle.state(), TransportState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_dispatch_immediately_without_buffer() {
        let (sock, frames, _sent) = socket();
        let (connector, _attempts) = scripted(vec![sock]);
        let (_handle, mut events) = Transport::open(connector, url, TransportOptions::default());

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        frames.send(SocketFrame::Text("a".to_string())).unwrap();
        frames.send(SocketFrame::Text("b".to_string())).unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Message("a".to_string())));
        assert_eq!(events.recv().await, Some(TransportEvent::Message("b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_drops_oldest_and_flushes_in_bulk() {
        let (sock, frames, _sent) = socket();
        for i in 1..=5 {
            frames.send(SocketFrame::Text(i.to_string())).unwrap();
        }
        let (connector, _attempts) = scripted(vec![sock]);
        let options = TransportOptions {
            buffer_capacity: 3,
            ..TransportOptions::default()
        };
        let (_handle, mut events) = Transport::open(connector, url, options);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::BulkMessage(vec![
                "3".to_string(),
                "4".to_string(),
                "5".to_string()
            ]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_replays_individually_without_bulk_consumer() {
        let (sock, frames, _sent) = socket();
        frames.send(SocketFrame::Text("x".to_string())).unwrap();
        frames.send(SocketFrame::Text("y".to_string())).unwrap();
        let (connector, _attempts) = scripted(vec![sock]);
        let options = TransportOptions {
            buffer_capacity: 10,
            bulk: false,
            ..TransportOptions::default()
        };
        let (_handle, mut events) = Transport::open(connector, url, options);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(events.recv().await, Some(TransportEvent::Message("x".to_string())));
        assert_eq!(events.recv().await, Some(TransportEvent::Message("y".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_buffer_first() {
        let (sock, frames, _sent) = socket();
        frames.send(SocketFrame::Text("last".to_string())).unwrap();
        frames
            .send(SocketFrame::Close {
                code: 1000,
                reason: "timeout".to_string(),
            })
            .unwrap();
        let (connector, _attempts) = scripted(vec![sock]);
        let options = TransportOptions {
            buffer_capacity: 10,
            flush_interval: Duration::from_secs(60),
            ..TransportOptions::default()
        };
        let (_handle, mut events) = Transport::open(connector, url, options);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::BulkMessage(vec!["last".to_string()]))
        );
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Close { code: 1000, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_immediately() {
        let (first, first_frames, _s1) = socket();
        let (second, second_frames, _s2) = socket();
        let (connector, mut attempts) = scripted(vec![first, second]);
        let (_handle, mut events) = Transport::open(connector, url, TransportOptions::default());

        let t0 = attempts.recv().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        first_frames
            .send(SocketFrame::Close {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            })
            .unwrap();
        let t1 = attempts.recv().await.unwrap();
        assert_eq!(t1 - t0, Duration::ZERO);
        assert!(matches!(events.recv().await, Some(TransportEvent::Close { code: CLOSE_ABNORMAL, .. })));
        assert_eq!(events.recv().await, Some(TransportEvent::Open));

        second_frames
            .send(SocketFrame::Close {
                code: 1000,
                reason: String::new(),
            })
            .unwrap();
        let t2 = attempts.recv().await.unwrap();
        assert_eq!(t2 - t1, Duration::from_millis(INITIAL_BACKOFF_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_dying_at_open_back_off() {
        let dead = || {
            let (sock, frames, _sent) = socket();
            drop(frames);
            sock
        };
        let (talkative, frames, _sent) = socket();
        frames.send(SocketFrame::Text("event".to_string())).unwrap();
        drop(frames);
        let (connector, mut attempts) = scripted(vec![dead(), dead(), talkative, dead()]);
        let (_handle, _events) = Transport::open(connector, url, TransportOptions::default());

        let mut times = Vec::new();
        for _ in 0..5 {
            times.push(attempts.recv().await.unwrap());
        }
        let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
        // one free retry, then backoff; a stream that delivered re-arms the retry and resets the backoff
        assert_eq!(
            gaps,
            vec![
                Duration::ZERO,
                Duration::from_millis(INITIAL_BACKOFF_MS),
                Duration::ZERO,
                Duration::from_millis(INITIAL_BACKOFF_MS),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_flush_interval_still_delivers() {
        let (sock, frames, _sent) = socket();
        let (connector, _attempts) = scripted(vec![sock]);
        let options = TransportOptions {
            buffer_capacity: 4,
            flush_interval: Duration::ZERO,
            ..TransportOptions::default()
        };
        let (handle, mut events) = Transport::open(connector, url, options);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        frames.send(SocketFrame::Text("a".to_string())).unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::BulkMessage(vec!["a".to_string()]))
        );
        assert_eq!(handle.state(), TransportState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_destroys() {
        let options = TransportOptions {
            connect_timeout: Some(Duration::from_secs(5)),
            ..TransportOptions::default()
        };
        let start = Instant::now();
        let (handle, mut events) = Transport::open(Arc::new(HangingConnector), url, options);

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Destroy(DestroyReason::ConnectTimeout))
        );
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(handle.is_destroyed());
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhaustion_is_fatal() {
        let (connector, mut attempts) = scripted(vec![]);
        let options = TransportOptions {
            reconnect_budget: Some(Duration::from_secs(3)),
            ..TransportOptions::default()
        };
        let (handle, mut events) = Transport::open(connector, url, options);

        let mut destroyed = None;
        while let Some(event) = events.recv().await {
            if let TransportEvent::Destroy(reason) = event {
                destroyed = Some(reason);
            }
        }
        assert_eq!(destroyed, Some(DestroyReason::ReconnectBudgetExhausted));
        assert!(DestroyReason::ReconnectBudgetExhausted.is_failure());
        assert!(handle.is_destroyed());

        // 1000 + 1500 fits, 2250 more does not: three attempts in total
        let mut count = 0;
        while attempts.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_socket() {
        let (sock, _frames, mut sent) = socket();
        let (connector, _attempts) = scripted(vec![sock]);
        let (handle, mut events) = Transport::open(connector, url, TransportOptions::default());

        assert_eq!(handle.send("early"), Err(TransportError::NotOpen));
        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        handle.send("hello").unwrap();
        assert_eq!(sent.recv().await.as_deref(), Some("hello"));
    }
}
