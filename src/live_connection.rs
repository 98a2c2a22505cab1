//! Push subscription to feature updates over a [`TransportFactory`] connection.
//!
//! Each opened transport is owned by one driver task that dispatches inbound messages, resets
//! the heartbeat deadline and reacts to the transport closing. Only one transport is live at a
//! time: opening a new one tears the previous one down first.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::oneshot,
    time::{sleep, sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    notifications::{ClientMessage, InboundMessage, NotificationMessage, SubscriptionMode},
    retry::backoff_delay,
    transport::{
        OutgoingFrame, TransportConnection, TransportEvent, TransportFactory,
        WebSocketTransportFactory, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_NO_STATUS,
    },
    Error, Result,
};

/// Receives every notification decoded from the live transport.
pub type MessageHandler = Arc<dyn Fn(NotificationMessage) + Send + Sync>;

const RECONNECT_DELAY_STEP: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const BACKGROUND_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_BACKGROUND_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LiveOptions {
    /// How long `connect` waits for the first message before giving up.
    pub connect_timeout: Duration,
    /// A connection with no traffic for this long is considered dead and replaced.
    pub heartbeat_timeout: Duration,
    /// Defaults to [`WebSocketTransportFactory`].
    pub transport_factory: Option<Arc<dyn TransportFactory>>,
}

impl LiveOptions {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

    pub fn new() -> LiveOptions {
        LiveOptions::default()
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> LiveOptions {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, heartbeat_timeout: Duration) -> LiveOptions {
        self.heartbeat_timeout = heartbeat_timeout;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> LiveOptions {
        self.transport_factory = Some(factory);
        self
    }
}

impl Default for LiveOptions {
    fn default() -> LiveOptions {
        LiveOptions {
            connect_timeout: LiveOptions::DEFAULT_CONNECT_TIMEOUT,
            heartbeat_timeout: LiveOptions::DEFAULT_HEARTBEAT_TIMEOUT,
            transport_factory: None,
        }
    }
}

impl fmt::Debug for LiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("custom_transport", &self.transport_factory.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Waiting to retry after the connection dropped.
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    Connect,
    Message,
    Closed { code: u16 },
    TornDown,
    ReconnectScheduled,
}

impl ConnectionState {
    pub(crate) fn next(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (_, E::Connect) => S::Connecting,
            // A late message from a transport that was already torn down.
            (S::Disconnected, E::Message) => S::Disconnected,
            (_, E::Message) => S::Subscribed,
            (_, E::Closed { code }) if is_application_close(code) => S::Disconnected,
            (_, E::Closed { .. }) | (_, E::ReconnectScheduled) => S::Reconnecting,
            (_, E::TornDown) => S::Disconnected,
        }
    }
}

/// Close codes that mean the peer closed the connection on purpose.
pub fn is_application_close(code: u16) -> bool {
    code == CLOSE_NORMAL || code == CLOSE_NO_STATUS
}

/// Wait before reconnect attempt `retry_count`: one second per attempt, at most 30 seconds.
pub fn reconnect_delay(retry_count: u32) -> Duration {
    RECONNECT_DELAY_STEP
        .saturating_mul(retry_count)
        .min(MAX_RECONNECT_DELAY)
}

struct CurrentConnection {
    generation: u64,
    token: CancellationToken,
    outgoing: tokio::sync::mpsc::UnboundedSender<OutgoingFrame>,
}

struct State {
    phase: ConnectionState,
    retry_count: u32,
    mode: SubscriptionMode,
    handler: Option<MessageHandler>,
    current: Option<CurrentConnection>,
    next_generation: u64,
    /// Bumped by every explicit `connect` and `close`, invalidating attempts started before.
    epoch: u64,
    /// Cancels a pending reconnect wait.
    reconnect: CancellationToken,
    /// Cancelled by `close`, stops background reconnection.
    closed: CancellationToken,
}

struct Inner {
    environment_api_key: String,
    endpoint: String,
    connect_timeout: Duration,
    heartbeat_timeout: Duration,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<State>,
}

/// A live subscription to the FeatureBoard push endpoint.
///
/// Cloning is cheap and every clone controls the same connection.
#[derive(Clone)]
pub struct LiveConnection {
    inner: Arc<Inner>,
}

impl LiveConnection {
    pub fn new(
        environment_api_key: impl Into<String>,
        mode: SubscriptionMode,
        endpoint: impl Into<String>,
        options: LiveOptions,
    ) -> LiveConnection {
        let factory = options
            .transport_factory
            .unwrap_or_else(|| Arc::new(WebSocketTransportFactory) as Arc<dyn TransportFactory>);
        LiveConnection {
            inner: Arc::new(Inner {
                environment_api_key: environment_api_key.into(),
                endpoint: endpoint.into(),
                connect_timeout: options.connect_timeout,
                heartbeat_timeout: options.heartbeat_timeout,
                factory,
                state: Mutex::new(State {
                    phase: ConnectionState::Disconnected,
                    retry_count: 0,
                    mode,
                    handler: None,
                    current: None,
                    next_generation: 0,
                    epoch: 0,
                    reconnect: CancellationToken::new(),
                    closed: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Subscription mode sent on the next (re)connect.
    pub fn set_mode(&self, mode: SubscriptionMode) {
        self.inner.lock().mode = mode;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().phase
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Open a new connection, replacing any existing one, and wait until the first message
    /// arrives.
    ///
    /// Resets the retry count and cancels any pending reconnect. Fails with
    /// [`Error::ConnectTimeout`] when nothing arrives within the connect timeout.
    pub async fn connect(&self, handler: MessageHandler) -> Result<()> {
        let epoch = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.handler = Some(Arc::clone(&handler));
            state.reconnect.cancel();
            state.reconnect = CancellationToken::new();
            state.epoch
        };
        Arc::clone(&self.inner).open(handler, 0, epoch).await
    }

    /// Tear the connection down. Pending reconnects and background reconnection stop, and the
    /// handler is released.
    pub fn close(&self, reason: &str) {
        log::debug!(target: "featureboard", reason; "closing live connection");
        self.inner.shutdown();
    }

    /// Keep calling [`LiveConnection::connect`] with exponential backoff (1s doubling, capped at
    /// 60s) until it succeeds, `cancellation` is cancelled, or the connection is closed.
    pub async fn try_reconnect_in_background(
        &self,
        handler: MessageHandler,
        cancellation: &CancellationToken,
    ) {
        let closed = self.inner.lock().closed.clone();
        let mut attempt = 0;
        loop {
            let delay = backoff_delay(
                BACKGROUND_RECONNECT_INITIAL_DELAY,
                2,
                attempt,
                MAX_BACKGROUND_RECONNECT_DELAY,
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancellation.cancelled() => return,
                _ = closed.cancelled() => return,
            }

            match self.connect(Arc::clone(&handler)).await {
                Ok(()) => {
                    log::info!(target: "featureboard", attempt; "live connection established in background");
                    return;
                }
                Err(err) => {
                    log::warn!(target: "featureboard", attempt; "background reconnect failed: {err}");
                    attempt += 1;
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .expect("thread holding live connection lock should not panic")
    }

    fn transition(&self, event: ConnectionEvent) {
        let mut state = self.lock();
        let next = state.phase.next(event);
        if next != state.phase {
            log::debug!(target: "featureboard", "live connection {:?} -> {:?}", state.phase, next);
        }
        state.phase = next;
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.handler = None;
            state.reconnect.cancel();
            state.reconnect = CancellationToken::new();
            state.closed.cancel();
            state.closed = CancellationToken::new();
        }
        self.teardown(None);
        self.transition(ConnectionEvent::TornDown);
    }

    /// Tear down the current transport if it is `generation` (any when `None`). Returns whether
    /// anything was torn down.
    fn teardown(&self, generation: Option<u64>) -> bool {
        let mut state = self.lock();
        let matches = state
            .current
            .as_ref()
            .is_some_and(|current| generation.map_or(true, |g| g == current.generation));
        if !matches {
            return false;
        }
        if let Some(current) = state.current.take() {
            current.token.cancel();
            let _ = current.outgoing.send(OutgoingFrame::Close);
        }
        state.phase = state.phase.next(ConnectionEvent::TornDown);
        true
    }

    fn open(
        self: Arc<Self>,
        handler: MessageHandler,
        retry_count: u32,
        epoch: u64,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return Err(Error::Closed);
                }
                state.retry_count = retry_count;
            }
            self.teardown(None);
            self.transition(ConnectionEvent::Connect);

            log::debug!(target: "featureboard", endpoint = self.endpoint.as_str(), retry_count; "connecting to live endpoint");
            let connection = match self.factory.open(&self.endpoint).await {
                Ok(connection) => connection,
                Err(err) => {
                    self.transition(ConnectionEvent::TornDown);
                    return Err(err);
                }
            };

            let (initialised_tx, initialised_rx) = oneshot::channel();
            let (generation, token) = {
                let mut state = self.lock();
                if state.epoch != epoch {
                    let _ = connection.outgoing.send(OutgoingFrame::Close);
                    return Err(Error::Closed);
                }
                let generation = state.next_generation;
                state.next_generation += 1;
                let token = CancellationToken::new();
                state.current = Some(CurrentConnection {
                    generation,
                    token: token.clone(),
                    outgoing: connection.outgoing.clone(),
                });
                (generation, token)
            };

            tokio::spawn(Arc::clone(&self).drive(
                generation,
                token,
                connection,
                handler,
                initialised_tx,
            ));

            match timeout(self.connect_timeout, initialised_rx).await {
                Ok(Ok(result)) => result,
                // Torn down before the first message.
                Ok(Err(_)) => Err(Error::Closed),
                Err(_) => {
                    log::warn!(target: "featureboard", "no message received within {:?}, giving up", self.connect_timeout);
                    self.teardown(Some(generation));
                    Err(Error::ConnectTimeout)
                }
            }
        }
        .boxed()
    }

    async fn drive(
        self: Arc<Self>,
        generation: u64,
        token: CancellationToken,
        connection: TransportConnection,
        handler: MessageHandler,
        initialised: oneshot::Sender<Result<()>>,
    ) {
        let TransportConnection {
            outgoing,
            mut events,
        } = connection;
        let mut initialised = Some(initialised);
        let mut deadline = Instant::now() + self.heartbeat_timeout;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep_until(deadline) => {
                    log::warn!(target: "featureboard", "no traffic within {:?}, replacing connection", self.heartbeat_timeout);
                    if self.teardown(Some(generation)) {
                        match initialised.take() {
                            Some(initialised) => {
                                let _ = initialised.send(Err(Error::ConnectTimeout));
                            }
                            None => self.schedule_reconnect(0, Duration::ZERO),
                        }
                    }
                    return;
                }
                event = events.recv() => event.unwrap_or(TransportEvent::Close {
                    code: CLOSE_ABNORMAL,
                    reason: "transport dropped".to_owned(),
                }),
            };

            match event {
                TransportEvent::Open => {
                    deadline = Instant::now() + self.heartbeat_timeout;
                    self.send_subscribe(&outgoing);
                }
                TransportEvent::Ping => {
                    deadline = Instant::now() + self.heartbeat_timeout;
                }
                TransportEvent::Message(text) => {
                    deadline = Instant::now() + self.heartbeat_timeout;
                    let message = InboundMessage::parse(&text);
                    let live = message.is_live_proof();
                    match message {
                        InboundMessage::Notification(NotificationMessage::SubscriptionError {
                            error,
                        }) => {
                            log::error!(target: "featureboard", "subscription rejected: {error}");
                            self.shutdown();
                            if let Some(initialised) = initialised.take() {
                                let _ = initialised.send(Err(Error::SubscriptionError(error)));
                            }
                            return;
                        }
                        InboundMessage::Notification(notification) => handler(notification),
                        InboundMessage::Unknown { kind } => {
                            log::warn!(target: "featureboard", kind; "unknown message kind, you may need to upgrade the SDK");
                        }
                        InboundMessage::Malformed { reason } => {
                            log::warn!(target: "featureboard", "failed to parse message: {reason}");
                        }
                    }
                    if live {
                        if let Some(initialised) = initialised.take() {
                            self.mark_subscribed(generation);
                            let _ = initialised.send(Ok(()));
                        }
                    }
                }
                TransportEvent::Error(err) => {
                    log::error!(target: "featureboard", "live connection error: {err}");
                }
                TransportEvent::Close { code, reason } => {
                    self.on_close(generation, code, reason, initialised.take());
                    return;
                }
            }
        }
    }

    fn send_subscribe(&self, outgoing: &tokio::sync::mpsc::UnboundedSender<OutgoingFrame>) {
        if self.environment_api_key.is_empty() {
            log::debug!(target: "featureboard", "no environment key, not subscribing");
            return;
        }
        let frame = ClientMessage::Subscribe {
            api_key: self.environment_api_key.clone(),
            mode: self.lock().mode.clone(),
        };
        match serde_json::to_string(&frame) {
            Ok(text) => {
                let _ = outgoing.send(OutgoingFrame::Text(text));
            }
            Err(err) => log::error!(target: "featureboard", "failed to encode subscribe frame: {err}"),
        }
    }

    fn mark_subscribed(&self, generation: u64) {
        let mut state = self.lock();
        if state
            .current
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            state.phase = state.phase.next(ConnectionEvent::Message);
        }
    }

    fn on_close(
        self: &Arc<Self>,
        generation: u64,
        code: u16,
        reason: String,
        pending: Option<oneshot::Sender<Result<()>>>,
    ) {
        let retry_count = {
            let mut state = self.lock();
            if !state
                .current
                .as_ref()
                .is_some_and(|current| current.generation == generation)
            {
                // Torn down on our side, nothing to react to.
                return;
            }
            state.current = None;
            state.phase = state.phase.next(ConnectionEvent::Closed { code });
            state.retry_count + 1
        };
        log::debug!(target: "featureboard", code, reason = reason.as_str(); "live connection closed");

        // The attempt that opened this connection decides whether to retry.
        if let Some(pending) = pending {
            self.transition(ConnectionEvent::TornDown);
            let _ = pending.send(Err(Error::Transport(format!(
                "connection closed before subscribing ({code}): {reason}"
            ))));
            return;
        }

        if is_application_close(code) {
            return;
        }
        self.schedule_reconnect(retry_count, reconnect_delay(retry_count));
    }

    fn schedule_reconnect(self: &Arc<Self>, retry_count: u32, delay: Duration) {
        let (handler, cancel, epoch) = {
            let state = self.lock();
            (state.handler.clone(), state.reconnect.clone(), state.epoch)
        };
        let Some(handler) = handler else {
            return;
        };
        self.transition(ConnectionEvent::ReconnectScheduled);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut retry_count = retry_count;
            let mut delay = delay;
            loop {
                log::info!(target: "featureboard", retry_count, delay_ms = delay.as_millis() as u64; "reconnecting live connection");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }

                match Arc::clone(&inner)
                    .open(Arc::clone(&handler), retry_count, epoch)
                    .await
                {
                    Ok(()) => return,
                    Err(Error::Closed) => return,
                    Err(err) => {
                        log::warn!(target: "featureboard", retry_count; "reconnect failed: {err}");
                        retry_count += 1;
                        delay = reconnect_delay(retry_count);
                        inner.transition(ConnectionEvent::ReconnectScheduled);
                    }
                }
            }
        });
    }
}
