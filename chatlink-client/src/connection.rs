use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chatlink_core::{
    CLIENT_CLOSE_REASON, Envelope, NORMAL_CLOSE_CODE, UserId, decode_frame, encode_frame,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bus::{EventBus, Subscription};
use crate::queue::OutboundQueue;
use crate::transport::{
    Connector, OutboundFrame, TransportError, TransportEvent, TransportLink, WriteCount,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Errored => "errored",
        })
    }
}

/// Everything the connection manager announces. Subscribers match on this
/// exhaustively, so a new variant is a compile error at every consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    State(ConnectionState),
    Inbound(Envelope),
    /// An envelope was evicted from the full outbound queue and never sent.
    QueueOverflow(Envelope),
    /// An envelope could not be encoded within the frame limit and was dropped.
    Undeliverable(Envelope),
    ReconnectExhausted { attempts: u32 },
}

#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub server_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub queue_limit: Option<usize>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_owned(),
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(12),
            queue_limit: None,
        }
    }
}

impl LinkSettings {
    /// Delay before the retry that follows the `failures`-th consecutive
    /// failure: `base * 2^(failures - 1)`, capped at the max delay.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.reconnect_base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.reconnect_max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub queued: usize,
}

/// Sink for envelopes headed to the server.
pub trait Outbox: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// Builds the realtime endpoint: the configured URL with `http(s)` mapped to
/// `ws(s)` and the auth token appended as the `token` query parameter.
pub fn resolve_endpoint(server_url: &str, credentials: &Credentials) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(server_url).map_err(|err| TransportError::Endpoint(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::Endpoint(format!(
                "unsupported scheme {other:?}"
            )));
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| TransportError::Endpoint(format!("cannot use scheme {scheme}")))?;
    }
    url.query_pairs_mut()
        .append_pair("token", &credentials.token);
    Ok(url)
}

enum Command {
    Connect(Credentials),
    Send(Envelope),
    Close,
    Stats(oneshot::Sender<LinkStats>),
}

/// Cheap handle to the connection task. All clones drive the same link.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: EventBus<LinkEvent>,
}

impl ConnectionHandle {
    pub fn spawn<C: Connector>(
        connector: C,
        settings: LinkSettings,
        events: EventBus<LinkEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let actor = LinkActor {
            connector,
            queue: OutboundQueue::new(settings.queue_limit),
            settings,
            events: events.clone(),
            state: state_tx,
            commands: command_rx,
            failures: 0,
        };
        let task = tokio::spawn(actor.run());
        (
            Self {
                commands: command_tx,
                state: state_rx,
                events,
            },
            task,
        )
    }

    /// Starts a session. Ignored while one is already connecting or connected.
    pub fn connect(&self, credentials: Credentials) {
        self.command(Command::Connect(credentials));
    }

    /// Transmits immediately when connected, queues otherwise.
    pub fn send(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Closes with the normal close code and suppresses reconnection.
    pub fn close(&self) {
        self.command(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> Subscription<LinkEvent> {
        self.events.subscribe()
    }

    /// Round-trips through the connection task, so every command issued
    /// before this call has been handled once it resolves.
    pub async fn stats(&self) -> Option<LinkStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(Command::Stats(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("connection task has stopped; command dropped");
        }
    }
}

impl Outbox for ConnectionHandle {
    fn send(&self, envelope: Envelope) {
        ConnectionHandle::send(self, envelope);
    }
}

enum SessionEnd {
    Idle,
    Shutdown,
}

enum Opened {
    Link(TransportLink),
    Failed(TransportError),
    Cancelled,
    Shutdown,
}

enum LinkEnd {
    Clean,
    Dropped,
    ClosedLocally,
    Shutdown,
}

enum Pause {
    Elapsed,
    Cancelled,
    Shutdown,
}

struct LinkActor<C> {
    connector: C,
    settings: LinkSettings,
    queue: OutboundQueue,
    events: EventBus<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    failures: u32,
}

impl<C: Connector> LinkActor<C> {
    async fn run(mut self) {
        while let Some(credentials) = self.wait_for_connect().await {
            if let SessionEnd::Shutdown = self.drive(credentials).await {
                break;
            }
        }
        debug!("connection task stopped");
    }

    async fn wait_for_connect(&mut self) -> Option<Credentials> {
        loop {
            match self.commands.recv().await? {
                Command::Connect(credentials) => return Some(credentials),
                Command::Close => debug!("close requested while disconnected"),
                other => self.handle_passive(other),
            }
        }
    }

    /// Commands that mean the same thing whatever phase the link is in.
    fn handle_passive(&mut self, command: Command) {
        match command {
            Command::Send(envelope) => self.enqueue(envelope),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Connect(_) => {
                let state = *self.state.borrow();
                debug!(%state, "connect ignored; session already active");
            }
            Command::Close => {}
        }
    }

    async fn drive(&mut self, credentials: Credentials) -> SessionEnd {
        self.failures = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = self.failures + 1;
            info!(
                attempt,
                max_attempts = self.settings.max_reconnect_attempts,
                server_url = %self.settings.server_url,
                "connecting"
            );

            match self.open(&credentials).await {
                Opened::Link(link) => match self.serve(link).await {
                    LinkEnd::Clean => {
                        info!("server closed the connection");
                        self.set_state(ConnectionState::Disconnected);
                        return SessionEnd::Idle;
                    }
                    LinkEnd::ClosedLocally => {
                        self.set_state(ConnectionState::Disconnected);
                        return SessionEnd::Idle;
                    }
                    LinkEnd::Shutdown => return SessionEnd::Shutdown,
                    LinkEnd::Dropped => {}
                },
                Opened::Failed(err) => {
                    error!(attempt, server_url = %self.settings.server_url, "{err}");
                }
                Opened::Cancelled => {
                    self.finish_close();
                    return SessionEnd::Idle;
                }
                Opened::Shutdown => return SessionEnd::Shutdown,
            }

            self.failures += 1;
            self.set_state(ConnectionState::Errored);
            if self.failures >= self.settings.max_reconnect_attempts {
                warn!(
                    attempts = self.failures,
                    "reconnect attempts exhausted; waiting for an explicit connect"
                );
                self.events.publish(LinkEvent::ReconnectExhausted {
                    attempts: self.failures,
                });
                self.set_state(ConnectionState::Disconnected);
                return SessionEnd::Idle;
            }

            let delay = self.settings.backoff_delay(self.failures);
            info!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = self.failures + 1,
                "reconnect scheduled"
            );
            match self.pause(delay).await {
                Pause::Elapsed => {}
                Pause::Cancelled => {
                    self.finish_close();
                    return SessionEnd::Idle;
                }
                Pause::Shutdown => return SessionEnd::Shutdown,
            }
        }
    }

    async fn open(&mut self, credentials: &Credentials) -> Opened {
        let endpoint = match resolve_endpoint(&self.settings.server_url, credentials) {
            Ok(endpoint) => endpoint,
            Err(err) => return Opened::Failed(err),
        };
        let connect_timeout = self.settings.connect_timeout;
        let opening = tokio::time::timeout(connect_timeout, self.connector.open(endpoint));
        tokio::pin!(opening);

        loop {
            tokio::select! {
                result = &mut opening => {
                    return match result {
                        Ok(Ok(link)) => Opened::Link(link),
                        Ok(Err(err)) => Opened::Failed(err),
                        Err(_) => Opened::Failed(TransportError::Timeout(connect_timeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    None => return Opened::Shutdown,
                    Some(Command::Close) => return Opened::Cancelled,
                    Some(other) => self.handle_passive(other),
                },
            }
        }
    }

    async fn serve(&mut self, link: TransportLink) -> LinkEnd {
        let mut in_flight = InFlight::new(link.written());
        let TransportLink {
            outgoing,
            mut incoming,
            ..
        } = link;
        let end = self.pump(&outgoing, &mut incoming, &mut in_flight).await;
        // Frames ahead of our own close frame are still written in order.
        if let LinkEnd::Clean | LinkEnd::Dropped = end {
            self.requeue_unwritten(in_flight);
        }
        end
    }

    async fn pump(
        &mut self,
        outgoing: &mpsc::UnboundedSender<OutboundFrame>,
        incoming: &mut mpsc::UnboundedReceiver<TransportEvent>,
        in_flight: &mut InFlight,
    ) -> LinkEnd {
        self.failures = 0;
        self.set_state(ConnectionState::Connected);
        info!(queued = self.queue.len(), "connected");

        let events = &self.events;
        match self
            .queue
            .flush(|envelope| transmit(outgoing, in_flight, events, envelope))
        {
            Ok(0) => {}
            Ok(count) => debug!(count, "flushed outbound queue"),
            Err(err) => {
                warn!("flush interrupted: {err}");
                return LinkEnd::Dropped;
            }
        }

        loop {
            tokio::select! {
                event = incoming.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.dispatch_inbound(&text),
                    Some(TransportEvent::Closed { code, reason }) => {
                        if code == Some(NORMAL_CLOSE_CODE) {
                            return LinkEnd::Clean;
                        }
                        warn!(?code, %reason, "connection closed uncleanly");
                        return LinkEnd::Dropped;
                    }
                    Some(TransportEvent::Error(err)) => {
                        warn!("{err}");
                        return LinkEnd::Dropped;
                    }
                    None => {
                        warn!("transport ended without a close frame");
                        return LinkEnd::Dropped;
                    }
                },
                command = self.commands.recv() => match command {
                    None => {
                        let _ = outgoing.send(close_frame());
                        return LinkEnd::Shutdown;
                    }
                    Some(Command::Send(envelope)) => {
                        if let Err(err) = transmit(outgoing, in_flight, &self.events, &envelope) {
                            warn!("send failed, queueing for the next connection: {err}");
                            self.enqueue(envelope);
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(Command::Close) => {
                        self.set_state(ConnectionState::Disconnecting);
                        let _ = outgoing.send(close_frame());
                        return LinkEnd::ClosedLocally;
                    }
                    Some(other) => self.handle_passive(other),
                },
            }
        }
    }

    fn requeue_unwritten(&mut self, in_flight: InFlight) {
        let unwritten = in_flight.into_unwritten();
        if unwritten.is_empty() {
            return;
        }
        info!(count = unwritten.len(), "requeueing envelopes the link never wrote");
        for evicted in self.queue.requeue_front(unwritten) {
            self.report_overflow(evicted);
        }
    }

    async fn pause(&mut self, delay: Duration) -> Pause {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Pause::Elapsed,
                command = self.commands.recv() => match command {
                    None => return Pause::Shutdown,
                    Some(Command::Close) => return Pause::Cancelled,
                    Some(other) => self.handle_passive(other),
                },
            }
        }
    }

    fn dispatch_inbound(&self, text: &str) {
        for decoded in decode_frame(text) {
            match decoded {
                Ok(envelope) => {
                    self.events.publish(LinkEvent::Inbound(envelope));
                }
                Err(err) => warn!("dropping malformed frame: {err}"),
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.enqueue(envelope) {
            self.report_overflow(evicted);
        }
    }

    fn report_overflow(&self, evicted: Envelope) {
        warn!(
            kind = ?evicted.kind(),
            limit = ?self.queue.limit(),
            "outbound queue full; dropped oldest envelope"
        );
        self.events.publish(LinkEvent::QueueOverflow(evicted));
    }

    fn finish_close(&self) {
        self.set_state(ConnectionState::Disconnecting);
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = %next, "connection state changed");
            self.events.publish(LinkEvent::State(next));
        }
    }

    fn stats(&self) -> LinkStats {
        LinkStats {
            state: *self.state.borrow(),
            consecutive_failures: self.failures,
            queued: self.queue.len(),
        }
    }
}

/// Envelopes handed to the current link, oldest first, until the transport
/// confirms them written.
struct InFlight {
    envelopes: VecDeque<Envelope>,
    confirmed: usize,
    written: WriteCount,
}

impl InFlight {
    fn new(written: WriteCount) -> Self {
        Self {
            envelopes: VecDeque::new(),
            confirmed: 0,
            written,
        }
    }

    fn push(&mut self, envelope: Envelope) {
        self.prune();
        self.envelopes.push_back(envelope);
    }

    fn cancel_last(&mut self) {
        self.envelopes.pop_back();
    }

    fn prune(&mut self) {
        let written = self.written.get();
        while self.confirmed < written && self.envelopes.pop_front().is_some() {
            self.confirmed += 1;
        }
    }

    fn into_unwritten(mut self) -> VecDeque<Envelope> {
        self.prune();
        self.envelopes
    }
}

fn transmit(
    outgoing: &mpsc::UnboundedSender<OutboundFrame>,
    in_flight: &mut InFlight,
    events: &EventBus<LinkEvent>,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let text = match encode_frame(envelope) {
        Ok(text) => text,
        Err(err) => {
            warn!(kind = ?envelope.kind(), "dropping unencodable envelope: {err}");
            events.publish(LinkEvent::Undeliverable(envelope.clone()));
            return Ok(());
        }
    };
    in_flight.push(envelope.clone());
    outgoing.send(OutboundFrame::Text(text)).map_err(|_| {
        in_flight.cancel_last();
        TransportError::Io("link closed".to_owned())
    })
}

fn close_frame() -> OutboundFrame {
    OutboundFrame::Close {
        code: NORMAL_CLOSE_CODE,
        reason: CLIENT_CLOSE_REASON.to_owned(),
    }
}
