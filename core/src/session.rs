//! The per-endpoint connection state machine.
//!
//! A [`Session`] performs no I/O. Callers feed it transport events and timer
//! expirations through [`Session::handle_transport`] and
//! [`Session::handle_timer`], and execute the [`Command`]s it queues. Every
//! socket and timer it requests carries a fresh id; events tagged with an id
//! that is no longer current are discarded, which is what guarantees that no
//! frame is processed after a close and that a cancelled timer never connects.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──opened──▶ Open ──close frame──▶ Closing
//!  ▲                    │                    │                      │
//!  │                    └──abnormal close────┴──────────┐           │
//!  │                                                    ▼           │
//!  └──────── 1000 / 4000 / disconnect ──────── ReconnectPending ◀───┘
//!                                                  │ timer
//!                                                  ▼
//!                                              Connecting
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::codec::{Frame, FrameCodec, Notice};
use crate::config::{Endpoint, EndpointResolver};
use crate::errors::SessionError;
use crate::reconnect::ReconnectPolicy;

/// Intentional closure. Never followed by a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported by transports when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// The backend rejected the handshake (missing `user_id`).
pub const POLICY_VIOLATION: u16 = 1008;
/// The backend already has a client for this endpoint and user.
pub const DUPLICATE_CONNECTION: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    ReconnectPending,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::ReconnectPending => "reconnect_pending",
        }
    }

    /// A socket attempt is in flight or established.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// I/O the session asks its driver to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { socket: SocketId, url: Url },
    Send { socket: SocketId, frame: Frame },
    Close { socket: SocketId, code: u16, reason: String },
    StartTimer { timer: TimerId, delay: Duration },
    CancelTimer { timer: TimerId },
}

/// Signals a driver reports for a socket it opened on the session's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(Frame),
    Error(String),
    /// The peer sent a close frame; `Closed` follows once the socket is down.
    CloseStarted,
    Closed { code: u16, reason: String },
}

pub struct Session<C: FrameCodec> {
    endpoint: Endpoint,
    resolver: EndpointResolver,
    codec: C,
    policy: ReconnectPolicy,
    user_id: Option<String>,
    state: SessionState,
    socket: Option<SocketId>,
    timer: Option<TimerId>,
    reconnect_attempt: u32,
    next_id: u64,
    commands: VecDeque<Command>,
    entries: VecDeque<C::Inbound>,
}

impl<C: FrameCodec> Session<C> {
    pub fn new(endpoint: Endpoint, resolver: EndpointResolver, codec: C) -> Self {
        Self {
            endpoint,
            resolver,
            codec,
            policy: ReconnectPolicy::default(),
            user_id: None,
            state: SessionState::Idle,
            socket: None,
            timer: None,
            reconnect_attempt: 0,
            next_id: 1,
            commands: VecDeque::new(),
            entries: VecDeque::new(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn pending_timer(&self) -> Option<TimerId> {
        self.timer
    }

    /// The identity is read-only unless the session is `Idle`.
    pub fn set_user_id(&mut self, user_id: Option<String>) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::IdentityLocked);
        }
        self.user_id = user_id.filter(|id| !id.is_empty());
        Ok(())
    }

    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Open => {
                debug!(endpoint = %self.endpoint, "Connection already in progress or established");
                return Ok(());
            }
            SessionState::Closing => return Err(SessionError::Closing),
            SessionState::Idle | SessionState::ReconnectPending => {}
        }

        let url = self.resolve_url()?;
        self.cancel_timer();
        self.open_socket(url);
        Ok(())
    }

    /// Arms the reconnect timer so a connection is attempted after `delay`.
    pub fn reconnect_after(&mut self, delay: Duration) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Open => return Ok(()),
            SessionState::Closing => return Err(SessionError::Closing),
            SessionState::Idle | SessionState::ReconnectPending => {}
        }
        self.require_identity()?;
        self.start_timer(delay);
        self.state = SessionState::ReconnectPending;
        Ok(())
    }

    /// Explicit, user-initiated close. Settles in `Idle` before returning.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        info!(endpoint = %self.endpoint, "Disconnecting");

        self.cancel_timer();
        if let Some(socket) = self.socket.take() {
            self.commands.push_back(Command::Close {
                socket,
                code: NORMAL_CLOSURE,
                reason: "Manual disconnect".to_string(),
            });
        }
        self.state = SessionState::Idle;
        self.reconnect_attempt = 0;
        self.notify(Notice::Disconnected { endpoint: self.endpoint });
    }

    pub fn send(&mut self, event: &C::Outbound) -> Result<(), SessionError> {
        let socket = self.open_socket_id()?;
        let frame = self.codec.encode(event)?;
        self.commands.push_back(Command::Send { socket, frame });
        Ok(())
    }

    /// Sends a pre-encoded frame, e.g. captured audio.
    pub fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let socket = self.open_socket_id()?;
        self.commands.push_back(Command::Send { socket, frame });
        Ok(())
    }

    /// Single entry point for everything a driver observes on a socket.
    pub fn handle_transport(&mut self, socket: SocketId, event: TransportEvent) {
        if self.socket != Some(socket) {
            debug!(endpoint = %self.endpoint, %socket, "Ignoring event from stale socket: {event:?}");
            return;
        }

        match event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Frame(frame) => self.on_frame(frame),
            TransportEvent::Error(detail) => self.on_error(detail),
            TransportEvent::CloseStarted => {
                if self.state.is_in_flight() {
                    self.state = SessionState::Closing;
                }
            }
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
        }
    }

    /// Single entry point for reconnect timer expirations.
    pub fn handle_timer(&mut self, timer: TimerId) {
        if self.timer != Some(timer) {
            debug!(endpoint = %self.endpoint, %timer, "Ignoring stale timer");
            return;
        }
        self.timer = None;

        match self.state {
            SessionState::ReconnectPending => match self.resolve_url() {
                Ok(url) => {
                    info!(
                        endpoint = %self.endpoint,
                        attempt = self.reconnect_attempt,
                        "Reconnecting"
                    );
                    self.open_socket(url);
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, "Reconnect aborted: {e}");
                    self.state = SessionState::Idle;
                }
            },
            // A manual connect won the race.
            SessionState::Connecting | SessionState::Open => {
                debug!(endpoint = %self.endpoint, "Timer fired while a connection is in flight");
            }
            SessionState::Idle | SessionState::Closing => {}
        }
    }

    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn drain_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    /// Log entries produced since the last call, in receipt order.
    pub fn take_entries(&mut self) -> Vec<C::Inbound> {
        self.entries.drain(..).collect()
    }

    /// Drops entries not yet taken. Bindings clear their own copy of the log.
    pub fn clear_log(&mut self) {
        self.entries.clear();
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(endpoint = %self.endpoint, state = %self.state, "Unexpected open signal");
            return;
        }
        self.state = SessionState::Open;
        self.reconnect_attempt = 0;
        info!(endpoint = %self.endpoint, "Connected");

        let user_id = self.user_id.clone().unwrap_or_default();
        self.notify(Notice::Connected { endpoint: self.endpoint, user_id });
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.state != SessionState::Open {
            debug!(endpoint = %self.endpoint, state = %self.state, "Dropping frame outside open state");
            return;
        }
        if let Some(entry) = self.codec.decode(frame) {
            self.entries.push_back(entry);
        }
    }

    fn on_error(&mut self, detail: String) {
        warn!(endpoint = %self.endpoint, "Transport error: {detail}");
        self.notify(Notice::TransportError { endpoint: self.endpoint, detail });
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        self.socket = None;
        info!(endpoint = %self.endpoint, code, %reason, "Socket closed");

        match code {
            NORMAL_CLOSURE => {
                self.state = SessionState::Idle;
                self.reconnect_attempt = 0;
                self.notify(Notice::Disconnected { endpoint: self.endpoint });
            }
            DUPLICATE_CONNECTION => {
                warn!(endpoint = %self.endpoint, "Rejected as duplicate connection");
                self.state = SessionState::Idle;
                self.reconnect_attempt = 0;
                self.notify(Notice::DuplicateConnection { endpoint: self.endpoint });
            }
            _ if self.policy.should_retry(self.reconnect_attempt) => {
                self.reconnect_attempt += 1;
                let delay = self.policy.delay_for(self.reconnect_attempt);
                self.start_timer(delay);
                self.state = SessionState::ReconnectPending;
                self.notify(Notice::ReconnectScheduled {
                    endpoint: self.endpoint,
                    attempt: self.reconnect_attempt,
                    delay,
                    code,
                    reason,
                });
            }
            _ => {
                warn!(
                    endpoint = %self.endpoint,
                    attempts = self.reconnect_attempt,
                    "Reconnect attempts exhausted"
                );
                let attempts = self.reconnect_attempt;
                self.state = SessionState::Idle;
                self.reconnect_attempt = 0;
                self.notify(Notice::ReconnectExhausted { endpoint: self.endpoint, attempts, code });
            }
        }
    }

    fn require_identity(&mut self) -> Result<Option<&str>, SessionError> {
        let missing = self.user_id.as_deref().map_or(true, str::is_empty);
        if self.endpoint.is_user_scoped() && missing {
            warn!(endpoint = %self.endpoint, "Cannot connect: user id is required");
            self.notify(Notice::MissingIdentity { endpoint: self.endpoint });
            return Err(SessionError::MissingIdentity {
                endpoint: self.endpoint.path().to_string(),
            });
        }
        Ok(self.user_id.as_deref())
    }

    fn resolve_url(&mut self) -> Result<Url, SessionError> {
        let endpoint = self.endpoint;
        let user_id = self.require_identity()?.map(str::to_string);
        let url = self.resolver.resolve_ws_url(endpoint.path(), user_id.as_deref())?;
        Ok(url)
    }

    fn open_socket(&mut self, url: Url) {
        let socket = SocketId(self.next_id());
        debug!(endpoint = %self.endpoint, %socket, %url, "Opening socket");
        self.socket = Some(socket);
        self.state = SessionState::Connecting;
        self.commands.push_back(Command::Open { socket, url });
    }

    fn open_socket_id(&self) -> Result<SocketId, SessionError> {
        match (self.state, self.socket) {
            (SessionState::Open, Some(socket)) => Ok(socket),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn start_timer(&mut self, delay: Duration) {
        self.cancel_timer();
        let timer = TimerId(self.next_id());
        self.timer = Some(timer);
        self.commands.push_back(Command::StartTimer { timer, delay });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.commands.push_back(Command::CancelTimer { timer });
        }
    }

    fn notify(&mut self, notice: Notice) {
        let entry = self.codec.notice(&notice);
        self.entries.push_back(entry);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl<C: FrameCodec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("user_id", &self.user_id)
            .field("state", &self.state)
            .field("socket", &self.socket)
            .field("timer", &self.timer)
            .field("reconnect_attempt", &self.reconnect_attempt)
            .finish()
    }
}
