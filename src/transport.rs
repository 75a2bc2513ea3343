//! Tokio driver for a [`Session`].
//!
//! Each session runs in its own task. Socket readers, reconnect timers and
//! control calls all post into one unbounded channel, so the state machine
//! sees a strictly serialised event stream even though I/O runs concurrently.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;
use voice_session::session::ABNORMAL_CLOSURE;
use voice_session::{
    Command, Endpoint, Frame, FrameCodec, Session, SessionState, SocketId, TimerId,
    TransportEvent,
};

use crate::errors::{AppError, TransportError};

/// Close code reported when the peer closed without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Runs against the session; the returned reply fires after the driver has flushed.
type ControlFn<C> = Box<dyn FnOnce(&mut Session<C>) -> Reply + Send>;
type Reply = Box<dyn FnOnce() + Send>;

enum DriverInput<C: FrameCodec> {
    Transport(SocketId, TransportEvent),
    Timer(TimerId),
    Control(ControlFn<C>),
    Shutdown,
}

/// Cloneable handle to a running session driver.
pub struct SessionHandle<C: FrameCodec> {
    endpoint: Endpoint,
    inputs: mpsc::UnboundedSender<DriverInput<C>>,
    state: watch::Receiver<SessionState>,
}

impl<C: FrameCodec> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint,
            inputs: self.inputs.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C> SessionHandle<C>
where
    C: FrameCodec + Send + 'static,
    C::Inbound: Send + 'static,
    C::Outbound: Send + 'static,
{
    /// Moves `session` into a driver task. Log entries arrive on the returned receiver.
    pub fn spawn(session: Session<C>) -> (Self, mpsc::UnboundedReceiver<C::Inbound>) {
        let endpoint = session.endpoint();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (entries_tx, entries_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(session.state());

        let driver = Driver {
            session,
            inputs: inputs_tx.clone(),
            sockets: HashMap::new(),
            timers: HashMap::new(),
            entries: entries_tx,
            state: state_tx,
        };
        tokio::spawn(driver.run(inputs_rx));

        let handle = Self { endpoint, inputs: inputs_tx, state: state_rx };
        (handle, entries_rx)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Resolves once the session reaches a state matching `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, AppError> {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.map_err(|_| self.stopped())?;
        Ok(*reached)
    }

    pub async fn connect(&self) -> Result<(), AppError> {
        self.call(|s| s.connect()).await??;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), AppError> {
        self.call(|s| s.disconnect()).await
    }

    pub async fn send(&self, event: C::Outbound) -> Result<(), AppError> {
        self.call(move |s| s.send(&event)).await??;
        Ok(())
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), AppError> {
        self.call(move |s| s.send_frame(frame)).await??;
        Ok(())
    }

    pub async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), AppError> {
        self.send_frame(Frame::Binary(pcm)).await
    }

    pub async fn reconnect_after(&self, delay: Duration) -> Result<(), AppError> {
        self.call(move |s| s.reconnect_after(delay)).await??;
        Ok(())
    }

    pub async fn set_user_id(&self, user_id: Option<String>) -> Result<(), AppError> {
        self.call(move |s| s.set_user_id(user_id)).await??;
        Ok(())
    }

    pub async fn clear_log(&self) -> Result<(), AppError> {
        self.call(|s| s.clear_log()).await
    }

    /// Disconnects and stops the driver task. Further calls fail with `DriverStopped`.
    pub fn shutdown(&self) {
        let _ = self.inputs.send(DriverInput::Shutdown);
    }

    async fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Session<C>) -> T + Send + 'static,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        let control: ControlFn<C> = Box::new(move |session| {
            let result = f(session);
            Box::new(move || {
                let _ = tx.send(result);
            })
        });
        self.inputs
            .send(DriverInput::Control(control))
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> AppError {
        AppError::DriverStopped { endpoint: self.endpoint.to_string() }
    }
}

struct Driver<C: FrameCodec> {
    session: Session<C>,
    inputs: mpsc::UnboundedSender<DriverInput<C>>,
    sockets: HashMap<SocketId, mpsc::UnboundedSender<WsMessage>>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    entries: mpsc::UnboundedSender<C::Inbound>,
    state: watch::Sender<SessionState>,
}

impl<C> Driver<C>
where
    C: FrameCodec + Send + 'static,
    C::Inbound: Send + 'static,
    C::Outbound: Send + 'static,
{
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<DriverInput<C>>) {
        let endpoint = self.session.endpoint();
        debug!(%endpoint, "Session driver started");

        while let Some(input) = inputs.recv().await {
            match input {
                DriverInput::Transport(socket, event) => {
                    if matches!(event, TransportEvent::Closed { .. }) {
                        self.sockets.remove(&socket);
                    }
                    self.session.handle_transport(socket, event);
                }
                DriverInput::Timer(timer) => {
                    self.timers.remove(&timer);
                    self.session.handle_timer(timer);
                }
                DriverInput::Control(control) => {
                    let reply = control(&mut self.session);
                    self.flush();
                    reply();
                    continue;
                }
                DriverInput::Shutdown => {
                    self.session.disconnect();
                    self.flush();
                    break;
                }
            }
            self.flush();
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.sockets.clear();
        debug!(%endpoint, "Session driver stopped");
    }

    /// Executes queued commands, then publishes entries and state.
    fn flush(&mut self) {
        while let Some(command) = self.session.poll_command() {
            self.execute(command);
        }
        for entry in self.session.take_entries() {
            let _ = self.entries.send(entry);
        }
        let current = self.session.state();
        self.state.send_if_modified(|state| {
            if *state == current {
                return false;
            }
            *state = current;
            true
        });
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Open { socket, url } => {
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                self.sockets.insert(socket, writer_tx);
                tokio::spawn(run_socket(socket, url, writer_rx, self.inputs.clone()));
            }
            Command::Send { socket, frame } => match self.sockets.get(&socket) {
                Some(writer) => {
                    let _ = writer.send(to_ws_message(frame));
                }
                None => warn!(%socket, "Send on unknown socket"),
            },
            Command::Close { socket, code, reason } => {
                if let Some(writer) = self.sockets.remove(&socket) {
                    let _ = writer.send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    })));
                }
            }
            Command::StartTimer { timer, delay } => {
                let inputs = self.inputs.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(DriverInput::Timer(timer));
                });
                if let Some(previous) = self.timers.insert(timer, handle) {
                    previous.abort();
                }
            }
            Command::CancelTimer { timer } => {
                if let Some(handle) = self.timers.remove(&timer) {
                    handle.abort();
                }
            }
        }
    }
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
    }
}

/// Owns one WebSocket from handshake to close and reports everything it sees.
async fn run_socket<C: FrameCodec>(
    socket: SocketId,
    url: Url,
    mut writer: mpsc::UnboundedReceiver<WsMessage>,
    inputs: mpsc::UnboundedSender<DriverInput<C>>,
) {
    let report = |event: TransportEvent| inputs.send(DriverInput::Transport(socket, event)).is_ok();

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(source) => {
            let err = TransportError::Handshake { url: url.to_string(), source };
            warn!(%socket, "{err}");
            report(TransportEvent::Error(err.to_string()));
            report(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
            return;
        }
    };
    info!(%socket, %url, "WebSocket connected");
    if !report(TransportEvent::Opened) {
        return;
    }

    let (mut sink, mut stream) = stream.split();
    let mut close: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            outbound = writer.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        if close.is_none() {
                            report(TransportEvent::Error(TransportError::Socket(e).to_string()));
                        }
                        break;
                    }
                }
                // The driver abandoned this socket.
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    if !report(TransportEvent::Frame(Frame::Text(text.as_str().to_string()))) {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if !report(TransportEvent::Frame(Frame::Binary(bytes.to_vec()))) {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    debug!(%socket, code, "Close frame received");
                    close = Some((code, reason));
                    report(TransportEvent::CloseStarted);
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => break,
                Some(Err(e)) => {
                    if close.is_none() {
                        error!(%socket, "WebSocket error: {e}");
                        report(TransportEvent::Error(TransportError::Socket(e).to_string()));
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let (code, reason) = close.unwrap_or((ABNORMAL_CLOSURE, String::new()));
    report(TransportEvent::Closed { code, reason });
}
