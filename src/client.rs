//! Composition root: the three backend sessions, the conversation controller,
//! the microphone and the HTTP API behind one handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voice_session::{
    monitor, ClientEvent, ConversationCodec, ConversationController, EndpointResolver, FrameCodec,
    MediaAccessError, Message, Session, SessionState, StreamingStatus, ToolEvent, ToolEventCodec,
};

use crate::api::BackendApi;
use crate::errors::AppError;
use crate::media::{AudioStream, Microphone, WavCapture, WavMicrophone, CHUNK_MILLIS};
use crate::settings::Settings;
use crate::transport::SessionHandle;

/// Delay between a successful product-info reset and the reconnect attempt.
pub const RESET_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One line of output, tagged with the log it belongs to.
#[derive(Debug, Clone)]
pub enum Entry {
    Conversation(Message),
    Tool(ToolEvent),
    ProductInfo(ToolEvent),
    Status(StreamingStatus),
}

type Controller = ConversationController<WavCapture>;

pub struct VoiceClient {
    conversation: SessionHandle<ConversationCodec>,
    tools: SessionHandle<ToolEventCodec>,
    product_info: SessionHandle<ToolEventCodec>,
    controller: Arc<Mutex<Controller>>,
    microphone: WavMicrophone,
    api: BackendApi,
    output: mpsc::UnboundedSender<Entry>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceClient {
    /// Spawns the session drivers. Must be called inside a tokio runtime.
    pub fn start(settings: Settings) -> (Self, mpsc::UnboundedReceiver<Entry>) {
        let resolver = EndpointResolver::new(settings.config.clone());
        let (output, entries) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let (conversation, rx) =
            SessionHandle::spawn(configure(monitor::conversation(resolver.clone()), &settings));
        tasks.push(forward(rx, output.clone(), Entry::Conversation));

        let (tools, rx) = SessionHandle::spawn(configure(monitor::tool_monitor(resolver.clone()), &settings));
        tasks.push(forward(rx, output.clone(), Entry::Tool));

        let (product_info, rx) =
            SessionHandle::spawn(configure(monitor::product_info_monitor(resolver.clone()), &settings));
        tasks.push(forward(rx, output.clone(), Entry::ProductInfo));

        let controller = Arc::new(Mutex::new(Controller::new()));
        tasks.push(watch_conversation(&conversation, Arc::clone(&controller), output.clone()));

        let client = Self {
            conversation,
            tools,
            product_info,
            controller,
            microphone: WavMicrophone::new(settings.microphone),
            api: BackendApi::new(resolver),
            output,
            tasks,
        };
        (client, entries)
    }

    pub fn conversation(&self) -> &SessionHandle<ConversationCodec> {
        &self.conversation
    }

    pub fn tools(&self) -> &SessionHandle<ToolEventCodec> {
        &self.tools
    }

    pub fn product_info(&self) -> &SessionHandle<ToolEventCodec> {
        &self.product_info
    }

    pub fn api(&self) -> &BackendApi {
        &self.api
    }

    /// Connects every session. All three are attempted even if one fails.
    pub async fn connect_all(&self) -> Result<(), AppError> {
        let results = [
            self.conversation.connect().await,
            self.tools.connect().await,
            self.product_info.connect().await,
        ];
        results.into_iter().collect()
    }

    pub async fn disconnect_all(&self) -> Result<(), AppError> {
        self.stop_conversation().await;
        self.conversation.disconnect().await?;
        self.tools.disconnect().await?;
        self.product_info.disconnect().await
    }

    /// Applies a new user id to every session. Sessions must be idle.
    pub async fn set_user_id(&self, user_id: Option<String>) -> Result<(), AppError> {
        self.conversation.set_user_id(user_id.clone()).await?;
        self.tools.set_user_id(user_id.clone()).await?;
        self.product_info.set_user_id(user_id).await
    }

    /// Drops entries the drivers have not delivered yet.
    pub async fn clear_logs(&self) -> Result<(), AppError> {
        self.conversation.clear_log().await?;
        self.tools.clear_log().await?;
        self.product_info.clear_log().await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), AppError> {
        let text = text.into();
        self.conversation.send(ClientEvent::Chat { text: text.clone() }).await?;
        let _ = self.output.send(Entry::Conversation(Message::user(text)));
        Ok(())
    }

    /// Returns whether a conversation is running afterwards.
    ///
    /// The input file is decoded on the blocking pool with the controller
    /// unlocked, so a stop issued meanwhile wins and the capture is released.
    pub async fn start_conversation(&self) -> Result<bool, AppError> {
        let constraints = {
            let mut controller = self.controller.lock().await;
            match controller.start_conversation(self.conversation.state()) {
                Some(constraints) => constraints,
                None => return Ok(controller.is_active()),
            }
        };

        let microphone = self.microphone.clone();
        let acquired = tokio::task::spawn_blocking(move || microphone.acquire(&constraints))
            .await
            .unwrap_or_else(|e| Err(MediaAccessError::DeviceUnavailable(e.to_string())));

        let mut controller = self.controller.lock().await;
        match acquired {
            Ok(capture) => {
                let stream = capture.stream();
                controller.media_acquired(capture, self.conversation.state());
                let active = controller.is_active();
                self.flush_controller(&mut controller);
                drop(controller);
                if active {
                    self.spawn_audio_pump(stream);
                }
                Ok(active)
            }
            Err(err) => {
                warn!("Microphone unavailable: {err}");
                controller.media_denied(err.clone());
                self.flush_controller(&mut controller);
                Err(err.into())
            }
        }
    }

    pub async fn stop_conversation(&self) {
        let mut controller = self.controller.lock().await;
        controller.stop_conversation();
        self.flush_controller(&mut controller);
    }

    pub async fn conversation_active(&self) -> bool {
        self.controller.lock().await.is_active()
    }

    /// Resets the backend's product-info stream, then reconnects the monitor.
    pub async fn reset_product_info(&self) -> Result<(), AppError> {
        self.api.reset_product_info().await?;
        if !self.product_info.state().is_in_flight() {
            self.product_info.reconnect_after(RESET_RECONNECT_DELAY).await?;
        }
        Ok(())
    }

    pub async fn product_info_status(&self) -> Result<StreamingStatus, AppError> {
        self.api.product_info_status().await
    }

    /// Polls the streaming status and emits an entry whenever it changes.
    pub fn spawn_status_poll(&mut self, interval: Duration) {
        let api = self.api.clone();
        let output = self.output.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last: Option<StreamingStatus> = None;
            loop {
                ticker.tick().await;
                match api.product_info_status().await {
                    Ok(status) if last.as_ref() != Some(&status) => {
                        last = Some(status.clone());
                        if output.send(Entry::Status(status)).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Status poll failed: {e}"),
                }
            }
        }));
    }

    /// Stops the conversation, disconnects every session and stops the drivers.
    pub async fn teardown(self) {
        info!("Tearing down voice client");
        if let Err(e) = self.disconnect_all().await {
            warn!("Disconnect during teardown failed: {e}");
        }
        self.conversation.shutdown();
        self.tools.shutdown();
        self.product_info.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }

    fn flush_controller(&self, controller: &mut Controller) {
        for message in controller.take_messages() {
            let _ = self.output.send(Entry::Conversation(message));
        }
    }

    fn spawn_audio_pump(&self, stream: AudioStream) {
        let controller = Arc::clone(&self.controller);
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(CHUNK_MILLIS)));
            for chunk in stream {
                ticker.tick().await;
                let Some(frame) = controller.lock().await.outbound_audio(chunk) else {
                    break;
                };
                if let Err(e) = conversation.send_frame(frame).await {
                    debug!("Audio pump stopped: {e}");
                    break;
                }
            }
            debug!("Audio input drained");
        });
    }
}

fn configure<C: FrameCodec>(session: Session<C>, settings: &Settings) -> Session<C> {
    let session = session.with_policy(settings.reconnect.clone());
    match &settings.user_id {
        Some(id) => session.with_user_id(id.clone()),
        None => session,
    }
}

fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    output: mpsc::UnboundedSender<Entry>,
    wrap: fn(T) -> Entry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if output.send(wrap(entry)).is_err() {
                break;
            }
        }
    })
}

/// Keeps the controller in step with the conversation session.
fn watch_conversation(
    conversation: &SessionHandle<ConversationCodec>,
    controller: Arc<Mutex<Controller>>,
    output: mpsc::UnboundedSender<Entry>,
) -> JoinHandle<()> {
    let mut states = conversation.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state: SessionState = *states.borrow_and_update();
            let mut controller = controller.lock().await;
            controller.session_state_changed(state);
            for message in controller.take_messages() {
                let _ = output.send(Entry::Conversation(message));
            }
        }
    })
}
