use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use gloo_timers::callback::Interval;
use leptos::prelude::*;
use leptos::task::spawn_local;
use voice_session::{
    ClientEvent, Configuration, ConversationCodec, ConversationController, EndpointResolver,
    EventLog, Message, SessionState, StreamingStatus, ToolEvent, ToolEventCodec, monitor,
};

use crate::api;
use crate::media::{self, BrowserMicrophone};
use crate::ws::BrowserDriver;

const RESET_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const STATUS_POLL_MILLIS: u32 = 5_000;

/// Backend location baked in at build time.
fn configuration() -> Configuration {
    let lookup = |key: &str| match key {
        "BACKEND_URL" => option_env!("BACKEND_URL").map(str::to_string),
        "USE_HTTPS" => option_env!("USE_HTTPS").map(str::to_string),
        _ => None,
    };
    Configuration::from_lookup(lookup).unwrap_or_else(|e| {
        log::error!("Invalid build-time configuration, using defaults: {e}");
        Configuration::default()
    })
}

/// Non-reactive half of the app: drivers, controller and timers.
struct Services {
    resolver: EndpointResolver,
    conversation: BrowserDriver<ConversationCodec>,
    tools: BrowserDriver<ToolEventCodec>,
    product_info: BrowserDriver<ToolEventCodec>,
    controller: RefCell<ConversationController<BrowserMicrophone>>,
    status_poll: RefCell<Option<Interval>>,
}

/// Shared application state, provided via Leptos context.
#[derive(Clone, Copy)]
pub struct AppState {
    // --- Read signals (for components to subscribe to) ---
    pub user_id: ReadSignal<String>,
    pub messages: ReadSignal<EventLog<Message>>,
    pub tool_events: ReadSignal<EventLog<ToolEvent>>,
    pub product_events: ReadSignal<EventLog<ToolEvent>>,
    pub conversation_state: ReadSignal<SessionState>,
    pub tools_state: ReadSignal<SessionState>,
    pub product_state: ReadSignal<SessionState>,
    pub conversation_active: ReadSignal<bool>,
    pub streaming_status: ReadSignal<Option<StreamingStatus>>,
    pub error: ReadSignal<Option<String>>,

    // --- Write signals (for mutating state) ---
    pub set_user_id: WriteSignal<String>,
    set_messages: WriteSignal<EventLog<Message>>,
    set_tool_events: WriteSignal<EventLog<ToolEvent>>,
    set_product_events: WriteSignal<EventLog<ToolEvent>>,
    set_conversation_active: WriteSignal<bool>,
    set_streaming_status: WriteSignal<Option<StreamingStatus>>,
    set_error: WriteSignal<Option<String>>,

    services: StoredValue<Rc<Services>, LocalStorage>,
}

impl AppState {
    /// Create a new `AppState` and provide it in the current Leptos context.
    pub fn provide() -> Self {
        let (user_id, set_user_id) = signal(String::new());
        let (messages, set_messages) = signal(EventLog::<Message>::new());
        let (tool_events, set_tool_events) = signal(EventLog::<ToolEvent>::new());
        let (product_events, set_product_events) = signal(EventLog::<ToolEvent>::new());
        let (conversation_state, set_conversation_state) = signal(SessionState::Idle);
        let (tools_state, set_tools_state) = signal(SessionState::Idle);
        let (product_state, set_product_state) = signal(SessionState::Idle);
        let (conversation_active, set_conversation_active) = signal(false);
        let (streaming_status, set_streaming_status) = signal(None::<StreamingStatus>);
        let (error, set_error) = signal(None::<String>);

        let resolver = EndpointResolver::new(configuration());
        let services = Rc::new_cyclic(|weak: &Weak<Services>| {
            let weak = weak.clone();
            Services {
                conversation: BrowserDriver::new(
                    monitor::conversation(resolver.clone()),
                    move |msg| set_messages.update(|log| log.push(msg)),
                    move |session| {
                        set_conversation_state.set(session);
                        if let Some(services) = weak.upgrade() {
                            let messages = {
                                let mut controller = services.controller.borrow_mut();
                                controller.session_state_changed(session);
                                set_conversation_active.set(controller.is_active());
                                controller.take_messages()
                            };
                            set_messages.update(|log| log.extend(messages));
                        }
                    },
                ),
                tools: BrowserDriver::new(
                    monitor::tool_monitor(resolver.clone()),
                    move |event| set_tool_events.update(|log| log.push(event)),
                    move |session| set_tools_state.set(session),
                ),
                product_info: BrowserDriver::new(
                    monitor::product_info_monitor(resolver.clone()),
                    move |event| set_product_events.update(|log| log.push(event)),
                    move |session| set_product_state.set(session),
                ),
                controller: RefCell::new(ConversationController::new()),
                status_poll: RefCell::new(None),
                resolver: resolver.clone(),
            }
        });

        let state = Self {
            user_id,
            messages,
            tool_events,
            product_events,
            conversation_state,
            tools_state,
            product_state,
            conversation_active,
            streaming_status,
            error,
            set_user_id,
            set_messages,
            set_tool_events,
            set_product_events,
            set_conversation_active,
            set_streaming_status,
            set_error,
            services: StoredValue::new_local(services),
        };

        provide_context(state);
        state
    }

    fn services(&self) -> Rc<Services> {
        self.services.get_value()
    }

    /// Applies the typed user id to every session, then connects them all.
    pub fn connect(&self) {
        let services = self.services();
        let id = self.user_id.get_untracked().trim().to_string();
        let id = (!id.is_empty()).then_some(id);
        self.set_error.set(None);

        let mut failure = None;
        for result in [
            services.conversation.set_user_id(id.clone()),
            services.tools.set_user_id(id.clone()),
            services.product_info.set_user_id(id),
        ] {
            if let Err(e) = result {
                failure.get_or_insert(e.to_string());
            }
        }
        for result in [
            services.conversation.connect(),
            services.tools.connect(),
            services.product_info.connect(),
        ] {
            if let Err(e) = result {
                failure.get_or_insert(e.to_string());
            }
        }
        if let Some(e) = failure {
            log::warn!("Connect failed: {e}");
            self.set_error.set(Some(e));
        }
        self.start_status_poll();
    }

    pub fn disconnect(&self) {
        self.stop_conversation();
        let services = self.services();
        services.conversation.disconnect();
        services.tools.disconnect();
        services.product_info.disconnect();
    }

    pub fn send_chat(&self, text: String) {
        let services = self.services();
        match services.conversation.send(&ClientEvent::Chat { text: text.clone() }) {
            Ok(()) => self.set_messages.update(|log| log.push(Message::user(text))),
            Err(e) => self.set_error.set(Some(e.to_string())),
        }
    }

    pub fn start_conversation(&self) {
        let services = self.services();
        let constraints = services
            .controller
            .borrow_mut()
            .start_conversation(services.conversation.state());
        let Some(constraints) = constraints else { return };

        let state = *self;
        let weak = Rc::downgrade(&services);
        let on_chunk = {
            let weak = weak.clone();
            move |pcm: Vec<u8>| {
                let Some(services) = weak.upgrade() else { return };
                let frame = services.controller.borrow().outbound_audio(pcm);
                if let Some(frame) = frame {
                    let _ = services.conversation.send_frame(frame);
                }
            }
        };

        spawn_local(async move {
            let result = media::acquire(constraints, on_chunk).await;
            let Some(services) = weak.upgrade() else { return };
            let session = services.conversation.state();
            let messages = {
                let mut controller = services.controller.borrow_mut();
                match result {
                    Ok(microphone) => controller.media_acquired(microphone, session),
                    Err(e) => {
                        log::error!("Microphone unavailable: {e}");
                        controller.media_denied(e);
                    }
                }
                state.set_conversation_active.set(controller.is_active());
                controller.take_messages()
            };
            state.set_messages.update(|log| log.extend(messages));
        });
    }

    pub fn stop_conversation(&self) {
        let services = self.services();
        let messages = {
            let mut controller = services.controller.borrow_mut();
            controller.stop_conversation();
            controller.take_messages()
        };
        self.set_conversation_active.set(false);
        self.set_messages.update(|log| log.extend(messages));
    }

    /// Resets the backend's product-info stream, reconnecting the monitor afterwards.
    pub fn reset_product_info(&self) {
        let state = *self;
        let services = self.services();
        let resolver = services.resolver.clone();
        spawn_local(async move {
            match api::reset_product_info(&resolver).await {
                Ok(()) => {
                    let services = state.services();
                    if !services.product_info.state().is_in_flight() {
                        if let Err(e) = services.product_info.reconnect_after(RESET_RECONNECT_DELAY) {
                            state.set_error.set(Some(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    log::error!("Failed to reset product info: {e}");
                    state.set_error.set(Some(format!("Failed to reset connection: {e}")));
                }
            }
        });
    }

    pub fn clear_messages(&self) {
        self.services().conversation.clear_log();
        self.set_messages.update(EventLog::clear);
    }

    pub fn clear_tool_events(&self) {
        self.services().tools.clear_log();
        self.set_tool_events.update(EventLog::clear);
    }

    pub fn clear_product_events(&self) {
        self.services().product_info.clear_log();
        self.set_product_events.update(EventLog::clear);
    }

    fn start_status_poll(&self) {
        let services = self.services();
        if services.status_poll.borrow().is_some() {
            return;
        }
        let resolver = services.resolver.clone();
        let set_status = self.set_streaming_status;
        let poll = move || {
            let resolver = resolver.clone();
            spawn_local(async move {
                match api::fetch_product_info_status(&resolver).await {
                    Ok(status) => set_status.set(Some(status)),
                    Err(e) => log::debug!("Status poll failed: {e}"),
                }
            });
        };
        poll();
        *services.status_poll.borrow_mut() = Some(Interval::new(STATUS_POLL_MILLIS, poll));
    }

    /// Stops the conversation, disconnects every session and cancels polling.
    pub fn teardown(&self) {
        self.disconnect();
        self.services().status_poll.borrow_mut().take();
    }
}
