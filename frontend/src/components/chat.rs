use leptos::ev;
use leptos::prelude::*;
use voice_session::{MessageKind, SessionState};

use crate::state::AppState;

/// Conversation log, voice controls and the chat input.
#[component]
pub fn ChatArea() -> impl IntoView {
    let state = expect_context::<AppState>();

    view! {
        <main class="chat-area">
            // Error banner
            {move || {
                state.error.get().map(|err| {
                    view! {
                        <div class="error-banner">{err}</div>
                    }
                })
            }}

            <div class="chat-header">
                {move || format!("Voice assistant: {}", state.conversation_state.get())}
                <VoiceControls />
                <button class="clear-btn" on:click=move |_| state.clear_messages()>
                    "Clear"
                </button>
            </div>

            <div class="messages-container">
                {move || {
                    if state.messages.with(|log| log.is_empty()) {
                        view! {
                            <div class="empty-state">
                                "Connect and start a conversation, or type a message"
                            </div>
                        }.into_any()
                    } else {
                        view! {
                            <For
                                each=move || state.messages.get().entries().to_vec()
                                key=|m| m.id.clone()
                                let:msg
                            >
                                <MessageBubble
                                    kind=msg.kind
                                    content=msg.content.clone()
                                    spoken=msg.is_audio_origin
                                    time=msg.timestamp.format("%H:%M:%S").to_string()
                                />
                            </For>
                        }.into_any()
                    }
                }}
            </div>

            <ChatInput />
        </main>
    }
}

/// A single conversation entry.
#[component]
fn MessageBubble(kind: MessageKind, content: String, spoken: bool, time: String) -> impl IntoView {
    let css_class = format!("message {kind}");
    let label = if spoken { format!("{kind} (voice)") } else { kind.to_string() };

    view! {
        <div class=css_class>
            <div class="role-label">{label}" · "{time}</div>
            <div>{content}</div>
        </div>
    }
}

#[component]
fn VoiceControls() -> impl IntoView {
    let state = expect_context::<AppState>();
    let is_open = move || state.conversation_state.get() == SessionState::Open;

    view! {
        {move || {
            if state.conversation_active.get() {
                view! {
                    <button class="voice-btn active" on:click=move |_| state.stop_conversation()>
                        "Stop conversation"
                    </button>
                }.into_any()
            } else {
                view! {
                    <button
                        class="voice-btn"
                        disabled=move || !is_open()
                        on:click=move |_| state.start_conversation()
                    >
                        "Start conversation"
                    </button>
                }.into_any()
            }
        }}
    }
}

/// Chat input form with textarea and send button.
#[component]
fn ChatInput() -> impl IntoView {
    let state = expect_context::<AppState>();
    let (input, set_input) = signal(String::new());

    let is_open = move || state.conversation_state.get() == SessionState::Open;

    let send = move || {
        let text = input.get().trim().to_string();
        if text.is_empty() || !is_open() {
            return;
        }
        set_input.set(String::new());
        state.send_chat(text);
    };

    let on_keydown = move |ev: ev::KeyboardEvent| {
        if ev.key() == "Enter" && !ev.shift_key() {
            ev.prevent_default();
            send();
        }
    };

    let on_submit = move |_| {
        send();
    };

    view! {
        <div class="input-area">
            <div class="input-row">
                <textarea
                    rows="1"
                    placeholder="Type a message… (Enter to send, Shift+Enter for newline)"
                    prop:value=input
                    on:input=move |ev| {
                        set_input.set(event_target_value(&ev));
                    }
                    on:keydown=on_keydown
                    disabled=move || !is_open()
                />
                <button
                    class="send-btn"
                    on:click=on_submit
                    disabled=move || !is_open() || input.get().trim().is_empty()
                >
                    "Send"
                </button>
            </div>
        </div>
    }
}
