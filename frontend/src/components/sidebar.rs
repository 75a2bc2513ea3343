use leptos::prelude::*;
use voice_session::{SessionState, ToolEvent};

use crate::state::AppState;

/// Identity, connection controls and the two side-channel monitors.
#[component]
pub fn Sidebar() -> impl IntoView {
    let state = expect_context::<AppState>();
    let connected = move || state.conversation_state.get() != SessionState::Idle;

    view! {
        <aside class="sidebar">
            <div class="sidebar-header">
                <h2>"Voice Assistant"</h2>
                <input
                    type="text"
                    placeholder="User ID"
                    prop:value=state.user_id
                    on:input=move |ev| state.set_user_id.set(event_target_value(&ev))
                    disabled=connected
                />
                {move || {
                    if connected() {
                        view! {
                            <button class="new-chat-btn" on:click=move |_| state.disconnect()>
                                "Disconnect"
                            </button>
                        }.into_any()
                    } else {
                        view! {
                            <button class="new-chat-btn" on:click=move |_| state.connect()>
                                "Connect"
                            </button>
                        }.into_any()
                    }
                }}
            </div>

            <section class="monitor">
                <h3>{move || format!("Tools ({})", state.tools_state.get())}</h3>
                <button on:click=move |_| state.clear_tool_events()>"Clear"</button>
                <EventList events=Signal::derive(move || state.tool_events.get().entries().to_vec()) />
            </section>

            <section class="monitor">
                <h3>{move || format!("Product info ({})", state.product_state.get())}</h3>
                <button on:click=move |_| state.reset_product_info()>"Reset"</button>
                <button on:click=move |_| state.clear_product_events()>"Clear"</button>
                {move || {
                    state.streaming_status.get().map(|status| {
                        view! {
                            <div class="streaming-status">
                                {format!(
                                    "streaming: {} · external: {} · clients: {}",
                                    status.is_streaming, status.external_connected, status.has_clients,
                                )}
                            </div>
                        }
                    })
                }}
                <EventList events=Signal::derive(move || state.product_events.get().entries().to_vec()) />
            </section>
        </aside>
    }
}

#[component]
fn EventList(events: Signal<Vec<ToolEvent>>) -> impl IntoView {
    view! {
        <div class="conversation-list">
            <For
                each=move || events.get().into_iter().rev()
                key=|e| e.id.clone()
                let:event
            >
                <div class="conversation-item">
                    <strong>{format!("{}/{}", event.category, event.action)}</strong>
                    " "
                    <span>{event.timestamp.format("%H:%M:%S").to_string()}</span>
                    <pre>{event.payload.to_string()}</pre>
                </div>
            </For>
        </div>
    }
}
