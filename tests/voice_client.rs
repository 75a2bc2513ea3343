mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::time::timeout;

use common::{conversation_text, eventually, next_matching, MockBackend, TIMEOUT};
use voice_client::{ApiError, AppError, Entry, VoiceClient};
use voice_session::{MessageKind, SessionState};

async fn wait_state<C>(handle: &voice_client::SessionHandle<C>, target: SessionState)
where
    C: voice_session::FrameCodec + Send + 'static,
    C::Inbound: Send + 'static,
    C::Outbound: Send + 'static,
{
    timeout(TIMEOUT, handle.wait_for(|s| *s == target))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}

#[tokio::test]
async fn test_connect_all_scopes_every_channel_to_the_user() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("alice")));

    client.connect_all().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;
    wait_state(client.tools(), SessionState::Open).await;
    wait_state(client.product_info(), SessionState::Open).await;

    let connected = next_matching(&mut entries, |e| {
        conversation_text(e) == Some("Connected to voice assistant as user: alice")
    })
    .await;
    assert!(matches!(connected, Entry::Conversation(_)));
    next_matching(&mut entries, |e| conversation_text(e) == Some("Welcome alice")).await;

    let connections = backend.state.connections.lock().unwrap().clone();
    assert_eq!(connections.len(), 3);
    assert!(connections.iter().all(|(_, user)| user.as_deref() == Some("alice")));

    client.teardown().await;
}

#[tokio::test]
async fn test_chat_round_trip() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("bob")));
    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    client.send_chat("hello there").await.unwrap();

    let echoed = next_matching(&mut entries, |e| conversation_text(e) == Some("echo: hello there")).await;
    let Entry::Conversation(msg) = echoed else { unreachable!() };
    assert_eq!(msg.kind, MessageKind::Assistant);
    assert_eq!(*backend.state.chat.lock().unwrap(), vec!["hello there".to_string()]);

    client.teardown().await;
}

#[tokio::test]
async fn test_chat_requires_open_session() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("bob")));

    let err = client.send_chat("too early").await.unwrap_err();
    assert!(err.to_string().contains("not connected"));
    assert!(backend.state.chat.lock().unwrap().is_empty());

    client.teardown().await;
}

#[tokio::test]
async fn test_side_channels_log_backend_events() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("carol")));
    client.connect_all().await.unwrap();

    let tool = next_matching(&mut entries, |e| matches!(e, Entry::Tool(ev) if ev.action == "open")).await;
    let Entry::Tool(tool) = tool else { unreachable!() };
    assert_eq!(tool.category, "invoice_command");
    assert_eq!(tool.payload["invoice_id"], 7);

    let product = next_matching(&mut entries, |e| {
        matches!(e, Entry::ProductInfo(ev) if ev.category == "product_info")
    })
    .await;
    let Entry::ProductInfo(product) = product else { unreachable!() };
    assert_eq!(product.payload["sku"], "A-1");

    client.teardown().await;
}

#[tokio::test]
async fn test_missing_identity_never_opens_a_socket() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(None));

    let err = client.connect_all().await.unwrap_err();
    assert!(err.is_missing_identity());
    next_matching(&mut entries, |e| {
        conversation_text(e) == Some("Please set a User ID before connecting")
    })
    .await;
    assert_eq!(client.conversation().state(), SessionState::Idle);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.state.connections.lock().unwrap().is_empty());

    client.set_user_id(Some("dave".into())).await.unwrap();
    client.connect_all().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    client.teardown().await;
}

#[tokio::test]
async fn test_user_id_is_locked_while_connected() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("erin")));
    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    assert!(client.set_user_id(Some("mallory".into())).await.is_err());

    client.teardown().await;
}

#[tokio::test]
async fn test_dropped_socket_reconnects() {
    let backend = MockBackend::start().await;
    backend.state.drop_next.store(1, Ordering::SeqCst);
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("frank")));

    client.conversation().connect().await.unwrap();

    next_matching(&mut entries, |e| {
        conversation_text(e).is_some_and(|t| t.starts_with("Connection lost (code 1006). Reconnecting in 50ms"))
    })
    .await;
    wait_state(client.conversation(), SessionState::Open).await;
    next_matching(&mut entries, |e| conversation_text(e) == Some("Welcome frank")).await;
    assert_eq!(backend.state.connection_count("/ws"), 2);

    client.teardown().await;
}

#[tokio::test]
async fn test_manual_disconnect_does_not_reconnect() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("grace")));
    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    client.conversation().disconnect().await.unwrap();
    assert_eq!(client.conversation().state(), SessionState::Idle);
    next_matching(&mut entries, |e| conversation_text(e) == Some("Disconnected from voice assistant")).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.conversation().state(), SessionState::Idle);
    assert_eq!(backend.state.connection_count("/ws"), 1);

    client.teardown().await;
}

#[tokio::test]
async fn test_normal_close_from_backend_settles_idle() {
    let backend = MockBackend::start().await;
    *backend.state.close_next.lock().unwrap() = Some((1000, "bye".into()));
    let (client, _entries) = VoiceClient::start(backend.settings(Some("heidi")));

    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Idle).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.conversation().state(), SessionState::Idle);
    assert_eq!(backend.state.connection_count("/ws"), 1);

    client.teardown().await;
}

#[tokio::test]
async fn test_abnormal_close_code_from_backend_reconnects() {
    let backend = MockBackend::start().await;
    *backend.state.close_next.lock().unwrap() = Some((1011, "internal".into()));
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("ivan")));

    client.conversation().connect().await.unwrap();
    next_matching(&mut entries, |e| {
        conversation_text(e).is_some_and(|t| t.starts_with("Connection lost (code 1011)"))
    })
    .await;
    next_matching(&mut entries, |e| conversation_text(e) == Some("Welcome ivan")).await;
    assert_eq!(backend.state.connection_count("/ws"), 2);

    client.teardown().await;
}

#[tokio::test]
async fn test_duplicate_rejection_waits_for_reset() {
    let backend = MockBackend::start().await;
    backend.state.reject_product_info.store(true, Ordering::SeqCst);
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("judy")));

    client.product_info().connect().await.unwrap();
    next_matching(&mut entries, |e| {
        matches!(e, Entry::ProductInfo(ev) if ev.action == "duplicate_connection")
    })
    .await;
    wait_state(client.product_info(), SessionState::Idle).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.state.connection_count("/ws/product_info"), 1);

    client.reset_product_info().await.unwrap();
    assert_eq!(backend.state.resets.load(Ordering::SeqCst), 1);
    assert_eq!(client.product_info().state(), SessionState::ReconnectPending);

    wait_state(client.product_info(), SessionState::Open).await;
    assert_eq!(backend.state.connection_count("/ws/product_info"), 2);

    client.teardown().await;
}

#[tokio::test]
async fn test_rejected_reset_does_not_reconnect() {
    let backend = MockBackend::start().await;
    backend.state.reject_reset.store(true, Ordering::SeqCst);
    let (client, _entries) = VoiceClient::start(backend.settings(Some("iris")));

    let err = client.reset_product_info().await.unwrap_err();
    assert!(matches!(err, AppError::Api(ApiError::Status { status: 503, .. })));
    assert_eq!(client.product_info().state(), SessionState::Idle);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.product_info().state(), SessionState::Idle);
    assert_eq!(backend.state.connection_count("/ws/product_info"), 0);

    client.teardown().await;
}

#[tokio::test]
async fn test_reset_leaves_open_monitor_alone() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("ken")));
    client.product_info().connect().await.unwrap();
    wait_state(client.product_info(), SessionState::Open).await;

    client.reset_product_info().await.unwrap();
    assert_eq!(client.product_info().state(), SessionState::Open);

    client.teardown().await;
}

#[tokio::test]
async fn test_status_and_bootstrap() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("leo")));

    let status = client.product_info_status().await.unwrap();
    assert!(status.is_streaming);
    assert!(!status.external_connected);
    assert!(!status.has_clients);

    let params = client.api().bootstrap().await.unwrap();
    assert_eq!(params["ws_url"], "/ws");

    client.teardown().await;
}

#[tokio::test]
async fn test_status_poll_reports_changes() {
    let backend = MockBackend::start().await;
    let (mut client, mut entries) = VoiceClient::start(backend.settings(Some("mia")));
    client.spawn_status_poll(Duration::from_millis(50));

    let first = next_matching(&mut entries, |e| matches!(e, Entry::Status(_))).await;
    assert!(matches!(first, Entry::Status(s) if !s.has_clients));

    client.product_info().connect().await.unwrap();
    let second = next_matching(&mut entries, |e| matches!(e, Entry::Status(_))).await;
    assert!(matches!(second, Entry::Status(s) if s.has_clients));

    client.teardown().await;
}

#[tokio::test]
async fn test_api_errors_surface_when_backend_is_down() {
    let backend = MockBackend::start().await;
    let mut settings = backend.settings(Some("nina"));
    // Nothing listens on port 9 locally.
    settings.config = voice_session::Configuration::new("127.0.0.1:9", false).unwrap();
    let (client, _entries) = VoiceClient::start(settings);

    assert!(client.product_info_status().await.is_err());
    assert!(client.reset_product_info().await.is_err());

    client.teardown().await;
}

fn write_wav(path: &std::path::Path, samples: usize) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..samples {
        writer.write_sample((i % 100) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

#[tokio::test]
async fn test_conversation_streams_microphone_audio() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("speech.wav");
    write_wav(&wav, 4800);

    let mut settings = backend.settings(Some("olga"));
    settings.microphone = Some(wav);
    let (client, mut entries) = VoiceClient::start(settings);

    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    assert!(client.start_conversation().await.unwrap());
    next_matching(&mut entries, |e| {
        conversation_text(e) == Some("Conversation started! You can now talk naturally with the AI.")
    })
    .await;

    // 300 ms of 16-bit mono audio.
    let state = backend.state.clone();
    eventually(|| state.audio_bytes.load(Ordering::SeqCst) == 9600).await;

    client.stop_conversation().await;
    assert!(!client.conversation_active().await);
    next_matching(&mut entries, |e| conversation_text(e) == Some("Conversation stopped.")).await;

    client.teardown().await;
}

#[tokio::test]
async fn test_conversation_ends_when_session_drops() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("speech.wav");
    write_wav(&wav, 16000);

    let mut settings = backend.settings(Some("pat"));
    settings.microphone = Some(wav);
    let (client, mut entries) = VoiceClient::start(settings);

    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;
    assert!(client.start_conversation().await.unwrap());

    client.conversation().disconnect().await.unwrap();
    next_matching(&mut entries, |e| {
        conversation_text(e) == Some("Conversation ended: connection closed.")
    })
    .await;
    assert!(!client.conversation_active().await);

    client.teardown().await;
}

#[tokio::test]
async fn test_stop_while_microphone_opens_releases_it() {
    let backend = MockBackend::start().await;
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("speech.wav");
    write_wav(&wav, 16000);

    let mut settings = backend.settings(Some("pia"));
    settings.microphone = Some(wav);
    let (client, _entries) = VoiceClient::start(settings);
    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    let (started, ()) = tokio::join!(client.start_conversation(), client.stop_conversation());
    assert!(!started.unwrap());
    assert!(!client.conversation_active().await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.state.audio_bytes.load(Ordering::SeqCst), 0);

    client.teardown().await;
}

#[tokio::test]
async fn test_conversation_requires_open_session() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("quinn")));

    assert!(!client.start_conversation().await.unwrap());
    assert!(!client.conversation_active().await);

    client.teardown().await;
}

#[tokio::test]
async fn test_missing_microphone_is_reported() {
    let backend = MockBackend::start().await;
    let (client, mut entries) = VoiceClient::start(backend.settings(Some("rita")));
    client.conversation().connect().await.unwrap();
    wait_state(client.conversation(), SessionState::Open).await;

    assert!(client.start_conversation().await.is_err());
    let denied = next_matching(&mut entries, |e| {
        conversation_text(e).is_some_and(|t| t.starts_with("Failed to start conversation"))
    })
    .await;
    assert!(matches!(denied, Entry::Conversation(m) if m.kind == MessageKind::Error));
    assert!(!client.conversation_active().await);

    client.teardown().await;
}

#[tokio::test]
async fn test_teardown_closes_every_socket() {
    let backend = MockBackend::start().await;
    let (client, _entries) = VoiceClient::start(backend.settings(Some("sam")));
    client.connect_all().await.unwrap();
    wait_state(client.tools(), SessionState::Open).await;

    let tools = client.tools().clone();
    client.teardown().await;

    assert_eq!(tools.state(), SessionState::Idle);
    assert!(tools.connect().await.is_err());
}
