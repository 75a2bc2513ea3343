use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use voice_client::client::STATUS_POLL_INTERVAL;
use voice_client::{Entry, Settings, VoiceClient};
use voice_session::{EventLog, Message, MessageKind, ToolEvent};

const HELP: &str = "\
Commands:
  /connect           connect all sessions
  /disconnect        disconnect all sessions
  /user <id>         set the user id (while disconnected)
  /start             start a voice conversation
  /stop              stop the voice conversation
  /reset             reset the product-info stream
  /status            show session and streaming status
  /clear             clear the event logs
  /quit              exit
Anything else is sent as a chat message.";

/// Local copies of each log, so `/clear` and `/status` have something to act on.
#[derive(Default)]
struct Logs {
    conversation: EventLog<Message>,
    tools: EventLog<ToolEvent>,
    product_info: EventLog<ToolEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_client=info,voice_session=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    info!(
        backend = settings.config.backend_host(),
        secure = settings.config.use_secure_transport(),
        "Starting voice client"
    );

    let (mut client, mut entries) = VoiceClient::start(settings.clone());
    client.spawn_status_poll(STATUS_POLL_INTERVAL);

    match client.api().bootstrap().await {
        Ok(params) => info!("Backend bootstrap: {params}"),
        Err(e) => warn!("Backend bootstrap unavailable: {e}"),
    }

    if settings.user_id.is_some() {
        if let Err(e) = client.connect_all().await {
            warn!("Initial connect failed: {e}");
        }
    } else {
        println!("No USER_ID set. Use /user <id> then /connect.");
    }
    println!("{HELP}");

    let mut logs = Logs::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(entry) = entries.recv() => {
                print_entry(&entry);
                logs.record(entry);
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&client, &mut logs, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.teardown().await;
    while let Ok(entry) = entries.try_recv() {
        print_entry(&entry);
    }
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(client: &VoiceClient, logs: &mut Logs, line: &str) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "/quit" | "/exit" => return false,
        "/help" => {
            println!("{HELP}");
            Ok(())
        }
        "/connect" => client.connect_all().await,
        "/disconnect" => client.disconnect_all().await,
        "/user" => {
            let id = (!arg.is_empty()).then(|| arg.to_string());
            client.set_user_id(id).await
        }
        "/start" => client.start_conversation().await.map(|active| {
            if !active {
                println!("Connect first; a conversation needs an open session.");
            }
        }),
        "/stop" => {
            client.stop_conversation().await;
            Ok(())
        }
        "/reset" => client.reset_product_info().await,
        "/status" => {
            print_status(client, logs).await;
            Ok(())
        }
        "/clear" => client.clear_logs().await.map(|()| {
            logs.clear();
            println!("Logs cleared.");
        }),
        _ if command.starts_with('/') => {
            println!("Unknown command {command}. Type /help.");
            Ok(())
        }
        _ => client.send_chat(line).await,
    };

    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

async fn print_status(client: &VoiceClient, logs: &Logs) {
    println!(
        "conversation: {} ({} entries, voice {})",
        client.conversation().state(),
        logs.conversation.len(),
        if client.conversation_active().await { "on" } else { "off" },
    );
    println!("tools: {} ({} events)", client.tools().state(), logs.tools.len());
    println!(
        "product info: {} ({} events)",
        client.product_info().state(),
        logs.product_info.len()
    );
    match client.product_info_status().await {
        Ok(status) => println!(
            "streaming: {} external: {} clients: {}",
            status.is_streaming, status.external_connected, status.has_clients
        ),
        Err(e) => println!("streaming status unavailable: {e}"),
    }
}

fn print_entry(entry: &Entry) {
    match entry {
        Entry::Conversation(msg) => {
            let marker = match msg.kind {
                MessageKind::Error => "!",
                MessageKind::System => "*",
                MessageKind::User if msg.is_audio_origin => "🎤",
                MessageKind::User => ">",
                MessageKind::Assistant => "<",
            };
            println!("[{}] {marker} {}", msg.timestamp.format("%H:%M:%S"), msg.content);
        }
        Entry::Tool(event) => print_event("tools", event),
        Entry::ProductInfo(event) => print_event("product", event),
        Entry::Status(status) => println!(
            "[status] streaming={} external={} clients={}",
            status.is_streaming, status.external_connected, status.has_clients
        ),
    }
}

fn print_event(channel: &str, event: &ToolEvent) {
    println!(
        "[{}] [{channel}] {}/{} {}",
        event.timestamp.format("%H:%M:%S"),
        event.category,
        event.action,
        event.payload
    );
}

impl Logs {
    fn record(&mut self, entry: Entry) {
        match entry {
            Entry::Conversation(msg) => self.conversation.push(msg),
            Entry::Tool(event) => self.tools.push(event),
            Entry::ProductInfo(event) => self.product_info.push(event),
            Entry::Status(_) => {}
        }
    }

    fn clear(&mut self) {
        self.conversation.clear();
        self.tools.clear();
        self.product_info.clear();
    }
}
