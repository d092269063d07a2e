use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tunegrab_daemon::client::HttpBackend;
use tunegrab_daemon::core::{QueueBroadcast, QueueCore, QueueEvent};
use tunegrab_daemon::http;
use tunegrab_proto::config::Config;

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<QueueBroadcast>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<QueueBroadcast>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach listeners
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(QueueBroadcast::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can feed it
    let (broadcast_tx, _) = broadcast::channel::<QueueBroadcast>(256);

    let log_path = tunegrab_proto::platform::log_path();
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tunegrab_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    info!("Backend: {}", backend.base_url());

    // Event channel: every input funnels into QueueCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<QueueEvent>(256);
    let core = QueueCore::new(
        config.clone(),
        backend.clone(),
        broadcast_tx.clone(),
        event_tx.clone(),
    );
    let handle = core.handle();

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            handle.clone(),
            backend.clone(),
            config.clone(),
        );
    }

    // Ctrl-C stops the loop and closes every job channel
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            handle.shutdown().await;
        }
    });

    info!("Queue initialised, running event loop");
    core.run(event_rx).await?;

    Ok(())
}
