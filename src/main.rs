use anyhow::{Context, Result};
use clap::Parser;
use loqa_voice_agent::room::{LiveKitSettings, LiveKitTokenIssuer};
use loqa_voice_agent::{
    create_router, AppState, Config, Dispatcher, EventPublisher, HttpProviderFactory,
    LiveKitTransport, NatsClient, NatsEventPublisher, RoomConnector, SessionServices,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loqa-voice-agent", version, about = "Real-time voice agent session service")]
struct Args {
    /// Config file path (extension optional)
    #[arg(short, long, default_value = "config/loqa-voice-agent")]
    config: String,

    /// Override the HTTP port from the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("Loqa Voice Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Media server: {}", cfg.media.url);

    let transport = LiveKitTransport::new(LiveKitSettings {
        sample_rate: cfg.audio.sample_rate,
        channels: cfg.audio.channels,
        connect_timeout: cfg.media.connect_timeout(),
        ..Default::default()
    });
    let connector = Arc::new(RoomConnector::new(
        transport,
        cfg.media.url.clone(),
        cfg.media.connect_retry.clone(),
    ));
    let providers = Arc::new(
        HttpProviderFactory::new(cfg.providers.clone())
            .context("Failed to build provider HTTP client")?,
    );
    let tokens = Arc::new(LiveKitTokenIssuer::new(
        cfg.media.api_key.clone(),
        cfg.media.api_secret.clone(),
        cfg.media.token_ttl(),
    ));

    let publisher: Option<Arc<dyn EventPublisher>> = match &cfg.nats {
        Some(nats) => match NatsClient::connect(&nats.url, nats.subject_prefix.clone()).await {
            Ok(client) => Some(Arc::new(NatsEventPublisher::new(Arc::new(client)))),
            Err(e) => {
                warn!("Session events will not be published: {:#}", e);
                None
            }
        },
        None => None,
    };

    let dispatcher = Dispatcher::new(
        cfg.dispatcher_settings(),
        SessionServices {
            connector,
            providers,
            tokens,
            publisher,
        },
    );

    let port = args.port.unwrap_or(cfg.service.http.port);
    let addr: SocketAddr = format!("{}:{}", cfg.service.http.bind, port)
        .parse()
        .context("Invalid HTTP bind address")?;

    let app = create_router(AppState::new(dispatcher.clone()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down; stopping running sessions");
    dispatcher.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}
