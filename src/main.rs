use speech_provider::backends;
use speech_provider::config_loader;
use speech_provider::dispatcher::Provider;
use speech_provider::service::{self, SpeechProvider};
use speech_provider::worker::SynthesisLock;
use std::error::Error;
use std::future::pending;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zbus::connection::Builder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config_loader::settings()?;

    let backend = backends::from_settings(&settings)?;
    info!(
        backend = backend.id(),
        workers = settings.pool_size,
        "Starting speech provider"
    );

    let (provider, events) = Provider::spawn(backend, settings.pool_size, SynthesisLock::new());
    match provider.voices().await {
        Ok(voices) => info!(voices = voices.len(), "Voice catalog loaded"),
        Err(e) => warn!("Failed to list voices: {}", e),
    }

    let bus_name = settings.bus_name();
    let path = settings.object_path();
    let conn = Builder::session()?
        .name(bus_name.as_str())?
        .serve_at(path.as_str(), SpeechProvider::new(provider.clone()))?
        .build()
        .await?;

    info!("Speech provider running at {} {}", bus_name, path);

    tokio::spawn(service::forward_events(conn.clone(), path.clone(), events));
    if let Some(period) = settings.voices_poll_interval() {
        tokio::spawn(service::watch_voices(
            conn.clone(),
            path.clone(),
            provider.clone(),
            period,
        ));
    }

    if settings.keep_alive {
        pending::<()>().await;
    } else {
        service::idle_shutdown(&provider, settings.idle_timeout()).await;
    }

    Ok(())
}
