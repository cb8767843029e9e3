mod api;
mod config;
mod poller;
mod sensor;
mod state;
mod viva;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sjofart=debug")),
        )
        .init();

    tracing::info!("Starting sjofart v{}", env!("CARGO_PKG_VERSION"));

    let config_path = config::config_path();
    let settings = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let stations = settings.stations();
    tracing::info!(
        "Prefix '{}', {} station(s), numeric values: {}",
        settings.name,
        stations.len(),
        settings.numeric_values
    );

    let app_state = Arc::new(AppState {
        store: state::StateStore::new(1024),
        stations: stations.clone(),
    });

    if std::env::args().any(|a| a == "--once") {
        return run_once(app_state, settings).await;
    }

    let mut changes = app_state.store.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(event) => {
                    if event.old_state.as_ref().map(|s| &s.state) != Some(&event.new_state.state) {
                        tracing::debug!("{} = {}", event.entity_id, event.new_state.state);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("state log skipped {} changes", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let fetcher = Arc::new(viva::HttpFetcher::new(config::FETCH_TIMEOUT)?);
    poller::start_all(
        app_state.clone(),
        fetcher,
        &settings.name,
        &stations,
        settings.value_mode(),
        config::POLL_INTERVAL,
    );

    let port: u16 = std::env::var("SJOFART_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8124);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(app_state)).await?;

    Ok(())
}

/// Poll every station once and print the published sensors as JSON.
async fn run_once(app_state: Arc<AppState>, settings: Config) -> anyhow::Result<()> {
    let app = app_state.clone();
    let answered = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let fetcher = viva::BlockingHttpFetcher::new(config::FETCH_TIMEOUT)?;
        Ok(poller::poll_once_blocking(
            &fetcher,
            &app,
            &settings.name,
            settings.value_mode(),
        ))
    })
    .await??;

    tracing::info!("{}/{} stations answered", answered, app_state.stations.len());
    println!("{}", serde_json::to_string_pretty(&app_state.store.get_all())?);
    Ok(())
}
