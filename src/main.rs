//! CLI entry point for the bus tracker.
//!
//! Replays a recorded track through the tracking engine, and offers
//! maintenance commands for the durable event queue and the persisted trip.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bus_tracker::config::{TrackerConfig, log_file_path_from};
use bus_tracker::fetch::auth::ApiKey;
use bus_tracker::fetch::{BasicClient, fetch_bytes};
use bus_tracker::infra::backend::{HttpBackend, InMemoryBackend};
use bus_tracker::sampler::ReplayProvider;
use bus_tracker::services::backend_api::BackendApi;
use bus_tracker::session::TrackingSession;
use bus_tracker::stops::load_stops_csv;
use bus_tracker::storage::{FileStore, KeyValueStore, MemoryStore};
use bus_tracker::trip::{RouteSource, TripStatus, TripTracker};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "bus_tracker")]
#[command(about = "Offline-tolerant bus location and stop-arrival tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a trip by replaying a recorded GPS track
    Track {
        /// Trip to track
        #[arg(long)]
        trip_id: i64,

        /// Bus running the trip
        #[arg(long)]
        bus_id: i64,

        /// Path or URL of the CSV track to replay
        #[arg(long, value_name = "FILE_OR_URL")]
        track: String,

        /// CSV stop list to use instead of asking the backend
        #[arg(long)]
        stops: Option<String>,

        /// Delay between replayed fixes, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pace_ms: u64,

        /// Use an in-memory backend and storage instead of the real ones
        #[arg(long, default_value_t = false, requires = "stops")]
        dry_run: bool,
    },
    /// Try to deliver every queued event now
    Flush,
    /// Print the queued events
    Queue,
    /// Print the persisted trip, if any
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = log_file_path_from(|key| std::env::var(key).ok());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("bus_tracker.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let config = TrackerConfig::load();
    let cli = Cli::parse();

    match cli.command {
        Commands::Track {
            trip_id,
            bus_id,
            track,
            stops,
            pace_ms,
            dry_run,
        } => {
            let (store, backend): (Arc<dyn KeyValueStore>, Arc<dyn BackendApi>) = if dry_run {
                info!("Dry run: using in-memory storage and backend");
                (Arc::new(MemoryStore::new()), Arc::new(InMemoryBackend::new()))
            } else {
                (
                    Arc::new(FileStore::open(&config.storage_dir)?),
                    http_backend(&config)?,
                )
            };

            let route = match stops {
                Some(path) => RouteSource::Provided(load_stops_csv(&path)?),
                None => RouteSource::Backend,
            };

            let bytes = fetcher(&track).await?;
            let provider = Arc::new(ReplayProvider::from_csv(
                &bytes,
                Duration::from_millis(pace_ms),
            )?);
            info!(points = provider.len(), "Track loaded");

            track_trip(config, store, backend, provider, trip_id, bus_id, route).await?;
        }
        Commands::Flush => {
            let session = open_session(config)?;
            let report = session.sync().flush().await;
            info!(%report, "Flush complete");
        }
        Commands::Queue => {
            let session = open_session(config)?;
            let items = session.queue().snapshot();
            info!(pending = items.len(), "Queued events");
            info!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::Status => {
            let session = open_session(config)?;
            match session.load_active_trip()? {
                Some(trip) => info!("{}", serde_json::to_string_pretty(&trip.state)?),
                None => info!("No trip is being tracked"),
            }
            info!(pending = session.queue().len(), "Queued events");
        }
    }

    Ok(())
}

fn http_backend(config: &TrackerConfig) -> Result<Arc<dyn BackendApi>> {
    let client = BasicClient::with_connect_timeout(Duration::from_secs(10))?;
    let backend: Arc<dyn BackendApi> = match &config.backend_token {
        Some(token) => Arc::new(HttpBackend::new(
            ApiKey::bearer(client, token).context("BACKEND_TOKEN is not a valid header value")?,
            &config.backend_url,
            config.network_timeout,
        )),
        None => Arc::new(HttpBackend::new(
            client,
            &config.backend_url,
            config.network_timeout,
        )),
    };
    Ok(backend)
}

fn open_session(config: TrackerConfig) -> Result<TrackingSession<dyn BackendApi>> {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&config.storage_dir)?);
    let backend = http_backend(&config)?;
    Ok(TrackingSession::open(config, store, backend)?)
}

/// Loads track data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &String) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::new();
        fetch_bytes(&client, url).await?
    } else {
        std::fs::read(url).with_context(|| format!("failed to read track {url}"))?
    };
    Ok(bytes)
}

/// Starts (or resumes) the trip, replays the track, then stops the trip.
async fn track_trip(
    config: TrackerConfig,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn BackendApi>,
    provider: Arc<ReplayProvider>,
    trip_id: i64,
    bus_id: i64,
    route: RouteSource,
) -> Result<()> {
    let session = Arc::new(TrackingSession::open(config, store, backend)?);
    let tracker = TripTracker::new(session.clone(), provider);

    let mut states = tracker.watch_state();
    let progress = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if let Some(state) = state {
                info!(
                    trip_id = state.trip_id,
                    status = ?state.status,
                    stop_index = state.current_stop_index,
                    "Trip progress"
                );
            }
        }
    });

    match tracker.restore().await? {
        Some(state) if state.trip_id != trip_id => {
            tracker.shutdown().await;
            bail!(
                "trip {} is still being tracked on this device; stop it before starting trip {}",
                state.trip_id,
                trip_id
            );
        }
        Some(state) => {
            info!(trip_id, stop_index = state.current_stop_index, "Continuing persisted trip");
            if state.status == TripStatus::Paused {
                tracker.resume().await?;
            }
        }
        None => {
            tracker.start_trip(trip_id, bus_id, route).await?;
        }
    }

    tokio::select! {
        _ = tracker.sampling_ended() => info!("Track replay finished"),
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping trip"),
    }

    let final_state = tracker.stop_trip().await?;
    progress.abort();

    info!(
        trip_id = final_state.trip_id,
        stops_reached = final_state.current_stop_index,
        pending = session.queue().len(),
        "Done"
    );
    Ok(())
}
