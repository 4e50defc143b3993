use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::sampler::Cadence;
use crate::sync::DrainMode;

pub const DEFAULT_LOG_FILE_PATH: &str = "logs/bus_tracker.log";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub backend_url: String,
    pub backend_token: Option<String>,
    pub storage_dir: PathBuf,
    pub cadence: Cadence,
    pub default_geofence_radius_m: f64,
    pub flush_interval: Duration,
    pub network_timeout: Duration,
    pub drain_mode: DrainMode,
    pub max_sample_accuracy_m: Option<f64>,
    pub log_file_path: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000/api".to_string(),
            backend_token: None,
            storage_dir: PathBuf::from("data"),
            cadence: Cadence {
                min_interval: Duration::from_millis(5000),
                min_distance_m: 10.0,
            },
            default_geofence_radius_m: 50.0,
            flush_interval: Duration::from_secs(20),
            network_timeout: Duration::from_secs(12),
            drain_mode: DrainMode::Full,
            max_sample_accuracy_m: None,
            log_file_path: DEFAULT_LOG_FILE_PATH.to_string(),
        }
    }
}

impl TrackerConfig {
    /// Reads the configuration from the environment (and `.env`, if present).
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let parsed = |key: &str| -> Option<f64> { get(key).and_then(|raw| parse_or_warn(key, &raw)) };

        Self {
            backend_url: get("BACKEND_URL").unwrap_or(defaults.backend_url),
            backend_token: get("BACKEND_TOKEN"),
            storage_dir: get("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            cadence: Cadence {
                min_interval: get("SAMPLE_MIN_INTERVAL_MS")
                    .and_then(|raw| parse_or_warn::<u64>("SAMPLE_MIN_INTERVAL_MS", &raw))
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.cadence.min_interval),
                min_distance_m: parsed("SAMPLE_MIN_DISTANCE_M")
                    .filter(|d| *d >= 0.0)
                    .unwrap_or(defaults.cadence.min_distance_m),
            },
            default_geofence_radius_m: parsed("GEOFENCE_DEFAULT_RADIUS_M")
                .filter(|r| *r > 0.0)
                .unwrap_or(defaults.default_geofence_radius_m),
            flush_interval: get("SYNC_FLUSH_INTERVAL_SECS")
                .and_then(|raw| parse_or_warn::<u64>("SYNC_FLUSH_INTERVAL_SECS", &raw))
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
            network_timeout: get("SYNC_NETWORK_TIMEOUT_SECS")
                .and_then(|raw| parse_or_warn::<u64>("SYNC_NETWORK_TIMEOUT_SECS", &raw))
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.network_timeout),
            drain_mode: get("SYNC_DRAIN_MODE")
                .and_then(|raw| parse_or_warn("SYNC_DRAIN_MODE", &raw))
                .unwrap_or(defaults.drain_mode),
            max_sample_accuracy_m: parsed("MAX_SAMPLE_ACCURACY_M").filter(|a| *a > 0.0),
            log_file_path: log_file_path_from(&lookup),
        }
    }
}

/// Resolves `LOG_FILE_PATH` on its own, so logging can be set up before the
/// rest of the configuration is parsed and its warnings have somewhere to go.
pub fn log_file_path_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("LOG_FILE_PATH")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILE_PATH.to_string())
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "Ignoring unparsable setting, using default");
            None
        }
    }
}
