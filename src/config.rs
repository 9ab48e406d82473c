use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_RETENTION_HOURS: u64 = 24;
const DEFAULT_SWEEP_INTERVAL_HOURS: u64 = 6;

/// Process configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env_parse("PORT", DEFAULT_PORT);
        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_DIR));
        let retention_hours = env_parse("CACHE_RETENTION_HOURS", DEFAULT_RETENTION_HOURS);
        let sweep_hours = env_parse("CACHE_SWEEP_INTERVAL_HOURS", DEFAULT_SWEEP_INTERVAL_HOURS);

        Self {
            port,
            cache_dir,
            retention: Duration::from_secs(retention_hours * 60 * 60),
            sweep_interval: Duration::from_secs(sweep_hours * 60 * 60),
        }
    }
}

/// Read an env var, falling back to the default when it is unset or malformed.
fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring malformed {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
