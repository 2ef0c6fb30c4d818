//! Configuration Module
//!
//! Settings read from `SAFESIGNAL_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::channel::ReconnectConfig;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_FAKE_CALL_PAUSE_MS: u64 = 3000;
// Clemson University main campus, near Sikes Hall
const DEFAULT_SIM_START: (f64, f64) = (34.6794, -82.8351);
const DEFAULT_SIM_STEP: f64 = 0.0001;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub ws_url: String,
    pub poll_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub fake_call_pause: Duration,
    pub sim_start: (f64, f64),
    pub sim_step: f64,
    pub data_dir: PathBuf,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("SAFESIGNAL_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ws_url = match get("SAFESIGNAL_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&api_url),
        };

        let poll_interval = Duration::from_millis(parse_or(
            "SAFESIGNAL_POLL_INTERVAL_MS",
            get("SAFESIGNAL_POLL_INTERVAL_MS"),
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SAFESIGNAL_POLL_INTERVAL_MS".into(),
                value: "0".into(),
            });
        }

        let mut reconnect = ReconnectConfig::default();
        if let Some(value) = get("SAFESIGNAL_RECONNECT") {
            reconnect.enabled = parse_flag("SAFESIGNAL_RECONNECT", &value)?;
        }
        if let Some(value) = get("SAFESIGNAL_RECONNECT_MAX_ATTEMPTS") {
            reconnect.max_attempts = Some(parse_or("SAFESIGNAL_RECONNECT_MAX_ATTEMPTS", Some(value), 0)?);
        }

        let fake_call_pause = Duration::from_millis(parse_or(
            "SAFESIGNAL_FAKE_CALL_PAUSE_MS",
            get("SAFESIGNAL_FAKE_CALL_PAUSE_MS"),
            DEFAULT_FAKE_CALL_PAUSE_MS,
        )?);

        let sim_start = match get("SAFESIGNAL_SIM_START") {
            Some(value) => parse_point("SAFESIGNAL_SIM_START", &value)?,
            None => DEFAULT_SIM_START,
        };
        let sim_step = parse_or("SAFESIGNAL_SIM_STEP", get("SAFESIGNAL_SIM_STEP"), DEFAULT_SIM_STEP)?;

        let data_dir = get("SAFESIGNAL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            api_url,
            ws_url,
            poll_interval,
            reconnect,
            fake_call_pause,
            sim_start,
            sim_step,
            data_dir,
        })
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir.join("fake-call")
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_url.to_string()
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("SafeSignal")
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_point(key: &str, value: &str) -> Result<(f64, f64), ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    };
    let (lat, lng) = value.split_once(',').ok_or_else(invalid)?;
    let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
    let lng: f64 = lng.trim().parse().map_err(|_| invalid())?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(invalid());
    }
    Ok((lat, lng))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}
