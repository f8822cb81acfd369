use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_BASE_URL: &str = "https://geocode-maps.yandex.ru/1.x/";
const DEFAULT_GEOCODER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_LISTING_LIMIT: usize = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub bind_addr: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_base_url: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_max_in_flight: usize,
    pub listing_limit: usize,
    pub shutdown_grace_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub bind_addr: String,
    pub geocoder_base_url: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_max_in_flight: usize,
    pub listing_limit: usize,
    pub shutdown_grace_secs: u64,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "company-directory.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_BASE_URL.to_string()),
            geocoder_timeout_secs: parse_u64(
                "GEOCODER_TIMEOUT_SECS",
                DEFAULT_GEOCODER_TIMEOUT_SECS,
            )
            .clamp(1, 60),
            geocoder_rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", 5).max(1),
            geocoder_max_in_flight: parse_usize("GEOCODER_MAX_IN_FLIGHT", 4).max(1),
            listing_limit: parse_usize("LISTING_LIMIT", DEFAULT_LISTING_LIMIT).max(1),
            shutdown_grace_secs: parse_u64("SHUTDOWN_GRACE_SECS", 10),
        }
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            bind_addr: self.bind_addr.clone(),
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            geocoder_max_in_flight: self.geocoder_max_in_flight,
            listing_limit: self.listing_limit,
            shutdown_grace_secs: self.shutdown_grace_secs,
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file_name: "company-directory.db".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            geocoder_api_key: None,
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocoder_timeout_secs: DEFAULT_GEOCODER_TIMEOUT_SECS,
            geocoder_rate_limit_qps: 5,
            geocoder_max_in_flight: 4,
            listing_limit: DEFAULT_LISTING_LIMIT,
            shutdown_grace_secs: 10,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
