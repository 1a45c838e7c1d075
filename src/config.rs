use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_connections_per_user: usize,
    pub checkpoint_debounce_secs: u64,
    pub transfer_min_remaining_minutes: i64,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            jwt_secret: get_env("JWT_SECRET")?,
            heartbeat_interval_secs: get_env_parse_or("WS_HEARTBEAT_INTERVAL_SECS", 30)?,
            heartbeat_timeout_secs: get_env_parse_or("WS_HEARTBEAT_TIMEOUT_SECS", 60)?,
            max_connections_per_user: get_env_parse_or("WS_MAX_CONNECTIONS_PER_USER", 3)?,
            checkpoint_debounce_secs: get_env_parse_or("WS_CHECKPOINT_DEBOUNCE_SECS", 2)?,
            transfer_min_remaining_minutes: get_env_parse_or("TRANSFER_MIN_REMAINING_MINUTES", 5)?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
