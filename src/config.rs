//! Layered configuration (defaults → optional file → environment overrides),
//! mirroring the teacher's `Config::builder()` pattern with this crate's own
//! environment prefix (`GATEWAY_`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub staging_buffer_size: usize,
    pub sensor_timeout_sec: i64,
    pub tcp_backlog: u32,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub select_timeout_sec: u64,
    pub db_connect_retry_attempts: u32,
    pub db_connect_retry_delay_sec: u64,
    pub retry_queue_capacity: usize,
    pub temp_too_hot_threshold: f64,
    pub temp_too_cold_threshold: f64,
    pub map_file_name: String,
    pub db_path: String,
    pub control_socket_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            staging_buffer_size: 15,
            sensor_timeout_sec: 5,
            tcp_backlog: 10,
            max_connections: 100,
            max_connections_per_ip: 5,
            select_timeout_sec: 1,
            db_connect_retry_attempts: 3,
            db_connect_retry_delay_sec: 5,
            retry_queue_capacity: 20,
            temp_too_hot_threshold: 30.0,
            temp_too_cold_threshold: 15.0,
            map_file_name: "room_sensor.map".to_string(),
            db_path: "sensor_gateway.sqlite".to_string(),
            control_socket_path: "/tmp/sensor_gateway.sock".to_string(),
        }
    }
}

/// Load configuration from file with layered fallbacks.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["config.toml", "gateway.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("GATEWAY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults and logging a warning on
/// any error rather than aborting startup.
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("failed to load config ({e}), using defaults");
            AppConfig::default()
        }
    }
}
