use std::time::Duration;

use log::LevelFilter;

/// Flat runtime configuration, built once from the environment at startup.
/// Nothing else in the process reads environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device path or `tcp://host:port`; `None` runs the bridge
    /// without a gateway connection.
    pub serial_port: Option<String>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    pub log_level: LevelFilter,
    pub restore_state: bool,
    pub restore_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial_port: None,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            log_level: LevelFilter::Info,
            restore_state: true,
            restore_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Config::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let non_empty = |name: &str| get(name).filter(|value| !value.is_empty());

        config.serial_port = non_empty("SERIAL_PORT");
        if let Some(host) = non_empty("MQTT_HOST") {
            config.mqtt_host = host;
        }
        if let Some(port) = non_empty("MQTT_PORT")
            && let Ok(port) = port.parse()
        {
            config.mqtt_port = port;
        }
        config.mqtt_user = non_empty("MQTT_USER");
        config.mqtt_password = non_empty("MQTT_PASSWORD");
        if let Some(level) = non_empty("LOG_LEVEL")
            && let Ok(level) = level.parse()
        {
            config.log_level = level;
        }
        if let Some(restore) = non_empty("RESTORE_STATE") {
            config.restore_state = matches!(restore.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(delay) = non_empty("RESTORE_DELAY")
            && let Ok(seconds) = delay.parse()
        {
            config.restore_delay = Duration::from_secs(seconds);
        }
        config
    }
}
