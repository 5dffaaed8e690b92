use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogLevel, VERSION};

pub fn init_logging(config: &Config) {
    use log::info;

    let level = match config.log_level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Production => tracing::Level::INFO,
    };

    // Default filter from the environment, with our configured level on top.
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_level {
        // Structured output for log shippers.
        LogLevel::Production => subscriber.json().init(),
        LogLevel::Debug => subscriber.pretty().init(),
    };

    info!("Welcome to gprxy! (Version {VERSION})");
}
