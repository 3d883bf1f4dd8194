pub mod devices;
pub mod eep;
pub mod esp3;
pub mod framer;
pub mod gateway;
pub mod states;
pub mod transport;
pub mod util;

/// One-time logger setup for binaries; the level normally comes from the
/// LOG_LEVEL environment variable parsed by the daemon's config.
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new().filter_level(level).init();
}
