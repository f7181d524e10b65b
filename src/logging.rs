/// Logging setup for the gateway process
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// The library logs through the `log` facade; the binary wires it to
/// env_logger here, driven by the `log:` configuration section. An empty
/// file name or "-" selects standard output.

use std::fs::OpenOptions;

use log::LevelFilter;

use crate::config::LogConfig;
use crate::error::{GatewayError, GatewayResult};

/// Map a configured level name onto a log filter. Unknown names fall back
/// to info.
pub fn parse_level(level: &str) -> LevelFilter {
    match level {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Initialize the global logger from the configuration.
pub fn init(cfg: &LogConfig) -> GatewayResult<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(parse_level(&cfg.level))
        .format_timestamp_millis();

    if !cfg.file.is_empty() && cfg.file != "-" {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file)
            .map_err(|e| {
                GatewayError::configuration(format!(
                    "failed to open log file {}: {}",
                    cfg.file, e
                ))
            })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // A second init (tests, embedding) is not an error worth failing over.
    let _ = builder.try_init();
    Ok(())
}
