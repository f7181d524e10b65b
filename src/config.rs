/// Gateway configuration
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// The configuration tree is deserialized from YAML. When no `--config`
/// path is given, well-known directories are searched in order, then the
/// current directory, for `config.yaml` / `config.yml`.
///
/// ```yaml
/// gateways:
///   - name: "plant-floor"
///     upstreams:
///       - type: "tcp"
///         tcp: { address: "0.0.0.0:502" }
///     downstreams:
///       - name: "pump-bus"
///         type: "rtu"
///         slave_ids: "1,2,5-10"
///         serial:
///           device: "/dev/ttyUSB0"
///           baud_rate: 19200
/// log:
///   level: "info"
///   file: "-"
/// ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};

/// Global configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// "debug", "info", "warn", or "error"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; "" or "-" selects standard output
    #[serde(default)]
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single gateway instance.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub downstreams: Vec<DownstreamConfig>,
}

/// A master connecting to the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// "tcp", "rtu", or "rtu-over-tcp"
    #[serde(rename = "type")]
    pub kind: String,
    /// Used when type is "tcp" or "rtu-over-tcp"
    #[serde(default)]
    pub tcp: TcpConfig,
    /// Used when type is "rtu"
    #[serde(default)]
    pub serial: SerialConfig,
}

/// A slave the gateway connects to.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    /// Optional name for logging
    #[serde(default)]
    pub name: String,
    /// "tcp", "rtu", "rtu-over-tcp", or "local"
    #[serde(rename = "type")]
    pub kind: String,
    /// Routing rules ("1", "1,2", "1-10"); absent selects the default route
    #[serde(default)]
    pub slave_ids: Option<String>,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

/// TCP endpoint settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TcpConfig {
    /// e.g. "0.0.0.0:502" or "192.168.1.100:502"
    #[serde(default)]
    pub address: String,
}

/// Local in-memory slave settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalConfig {
    /// Informational device name
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Data storage settings for the local slave.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PersistenceConfig {
    /// "memory", "file", or "mmap"
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Backing file path for "file" / "mmap"
    #[serde(default)]
    pub path: String,
}

/// Serial line settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// "N", "E", or "O" (case-insensitive; stored upper)
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Response deadline; defaults to 500 ms when zero
    #[serde(with = "humantime_serde", default)]
    pub timeout: Duration,
    /// Pause between requests; defaults to 100 ms when zero
    #[serde(with = "humantime_serde", default)]
    pub rqst_pause: Duration,

    // RS485 specific
    #[serde(default)]
    pub rs485: bool,
    #[serde(with = "humantime_serde", default)]
    pub delay_rts_before_send: Duration,
    #[serde(with = "humantime_serde", default)]
    pub delay_rts_after_send: Duration,
    #[serde(default)]
    pub rts_high_during_send: bool,
    #[serde(default)]
    pub rts_high_after_send: bool,
    #[serde(default)]
    pub rx_during_tx: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout: Duration::ZERO,
            rqst_pause: Duration::ZERO,
            rs485: false,
            delay_rts_before_send: Duration::ZERO,
            delay_rts_after_send: Duration::ZERO,
            rts_high_during_send: false,
            rts_high_after_send: false,
            rx_during_tx: false,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialConfig {
    /// Map the configured data bits onto the serial backend.
    pub fn data_bits(&self) -> GatewayResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(GatewayError::configuration(format!(
                "invalid data bits: {}",
                other
            ))),
        }
    }

    /// Map the configured stop bits onto the serial backend.
    pub fn stop_bits(&self) -> GatewayResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(GatewayError::configuration(format!(
                "invalid stop bits: {}",
                other
            ))),
        }
    }

    /// Map the configured parity onto the serial backend.
    pub fn parity(&self) -> GatewayResult<tokio_serial::Parity> {
        match self.parity.as_str() {
            "N" => Ok(tokio_serial::Parity::None),
            "E" => Ok(tokio_serial::Parity::Even),
            "O" => Ok(tokio_serial::Parity::Odd),
            other => Err(GatewayError::configuration(format!(
                "invalid parity: {}",
                other
            ))),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or search the well-known
    /// locations when none is given.
    pub fn load(path: Option<&Path>) -> GatewayResult<Config> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => find_config_file().ok_or_else(|| {
                GatewayError::configuration("no config file found in search path")
            })?,
        };

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::configuration(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.fixup();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> GatewayResult<Config> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.fixup();
        Ok(config)
    }

    /// Normalize parsed values: parity uppercased, zero durations replaced
    /// by their defaults.
    fn fixup(&mut self) {
        for gateway in &mut self.gateways {
            for upstream in &mut gateway.upstreams {
                fixup_serial(&mut upstream.serial);
            }
            for downstream in &mut gateway.downstreams {
                fixup_serial(&mut downstream.serial);
            }
        }
    }
}

fn fixup_serial(serial: &mut SerialConfig) {
    serial.parity = serial.parity.to_uppercase();
    if serial.timeout.is_zero() {
        serial.timeout = Duration::from_millis(500);
    }
    if serial.rqst_pause.is_zero() {
        serial.rqst_pause = Duration::from_millis(100);
    }
}

/// Search order: /etc/voltage-gateway, $HOME/.voltage-gateway, then the
/// current directory, each for config.yaml / config.yml.
fn find_config_file() -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = vec![PathBuf::from("/etc/voltage-gateway")];
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(".voltage-gateway"));
    }
    dirs.push(PathBuf::from("."));

    for dir in dirs {
        for name in ["config.yaml", "config.yml"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
gateways:
  - name: "test-gateway"
    upstreams:
      - type: "tcp"
        tcp:
          address: "0.0.0.0:33502"
    downstreams:
      - name: "rtu-slave"
        type: "rtu"
        slave_ids: "1"
        serial:
          device: "/dev/pts/1"
          baud_rate: 19200
          data_bits: 8
          parity: "n"
          stop_bits: 1
          timeout: "1s"
      - name: "local-db"
        type: "local"
        local:
          device: "bench"
          persistence:
            type: "mmap"
            path: "/tmp/model.dat"
log:
  level: "debug"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.gateways.len(), 1);
        assert_eq!(config.log.level, "debug");

        let gw = &config.gateways[0];
        assert_eq!(gw.name, "test-gateway");
        assert_eq!(gw.upstreams[0].kind, "tcp");
        assert_eq!(gw.upstreams[0].tcp.address, "0.0.0.0:33502");

        let rtu = &gw.downstreams[0];
        assert_eq!(rtu.kind, "rtu");
        assert_eq!(rtu.slave_ids.as_deref(), Some("1"));
        assert_eq!(rtu.serial.baud_rate, 19200);
        assert_eq!(rtu.serial.timeout, Duration::from_secs(1));

        let local = &gw.downstreams[1];
        assert_eq!(local.kind, "local");
        assert!(local.slave_ids.is_none());
        assert_eq!(local.local.persistence.kind, "mmap");
    }

    #[test]
    fn test_serial_fixups() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let serial = &config.gateways[0].downstreams[0].serial;

        // Parity stored upper
        assert_eq!(serial.parity, "N");
        // rqst_pause defaulted to 100ms
        assert_eq!(serial.rqst_pause, Duration::from_millis(100));
    }

    #[test]
    fn test_serial_mapping() {
        let serial = SerialConfig::default();
        assert!(matches!(
            serial.data_bits().unwrap(),
            tokio_serial::DataBits::Eight
        ));
        assert!(matches!(serial.parity().unwrap(), tokio_serial::Parity::None));
        assert!(matches!(
            serial.stop_bits().unwrap(),
            tokio_serial::StopBits::One
        ));

        let bad = SerialConfig {
            data_bits: 9,
            ..Default::default()
        };
        assert!(bad.data_bits().is_err());
    }

    #[test]
    fn test_default_log_level() {
        let config = Config::from_yaml("gateways: []").unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.file, "");
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = Config::from_yaml("gateways: {broken").unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
