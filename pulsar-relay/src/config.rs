//! Fixed relay settings. Only the device address comes from the command line.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{cli::Cli, server::OriginPolicy};

pub const BAUD_RATE: u32 = 115_200;
/// Upper bound on how long a stop request waits for the serial reader.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const SUBSCRIBER_QUEUE: usize = 64;
pub const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_FRAME_LEN: usize = 64 * 1024;
/// How long shutdown waits for the supervisor to let go of the device.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const LISTEN_PORT: u16 = 8080;
pub const LOG_FILE: &str = "pulsar.log";

#[cfg(target_os = "windows")]
pub const DEFAULT_DEVICE: &str = "COM3";
#[cfg(target_os = "macos")]
pub const DEFAULT_DEVICE: &str = "/dev/cu.usbserial-0001";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub device: String,
    pub listen_addr: SocketAddr,
    pub log_file: PathBuf,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub retry_interval: Duration,
    pub subscriber_queue: usize,
    pub subscriber_write_timeout: Duration,
    pub max_frame_len: usize,
    pub shutdown_grace: Duration,
    pub origins: OriginPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, LISTEN_PORT)),
            log_file: PathBuf::from(LOG_FILE),
            baud_rate: BAUD_RATE,
            read_timeout: READ_TIMEOUT,
            retry_interval: RETRY_INTERVAL,
            subscriber_queue: SUBSCRIBER_QUEUE,
            subscriber_write_timeout: SUBSCRIBER_WRITE_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
            shutdown_grace: SHUTDOWN_GRACE,
            origins: OriginPolicy::localhost(LISTEN_PORT),
        }
    }
}

impl RelayConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let mut config = Self::default();
        if let Some(device) = &cli.device {
            config.device = device.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn device_defaults_per_platform() {
        let cli = Cli::try_parse_from(["pulsar-relay"]).expect("no args parse");
        let config = RelayConfig::from_cli(&cli);
        assert_eq!(config.device, DEFAULT_DEVICE);
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn positional_device_overrides_default() {
        let cli = Cli::try_parse_from(["pulsar-relay", "/dev/ttyACM1"]).expect("parse");
        assert_eq!(RelayConfig::from_cli(&cli).device, "/dev/ttyACM1");
    }

    #[test]
    fn flags_are_rejected() {
        assert!(Cli::try_parse_from(["pulsar-relay", "--baud", "9600"]).is_err());
        assert!(Cli::try_parse_from(["pulsar-relay", "a", "b"]).is_err());
    }
}
