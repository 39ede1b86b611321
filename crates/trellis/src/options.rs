//! Startup options.
//!
//! Everything process-wide (base id, restart epoch, service identity) comes
//! in through this record and is passed down explicitly; nothing reads flags
//! from ambient globals after startup.

use std::time::Duration;

use clap::Parser;
use trellis_core::dns::IpFamily;

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Validate configs and then serve traffic normally.
    Serve,
    /// Validate configs and exit.
    Validate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum IpVersion {
    V4,
    V6,
}

impl From<IpVersion> for IpFamily {
    fn from(version: IpVersion) -> IpFamily {
        match version {
            IpVersion::V4 => IpFamily::V4,
            IpVersion::V6 => IpFamily::V6,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "trellis", about = "trellis L7 proxy")]
pub struct Options {
    /// Base ID so that multiple instances can run on the same host if
    /// needed. Scaled by 10 internally to leave spread for sockets.
    #[arg(long, default_value_t = 0)]
    base_id: u64,

    /// Number of worker threads to run.
    #[arg(long, default_value_t = default_concurrency())]
    pub concurrency: usize,

    /// Path to the configuration file.
    #[arg(short, long, default_value = "")]
    pub config_path: String,

    /// Path to the bootstrap file. Takes precedence over --config-path.
    #[arg(short, long, default_value = "")]
    pub bootstrap_path: String,

    /// Path the admin address is written to.
    #[arg(long, default_value = "")]
    pub admin_address_path: String,

    /// The local IP address version.
    #[arg(long, value_enum, default_value_t = IpVersion::V4)]
    pub local_address_ip_version: IpVersion,

    /// Log level: trace, debug, info, warn, error, or off.
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Hot restart epoch number.
    #[arg(long, default_value_t = 0)]
    pub restart_epoch: u64,

    /// Print the hot restart compatibility version and exit.
    #[arg(long, default_value_t = false)]
    pub hot_restart_version: bool,

    /// Cluster name this instance runs in.
    #[arg(long, default_value = "")]
    pub service_cluster: String,

    /// Node name of this instance.
    #[arg(long, default_value = "")]
    pub service_node: String,

    /// Zone name of this instance.
    #[arg(long, default_value = "")]
    pub service_zone: String,

    /// Interval for access log flushing, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    file_flush_interval_msec: u64,

    /// Hot restart drain time, in seconds.
    #[arg(long, default_value_t = 600)]
    drain_time_s: u64,

    /// Hot restart parent shutdown time, in seconds.
    #[arg(long, default_value_t = 900)]
    parent_shutdown_time_s: u64,

    #[arg(long, value_enum, default_value_t = Mode::Serve)]
    pub mode: Mode,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Options {
    /// The user's base id scaled for socket spread.
    pub fn base_id(&self) -> u64 {
        self.base_id * 10
    }

    pub fn file_flush_interval(&self) -> Duration {
        Duration::from_millis(self.file_flush_interval_msec)
    }

    pub fn drain_time(&self) -> Duration {
        Duration::from_secs(self.drain_time_s)
    }

    pub fn parent_shutdown_time(&self) -> Duration {
        Duration::from_secs(self.parent_shutdown_time_s)
    }

    /// The bootstrap file to load, preferring --bootstrap-path.
    pub fn bootstrap_file(&self) -> Option<&str> {
        if !self.bootstrap_path.is_empty() {
            return Some(&self.bootstrap_path);
        }
        if !self.config_path.is_empty() {
            return Some(&self.config_path);
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::try_parse_from(["trellis"]).unwrap();
        assert_eq!(options.mode, Mode::Serve);
        assert_eq!(options.base_id(), 0);
        assert_eq!(options.local_address_ip_version, IpVersion::V4);
        assert_eq!(options.drain_time(), Duration::from_secs(600));
        assert_eq!(options.parent_shutdown_time(), Duration::from_secs(900));
        assert!(options.bootstrap_file().is_none());
    }

    #[test]
    fn test_base_id_scaling() {
        let options = Options::try_parse_from(["trellis", "--base-id", "3"]).unwrap();
        assert_eq!(options.base_id(), 30);
    }

    #[test]
    fn test_bootstrap_path_precedence() {
        let options = Options::try_parse_from([
            "trellis",
            "--config-path",
            "/etc/old.json",
            "--bootstrap-path",
            "/etc/boot.json",
        ])
        .unwrap();
        assert_eq!(options.bootstrap_file(), Some("/etc/boot.json"));
    }

    #[test]
    fn test_validate_mode() {
        let options =
            Options::try_parse_from(["trellis", "--mode", "validate", "-c", "/etc/t.json"])
                .unwrap();
        assert_eq!(options.mode, Mode::Validate);
        assert_eq!(options.bootstrap_file(), Some("/etc/t.json"));
    }

    #[test]
    fn test_bad_mode_is_an_error() {
        assert!(Options::try_parse_from(["trellis", "--mode", "dance"]).is_err());
        assert!(
            Options::try_parse_from(["trellis", "--local-address-ip-version", "v5"]).is_err()
        );
    }
}
