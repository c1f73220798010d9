//! Command-line argument parsing for the `ha-probe` binary
//!
//! Arguments are grouped by category for clarity.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for topology snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Connects to a cache cluster, maintains the subscription queue topology
/// and reports it
#[derive(Parser, Debug, Clone)]
#[command(name = "ha-probe")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    // ===== Connection Options =====
    /// Cache server address host:port (repeat for several servers)
    #[arg(short = 's', long = "server", required = true, action = clap::ArgAction::Append)]
    pub servers: Vec<String>,

    /// Username for the user-credential exchange
    #[arg(long = "user")]
    pub username: Option<String>,

    /// Password for the user-credential exchange
    #[arg(short = 'a', long = "password")]
    pub password: Option<String>,

    /// Client id announced in every handshake
    #[arg(long = "client-id")]
    pub client_id: Option<String>,

    /// Maximum pooled operation connections per server (0 disables pooling)
    #[arg(long = "max-connections", default_value_t = 16)]
    pub max_connections: usize,

    /// Connect timeout in milliseconds
    #[arg(long = "connect-timeout-ms", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Read timeout in milliseconds
    #[arg(long = "read-timeout-ms", default_value_t = 10_000)]
    pub read_timeout_ms: u64,

    /// Interval between idle-endpoint pings in milliseconds
    #[arg(long = "ping-interval-ms", default_value_t = 10_000)]
    pub ping_interval_ms: u64,

    /// Keep the configured server order instead of starting at a random one
    #[arg(long = "no-shuffle")]
    pub no_shuffle: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long = "tls")]
    pub tls: bool,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// CA certificate file for TLS
    #[arg(long = "tls-ca-cert")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Client certificate file for TLS
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key file for TLS
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,

    /// Server Name Indication for TLS
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    // ===== Subscription Options =====
    /// Number of secondary queues to maintain (-1 = every available server)
    #[arg(short = 'r', long = "redundancy", default_value_t = 0, allow_hyphen_values = true)]
    pub redundancy: i32,

    /// Disable the subscription channel (request routing only)
    #[arg(long = "no-subscription")]
    pub no_subscription: bool,

    /// Durable client: server keeps the queue across disconnects
    #[arg(long = "durable")]
    pub durable: bool,

    /// Interval between redundancy checks in milliseconds
    #[arg(long = "redundancy-monitor-ms", default_value_t = 10_000)]
    pub redundancy_monitor_ms: u64,

    /// Interval between periodic acks in milliseconds (minimum 100)
    #[arg(long = "ack-interval-ms", default_value_t = 100)]
    pub ack_interval_ms: u64,

    /// Lifetime of duplicate-suppression entries in seconds
    #[arg(long = "dup-lifetime-secs", default_value_t = 900)]
    pub dup_lifetime_secs: u64,

    // ===== Output Options =====
    /// Seconds to keep the pool running before shutting down
    #[arg(long = "watch-secs", default_value_t = 0)]
    pub watch_secs: u64,

    /// Interval between topology reports in milliseconds
    #[arg(long = "report-interval-ms", default_value_t = 1_000)]
    pub report_interval_ms: u64,

    /// Keep the durable queue alive on the servers after exit
    #[arg(long = "keep-alive")]
    pub keep_alive: bool,

    /// Report format
    #[arg(long = "output", value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn test_minimal_args() {
        let args = CliArgs::try_parse_from(["ha-probe", "-s", "127.0.0.1:40404"]).unwrap();
        assert_eq!(args.servers, vec!["127.0.0.1:40404".to_string()]);
        assert_eq!(args.redundancy, 0);
        assert_eq!(args.output, OutputFormat::Text);
    }

    #[test]
    fn test_negative_redundancy() {
        let args = CliArgs::try_parse_from(["ha-probe", "-s", "h:1", "-r", "-1"]).unwrap();
        assert_eq!(args.redundancy, -1);
    }

    #[test]
    fn test_config_from_cli() {
        let args = CliArgs::try_parse_from([
            "ha-probe",
            "-s",
            "a:1",
            "-s",
            "b:2",
            "-r",
            "1",
            "--durable",
            "--ack-interval-ms",
            "250",
        ])
        .unwrap();
        let config = ClientConfig::from_cli(&args).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.redundancy_level, 1);
        assert!(config.is_durable);
        assert_eq!(config.ack_interval.as_millis(), 250);
    }

    #[test]
    fn test_credentials_must_pair() {
        let args = CliArgs::try_parse_from(["ha-probe", "-s", "a:1", "--user", "u"]).unwrap();
        assert!(ClientConfig::from_cli(&args).is_err());
    }

    #[test]
    fn test_server_required() {
        assert!(CliArgs::try_parse_from(["ha-probe"]).is_err());
    }
}
