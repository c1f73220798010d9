//! Client configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::cli::CliArgs;
use super::tls_config::TlsConfig;

/// Minimum spacing between periodic acks
pub const MIN_ACK_INTERVAL: Duration = Duration::from_millis(100);

/// Server address as `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServerLocation {
    pub host: String,
    pub port: u16,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint name used as registry key
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerLocation {
    type Err = String;

    /// Accepts `host:port`; the host is lower-cased so that the same server
    /// always maps to the same endpoint name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid server address '{}': expected host:port", s))?;
        if host.is_empty() {
            return Err(format!("Invalid server address '{}': empty host", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("Invalid port in server address '{}'", s))?;
        Ok(Self::new(host.to_ascii_lowercase(), port))
    }
}

/// Username/password sent with the user-credential request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Complete client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Servers
    pub servers: Vec<ServerLocation>,
    pub shuffle_endpoints: bool,
    pub client_id: String,

    // Connections
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsConfig>,

    // Subscription queues
    pub subscription_enabled: bool,
    /// -1 keeps a queue on every available server
    pub redundancy_level: i32,
    pub redundancy_monitor_interval: Duration,
    pub ack_interval: Duration,
    pub duplicate_check_lifetime: Duration,
    pub is_durable: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            shuffle_endpoints: true,
            client_id: format!("ha-client-{}", std::process::id()),
            max_connections: 16,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            credentials: None,
            tls: None,
            subscription_enabled: true,
            redundancy_level: 0,
            redundancy_monitor_interval: Duration::from_secs(10),
            ack_interval: MIN_ACK_INTERVAL,
            duplicate_check_lifetime: Duration::from_secs(900),
            is_durable: false,
        }
    }
}

impl ClientConfig {
    /// Build configuration from parsed CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        let servers = args
            .servers
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<ServerLocation>, String>>()?;

        let credentials = match (&args.username, &args.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            _ => return Err("--user and --password must be given together".to_string()),
        };

        let tls = if args.tls {
            Some(TlsConfig {
                skip_verify: args.tls_skip_verify,
                ca_cert: args.tls_ca_cert.clone(),
                client_cert: args.tls_cert.clone(),
                client_key: args.tls_key.clone(),
                sni: args.tls_sni.clone(),
            })
        } else {
            None
        };

        let config = Self {
            servers,
            shuffle_endpoints: !args.no_shuffle,
            client_id: args
                .client_id
                .clone()
                .unwrap_or_else(|| ClientConfig::default().client_id),
            max_connections: args.max_connections,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            ping_interval: Duration::from_millis(args.ping_interval_ms),
            credentials,
            tls,
            subscription_enabled: !args.no_subscription,
            redundancy_level: args.redundancy,
            redundancy_monitor_interval: Duration::from_millis(args.redundancy_monitor_ms),
            ack_interval: Duration::from_millis(args.ack_interval_ms),
            duplicate_check_lifetime: Duration::from_secs(args.dup_lifetime_secs),
            is_durable: args.durable,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.redundancy_level < -1 {
            return Err(format!(
                "Redundancy level must be -1 or greater, got {}",
                self.redundancy_level
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be positive".to_string());
        }
        if self.read_timeout.is_zero() {
            return Err("Read timeout must be positive".to_string());
        }
        if self.ping_interval.is_zero() || self.redundancy_monitor_interval.is_zero() {
            return Err("Background task intervals must be positive".to_string());
        }
        if self.is_durable && !self.subscription_enabled {
            return Err("A durable client needs subscriptions enabled".to_string());
        }
        if let Some(ref tls) = self.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err("TLS client certificate and key must be given together".to_string());
            }
        }
        Ok(())
    }

    /// HA bookkeeping (acks, acked-only expiry) is on for redundant or
    /// durable subscriptions
    pub fn ha_enabled(&self) -> bool {
        self.redundancy_level > 0 || self.is_durable
    }

    /// Ack interval clamped to the protocol minimum
    pub fn effective_ack_interval(&self) -> Duration {
        self.ack_interval.max(MIN_ACK_INTERVAL)
    }
}
