use crate::blacklist::{BlockedNet, GITHUB_META_URL};
use crate::error::ClajsError;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "clajs")]
#[command(about = "CLaJ rendezvous-and-relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "CLAJS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "CLAJS_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Do not start the metrics endpoint.
    #[arg(long)]
    pub no_metrics: bool,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "CLAJS_MAX_CONNS")]
    pub max_conns: usize,
    /// Packets a connection may send per spam window before it is kicked.
    #[arg(long, default_value = "300", env = "CLAJS_SPAM_LIMIT")]
    pub spam_limit: u32,
    /// Spam window in milliseconds.
    #[arg(long, default_value = "3000", env = "CLAJS_SPAM_WINDOW_MS")]
    pub spam_window_ms: u64,
    /// Minimum milliseconds between two spam pardons for the same host.
    #[arg(long, default_value = "60000", env = "CLAJS_HOST_GRACE_MS")]
    pub host_grace_ms: u64,
    /// Maximum frame body size in bytes.
    #[arg(long, default_value = "65535", env = "CLAJS_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "10", env = "CLAJS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Seconds without inbound traffic before a connection is dropped.
    #[arg(long, default_value = "30", env = "CLAJS_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// URL of the GitHub meta document whose Actions ranges are blocked.
    #[arg(long, default_value = GITHUB_META_URL, env = "CLAJS_BLACKLIST_URL")]
    pub blacklist_url: String,
    /// Do not fetch the remote blacklist.
    #[arg(long)]
    pub no_blacklist: bool,
    /// Seconds between blacklist refreshes; 0 refreshes only at startup.
    #[arg(long, default_value = "0", env = "CLAJS_BLACKLIST_REFRESH")]
    pub blacklist_refresh: u64,
    /// Extra address or CIDR range to block (repeatable).
    #[arg(long = "block", value_name = "CIDR")]
    pub block: Vec<String>,
    /// Increase log verbosity (-v debug, -vv trace). Ignored when RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint, if enabled.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Packets allowed per spam window.
    pub spam_limit: u32,
    /// Spam window in milliseconds.
    pub spam_window_ms: u64,
    /// Host spam grace interval in milliseconds.
    pub host_grace_ms: u64,
    /// Maximum frame body size in bytes.
    pub max_payload: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Idle timeout in seconds.
    pub idle_timeout: u64,
    /// Remote blacklist source, if enabled.
    pub blacklist_url: Option<String>,
    /// Seconds between blacklist refreshes; 0 = startup only.
    pub blacklist_refresh: u64,
    /// Static blacklist entries.
    pub block: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: None,
            max_conns: 10_000,
            spam_limit: 300,
            spam_window_ms: 3_000,
            host_grace_ms: 60_000,
            max_payload: 65_535,
            ping_interval: 10,
            idle_timeout: 30,
            blacklist_url: None,
            blacklist_refresh: 0,
            block: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.spam_limit == 0 {
            return Err("spam_limit must be greater than 0".to_string());
        }
        if self.spam_limit > 1_000_000 {
            return Err("spam_limit exceeds reasonable limit (1,000,000)".to_string());
        }
        if self.spam_window_ms == 0 {
            return Err("spam_window_ms must be greater than 0".to_string());
        }
        if self.spam_window_ms > 3_600_000 {
            return Err("spam_window_ms exceeds reasonable limit (1 hour)".to_string());
        }
        if self.host_grace_ms > 86_400_000 {
            return Err("host_grace_ms exceeds reasonable limit (1 day)".to_string());
        }

        // Must not exceed frame parsing limits
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > claj_common::frame::MAX_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                claj_common::frame::MAX_PAYLOAD
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout must not be shorter than ping_interval".to_string());
        }

        if self.blacklist_refresh != 0 && self.blacklist_refresh < 60 {
            return Err("blacklist_refresh must be 0 or at least 60 seconds".to_string());
        }
        if let Some(url) = &self.blacklist_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err("blacklist_url must be an http(s) URL".to_string());
            }
        }
        if let Err(e) = self.blocked_nets() {
            return Err(format!("block: {e}"));
        }
        Ok(())
    }

    /// Rate window as a duration.
    #[must_use]
    pub fn spam_window(&self) -> Duration {
        Duration::from_millis(self.spam_window_ms)
    }

    /// Host grace interval as a duration.
    #[must_use]
    pub fn host_grace(&self) -> Duration {
        Duration::from_millis(self.host_grace_ms)
    }

    /// Parse the static blacklist entries.
    ///
    /// # Errors
    ///
    /// Returns the first entry that is neither an address nor a CIDR range.
    pub fn blocked_nets(&self) -> Result<Vec<BlockedNet>, ClajsError> {
        self.block.iter().map(|entry| entry.parse()).collect()
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: (!args.no_metrics).then_some(args.metrics_addr),
            max_conns: args.max_conns,
            spam_limit: args.spam_limit,
            spam_window_ms: args.spam_window_ms,
            host_grace_ms: args.host_grace_ms,
            max_payload: args.max_payload,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            blacklist_url: (!args.no_blacklist).then_some(args.blacklist_url),
            blacklist_refresh: args.blacklist_refresh,
            block: args.block,
        }
    }
}
