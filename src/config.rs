//! Client configuration.

use std::time::Duration;

use serde::Serialize;

/// Shard identity of one connection: a deterministic id/count pair
/// partitioning the workload across parallel gateway connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shard {
    /// this connection's shard id, `0 <= id < count`
    pub id: u32,
    /// total shard count
    pub count: u32,
}

/// How the credential authenticates, which also decides the startup flow:
/// bot sessions get a bulk guild burst plus member chunking, user sessions
/// do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    /// bot token
    Bot,
    /// user token
    User,
}

/// Identify connection properties sent in the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    /// operating system name
    #[serde(rename = "$os")]
    pub os: String,
    /// library name reported as browser
    #[serde(rename = "$browser")]
    pub browser: String,
    /// library name reported as device
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Timing knobs of the session machinery.
///
/// The defaults mirror the remote platform's observed behavior; change them
/// only with evidence.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    /// how long to wait for the server hello after connecting
    pub hello_timeout: Duration,
    /// initial bound for the first bulk-state dispatch after ready
    pub ready_first_bulk_wait: Duration,
    /// rolling silence window closing the bulk-state burst
    pub ready_silence_window: Duration,
    /// guilds per bulk member request
    pub member_request_batch: usize,
    /// fixed delay between failed reconnect attempts
    pub reconnect_delay: Duration,
    /// remote-declared window between two identify sends per credential
    pub identify_reset_after: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(6),
            ready_first_bulk_wait: Duration::from_secs(3),
            ready_silence_window: Duration::from_millis(3500),
            member_request_batch: 75,
            reconnect_delay: Duration::from_secs(10),
            identify_reset_after: Duration::from_secs(5),
        }
    }
}

/// Everything a connection needs to know up front.
#[derive(Debug, Clone)]
pub struct Config {
    /// credential used for the REST bootstrap and the handshakes
    pub token: String,
    /// kind of the credential
    pub account_kind: AccountKind,
    /// identify properties
    pub properties: ConnectionProperties,
    /// ask the server for compressed frames
    pub compress: bool,
    /// timing knobs
    pub tuning: Tuning,
}

impl Config {
    /// Configuration for a bot credential with default tuning.
    pub fn bot<S: Into<String>>(token: S) -> Self {
        Self::new(token, AccountKind::Bot)
    }

    /// Configuration for a user credential with default tuning.
    pub fn user<S: Into<String>>(token: S) -> Self {
        Self::new(token, AccountKind::User)
    }

    fn new<S: Into<String>>(token: S, account_kind: AccountKind) -> Self {
        Self {
            token: token.into(),
            account_kind,
            properties: ConnectionProperties::default(),
            compress: false,
            tuning: Tuning::default(),
        }
    }
}
