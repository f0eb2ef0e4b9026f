//! REST bootstrap response types.

use serde::Deserialize;

/// Response of the gateway bootstrap endpoint.
#[derive(Debug, Deserialize)]
pub struct GatewayBot {
    /// websocket gateway url to connect to
    pub url: String,
    /// recommended shard count for this credential
    #[serde(default)]
    pub shards: Option<u32>,
    /// identify allotment of this credential
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

/// Identify allotment, resets on a fixed external schedule.
#[derive(Debug, Deserialize)]
pub struct SessionStartLimit {
    /// total identifies per window
    pub total: u64,
    /// identifies left in the current window
    pub remaining: u64,
    /// milliseconds until the allotment resets
    pub reset_after: u64,
}
