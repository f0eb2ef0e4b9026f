//! Terminal gateway errors.

use std::time::Duration;

use snafu::prelude::*;

/// framework result type
pub type Result<T> = std::result::Result<T, Error>;

/// Unrecoverable error that permanently stops a connection.
///
/// Everything transient (socket drops, timeouts, decode failures) is handled
/// inside the reconnect loop and never surfaces here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// a second concurrent run was attempted on the same connection
    #[snafu(display("the gateway connection is already running"))]
    AlreadyRunning,

    /// create the REST bootstrap client failed
    #[snafu(display("create api client failed: {source}"))]
    CallAPIFailed {
        /// source error
        source: crate::api::Error,
    },

    /// the credential was rejected by the REST bootstrap
    #[snafu(display("authentication rejected, the token is invalid"))]
    AuthenticationFailed,

    /// the identify allotment of the credential is exhausted; retrying
    /// cannot succeed before the allotment resets
    #[snafu(display("no sessions remaining, allotment resets after {resets_after:?}"))]
    SessionLimit {
        /// time until the allotment resets
        resets_after: Duration,
    },

    /// the server closed the connection with an unrecoverable close code
    #[snafu(display("close code {code} ({reason}) is unrecoverable"))]
    FatalClose {
        /// numeric close code
        code: u16,
        /// close reason text
        reason: String,
    },
}
