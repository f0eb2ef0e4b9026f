use std::time::Duration;

use snafu::prelude::*;

/// API Error
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(variant), context(suffix(false)))]
pub enum Error {
    /// token is invalid (contains characters that cannot go in an HTTP header)
    #[snafu(display("token is not a valid header value"))]
    TokenInvalid,

    /// create HTTP client failed
    #[snafu(display("create api client failed: {source}"))]
    ClientCreateFailed {
        /// source error
        source: reqwest::Error,
    },

    /// send api request failed
    #[snafu(display("request url {url} failed: {source}"))]
    RequestFailed {
        /// target url
        url: String,
        /// source http error
        source: reqwest::Error,
    },

    /// the credential was rejected
    #[snafu(display("authentication rejected by url {url}"))]
    Unauthorized {
        /// request url
        url: String,
    },

    /// http response of api request is not OK(200)
    #[snafu(display("url {url} got http status code {status_code}"))]
    HTTPStatusNotOK {
        /// request url
        url: String,
        /// received http status code
        status_code: reqwest::StatusCode,
    },

    /// parse response body of api request as target json type failed
    #[snafu(display("parse response body {body:?} failed: {source}"))]
    ParseBodyFailed {
        /// http response body
        body: bytes::Bytes,
        /// source parse error
        source: serde_json::Error,
    },

    /// no identify sessions left for this credential
    #[snafu(display("no sessions remaining, allotment resets after {resets_after:?}"))]
    SessionLimit {
        /// time until the allotment resets
        resets_after: Duration,
    },
}
