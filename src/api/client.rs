use std::{sync::Mutex, time::Duration};

use reqwest::StatusCode;
use snafu::prelude::*;

use super::error::variant::*;
use super::types::*;
use super::Result;
use crate::config::AccountKind;

static BASE_URL: &str = "https://discord.com/api/v9";

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// REST client for the gateway bootstrap call.
///
/// The url from a fresh bootstrap is cached; resumes reuse it without
/// another round-trip.
#[derive(Debug)]
pub struct Client {
    client: reqwest::Client,
    cached_url: Mutex<Option<String>>,
}

impl Client {
    /// Create a new api client for the given credential kind.
    pub fn new<S: AsRef<str> + ?Sized>(token: &S, kind: AccountKind) -> Result<Self> {
        let token = token.as_ref();
        let header_value = match kind {
            AccountKind::Bot => format!("Bot {}", token),
            AccountKind::User => token.to_string(),
        };
        let auth_header_value = header_value.parse().map_err(|_| TokenInvalid.build())?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, auth_header_value);

        let client = reqwest::Client::builder()
            .gzip(true)
            .deflate(true)
            .user_agent(APP_USER_AGENT)
            .default_headers(headers)
            .build()
            .context(ClientCreateFailed)?;

        Ok(Self {
            client,
            cached_url: Mutex::new(None),
        })
    }

    /// Resolve the gateway url.
    ///
    /// A fresh session always performs the bootstrap request, which also
    /// checks the identify allotment: an exhausted allotment surfaces as the
    /// distinguishable [`Error::SessionLimit`](super::Error::SessionLimit)
    /// carrying the reset time. Resumes get the cached url when one exists.
    pub async fn get_gateway(&self, fresh: bool) -> Result<String> {
        if !fresh {
            if let Some(url) = self.cached_url.lock().unwrap().clone() {
                log::debug!("Reuse cached gateway url for resume");
                return Ok(url);
            }
        }

        let url = format!("{}/gateway/bot", BASE_URL);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|_| RequestFailed { url: &url })?;

        ensure!(
            resp.status() != StatusCode::UNAUTHORIZED,
            Unauthorized { url: &url }
        );

        ensure!(
            resp.status() == StatusCode::OK,
            HTTPStatusNotOK {
                url: &url,
                status_code: resp.status()
            }
        );

        let body = resp
            .bytes()
            .await
            .with_context(|_| RequestFailed { url: &url })?;

        let data: GatewayBot =
            serde_json::from_slice(&body).with_context(|_| ParseBodyFailed { body })?;

        if let Some(ref limit) = data.session_start_limit {
            log::debug!(
                "Session allotment: {}/{} remaining",
                limit.remaining,
                limit.total
            );

            ensure!(
                limit.remaining > 0,
                SessionLimit {
                    resets_after: Duration::from_millis(limit.reset_after)
                }
            );
        }

        self.cached_url
            .lock()
            .unwrap()
            .replace(data.url.clone());

        Ok(data.url)
    }
}
