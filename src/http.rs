//! Thin JSON client for the discovery HTTP endpoints.
//!
//! Every endpoint answers the same envelope: an integer `code`, an optional
//! `message` and an optional `data` payload. Transport errors surface as
//! [`Error::Transport`](crate::Error); code interpretation is left to the
//! callers, which know which non-OK codes are part of their protocol.

use crate::config::HttpConfig;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Reply envelope shared by all discovery endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct Reply<T> {
    /// Wire status code; `0` is success.
    pub code: i64,
    /// Human-readable detail, mostly on failures.
    #[serde(default)]
    #[allow(dead_code)]
    pub message: String,
    /// Payload, present on data-carrying successes and conflict replies.
    pub data: Option<T>,
}

/// HTTP client with the connection tuning the discovery protocol expects:
/// a short connect timeout, TCP keepalive, and no overall request deadline
/// so the server controls how long a poll is held open.
#[derive(Clone)]
pub(crate) struct Client {
    inner: reqwest::Client,
}

impl Client {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_keepalive(Some(config.keepalive()))
            .build()?;
        Ok(Self { inner })
    }

    /// GET `url` with repeated query pairs and decode the reply envelope.
    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Reply<T>> {
        let response = self.inner.get(url).query(query).send().await?;
        Ok(response.json().await?)
    }

    /// POST `url` as a form body and decode the reply envelope.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<Reply<T>> {
        let response = self.inner.post(url).form(form).send().await?;
        Ok(response.json().await?)
    }
}
