//! HTTP fetching with HTML-to-Markdown conversion.
//!
//! Used by site loads: a page is fetched, converted to markdown, and then
//! indexed like any local markdown file. The conversion itself is an opaque
//! string transform.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("docdex/", env!("CARGO_PKG_VERSION"));

/// Abstracts URL fetching so site loads are testable without a network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a URL and convert the response body to markdown.
    async fn fetch_as_markdown(&self, url: &str) -> Result<String>;
}

/// Production [`Fetcher`] using real HTTP requests.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_as_markdown(&self, url: &str) -> Result<String> {
        reqwest::Url::parse(url).context("parse URL")?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .context("fetch URL")?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {}", status);
        }

        let body = response.text().await.context("read body")?;

        htmd::convert(&body).map_err(|e| anyhow::anyhow!("convert to markdown: {}", e))
    }
}
