use std::time::Duration;

use anyhow::Context as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::config::HttpConfig;

/// Shared HTML client: non-2xx responses are errors, transient failures are retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpConfig,
}

#[derive(Debug)]
enum Attempt {
    Done(String),
    Retry(anyhow::Error),
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client, config })
    }

    pub async fn get_html(&self, url: &Url) -> anyhow::Result<String> {
        let mut attempt = 0_u32;
        loop {
            if !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
            match self.try_get(url).await? {
                Attempt::Done(body) => return Ok(body),
                Attempt::Retry(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        %url,
                        attempt,
                        max_retries = self.config.max_retries,
                        err = %format!("{err:#}"),
                        "request failed; retrying"
                    );
                    tokio::time::sleep(backoff_duration(attempt)).await;
                }
                Attempt::Retry(err) => return Err(err),
            }
        }
    }

    async fn try_get(&self, url: &Url) -> anyhow::Result<Attempt> {
        let response = match self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                return Ok(Attempt::Retry(
                    anyhow::Error::new(err).context(format!("GET {url}")),
                ));
            }
            Err(err) => return Err(err).with_context(|| format!("GET {url}")),
        };

        let status = response.status();
        if is_retryable(status) {
            return Ok(Attempt::Retry(anyhow::anyhow!("GET {url}: {status}")));
        }
        if !status.is_success() {
            anyhow::bail!("GET {url}: {status}");
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))?;
        Ok(Attempt::Done(body))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 500ms, 1s, 2s, ... capped at 30s.
pub fn backoff_duration(attempt: u32) -> Duration {
    let millis = 2u64
        .checked_pow(attempt)
        .map_or(u64::MAX, |factor| factor.saturating_mul(250));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}
