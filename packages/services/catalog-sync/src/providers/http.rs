use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::config::Config;
use crate::models::*;
use crate::resilience::{with_retry, RetryPolicy};

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Header { name: String, value: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub body: Value,
    pub headers: HeaderMap,
}

impl FetchedJson {
    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }
}

/// GET-with-JSON client shared by the platform adapters. Every request goes through the retry helper.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(timeout_ms: u64, user_agent: &str, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, policy })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(cfg.http_timeout_ms, &cfg.http_user_agent, cfg.http_retry_policy())
    }

    pub async fn get_json(&self, url: &str, auth: &Auth) -> Result<FetchedJson> {
        with_retry(&self.policy, "http_get", || self.get_once(url, auth)).await
    }

    async fn get_once(&self, url: &str, auth: &Auth) -> Result<FetchedJson> {
        let mut request_builder = self.client.get(url).header(ACCEPT, "application/json");
        request_builder = match auth {
            Auth::None => request_builder,
            Auth::Header { name, value } => request_builder.header(name.as_str(), value.as_str()),
            Auth::Basic { username, password } => request_builder.basic_auth(username, Some(password)),
        };

        tracing::debug!(url = url, "Sending catalog request");
        let response = request_builder.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::RateLimited {
                retry_after,
                message: format!("{} throttled: {}", url, truncate(&body, 200)),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CatalogError::AuthRejected(format!("{} ({})", url, status.as_u16())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate(&body, 500),
            });
        }

        let headers = response.headers().clone();
        let body: Value = response.json().await?;
        Ok(FetchedJson { body, headers })
    }
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values and
/// values too large for a `Duration` are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
