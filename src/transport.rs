//! HTTP transport seam between the GitHub client and the network.
//!
//! The client only needs "GET this route, give me status, rate-limit headers
//! and body". Production uses octocrab; tests plug in an in-memory fake.

use crate::error::ApiError;
use async_trait::async_trait;
use octocrab::Octocrab;

/// Rate-limit and retry headers GitHub attaches to responses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `x-ratelimit-remaining`
    pub remaining: Option<u64>,
    /// `x-ratelimit-reset`, seconds since the Unix epoch.
    pub reset_epoch: Option<i64>,
    /// `retry-after`, seconds.
    pub retry_after: Option<u64>,
}

/// A response with its body already read.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub rate_limit: RateLimitHeaders,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            rate_limit: RateLimitHeaders::default(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues one GET for a route relative to the API root (e.g. `/repos/o/r`).
    ///
    /// Non-2xx statuses are returned as responses; only failures to get a
    /// response at all are errors.
    async fn get(&self, route: &str) -> Result<RawResponse, ApiError>;
}

/// Transport backed by an [`Octocrab`] instance.
pub struct OctocrabTransport {
    octocrab: Octocrab,
}

impl OctocrabTransport {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let mut builder = Octocrab::builder()
            .base_uri(base_url)
            .map_err(|e| ApiError::Unexpected {
                status: 0,
                message: format!("invalid GitHub API url '{base_url}': {e}"),
            })?;
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }

        let octocrab = builder.build().map_err(|e| ApiError::Unexpected {
            status: 0,
            message: format!("failed to build GitHub client: {e}"),
        })?;

        Ok(Self { octocrab })
    }
}

#[async_trait]
impl Transport for OctocrabTransport {
    async fn get(&self, route: &str) -> Result<RawResponse, ApiError> {
        let response = self
            .octocrab
            ._get(route)
            .await
            .map_err(|e| ApiError::TransientNetwork {
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let rate_limit = {
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse().ok())
            };
            RateLimitHeaders {
                remaining: header("x-ratelimit-remaining"),
                reset_epoch: header("x-ratelimit-reset").map(|v: u64| v as i64),
                retry_after: header("retry-after"),
            }
        };

        let body = self
            .octocrab
            .body_to_string(response)
            .await
            .map_err(|e| ApiError::TransientNetwork {
                message: e.to_string(),
            })?;

        Ok(RawResponse {
            status,
            rate_limit,
            body,
        })
    }
}
