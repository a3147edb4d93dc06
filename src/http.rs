//! HTTP client with rate limiting for the accounts service and Web API.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting to stay well below the Web API quota
//! * Consistent timeouts and headers
//! * Helpers for bearer-authenticated JSON and form-encoded requests
//!
//! # Example
//!
//! ```rust
//! use booster::http::Client;
//!
//! let client = Client::new(&config)?;
//! let request = client.get(url)
//!     .bearer(credential.access_token())?;
//! let response = client.execute(request).await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Body, Method, Url,
};

use crate::{config::Config, error::Result};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Underlying client, only reached through the rate limiter.
    unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

/// A request under construction.
#[derive(Debug)]
pub struct Request(reqwest::Request);

impl Client {
    /// The API enforces a rolling window of 30 seconds.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(30);

    /// Maximum calls per interval. A background daemon needs a handful per
    /// hour, so this only guards against runaway loops.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 30;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a new client.
    ///
    /// Every request is bounded by `config.request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method and URL and an empty body.
    #[must_use]
    pub fn request(&self, method: Method, url: Url) -> Request {
        Request(reqwest::Request::new(method, url))
    }

    #[must_use]
    pub fn get(&self, url: Url) -> Request {
        self.request(Method::GET, url)
    }

    #[must_use]
    pub fn post(&self, url: Url) -> Request {
        self.request(Method::POST, url)
    }

    #[must_use]
    pub fn put(&self, url: Url) -> Request {
        self.request(Method::PUT, url)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent or times out. An
    /// unsuccessful status code is not an error at this level.
    pub fn execute(&self, request: Request) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(move |()| self.unlimited.execute(request.0).map_err(Into::into))
    }
}

impl Request {
    /// Adds an `Authorization: Bearer` header.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the token contains characters not allowed in a
    /// header value.
    pub fn bearer(mut self, token: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        self.0.headers_mut().insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// Sets a JSON body.
    pub fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self> {
        let body = serde_json::to_string(body)?;
        self.0
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *self.0.body_mut() = Some(Body::from(body));
        Ok(self)
    }

    /// Sets a `application/x-www-form-urlencoded` body.
    #[must_use]
    pub fn form<'a, I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.0.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        *self.0.body_mut() = Some(Body::from(body));
        self
    }

    /// Sets an empty body with an explicit zero length, as some endpoints
    /// reject bodiless `PUT` requests.
    #[must_use]
    pub fn empty(mut self) -> Self {
        *self.0.body_mut() = Some(Body::from(""));
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        self.0.url()
    }
}
