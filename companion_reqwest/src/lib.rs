//! Outbound HTTP plumbing shared by every network call the companion makes
//!
//! All traffic to the upstream platform goes through a
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) built by
//! [`build_client()`]. The client applies a per-request timeout, optionally
//! routes through a proxy, and includes a [`RetryMiddleware`] which retries
//! requests that fail in transit.
//!
//! Only transport failures are retried. A response with an error status is
//! still a response, and is handed back to the caller untouched so that the
//! caller can decide what a rejection means.
//!
//! ```
//! use companion_reqwest::{build_client, NetworkConfig};
//! use std::time::Duration;
//!
//! let config = NetworkConfig::default()
//!     .with_timeout(Duration::from_secs(5))
//!     .with_proxy("http://127.0.0.1:3128");
//!
//! let client = build_client(&config).unwrap();
//!
//! let req = client.head("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! ```
//!
//! The retry middleware can also be used on its own when composing a
//! custom middleware stack.
//!
//! ```
//! use companion_reqwest::{backoff::ErrorBackoffConfig, RetryMiddleware};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(RetryMiddleware::new(ErrorBackoffConfig::default()))
//!     .build();
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::time::Duration;

use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next, Result};

pub mod backoff;

use backoff::{ErrorBackoffConfig, ErrorBackoffHandler};

/// The user agent presented to the upstream platform by default
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Network settings for outbound requests
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    timeout: Duration,
    proxy: Option<String>,
    user_agent: String,
    backoff: ErrorBackoffConfig,
}

impl Default for NetworkConfig {
    /// Default network configuration
    ///
    /// Requests time out after 10 seconds, are not proxied, and are retried
    /// according to [`ErrorBackoffConfig::default()`].
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Sets the timeout applied to each individual request attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Routes all requests through the given proxy URL
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Routes requests through the given proxy URL, if any
    pub fn with_optional_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the user agent sent with each request
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the retry policy for requests that fail in transit
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The timeout applied to each request attempt
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The proxy requests are routed through, if any
    #[inline]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// The user agent sent with each request
    #[inline]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Builds a client that applies the timeout, proxy and retry policy of `config`
pub fn build_client(
    config: &NetworkConfig,
) -> std::result::Result<ClientWithMiddleware, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(config.user_agent.as_str());

    if let Some(proxy) = &config.proxy {
        tracing::debug!(proxy = %proxy, "routing outbound requests through proxy");
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }

    let client = builder.build()?;

    Ok(ClientBuilder::new(client)
        .with(RetryMiddleware::new(config.backoff.clone()))
        .build())
}

/// A middleware that retries requests which fail before a response is received
#[derive(Clone, Debug)]
pub struct RetryMiddleware {
    config: ErrorBackoffConfig,
}

impl RetryMiddleware {
    /// Constructs a new middleware with the given backoff policy
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut handler = ErrorBackoffHandler::new(self.config.clone());

        loop {
            // Streaming bodies cannot be replayed, so those get a single attempt
            let Some(attempt) = req.try_clone() else {
                return next.run(req, extensions).await;
            };

            match next.clone().run(attempt, extensions).await {
                Ok(resp) => {
                    handler.success();
                    return Ok(resp);
                }
                Err(error) => match handler.error() {
                    Some(delay) => {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            http.url = %req.url(),
                            attempt = handler.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "request failed in transit, will retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::debug!(
                            http.url = %req.url(),
                            attempts = handler.attempts(),
                            "request failed in transit, giving up"
                        );
                        return Err(error);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use reqwest::Client;

    use super::*;

    /// Fails in transit a fixed number of times before answering
    struct FlakyUpstream {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyUpstream {
        fn new(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Acquire)
        }
    }

    #[async_trait::async_trait]
    impl Middleware for FlakyUpstream {
        async fn handle(
            &self,
            _: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let call = self.calls.fetch_add(1, Ordering::AcqRel);
            if call < self.failures_before_success {
                Err(reqwest_middleware::Error::Middleware(anyhow::anyhow!(
                    "connection reset"
                )))
            } else {
                Ok(http::Response::<&[u8]>::default().into())
            }
        }
    }

    fn fast_backoff(max_attempts: u32) -> ErrorBackoffConfig {
        ErrorBackoffConfig::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2,
        )
    }

    fn client_with(
        upstream: Arc<FlakyUpstream>,
        backoff: ErrorBackoffConfig,
    ) -> ClientWithMiddleware {
        ClientBuilder::new(Client::default())
            .with(RetryMiddleware::new(backoff))
            .with_arc(upstream)
            .build()
    }

    mod when_upstream_recovers_within_budget {
        use super::*;

        #[tokio::test]
        async fn request_succeeds_after_retrying() {
            let upstream = Arc::new(FlakyUpstream::new(2));
            let client = client_with(upstream.clone(), fast_backoff(3));

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(upstream.calls(), 3);
        }
    }

    mod when_upstream_keeps_failing {
        use super::*;

        #[tokio::test]
        async fn error_is_returned_after_max_attempts() {
            let upstream = Arc::new(FlakyUpstream::new(10));
            let client = client_with(upstream.clone(), fast_backoff(3));

            let result = client.get("https://example.com").send().await;

            assert!(result.is_err());
            assert_eq!(upstream.calls(), 3);
        }

        #[tokio::test]
        async fn no_retry_config_makes_a_single_attempt() {
            let upstream = Arc::new(FlakyUpstream::new(10));
            let client = client_with(upstream.clone(), ErrorBackoffConfig::no_retry());

            let result = client.get("https://example.com").send().await;

            assert!(result.is_err());
            assert_eq!(upstream.calls(), 1);
        }
    }

    mod when_upstream_answers_immediately {
        use super::*;

        #[tokio::test]
        async fn request_is_sent_once() {
            let upstream = Arc::new(FlakyUpstream::new(0));
            let client = client_with(upstream.clone(), fast_backoff(3));

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(upstream.calls(), 1);
        }
    }

    mod network_config {
        use super::*;

        #[test]
        fn builds_client_with_proxy() {
            let config = NetworkConfig::default().with_proxy("http://127.0.0.1:8080");
            assert_eq!(config.proxy(), Some("http://127.0.0.1:8080"));
            assert!(build_client(&config).is_ok());
        }

        #[test]
        fn rejects_malformed_proxy() {
            let config = NetworkConfig::default().with_proxy("http://[::1");
            assert!(build_client(&config).is_err());
        }
    }
}
