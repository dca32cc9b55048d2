use crate::config::FetchConfig;
use crate::feed::sanitize::clean_html_bytes;
use crate::util::UrlValidationError;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving a feed or post page.
///
/// Callers decide what to do with a failure through [`FetchError::is_unreachable`]:
/// an unreachable feed is bad input (reject it), everything else is transient
/// (log it, try again next cycle).
#[derive(Debug, Error)]
pub enum FetchError {
    /// URL rejected before any request was made
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(reqwest::Error),
    /// HTTP response with a status we can't use
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e)
        }
    }
}

impl FetchError {
    /// True when retrying later cannot help: the URL is malformed or the
    /// server answered with a client error or a status we don't understand.
    pub fn is_unreachable(&self) -> bool {
        match self {
            FetchError::InvalidUrl(_) => true,
            FetchError::HttpStatus(status) => {
                let status = *status;
                status != 408 && status != 429 && !(500..600).contains(&status)
            }
            FetchError::Network(e) => e.is_builder() || e.is_redirect(),
            FetchError::Timeout
            | FetchError::RateLimited(_)
            | FetchError::ResponseTooLarge
            | FetchError::IncompleteResponse { .. } => false,
        }
    }
}

/// Conditional GET input: the feed URL plus the validators stored from the
/// previous successful fetch. Empty validators are not sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRequest<'a> {
    pub url: &'a str,
    pub etag: &'a str,
    pub last_modified: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResponse {
    /// `304 Not Modified`: nothing to parse
    NotModified { etag: String, last_modified: String },
    /// New content and the validators to store with it (empty if absent)
    Fetched {
        body: Vec<u8>,
        etag: String,
        last_modified: String,
    },
}

/// HTTP client for feeds and post pages.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl FeedFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
        })
    }

    /// Fetch a feed document, conditionally if validators are known.
    pub async fn fetch_feed(&self, request: &FeedRequest<'_>) -> Result<FeedResponse, FetchError> {
        tracing::debug!(
            url = %request.url,
            conditional = !request.etag.is_empty() || !request.last_modified.is_empty(),
            "Fetching feed"
        );

        match self
            .get(request.url, request.etag, request.last_modified)
            .await?
        {
            RawResponse::NotModified(v) => Ok(FeedResponse::NotModified {
                etag: v.etag,
                last_modified: v.last_modified,
            }),
            RawResponse::Body(body, v) => Ok(FeedResponse::Fetched {
                body,
                etag: v.etag,
                last_modified: v.last_modified,
            }),
        }
    }

    /// Fetch a post's own page and return its text content.
    ///
    /// Used when a feed entry carries no body. No conditional headers.
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        tracing::debug!(url = %url, "Fetching page");

        match self.get(url, "", "").await? {
            RawResponse::Body(body, _) => Ok(clean_html_bytes(&body)),
            RawResponse::NotModified(_) => Err(FetchError::HttpStatus(304)),
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.retry_base_delay.saturating_mul(2u32.saturating_pow(retry))
    }

    async fn get(
        &self,
        url: &str,
        etag: &str,
        last_modified: &str,
    ) -> Result<RawResponse, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url);
            if !etag.is_empty() {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if !last_modified.is_empty() {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            let response = request.send().await?;
            let status = response.status();

            // Rate limiting and server errors back off exponentially
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(self.max_retries)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable response, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            let validators = Validators::from_headers(response.headers());

            if status == StatusCode::NOT_MODIFIED {
                return Ok(RawResponse::NotModified(validators));
            }

            // 4xx and anything else unexpected fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, MAX_BODY_SIZE).await {
                Ok(body) => return Ok(RawResponse::Body(body, validators)),
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < self.max_retries =>
                {
                    let delay = self.backoff(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum RawResponse {
    NotModified(Validators),
    Body(Vec<u8>, Validators),
}

/// Cache validators as the server sent them; absent headers become "".
struct Validators {
    etag: String,
    last_modified: String,
}

impl Validators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: HeaderName| {
            headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default()
        };
        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{any, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test</title>
    <item><title>Test</title><link>https://example.com/1</link></item>
</channel></rss>"#;

    fn fetcher() -> FeedFetcher {
        FeedFetcher::new(&FetchConfig {
            retry_base_delay_ms: 1,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    fn request(url: &str) -> FeedRequest<'_> {
        FeedRequest {
            url,
            ..FeedRequest::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v2\"")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 00:00:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let response = fetcher().fetch_feed(&request(&url)).await.unwrap();
        assert_eq!(
            response,
            FeedResponse::Fetched {
                body: VALID_RSS.as_bytes().to_vec(),
                etag: "\"v2\"".to_string(),
                last_modified: "Tue, 02 Jan 2024 00:00:00 GMT".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_validators_are_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().fetch_feed(&request(&url)).await.unwrap() {
            FeedResponse::Fetched {
                etag,
                last_modified,
                ..
            } => {
                assert_eq!(etag, "");
                assert_eq!(last_modified, "");
            }
            other => panic!("Expected Fetched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_headers_sent_when_validators_known() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304).insert_header("ETag", "\"v1\""))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let response = fetcher()
            .fetch_feed(&FeedRequest {
                url: &url,
                etag: "\"v1\"",
                last_modified: "Mon, 01 Jan 2024 00:00:00 GMT",
            })
            .await
            .unwrap();

        assert_eq!(
            response,
            FeedResponse::NotModified {
                etag: "\"v1\"".to_string(),
                last_modified: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_no_conditional_headers_without_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        fetcher().fetch_feed(&request(&url)).await.unwrap();

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("if-none-match").is_none());
        assert!(received[0].headers.get("if-modified-since").is_none());
    }

    #[tokio::test]
    async fn test_only_nonempty_validator_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        fetcher()
            .fetch_feed(&FeedRequest {
                url: &url,
                etag: "\"only-etag\"",
                last_modified: "",
            })
            .await
            .unwrap();

        let received = mock_server.received_requests().await.unwrap();
        assert!(received[0].headers.get("if-none-match").is_some());
        assert!(received[0].headers.get("if-modified-since").is_none());
    }

    #[tokio::test]
    async fn test_404_is_unreachable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher().fetch_feed(&request(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_500_retries_then_fails_transiently() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher().fetch_feed(&request(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(500)));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let response = fetcher().fetch_feed(&request(&url)).await.unwrap();
        assert!(matches!(response, FeedResponse::Fetched { .. }));
    }

    #[tokio::test]
    async fn test_429_exhausts_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher().fetch_feed(&request(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited(3)));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_oversize_body_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; MAX_BODY_SIZE + 1]))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher().fetch_feed(&request(&url)).await.unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Port 1 is reserved (tcpmux) and nothing listens there in CI
        let err = fetcher()
            .fetch_feed(&request("http://127.0.0.1:1/feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_fetch_page_returns_clean_text() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>x</title></head><body><nav>menu</nav><p>Post body</p></body></html>",
            ))
            .mount(&mock_server)
            .await;

        let url = format!("{}/post", mock_server.uri());
        let text = fetcher().fetch_page(&url).await.unwrap();
        assert_eq!(text, "Post body");
    }
}
