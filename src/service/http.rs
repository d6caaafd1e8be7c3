//! Thin HTTP helper shared by the service adapters

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;

/// Repository service API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unparsable response: {0}")]
    Parse(serde_json::Error),

    #[error("invalid base url: {0}")]
    InvalidUrl(String),

    #[error("missing {0} in response")]
    MissingField(&'static str),
}

impl ApiError {
    /// HTTP status of the failed call, when there was a response at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP client bound to one service's API base URL
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::InvalidUrl(base_url));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(ApiError::Request)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a path against the base URL; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Start a request; the caller adds auth headers and a body.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    /// Send a request and decode the JSON response body, if any.
    ///
    /// Non-2xx responses become `ApiError::Status` carrying the body text.
    pub async fn execute(&self, request: RequestBuilder) -> Result<Option<Value>, ApiError> {
        let response = request.send().await.map_err(ApiError::Request)?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::Request)?;

        if !status.is_success() {
            debug!("api call failed with {}: {}", status, text);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        if text.is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text).map(Some).map_err(ApiError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_resolution() {
        let client = ApiClient::new("https://api.github.com/", 20).unwrap();
        assert_eq!(
            client.url("/repos/owner/project/releases"),
            "https://api.github.com/repos/owner/project/releases"
        );
        assert_eq!(
            client.url("https://uploads.github.com/x"),
            "https://uploads.github.com/x"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            ApiClient::new("api.github.com", 20),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_status_error_carries_body() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), 5).unwrap();
        let err = client
            .execute(client.request(Method::GET, "/missing"))
            .await
            .unwrap_err();

        assert_eq!(err.http_status(), Some(404));
        assert!(matches!(err, ApiError::Status { message, .. } if message == "not found"));
    }

    #[tokio::test]
    async fn test_empty_body_is_none() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("DELETE"))
            .respond_with(wiremock::ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), 5).unwrap();
        let value = client
            .execute(client.request(Method::DELETE, "/thing"))
            .await
            .unwrap();
        assert!(value.is_none());
    }
}
