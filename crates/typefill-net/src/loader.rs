//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{Fetcher, NetError, Request, Response, ResponseSource};

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("TypeFill-Worker/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    fn map_error(&self, request: &Request, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
        } else if err.is_connect() {
            NetError::Connection(err.to_string())
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_error(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(request, e))?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        let mut out = Response::new(status, body)
            .with_url(url)
            .with_source(ResponseSource::Network);
        out.headers = headers;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("TypeFill-Worker/"));
        assert!(config.cookies_enabled);
    }

    #[tokio::test]
    async fn test_fetch_buffers_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html>shell</html>", "text/html"),
            )
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/index.html", server.uri())).unwrap();
        let response = loader.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "<html>shell</html>");
        assert_eq!(response.content_type().unwrap().subtype(), mime::HTML);
        assert_eq!(response.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_error_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = loader.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_request_timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/slow", server.uri()))
            .unwrap()
            .timeout(Duration::from_millis(50));

        let err = loader.fetch(&request).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(d) if d == Duration::from_millis(50)));
    }
}
