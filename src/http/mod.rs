//! HTTP response source
//!
//! Turns a URL into what the manager takes over: a [`DownloadCreateInfo`]
//! filled from the response headers, and the response body as a
//! [`ByteStream`]. Redirects are followed here rather than by reqwest so
//! the full chain ends up in the create info.

use crate::config::ManagerConfig;
use crate::error::{EngineError, NetworkErrorKind, Result};
use crate::protocol::{DownloadCreateInfo, DownloadSaveInfo, PageTransition};
use crate::stream::ByteStream;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use reqwest::{Client, Response};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// What to fetch and how the result should be treated
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub referrer: Option<Url>,
    pub save_info: DownloadSaveInfo,
    pub prompt: bool,
    pub has_user_gesture: bool,
    pub transition: PageTransition,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            referrer: None,
            save_info: DownloadSaveInfo::default(),
            prompt: false,
            has_user_gesture: true,
            transition: PageTransition::Link,
            headers: Vec::new(),
        }
    }

    /// Parse `url` and build a request for it
    pub fn parse(url: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Save to exactly this path, overwriting whatever is there
    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_info.file_path = Some(path.into());
        self
    }

    pub fn suggested_name(mut self, name: impl Into<String>) -> Self {
        self.save_info.suggested_name = Some(name.into());
        self
    }

    pub fn prompt(mut self, prompt: bool) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn user_gesture(mut self, gesture: bool) -> Self {
        self.has_user_gesture = gesture;
        self
    }

    pub fn transition(mut self, transition: PageTransition) -> Self {
        self.transition = transition;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Issues requests and hands back response bodies as byte streams
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
    max_redirects: usize,
}

impl HttpFetcher {
    /// Create a fetcher with the manager's HTTP settings
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let http = &config.http;
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout))
            .read_timeout(Duration::from_secs(http.read_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(http.accept_invalid_certs)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(ref proxy_url) = http.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| EngineError::Internal(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            max_redirects: http.max_redirects,
        })
    }

    /// Send the request and describe the response. The body has not been
    /// read yet; it is consumed through the returned stream.
    pub async fn fetch(&self, request: &DownloadRequest) -> Result<(DownloadCreateInfo, ByteStream)> {
        let mut chain = vec![request.url.clone()];

        let response = loop {
            let current = chain[chain.len() - 1].clone();
            let response = self.send(&current, request).await?;
            let status = response.status();

            if status.is_redirection() {
                if chain.len() > self.max_redirects {
                    return Err(EngineError::network(
                        NetworkErrorKind::TooManyRedirects,
                        format!("More than {} redirects", self.max_redirects),
                    ));
                }
                let next = redirect_target(&current, response.headers())?;
                tracing::debug!("Redirected from {} to {}", current, next);
                chain.push(next);
                continue;
            }

            if !status.is_success() {
                return Err(EngineError::network(
                    NetworkErrorKind::HttpStatus(status.as_u16()),
                    format!("HTTP error: {}", status),
                ));
            }
            break response;
        };

        let info = create_info(request, chain, &response);
        tracing::debug!(
            "Response for {}: {} bytes of {:?}",
            info.url(),
            info.total_bytes,
            info.mime_type
        );
        Ok((info, body_stream(response)))
    }

    async fn send(&self, url: &Url, request: &DownloadRequest) -> Result<Response> {
        let mut builder = self
            .client
            .get(url.clone())
            .header("User-Agent", self.user_agent.as_str());
        if let Some(ref referrer) = request.referrer {
            builder = builder.header("Referer", referrer.as_str());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.send().await?)
    }
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Result<Url> {
    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EngineError::network(NetworkErrorKind::Other, "Redirect without a Location header")
        })?;
    Ok(current.join(location)?)
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn create_info(request: &DownloadRequest, url_chain: Vec<Url>, response: &Response) -> DownloadCreateInfo {
    let headers = response.headers();
    let total_bytes = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    // Parameters such as charset are not part of the type
    let mime_type = header_string(headers, CONTENT_TYPE)
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();

    DownloadCreateInfo {
        url_chain,
        referrer_url: request.referrer.clone(),
        start_time: Utc::now(),
        total_bytes,
        has_user_gesture: request.has_user_gesture,
        transition: request.transition,
        content_disposition: header_string(headers, CONTENT_DISPOSITION),
        original_mime_type: mime_type.clone(),
        mime_type,
        referrer_charset: None,
        remote_address: response.remote_addr().map(|a| a.ip().to_string()),
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
        save_info: request.save_info.clone(),
        prompt_user_for_save_location: request.prompt,
    }
}

fn body_stream(response: Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| {
            chunk.map_err(|e| {
                let err = EngineError::from(e);
                tracing::debug!("Response body failed: {}", err);
                err.interrupt_reason()
            })
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn relative_redirects_resolve_against_current_url() {
        let current = Url::parse("https://example.com/a/b").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("../c?x=1"));
        assert_eq!(
            redirect_target(&current, &headers).unwrap().as_str(),
            "https://example.com/c?x=1"
        );
    }

    #[test]
    fn redirect_without_location_is_an_error() {
        let current = Url::parse("https://example.com/").unwrap();
        let err = redirect_target(&current, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Network { .. }));
    }

    #[test]
    fn request_builder_fills_save_info() {
        let request = DownloadRequest::parse("https://example.com/f.zip")
            .unwrap()
            .suggested_name("g.zip")
            .prompt(true)
            .user_gesture(false);
        assert_eq!(request.save_info.suggested_name.as_deref(), Some("g.zip"));
        assert!(request.prompt);
        assert!(!request.has_user_gesture);
        assert!(DownloadRequest::parse("not a url").is_err());
    }
}
