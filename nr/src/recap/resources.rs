//! Resource loading for the recap pipeline
//!
//! Fetches article URLs and extracts readable text. YouTube links are
//! recognized and delegated to a transcript-capable loader when one is
//! injected; the default HTTP loader reports them as unsupported.

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::ingestion::cleaning::html_to_text;

const YOUTUBE_HOSTS: [&str; 3] = ["youtube.com", "www.youtube.com", "youtu.be"];

/// Result of loading and extracting content from a URL.
#[derive(Debug, Clone)]
pub struct LoadedResource {
    pub url: String,
    pub text: String,
    pub content_type: String,
    pub is_success: bool,
    pub error: Option<String>,
}

impl LoadedResource {
    fn failure(url: &str, content_type: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            text: String::new(),
            content_type: content_type.to_string(),
            is_success: false,
            error: Some(error.into()),
        }
    }
}

/// Seam for URL content loading; tests and transcript extractors plug in
/// their own implementations.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, url: &str) -> LoadedResource;
}

pub fn is_youtube_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .host_str()
                .map(|host| YOUTUBE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
        })
        .unwrap_or(false)
}

/// HTTP + HTML text extraction loader.
pub struct HttpResourceLoader {
    client: reqwest::Client,
    max_chars: usize,
}

impl HttpResourceLoader {
    pub fn new(request_timeout: std::time::Duration, max_chars: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("newsrecap/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, max_chars }
    }
}

#[async_trait]
impl ResourceLoader for HttpResourceLoader {
    async fn load(&self, url: &str) -> LoadedResource {
        if is_youtube_url(url) {
            return LoadedResource::failure(
                url,
                "youtube/transcript",
                "transcript extraction requires a transcript-capable loader",
            );
        }

        debug!(url, "loading article resource");
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(error) => {
                return LoadedResource::failure(url, "", format!("fetch failed: {error}"));
            }
        };
        if !response.status().is_success() {
            return LoadedResource::failure(
                url,
                "",
                format!("HTTP error: {}", response.status()),
            );
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                return LoadedResource::failure(
                    url,
                    &content_type,
                    format!("body read failed: {error}"),
                );
            }
        };

        let mut text = html_to_text(&body);
        if text.chars().count() > self.max_chars {
            text = text.chars().take(self.max_chars).collect();
        }
        if text.is_empty() {
            return LoadedResource::failure(url, &content_type, "no extractable text");
        }
        LoadedResource {
            url: url.to_string(),
            text,
            content_type,
            is_success: true,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_youtube_url() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://youtu.be/abc"));
        assert!(!is_youtube_url("https://example.com/watch"));
        assert!(!is_youtube_url("not a url"));
    }

    #[tokio::test]
    async fn test_http_loader_rejects_youtube() {
        let loader =
            HttpResourceLoader::new(std::time::Duration::from_secs(5), 1000);
        let loaded = loader.load("https://youtu.be/abc").await;
        assert!(!loaded.is_success);
        assert_eq!(loaded.content_type, "youtube/transcript");
    }
}
