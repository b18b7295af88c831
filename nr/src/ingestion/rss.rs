//! Generic RSS/Atom source adapter
//!
//! Fetches one or more feeds with conditional GET validators, parses both
//! RSS 2.0 and Atom with case-insensitive local-name matching, and keeps a
//! crash-safe processing snapshot so a run interrupted mid-page resumes
//! without refetching.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use newsstore::{SourceArticle, SourcePage, Store};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::cleaning::sha1_hex;

pub const RSS_SOURCE_NAME: &str = "rss";

const HTTP_NOT_MODIFIED: u16 = 304;
const RETRYABLE_HTTP_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];
const INOREADER_HOST_SUFFIX: &str = "inoreader.com";
const INOREADER_STREAM_PATH_PART: &str = "/stream/";
const USER_AGENT: &str = concat!("newsrecap/", env!("CARGO_PKG_VERSION"));

/// Errors raised by source adapters.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Retryable window failure; recorded as an ingestion gap.
    #[error("{message}")]
    Temporary {
        message: String,
        code: String,
        retry_after: Option<i64>,
        from_cursor: Option<String>,
        to_cursor: Option<String>,
    },

    /// Aborts the run as failed.
    #[error("{message}")]
    NonRetryable { message: String, code: String },

    #[error("source store error: {0}")]
    Store(#[from] newsstore::StoreError),
}

impl SourceError {
    pub fn temporary(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Temporary {
            message: message.into(),
            code: code.into(),
            retry_after: None,
            from_cursor: None,
            to_cursor: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::NonRetryable {
            message: message.into(),
            code: code.into(),
        }
    }
}

/// Cursor-paged source of normalized articles.
#[async_trait]
pub trait SourceAdapter: Send {
    fn name(&self) -> &'static str;

    /// Reset run-local state before a new ingestion run.
    fn begin_run(&mut self);

    async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<SourcePage, SourceError>;

    /// Checkpoint after one fully persisted page; `None` means done.
    fn mark_page_processed(&mut self, next_cursor: Option<&str>) -> Result<(), SourceError>;
}

/// One conditional HTTP fetch result.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub body: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub retry_after: Option<i64>,
}

/// Transport seam so tests inject canned feeds instead of sockets.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedResponse, SourceError>;
}

/// reqwest-backed transport with redirects and conditional headers.
pub struct HttpFeedTransport {
    client: reqwest::Client,
}

impl HttpFeedTransport {
    pub fn new(request_timeout: std::time::Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| {
                SourceError::non_retryable(
                    format!("failed to build HTTP client: {error}"),
                    "client_init",
                )
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedTransport for HttpFeedTransport {
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedResponse, SourceError> {
        let mut request = self.client.get(url).header(
            reqwest::header::ACCEPT,
            "application/rss+xml, application/atom+xml, application/xml",
        );
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|error| SourceError::Temporary {
            message: format!("RSS transport error: {error}"),
            code: "transport".to_string(),
            retry_after: None,
            from_cursor: None,
            to_cursor: None,
        })?;

        let status = response.status().as_u16();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let etag = header("etag");
        let last_modified = header("last-modified");
        let retry_after = header("retry-after").and_then(|value| value.parse::<i64>().ok());

        let body = if status == HTTP_NOT_MODIFIED {
            None
        } else {
            Some(response.text().await.map_err(|error| SourceError::Temporary {
                message: format!("RSS transport error: {error}"),
                code: "transport".to_string(),
                retry_after: None,
                from_cursor: None,
                to_cursor: None,
            })?)
        };

        Ok(FeedResponse {
            status,
            body,
            etag,
            last_modified,
            retry_after,
        })
    }
}

/// Per-feed HTTP conditional fetch diagnostics for one run.
#[derive(Debug, Clone)]
pub struct RssFeedFetchStats {
    pub feed_url: String,
    pub request_url: String,
    pub requested_n: usize,
    pub sent_if_none_match: bool,
    pub sent_if_modified_since: bool,
    pub status: String,
    pub received_etag: bool,
    pub received_last_modified: bool,
    pub received_items: usize,
}

/// Aggregated RSS fetch diagnostics for one run.
#[derive(Debug, Clone, Default)]
pub struct RssRunFetchStats {
    pub feeds_total: usize,
    pub requests_conditional: usize,
    pub responses_not_modified: usize,
    pub responses_fetched: usize,
    pub responses_with_etag: usize,
    pub responses_with_last_modified: usize,
    pub snapshot_articles: usize,
    pub snapshot_expired: bool,
    pub snapshot_restored: bool,
    pub resume_cursor: Option<String>,
    pub feeds: Vec<RssFeedFetchStats>,
}

/// RSS source settings.
#[derive(Debug, Clone)]
pub struct RssSourceConfig {
    pub feed_urls: Vec<String>,
    pub default_items_per_feed: usize,
    pub per_feed_items: HashMap<String, usize>,
    pub snapshot_max_age: Option<Duration>,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
}

impl Default for RssSourceConfig {
    fn default() -> Self {
        Self {
            feed_urls: Vec::new(),
            default_items_per_feed: 10_000,
            per_feed_items: HashMap::new(),
            snapshot_max_age: Some(Duration::hours(24)),
            max_retries: 3,
            retry_backoff_seconds: 1.0,
        }
    }
}

/// Cursor-based source over one or more RSS/Atom feeds.
pub struct RssSource {
    config: RssSourceConfig,
    store: Store,
    transport: Box<dyn FeedTransport>,
    feed_set_hash: String,
    snapshot_articles: Option<Vec<SourceArticle>>,
    resume_cursor: Option<String>,
    stats: RssRunFetchStats,
}

impl RssSource {
    pub fn new(config: RssSourceConfig, store: Store, transport: Box<dyn FeedTransport>) -> Self {
        let feed_set_hash = build_feed_set_hash(&config.feed_urls);
        Self {
            config,
            store,
            transport,
            feed_set_hash,
            snapshot_articles: None,
            resume_cursor: None,
            stats: RssRunFetchStats::default(),
        }
    }

    /// HTTP fetch diagnostics for the latest run.
    pub fn last_run_fetch_stats(&self) -> &RssRunFetchStats {
        &self.stats
    }

    async fn ensure_snapshot(&mut self) -> Result<(), SourceError> {
        if self.snapshot_articles.is_some() {
            return Ok(());
        }
        match self.load_processing_snapshot()? {
            Some((articles, resume_cursor)) => {
                self.stats.snapshot_restored = true;
                self.stats.resume_cursor = resume_cursor.clone();
                self.stats.snapshot_articles = articles.len();
                self.stats.feeds_total = self.config.feed_urls.len();
                let feeds: Vec<(String, usize)> = self
                    .config
                    .feed_urls
                    .iter()
                    .map(|feed_url| (feed_url.clone(), self.items_limit(feed_url)))
                    .collect();
                for (feed_url, items_limit) in feeds {
                    self.stats.feeds.push(RssFeedFetchStats {
                        request_url: feed_url.clone(),
                        feed_url,
                        requested_n: items_limit,
                        sent_if_none_match: false,
                        sent_if_modified_since: false,
                        status: "restored_snapshot".to_string(),
                        received_etag: false,
                        received_last_modified: false,
                        received_items: 0,
                    });
                }
                self.resume_cursor = resume_cursor;
                self.snapshot_articles = Some(articles);
            }
            None => {
                let articles = self.fetch_all_articles().await?;
                self.save_processing_snapshot(&articles, None)?;
                self.snapshot_articles = Some(articles);
            }
        }
        Ok(())
    }

    async fn fetch_all_articles(&mut self) -> Result<Vec<SourceArticle>, SourceError> {
        let mut articles: Vec<SourceArticle> = Vec::new();
        self.stats.feeds_total = self.config.feed_urls.len();
        let feed_urls = self.config.feed_urls.clone();
        for feed_url in feed_urls {
            let items_limit = self.items_limit(&feed_url);
            let request_url = effective_feed_request_url(&feed_url, items_limit);
            let (etag, last_modified) = self
                .store
                .feed_http_cache(RSS_SOURCE_NAME, &request_url)?;
            let sent_if_none_match = etag.is_some();
            let sent_if_modified_since = last_modified.is_some();
            if sent_if_none_match || sent_if_modified_since {
                self.stats.requests_conditional += 1;
            }

            let response = self
                .request_feed(&request_url, etag.as_deref(), last_modified.as_deref())
                .await?;
            let not_modified = response.status == HTTP_NOT_MODIFIED || response.body.is_none();
            let mut parsed_items: Vec<SourceArticle> = Vec::new();
            let status = if not_modified {
                self.stats.responses_not_modified += 1;
                "not_modified"
            } else {
                self.stats.responses_fetched += 1;
                if let Some(body) = response.body.as_deref() {
                    parsed_items = parse_feed(body, &feed_url)?;
                }
                "fetched"
            };
            if response.etag.is_some() {
                self.stats.responses_with_etag += 1;
            }
            if response.last_modified.is_some() {
                self.stats.responses_with_last_modified += 1;
            }
            self.stats.feeds.push(RssFeedFetchStats {
                feed_url: feed_url.clone(),
                request_url: request_url.clone(),
                requested_n: items_limit,
                sent_if_none_match,
                sent_if_modified_since,
                status: status.to_string(),
                received_etag: response.etag.is_some(),
                received_last_modified: response.last_modified.is_some(),
                received_items: parsed_items.len(),
            });

            self.store.upsert_feed_http_cache(
                RSS_SOURCE_NAME,
                &request_url,
                response.etag.as_deref().or(etag.as_deref()),
                response.last_modified.as_deref().or(last_modified.as_deref()),
            )?;

            articles.extend(parsed_items);
        }
        articles.sort_by(|left, right| right.published_at.cmp(&left.published_at));
        self.stats.snapshot_articles = articles.len();
        Ok(articles)
    }

    async fn request_feed(
        &mut self,
        request_url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FeedResponse, SourceError> {
        let mut last_error: Option<SourceError> = None;
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.transport.get(request_url, etag, last_modified).await {
                Ok(response) => {
                    if response.status == HTTP_NOT_MODIFIED
                        || (200..300).contains(&response.status)
                    {
                        return Ok(response);
                    }
                    if RETRYABLE_HTTP_STATUS_CODES.contains(&response.status) {
                        last_error = Some(SourceError::Temporary {
                            message: format!("Temporary RSS HTTP error: {}", response.status),
                            code: response.status.to_string(),
                            retry_after: response.retry_after,
                            from_cursor: None,
                            to_cursor: None,
                        });
                    } else {
                        return Err(SourceError::non_retryable(
                            format!("Non-retryable RSS HTTP error: {}", response.status),
                            response.status.to_string(),
                        ));
                    }
                }
                Err(SourceError::NonRetryable { message, code }) => {
                    return Err(SourceError::NonRetryable { message, code });
                }
                Err(error) => last_error = Some(error),
            }

            if attempt < self.config.max_retries.max(1) {
                let mut backoff = self.config.retry_backoff_seconds * attempt as f64;
                if let Some(SourceError::Temporary {
                    retry_after: Some(retry_after),
                    ..
                }) = &last_error
                {
                    backoff = backoff.max(*retry_after as f64);
                }
                debug!(request_url, attempt, backoff, "retrying feed request");
                tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| SourceError::temporary("RSS request failed", "unknown")))
    }

    fn items_limit(&self, feed_url: &str) -> usize {
        self.config
            .per_feed_items
            .get(feed_url)
            .copied()
            .unwrap_or(self.config.default_items_per_feed)
    }

    fn load_processing_snapshot(
        &mut self,
    ) -> Result<Option<(Vec<SourceArticle>, Option<String>)>, SourceError> {
        let Some((snapshot_json, next_cursor, updated_at)) = self
            .store
            .rss_processing_snapshot(RSS_SOURCE_NAME, &self.feed_set_hash)?
        else {
            return Ok(None);
        };
        if self.snapshot_expired(updated_at) {
            self.store
                .delete_rss_processing_snapshot(RSS_SOURCE_NAME, &self.feed_set_hash)?;
            self.stats.snapshot_expired = true;
            return Ok(None);
        }
        match serde_json::from_str::<Vec<SourceArticle>>(&snapshot_json) {
            Ok(articles) => Ok(Some((articles, next_cursor))),
            Err(error) => {
                warn!(%error, "dropping undecodable RSS processing snapshot");
                self.store
                    .delete_rss_processing_snapshot(RSS_SOURCE_NAME, &self.feed_set_hash)?;
                Ok(None)
            }
        }
    }

    fn save_processing_snapshot(
        &mut self,
        articles: &[SourceArticle],
        next_cursor: Option<&str>,
    ) -> Result<(), SourceError> {
        let snapshot_json = serde_json::to_string(articles).map_err(|error| {
            SourceError::non_retryable(
                format!("failed to serialize RSS snapshot: {error}"),
                "snapshot_serialize",
            )
        })?;
        self.store.upsert_rss_processing_snapshot(
            RSS_SOURCE_NAME,
            &self.feed_set_hash,
            &snapshot_json,
            next_cursor,
        )?;
        Ok(())
    }

    fn snapshot_expired(&self, updated_at: DateTime<Utc>) -> bool {
        match self.config.snapshot_max_age {
            Some(max_age) => Utc::now() - updated_at > max_age,
            None => false,
        }
    }
}

#[async_trait]
impl SourceAdapter for RssSource {
    fn name(&self) -> &'static str {
        RSS_SOURCE_NAME
    }

    fn begin_run(&mut self) {
        self.snapshot_articles = None;
        self.resume_cursor = None;
        self.stats = RssRunFetchStats::default();
    }

    async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<SourcePage, SourceError> {
        self.ensure_snapshot().await?;
        let effective_cursor = match cursor {
            Some(value) => Some(value.to_string()),
            None => self.resume_cursor.clone(),
        };
        let offset = parse_cursor_offset(effective_cursor.as_deref());
        let all_articles = self.snapshot_articles.as_deref().unwrap_or(&[]);
        let articles: Vec<SourceArticle> = all_articles
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let next_offset = offset + limit;
        let next_cursor = if next_offset < all_articles.len() {
            Some(next_offset.to_string())
        } else {
            None
        };
        Ok(SourcePage {
            articles,
            next_cursor,
            cursor: effective_cursor,
        })
    }

    fn mark_page_processed(&mut self, next_cursor: Option<&str>) -> Result<(), SourceError> {
        match next_cursor {
            None => {
                self.store
                    .delete_rss_processing_snapshot(RSS_SOURCE_NAME, &self.feed_set_hash)?;
                self.resume_cursor = None;
            }
            Some(cursor) => {
                let updated = self.store.update_rss_processing_snapshot_cursor(
                    RSS_SOURCE_NAME,
                    &self.feed_set_hash,
                    Some(cursor),
                )?;
                if !updated {
                    if let Some(articles) = self.snapshot_articles.take() {
                        warn!(
                            feed_set_hash = %self.feed_set_hash,
                            next_cursor = cursor,
                            "RSS snapshot row missing while advancing cursor; recreating snapshot"
                        );
                        self.save_processing_snapshot(&articles, Some(cursor))?;
                        self.snapshot_articles = Some(articles);
                    }
                }
                self.resume_cursor = Some(cursor.to_string());
            }
        }
        Ok(())
    }
}

fn parse_cursor_offset(cursor: Option<&str>) -> usize {
    cursor
        .and_then(|value| value.parse::<i64>().ok())
        .map(|value| value.max(0) as usize)
        .unwrap_or(0)
}

pub(crate) fn build_feed_set_hash(feed_urls: &[String]) -> String {
    let mut normalized: Vec<&str> = feed_urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .collect();
    normalized.sort_unstable();
    sha1_hex(normalized.join("\n").as_bytes())
}

/// Inoreader stream URLs take an `n` query override for the page size.
fn effective_feed_request_url(feed_url: &str, items_limit: usize) -> String {
    let Ok(mut parsed) = Url::parse(feed_url) else {
        return feed_url.to_string();
    };
    let host_matches = parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase().ends_with(INOREADER_HOST_SUFFIX))
        .unwrap_or(false);
    if !host_matches || !parsed.path().contains(INOREADER_STREAM_PATH_PART) {
        return feed_url.to_string();
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "n")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.push(("n".to_string(), items_limit.to_string()));
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs.iter().map(|(key, value)| (key.as_str(), value.as_str())));
    parsed.to_string()
}

// -- feed parsing --------------------------------------------------------

#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<XmlNode>,
    text: String,
}

impl XmlNode {
    fn child_text(&self, name: &str) -> Option<String> {
        for child in &self.children {
            if child.name != name {
                continue;
            }
            let direct = child.text.trim();
            if !direct.is_empty() {
                return Some(direct.to_string());
            }
            let deep = child.deep_text();
            let deep = deep.trim();
            if !deep.is_empty() {
                return Some(deep.to_string());
            }
        }
        None
    }

    fn deep_text(&self) -> String {
        let mut collected = self.text.clone();
        for child in &self.children {
            collected.push_str(&child.deep_text());
        }
        collected
    }

    fn descendants(&self) -> Vec<&XmlNode> {
        let mut nodes = Vec::new();
        for child in &self.children {
            nodes.push(child);
            nodes.extend(child.descendants());
        }
        nodes
    }

    fn find_child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }
}

fn local_name(raw: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw);
    let local = raw.rsplit(':').next().unwrap_or(&raw);
    local.to_ascii_lowercase()
}

fn parse_xml_tree(raw_xml: &str, feed_url: &str) -> Result<XmlNode, SourceError> {
    let mut reader = Reader::from_str(raw_xml);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = reader.read_event().map_err(|error| {
            SourceError::non_retryable(
                format!("Invalid RSS/Atom XML from {feed_url}: {error}"),
                "invalid_feed_xml",
            )
        })?;
        match event {
            Event::Start(start) => {
                let mut node = XmlNode {
                    name: local_name(start.name().as_ref()),
                    ..XmlNode::default()
                };
                for attr in start.attributes().flatten() {
                    let key = local_name(attr.key.as_ref());
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    node.attrs.insert(key, value);
                }
                stack.push(node);
            }
            Event::Empty(start) => {
                let mut node = XmlNode {
                    name: local_name(start.name().as_ref()),
                    ..XmlNode::default()
                };
                for attr in start.attributes().flatten() {
                    let key = local_name(attr.key.as_ref());
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    node.attrs.insert(key, value);
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    if let Ok(decoded) = text.unescape() {
                        current.text.push_str(&decoded);
                    }
                }
            }
            Event::CData(cdata) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(done) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => root = Some(done),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    root.ok_or_else(|| {
        SourceError::non_retryable(
            format!("Invalid RSS/Atom XML from {feed_url}: empty document"),
            "invalid_feed_xml",
        )
    })
}

/// Parse RSS 2.0 or Atom; root shape is inferred from local names.
pub(crate) fn parse_feed(
    raw_xml: &str,
    feed_url: &str,
) -> Result<Vec<SourceArticle>, SourceError> {
    let root = parse_xml_tree(raw_xml, feed_url)?;
    match root.name.as_str() {
        "rss" => Ok(parse_rss(&root, feed_url)),
        "feed" => Ok(parse_atom(&root, feed_url)),
        _ => {
            // Best effort: some feeds omit top-level conventions.
            let has_items = root
                .descendants()
                .iter()
                .any(|node| node.name == "item");
            if has_items {
                return Ok(parse_rss(&root, feed_url));
            }
            let has_entries = root
                .descendants()
                .iter()
                .any(|node| node.name == "entry");
            if has_entries {
                return Ok(parse_atom(&root, feed_url));
            }
            Err(SourceError::non_retryable(
                format!("Unsupported feed format from {feed_url}"),
                "unsupported_feed_format",
            ))
        }
    }
}

fn parse_rss(root: &XmlNode, feed_url: &str) -> Vec<SourceArticle> {
    let container = root.find_child("channel").unwrap_or(root);
    let feed_title = container.child_text("title");

    let mut results = Vec::new();
    for item in container.children.iter().filter(|node| node.name == "item") {
        let title = item
            .child_text("title")
            .unwrap_or_else(|| "Untitled".to_string());
        let link = item
            .child_text("link")
            .unwrap_or_else(|| feed_url.to_string());
        let description = item.child_text("description");
        let content = item.child_text("encoded");
        let guid = item.child_text("guid");
        let source = item
            .child_text("source")
            .or_else(|| item.child_text("creator"));
        let raw_pub_date = item.child_text("pubdate");
        let published_at = parse_feed_datetime(raw_pub_date.as_deref());

        results.push(SourceArticle {
            external_id: build_external_id(
                feed_url,
                guid.as_deref(),
                &link,
                &title,
                raw_pub_date.as_deref(),
            ),
            url: link.clone(),
            title: title.clone(),
            source: source
                .clone()
                .or_else(|| feed_title.clone())
                .unwrap_or_else(|| domain_or_unknown(&link)),
            published_at,
            content: content.clone(),
            summary: description.clone(),
            raw_payload: serde_json::json!({
                "feed_url": feed_url,
                "guid": guid,
                "title": title,
                "link": link,
                "description": description,
                "content": content,
                "source": source,
                "pub_date_raw": raw_pub_date,
                "pub_date": published_at.to_rfc3339(),
            }),
        });
    }
    results
}

fn parse_atom(root: &XmlNode, feed_url: &str) -> Vec<SourceArticle> {
    let feed_title = root.child_text("title");

    let mut results = Vec::new();
    for entry in root
        .descendants()
        .into_iter()
        .filter(|node| node.name == "entry")
    {
        let title = entry
            .child_text("title")
            .unwrap_or_else(|| "Untitled".to_string());
        let link = atom_link(entry).unwrap_or_else(|| feed_url.to_string());
        let summary = entry.child_text("summary");
        let content = entry.child_text("content");
        let entry_id = entry.child_text("id");
        let source = entry
            .child_text("name")
            .or_else(|| entry.child_text("author"))
            .or_else(|| {
                entry
                    .find_child("author")
                    .and_then(|author| author.child_text("name"))
            });
        let raw_published_at = entry
            .child_text("published")
            .or_else(|| entry.child_text("updated"));
        let published_at = parse_feed_datetime(raw_published_at.as_deref());

        results.push(SourceArticle {
            external_id: build_external_id(
                feed_url,
                entry_id.as_deref(),
                &link,
                &title,
                raw_published_at.as_deref(),
            ),
            url: link.clone(),
            title: title.clone(),
            source: source
                .clone()
                .or_else(|| feed_title.clone())
                .unwrap_or_else(|| domain_or_unknown(&link)),
            published_at,
            content: content.clone(),
            summary: summary.clone(),
            raw_payload: serde_json::json!({
                "feed_url": feed_url,
                "id": entry_id,
                "title": title,
                "link": link,
                "summary": summary,
                "content": content,
                "source": source,
                "published_at_raw": raw_published_at,
                "published_at": published_at.to_rfc3339(),
            }),
        });
    }
    results
}

fn atom_link(entry: &XmlNode) -> Option<String> {
    for child in entry.children.iter().filter(|node| node.name == "link") {
        let rel = child
            .attrs
            .get("rel")
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let href = child.attrs.get("href").map(|value| value.trim()).unwrap_or("");
        if href.is_empty() {
            continue;
        }
        if rel.is_empty() || rel == "alternate" {
            return Some(href.to_string());
        }
    }
    entry
        .children
        .iter()
        .filter(|node| node.name == "link")
        .find_map(|child| {
            child
                .attrs
                .get("href")
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
}

pub(crate) const UNKNOWN_PUBLISHED_AT: &str = "1970-01-01T00:00:00Z";

/// RFC 2822 first, then RFC 3339; unknown dates map to the epoch.
pub(crate) fn parse_feed_datetime(raw: Option<&str>) -> DateTime<Utc> {
    let epoch = || {
        UNKNOWN_PUBLISHED_AT
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
    };
    let Some(raw) = raw else {
        return epoch();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return epoch();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.with_timezone(&Utc);
    }
    epoch()
}

/// Feed-scoped external id; items without a GUID get a deterministic
/// `generated:` digest over the identifying fields.
pub(crate) fn build_external_id(
    feed_url: &str,
    guid: Option<&str>,
    link: &str,
    title: &str,
    raw_published_at: Option<&str>,
) -> String {
    if let Some(guid) = guid {
        let guid = guid.trim();
        if !guid.is_empty() {
            let prefix = &sha1_hex(feed_url.as_bytes())[..10];
            return format!("{prefix}:{guid}");
        }
    }
    let payload = serde_json::json!({
        "feed_url": feed_url,
        "link": link,
        "raw_published_at": raw_published_at.unwrap_or("").trim(),
        "title": title,
    });
    let canonical = serde_json::to_string(&payload).unwrap_or_default();
    format!("generated:{}", sha1_hex(canonical.as_bytes()))
}

fn domain_or_unknown(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
        .unwrap_or_else(|| "unknown".to_string())
}
