//! Summarization and keyword extraction, delegated to HTTP services.

use std::collections::HashMap;
use std::time::Duration;

use newsdesk_harvester::BoxFuture;
use newsdesk_shared::{Article, DelegateConfig, NewsdeskError, Result};
use newsdesk_sync::QueuedPool;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Produces summaries and weighted keywords for articles.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<String>>;

    /// Keywords mapped to their relevancy within the article.
    fn extract_keywords<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<HashMap<String, f64>>>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DelegateRequest<'a> {
    text: &'a str,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    summarized: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeywordResponse {
    keywords: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// DelegatedSummarizer
// ---------------------------------------------------------------------------

/// [`Summarizer`] that POSTs `{text, lang}` to two remote endpoints.
pub struct DelegatedSummarizer {
    summarizer_url: String,
    extractor_url: String,
    clients: QueuedPool<Client>,
}

impl DelegatedSummarizer {
    /// Build from `[delegate]`. The API key, when configured, is read from
    /// the environment variable named by `api_key_env`.
    pub fn from_config(config: &DelegateConfig) -> Result<Self> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());
        Self::new(config, api_key.as_deref())
    }

    /// Build with an explicit API key.
    pub fn new(config: &DelegateConfig, api_key: Option<&str>) -> Result<Self> {
        let summarizer_url = config
            .summarizer_url
            .clone()
            .ok_or_else(|| NewsdeskError::config("delegate.summarizer_url is required"))?;
        let extractor_url = config
            .extractor_url
            .clone()
            .ok_or_else(|| NewsdeskError::config("delegate.extractor_url is required"))?;

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.filter(|_| !config.auth_scheme.is_empty()) {
            let value = HeaderValue::from_str(&format!("{} {key}", config.auth_scheme))
                .map_err(|e| NewsdeskError::config(format!("invalid delegate authorization header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NewsdeskError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            summarizer_url,
            extractor_url,
            clients: QueuedPool::new("delegate", move || client.clone()),
        })
    }

    async fn post<R: DeserializeOwned>(&self, url: &str, article: &Article) -> Result<R> {
        let client = self
            .clients
            .acquire()
            .await
            .map_err(|e| NewsdeskError::Delegate(format!("{url}: {e}")))?;
        debug!(%url, article = %article.url, "delegating");

        let response = client
            .post(url)
            .json(&DelegateRequest {
                text: &article.text,
                lang: &article.language,
            })
            .send()
            .await
            .map_err(|e| NewsdeskError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NewsdeskError::Delegate(format!(
                "{url}: HTTP request failed with status {status}"
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| NewsdeskError::parse(format!("{url}: unexpected response body: {e}")))
    }
}

impl Summarizer for DelegatedSummarizer {
    fn summarize<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let response: SummaryResponse = self.post(&self.summarizer_url, article).await?;
            Ok(response.summarized.unwrap_or_default())
        })
    }

    fn extract_keywords<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<HashMap<String, f64>>> {
        Box::pin(async move {
            let response: KeywordResponse = self.post(&self.extractor_url, article).await?;
            Ok(response
                .keywords
                .into_iter()
                .map(|(keyword, relevancy)| (keyword.trim().to_lowercase(), relevancy))
                .collect())
        })
    }
}
