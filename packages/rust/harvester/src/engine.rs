//! Concurrent fan-out across outlets.
//!
//! Fetch failures never propagate out of the [`Harvester`]: they are logged
//! and the affected page simply contributes nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use newsdesk_shared::{AppConfig, Article, Comment, FrontPageQuery, Result};
use tracing::{debug, info, instrument, warn};

use crate::outlet::Outlet;
use crate::selector::SelectorOutlet;

/// The set of configured outlets and the fan-out logic over them.
#[derive(Clone, Default)]
pub struct Harvester {
    outlets: Vec<Arc<dyn Outlet>>,
}

impl Harvester {
    pub fn new(outlets: Vec<Arc<dyn Outlet>>) -> Self {
        Self { outlets }
    }

    /// One [`SelectorOutlet`] per `[[outlets]]` entry.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let outlets = config
            .outlets
            .iter()
            .map(|outlet| SelectorOutlet::from_config(outlet).map(|o| Arc::new(o) as Arc<dyn Outlet>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(outlets))
    }

    /// Look up an outlet by name.
    pub fn outlet(&self, name: &str) -> Option<Arc<dyn Outlet>> {
        self.outlets.iter().find(|o| o.name() == name).cloned()
    }

    pub fn outlets(&self) -> &[Arc<dyn Outlet>] {
        &self.outlets
    }

    /// Base URLs of every outlet, in configuration order.
    pub fn outlet_urls(&self) -> Vec<String> {
        self.outlets.iter().map(|o| o.base_url().to_string()).collect()
    }

    /// The outlet whose base URL prefixes `url`.
    pub fn owner_of(&self, url: &str) -> Option<Arc<dyn Outlet>> {
        self.outlets.iter().find(|o| o.owns_url(url)).cloned()
    }

    /// Front page links of one outlet. Empty on failure.
    pub async fn front_page(&self, outlet: &Arc<dyn Outlet>, query: &FrontPageQuery) -> Vec<String> {
        match outlet.front_page_links(query).await {
            Ok(links) => links,
            Err(e) => {
                warn!(outlet = %outlet.name(), error = %e, "front page fetch failed");
                Vec::new()
            }
        }
    }

    /// Fetch up to `limit` of `urls` concurrently.
    pub async fn aggregate_articles(
        &self,
        outlet: &Arc<dyn Outlet>,
        urls: Vec<String>,
        limit: usize,
    ) -> Vec<Article> {
        let mut handles = Vec::new();
        for url in urls.into_iter().take(limit) {
            let outlet = outlet.clone();
            handles.push(tokio::spawn(async move {
                let result = outlet.article(&url).await;
                (url, result)
            }));
        }

        let mut articles = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((_, Ok(Some(article)))) => articles.push(article),
                Ok((url, Ok(None))) => debug!(outlet = %outlet.name(), %url, "not an article"),
                Ok((url, Err(e))) => {
                    warn!(outlet = %outlet.name(), %url, error = %e, "article fetch failed");
                }
                Err(e) => warn!(outlet = %outlet.name(), error = %e, "article task failed"),
            }
        }
        articles
    }

    /// Front page links of `outlet`, then the articles behind them.
    pub async fn aggregate_front_page(
        &self,
        outlet: &Arc<dyn Outlet>,
        query: &FrontPageQuery,
    ) -> Vec<Article> {
        let links = self.front_page(outlet, query).await;
        self.aggregate_articles(outlet, links, query.limit).await
    }

    /// Scrape every outlet concurrently. Articles are deduplicated by URL,
    /// first occurrence wins.
    #[instrument(skip_all, fields(outlets = self.outlets.len()))]
    pub async fn harvest_all(&self, query: &FrontPageQuery) -> Vec<Article> {
        let started = Instant::now();
        let mut handles = Vec::new();
        for outlet in &self.outlets {
            let this = self.clone();
            let outlet = outlet.clone();
            let query = *query;
            handles.push(tokio::spawn(async move {
                this.aggregate_front_page(&outlet, &query).await
            }));
        }

        let mut seen = HashSet::new();
        let mut articles = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(batch) => {
                    articles.extend(batch.into_iter().filter(|a| seen.insert(a.url.clone())));
                }
                Err(e) => warn!(error = %e, "outlet task failed"),
            }
        }

        info!(
            articles = articles.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "harvest fetch completed"
        );
        articles
    }

    /// Comments under `url`, fetched from the outlet that owns it.
    pub async fn comments(&self, url: &str) -> Vec<Comment> {
        let Some(outlet) = self.owner_of(url) else {
            debug!(%url, "no outlet owns url");
            return Vec::new();
        };
        match outlet.comments(url).await {
            Ok(comments) => comments,
            Err(e) => {
                warn!(outlet = %outlet.name(), %url, error = %e, "comment fetch failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use newsdesk_shared::NewsdeskError;

    use super::*;
    use crate::outlet::BoxFuture;

    struct StaticOutlet {
        name: String,
        base: String,
        links: Vec<String>,
        pages: HashMap<String, Option<Article>>,
        fetches: AtomicUsize,
    }

    impl StaticOutlet {
        fn new(name: &str, base: &str, pages: &[(&str, bool)]) -> Self {
            let mut map = HashMap::new();
            let mut links = Vec::new();
            for (url, is_article) in pages {
                links.push(url.to_string());
                let article = is_article.then(|| Article {
                    outlet_url: base.into(),
                    language: "en_US".into(),
                    url: url.to_string(),
                    title: "t".into(),
                    author: String::new(),
                    text: "body".into(),
                    tags: Vec::new(),
                    time_posted: Utc::now(),
                    word_count: 1,
                });
                map.insert(url.to_string(), article);
            }
            Self {
                name: name.into(),
                base: base.into(),
                links,
                pages: map,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl Outlet for StaticOutlet {
        fn name(&self) -> &str {
            &self.name
        }

        fn base_url(&self) -> &str {
            &self.base
        }

        fn language(&self) -> &str {
            "en_US"
        }

        fn blacklist(&self) -> &[String] {
            &[]
        }

        fn front_page_links<'a>(&'a self, _query: &'a FrontPageQuery) -> BoxFuture<'a, Result<Vec<String>>> {
            Box::pin(async move { Ok(self.links.clone()) })
        }

        fn article<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<Article>>> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                self.pages
                    .get(url)
                    .cloned()
                    .ok_or_else(|| NewsdeskError::Network(format!("{url}: HTTP 404")))
            })
        }

        fn comments<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Vec<Comment>>> {
            Box::pin(async { Err(NewsdeskError::Network("comments unavailable".into())) })
        }
    }

    #[tokio::test]
    async fn harvest_deduplicates_across_outlets() {
        let a = StaticOutlet::new("a", "https://a.example/", &[("https://a.example/1", true), ("https://shared.example/x", true)]);
        let b = StaticOutlet::new("b", "https://b.example/", &[("https://shared.example/x", true), ("https://b.example/2", false)]);
        let harvester = Harvester::new(vec![Arc::new(a), Arc::new(b)]);

        let articles = harvester.harvest_all(&FrontPageQuery::default()).await;
        let mut urls: Vec<_> = articles.iter().map(|a| a.url.as_str()).collect();
        urls.sort();
        assert_eq!(urls, vec!["https://a.example/1", "https://shared.example/x"]);
    }

    #[tokio::test]
    async fn limit_caps_fetches_per_outlet() {
        let outlet = Arc::new(StaticOutlet::new(
            "a",
            "https://a.example/",
            &[("https://a.example/1", true), ("https://a.example/2", true), ("https://a.example/3", true)],
        ));
        let harvester = Harvester::new(vec![outlet.clone()]);
        let dyn_outlet: Arc<dyn Outlet> = outlet.clone();

        let query = FrontPageQuery {
            limit: 2,
            ..FrontPageQuery::default()
        };
        let articles = harvester.aggregate_front_page(&dyn_outlet, &query).await;
        assert_eq!(articles.len(), 2);
        assert_eq!(outlet.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_errors_yield_nothing() {
        let outlet: Arc<dyn Outlet> = Arc::new(StaticOutlet::new("a", "https://a.example/", &[]));
        let harvester = Harvester::new(vec![outlet.clone()]);

        let articles = harvester
            .aggregate_articles(&outlet, vec!["https://a.example/missing".into()], usize::MAX)
            .await;
        assert!(articles.is_empty());
        assert!(harvester.comments("https://a.example/missing").await.is_empty());
        assert!(harvester.comments("https://nobody.example/").await.is_empty());
    }

    #[test]
    fn lookup_by_name_and_url() {
        let harvester = Harvester::new(vec![Arc::new(StaticOutlet::new("a", "https://a.example/", &[]))]);
        assert!(harvester.outlet("a").is_some());
        assert!(harvester.outlet("z").is_none());
        assert_eq!(harvester.outlet_urls(), vec!["https://a.example/".to_string()]);
        assert!(harvester.owner_of("https://a.example/news/1").is_some());
    }
}
