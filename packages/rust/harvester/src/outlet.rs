//! The contract every news source implements.

use std::future::Future;
use std::pin::Pin;

use newsdesk_shared::{Article, Comment, FrontPageQuery, Result};

/// Boxed future returned by [`Outlet`] methods so the trait stays object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One news outlet: a home page with links, and article pages behind them.
pub trait Outlet: Send + Sync {
    /// Short name used on the command line and in logs.
    fn name(&self) -> &str;

    /// Home URL. Every article URL of this outlet starts with it.
    fn base_url(&self) -> &str;

    /// Default language tag for articles, e.g. `en_US`.
    fn language(&self) -> &str;

    /// URLs that are never treated as articles.
    fn blacklist(&self) -> &[String];

    /// Links found on the front page, filtered by `query.kind`.
    fn front_page_links<'a>(&'a self, query: &'a FrontPageQuery) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Fetch and parse one article. `Ok(None)` means the page is not an article.
    fn article<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<Article>>>;

    /// Comments posted under an article.
    fn comments<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<Comment>>>;

    fn owns_url(&self, url: &str) -> bool {
        url.starts_with(self.base_url())
    }
}
