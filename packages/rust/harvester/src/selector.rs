//! Outlet driven by CSS selectors from configuration.
//!
//! Front pages are scanned for links owned by the outlet, article pages are
//! parsed with the configured selectors. Parsing happens synchronously on the
//! fetched body so no `Html` document is held across an await point.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use newsdesk_shared::{
    Article, Comment, FrontPageKind, FrontPageQuery, NewsdeskError, OutletConfig, Result,
};
use newsdesk_sync::{LockedPool, ResourcePool};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::outlet::{BoxFuture, Outlet};

/// User-Agent string for outlet requests.
const USER_AGENT: &str = concat!("Newsdesk/", env!("CARGO_PKG_VERSION"));

/// `dd/mm/yyyy HH:MM GMT+h`
static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+)\s(GMT)([+-])(\d+)").expect("valid regex"));

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

struct Selectors {
    title: Selector,
    content: Selector,
    paragraph: Selector,
    author: Option<Selector>,
    tags: Option<Selector>,
    date: Option<Selector>,
    comment_section: Option<Selector>,
    comment: Option<Selector>,
    comment_user: Option<Selector>,
    comment_text: Option<Selector>,
    link: Selector,
}

fn compile(outlet: &str, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| NewsdeskError::config(format!("outlet '{outlet}': invalid selector '{css}': {e}")))
}

fn compile_opt(outlet: &str, css: Option<&String>) -> Result<Option<Selector>> {
    css.map(|css| compile(outlet, css)).transpose()
}

// ---------------------------------------------------------------------------
// SelectorOutlet
// ---------------------------------------------------------------------------

/// An [`Outlet`] whose pages are understood through CSS selectors.
pub struct SelectorOutlet {
    name: String,
    base_url: String,
    home: Url,
    language: String,
    blacklist: Vec<String>,
    article_pattern: Option<Regex>,
    selectors: Selectors,
    clients: LockedPool<Client>,
}

impl SelectorOutlet {
    /// Build an outlet from its configuration entry.
    pub fn from_config(config: &OutletConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NewsdeskError::Network(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(config, client)
    }

    /// Build an outlet whose pooled clients are clones of `client`.
    pub fn with_client(config: &OutletConfig, client: Client) -> Result<Self> {
        let name = config.name.as_str();
        let home_str = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let home = Url::parse(&home_str).map_err(|e| {
            NewsdeskError::config(format!("outlet '{name}': invalid base_url '{}': {e}", config.base_url))
        })?;
        let article_pattern = config
            .article_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| NewsdeskError::config(format!("outlet '{name}': invalid article_pattern: {e}")))?;

        let s = &config.selectors;
        let selectors = Selectors {
            title: compile(name, &s.title)?,
            content: compile(name, &s.content)?,
            paragraph: compile(name, "p")?,
            author: compile_opt(name, s.author.as_ref())?,
            tags: compile_opt(name, s.tags.as_ref())?,
            date: compile_opt(name, s.date.as_ref())?,
            comment_section: compile_opt(name, s.comment_section.as_ref())?,
            comment: compile_opt(name, s.comment.as_ref())?,
            comment_user: compile_opt(name, s.comment_user.as_ref())?,
            comment_text: compile_opt(name, s.comment_text.as_ref())?,
            link: compile(name, "a[href]")?,
        };

        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            home,
            language: config.language.clone(),
            blacklist: config.blacklist.clone(),
            article_pattern,
            selectors,
            clients: LockedPool::new(move || client.clone()),
        })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let client = self
            .clients
            .borrow()
            .map_err(|e| NewsdeskError::Network(format!("{url}: {e}")))?;
        debug!(outlet = %self.name, %url, "fetching");

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| NewsdeskError::Network(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NewsdeskError::Network(format!("{url}: HTTP {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| NewsdeskError::Network(format!("{url}: body read failed: {e}")))
    }

    fn is_article_link(&self, link: &str) -> bool {
        self.article_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(link))
    }

    /// Owned, non-blacklisted links on a page, deduplicated in document order.
    fn links_from(&self, body: &str, kind: FrontPageKind) -> Vec<String> {
        let doc = Html::parse_document(body);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for el in doc.select(&self.selectors.link) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
                continue;
            }
            let Ok(mut resolved) = self.home.join(href) else {
                continue;
            };
            resolved.set_fragment(None);
            let link = resolved.to_string();

            if link == self.home.as_str()
                || !self.owns_url(&link)
                || self.blacklist.iter().any(|b| b == &link)
            {
                continue;
            }
            let keep = match kind {
                FrontPageKind::All => true,
                FrontPageKind::Articles => self.is_article_link(&link),
                FrontPageKind::Sections => self.article_pattern.is_some() && !self.is_article_link(&link),
            };
            if keep && seen.insert(link.clone()) {
                links.push(link);
            }
        }
        links
    }

    fn parse_article(&self, url: &str, body: &str) -> Option<Article> {
        let doc = Html::parse_document(body);
        let sel = &self.selectors;

        let title = doc.select(&sel.title).next().map(|el| collapse(&el.text().collect::<String>()))?;
        let text = doc.select(&sel.content).next().map(|el| content_text(el, &sel.paragraph))?;
        if title.is_empty() || text.is_empty() {
            return None;
        }

        let author = first_text(&doc, sel.author.as_ref())
            .and_then(|raw| raw.lines().map(str::trim).find(|line| !line.is_empty()).map(str::to_string))
            .unwrap_or_default();
        let tags = sel
            .tags
            .as_ref()
            .and_then(|tags| doc.select(tags).next())
            .map(leaf_texts)
            .unwrap_or_default();
        let time_posted = parse_posted_time(&first_text(&doc, sel.date.as_ref()).unwrap_or_default());

        Some(Article {
            outlet_url: self.base_url.clone(),
            language: self.language.clone(),
            url: url.to_string(),
            word_count: u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX),
            title,
            author,
            text,
            tags,
            time_posted,
        })
    }

    fn parse_comments(&self, url: &str, body: &str) -> Vec<Comment> {
        let sel = &self.selectors;
        let (Some(section), Some(comment), Some(user), Some(text)) = (
            sel.comment_section.as_ref(),
            sel.comment.as_ref(),
            sel.comment_user.as_ref(),
            sel.comment_text.as_ref(),
        ) else {
            return Vec::new();
        };

        let doc = Html::parse_document(body);
        let Some(section) = doc.select(section).next() else {
            return Vec::new();
        };
        section
            .select(comment)
            .filter_map(|node| {
                let username = collapse(&node.select(user).next()?.text().collect::<String>());
                let text = collapse(&node.select(text).next()?.text().collect::<String>());
                Some(Comment {
                    outlet_url: self.base_url.clone(),
                    language: self.language.clone(),
                    url: url.to_string(),
                    username,
                    text,
                })
            })
            .collect()
    }
}

impl Outlet for SelectorOutlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    fn front_page_links<'a>(&'a self, query: &'a FrontPageQuery) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let body = self.fetch(self.home.as_str()).await?;
            Ok(self.links_from(&body, query.kind))
        })
    }

    fn article<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<Article>>> {
        Box::pin(async move {
            let body = self.fetch(url).await?;
            Ok(self.parse_article(url, &body))
        })
    }

    fn comments<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<Comment>>> {
        Box::pin(async move {
            let body = self.fetch(url).await?;
            Ok(self.parse_comments(url, &body))
        })
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(doc: &Html, selector: Option<&Selector>) -> Option<String> {
    let el = doc.select(selector?).next()?;
    Some(el.text().collect::<String>().trim().to_string())
}

/// Paragraphs under the content node, one per line. Falls back to the whole
/// node when it has no `<p>` children.
fn content_text(node: ElementRef<'_>, paragraph: &Selector) -> String {
    let paragraphs: Vec<String> = node
        .select(paragraph)
        .map(|p| collapse(&p.text().collect::<String>()))
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        collapse(&node.text().collect::<String>())
    } else {
        paragraphs.join("\n")
    }
}

/// Non-empty text leaves under `root`, lowercased. Script bodies are skipped.
fn leaf_texts(root: ElementRef<'_>) -> Vec<String> {
    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let in_script = node
                .parent()
                .and_then(|parent| parent.value().as_element().map(|el| el.name() == "script"))
                .unwrap_or(false);
            let text = text.trim();
            (!in_script && !text.is_empty()).then(|| text.to_lowercase())
        })
        .collect()
}

/// Parse `dd/mm/yyyy HH:MM GMT+h`. Anything unparseable maps to midnight today.
fn parse_posted_time(raw: &str) -> DateTime<Utc> {
    let today = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    let Some(caps) = DATE_RE.captures(raw.trim()) else {
        return today;
    };
    let Ok(local) = NaiveDateTime::parse_from_str(caps[1].trim(), "%d/%m/%Y %H:%M") else {
        return today;
    };
    let Ok(hours) = caps[4].parse::<i32>() else {
        return today;
    };
    let Some(seconds) = hours.checked_mul(3600) else {
        return today;
    };
    let seconds = if &caps[3] == "-" { -seconds } else { seconds };
    FixedOffset::east_opt(seconds)
        .and_then(|offset| offset.from_local_datetime(&local).single())
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or(today)
}
