//! Core domain types for Newsdesk.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Article
// ---------------------------------------------------------------------------

/// One scraped article, keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// Base URL of the outlet that published it.
    pub outlet_url: String,
    /// Language tag, e.g. `vi_VN`.
    pub language: String,
    /// Canonical article URL (primary key).
    pub url: String,
    pub title: String,
    pub author: String,
    /// Extracted body text.
    pub text: String,
    /// Lowercased tags attached by the outlet.
    #[serde(default)]
    pub tags: Vec<String>,
    pub time_posted: DateTime<Utc>,
    pub word_count: u32,
}

/// One reader comment under an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub outlet_url: String,
    pub language: String,
    /// URL of the article the comment belongs to.
    pub url: String,
    pub username: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Front page queries
// ---------------------------------------------------------------------------

/// Which links of a front page to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontPageKind {
    #[default]
    All,
    Articles,
    Sections,
}

/// Options for a front page scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontPageQuery {
    pub kind: FrontPageKind,
    /// Maximum number of articles fetched per outlet.
    pub limit: usize,
}

impl Default for FrontPageQuery {
    fn default() -> Self {
        Self {
            kind: FrontPageKind::All,
            limit: i32::MAX as usize,
        }
    }
}

// ---------------------------------------------------------------------------
// ScrapeSession
// ---------------------------------------------------------------------------

/// Bookkeeping record spanning one harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    /// [`DateTime::<Utc>::MAX_UTC`] while the session is still open.
    pub end_time: DateTime<Utc>,
    pub is_finished: bool,
}

impl ScrapeSession {
    /// End-time sentinel reported by unfinished sessions.
    pub const OPEN_END: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;
}

// ---------------------------------------------------------------------------
// Grading
// ---------------------------------------------------------------------------

/// What a grade or count query is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeTarget {
    Tags,
    Keywords,
    Articles,
}

impl std::str::FromStr for GradeTarget {
    type Err = crate::NewsdeskError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tags" => Ok(Self::Tags),
            "keywords" => Ok(Self::Keywords),
            "articles" => Ok(Self::Articles),
            other => Err(crate::NewsdeskError::validation(format!(
                "unknown grade target '{other}': expected tags, keywords or articles"
            ))),
        }
    }
}

/// Parameters of a relevancy grade or count query.
#[derive(Debug, Clone, PartialEq)]
pub struct GraderQuery {
    pub target: GradeTarget,
    /// Look-back window ending at `time_end`.
    pub window: Duration,
    /// End of the window. Defaults to now.
    pub time_end: Option<DateTime<Utc>>,
    /// Outlet base URLs to include. Empty means every configured outlet.
    pub outlets: Vec<String>,
    /// Tags weight override in `[0, 1)`. Zero keeps the configured weight.
    pub normalized_scale: f64,
    /// `LIKE` pattern for count queries over tags or keywords.
    pub selection: String,
}

impl GraderQuery {
    pub fn new(target: GradeTarget, window: Duration) -> Self {
        Self {
            target,
            window,
            time_end: None,
            outlets: Vec::new(),
            normalized_scale: 0.0,
            selection: "%".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Severity of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Message,
    Warning,
    Exception,
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Message => "message",
            Self::Warning => "warning",
            Self::Exception => "exception",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_serialization() {
        let article = Article {
            outlet_url: "https://news.example/".into(),
            language: "vi_VN".into(),
            url: "https://news.example/a.htm".into(),
            title: "Title".into(),
            author: "Author".into(),
            text: "Body text".into(),
            tags: vec!["economy".into()],
            time_posted: Utc::now(),
            word_count: 2,
        };

        let json = serde_json::to_string(&article).expect("serialize");
        let parsed: Article = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, article);
    }

    #[test]
    fn open_session_end_is_max() {
        assert_eq!(ScrapeSession::OPEN_END, DateTime::<Utc>::MAX_UTC);
        assert!(ScrapeSession::OPEN_END > Utc::now());
    }

    #[test]
    fn grade_target_parses_case_insensitively() {
        assert_eq!("Tags".parse::<GradeTarget>().unwrap(), GradeTarget::Tags);
        assert_eq!("articles".parse::<GradeTarget>().unwrap(), GradeTarget::Articles);
        assert!("topics".parse::<GradeTarget>().is_err());
    }

    #[test]
    fn default_front_page_query_is_unbounded() {
        let query = FrontPageQuery::default();
        assert_eq!(query.kind, FrontPageKind::All);
        assert_eq!(query.limit, i32::MAX as usize);
    }
}
