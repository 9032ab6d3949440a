//! Popularity grading over a time window.
//!
//! Tag and keyword relevancy is the share of all appearances inside the
//! window. An article's score mixes the relevancy of its tags and keywords
//! and is normalized so that all scores sum to one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use newsdesk_shared::{GradeTarget, GraderQuery, NewsdeskError, Result};
use newsdesk_storage::{Storage, Window};
use newsdesk_sync::{FixedPool, Lease};
use tracing::{instrument, warn};

use crate::journal::Journal;

/// Upper bound for a per-query tags weight override.
const MAX_NORMALIZED_SCALE: f64 = 0.998;

const HEADER: &str = "Grader";

/// Lease one connection from the shared database pool.
pub(crate) async fn lease(db: &FixedPool<Storage>) -> Result<Lease<Storage>> {
    db.acquire()
        .await
        .map_err(|e| NewsdeskError::Cancelled(format!("database pool: {e}")))
}

/// Grades and counts tags, keywords and articles.
#[derive(Clone)]
pub struct Grader {
    db: Arc<FixedPool<Storage>>,
    tags_weight: f64,
    journal: Journal,
}

/// Window bounds and outlets resolved from a query.
struct Span {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    outlets: Vec<String>,
}

impl Span {
    fn of(query: &GraderQuery) -> Result<Self> {
        let end = query.time_end.unwrap_or_else(Utc::now);
        let width = TimeDelta::from_std(query.window)
            .map_err(|_| NewsdeskError::validation("grading window is too large"))?;
        let begin = end
            .checked_sub_signed(width)
            .ok_or_else(|| NewsdeskError::validation("grading window reaches before the calendar"))?;
        Ok(Self {
            begin,
            end,
            outlets: query.outlets.clone(),
        })
    }

    fn window(&self) -> Window<'_> {
        Window {
            begin: self.begin,
            end: self.end,
            outlets: &self.outlets,
        }
    }
}

impl Grader {
    pub fn new(db: Arc<FixedPool<Storage>>, tags_weight: f64, journal: Journal) -> Self {
        Self {
            db,
            tags_weight,
            journal,
        }
    }

    pub fn tags_weight(&self) -> f64 {
        self.tags_weight
    }

    /// Relevancy per tag, keyword or article URL.
    #[instrument(skip_all, fields(target = ?query.target))]
    pub async fn grade(&self, query: &GraderQuery) -> Result<HashMap<String, f64>> {
        let span = Span::of(query)?;
        match query.target {
            GradeTarget::Tags => self.grade_tags(&span).await,
            GradeTarget::Keywords => self.grade_keywords(&span).await,
            GradeTarget::Articles => self.grade_articles(&span, query.normalized_scale).await,
        }
    }

    /// Appearances matching `query.selection` (articles ignore the selection).
    #[instrument(skip_all, fields(target = ?query.target))]
    pub async fn count(&self, query: &GraderQuery) -> Result<i64> {
        let span = Span::of(query)?;
        let _watch = self.journal.stopwatch(HEADER, "count");
        let storage = lease(&self.db).await?;
        match query.target {
            GradeTarget::Tags => storage.count_tags(&query.selection, &span.window()).await,
            GradeTarget::Keywords => storage.count_keywords(&query.selection, &span.window()).await,
            GradeTarget::Articles => storage.count_articles(&span.window()).await,
        }
    }

    async fn grade_tags(&self, span: &Span) -> Result<HashMap<String, f64>> {
        let _watch = self.journal.stopwatch(HEADER, "grade_tags");
        let tags = lease(&self.db).await?.window_tags(&span.window()).await?;
        Ok(relevancy(tags))
    }

    async fn grade_keywords(&self, span: &Span) -> Result<HashMap<String, f64>> {
        let _watch = self.journal.stopwatch(HEADER, "grade_keywords");
        let keywords = lease(&self.db).await?.window_keywords(&span.window()).await?;
        Ok(relevancy(keywords))
    }

    async fn grade_articles(&self, span: &Span, normalized_scale: f64) -> Result<HashMap<String, f64>> {
        let tags_weight = if normalized_scale == 0.0 {
            self.tags_weight
        } else {
            normalized_scale.clamp(0.0, MAX_NORMALIZED_SCALE)
        };
        let keywords_weight = 1.0 - tags_weight;

        let (tags_table, keywords_table) = tokio::try_join!(self.grade_tags(span), self.grade_keywords(span))?;
        let _watch = self.journal.stopwatch(HEADER, "grade_articles");
        let urls = lease(&self.db).await?.window_articles(&span.window()).await?;

        let tags_table = Arc::new(tags_table);
        let keywords_table = Arc::new(keywords_table);
        let outlets = Arc::new(span.outlets.clone());

        let mut handles = Vec::with_capacity(urls.len());
        for url in urls {
            let db = self.db.clone();
            let tags_table = tags_table.clone();
            let keywords_table = keywords_table.clone();
            let outlets = outlets.clone();
            let (begin, end) = (span.begin, span.end);
            handles.push(tokio::spawn(async move {
                let window = Window {
                    begin,
                    end,
                    outlets: &outlets,
                };
                let storage = lease(&db).await?;
                let tags = storage.window_article_tags(&url, &window).await?;
                let keywords = storage.window_article_keywords(&url, &window).await?;

                let tag_score: f64 = tags.iter().filter_map(|tag| tags_table.get(tag)).sum();
                let keyword_score: f64 = keywords
                    .iter()
                    .filter_map(|(keyword, weight)| keywords_table.get(keyword).map(|rel| weight * rel))
                    .sum();
                Ok::<_, NewsdeskError>((url, tag_score * tags_weight + keyword_score * keywords_weight))
            }));
        }

        let mut scores = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(score) => scores.push(score?),
                Err(e) => {
                    warn!(error = %e, "article grading task failed");
                    return Err(NewsdeskError::Cancelled(format!("article grading task: {e}")));
                }
            }
        }

        let total: f64 = scores.iter().map(|(_, score)| score).sum();
        let total = if total == 0.0 { 1.0 } else { total };
        Ok(scores.into_iter().map(|(url, score)| (url, score / total)).collect())
    }
}

/// Share of each distinct value among all appearances.
fn relevancy(values: Vec<String>) -> HashMap<String, f64> {
    let total = values.len();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(value, count)| (value, count as f64 / total as f64))
        .collect()
}
