//! The conductor's periodic work: harvest sessions and garbage collection.
//!
//! The only mutable scheduling state is [`Clocks`], kept under one mutex.
//! A running harvest parks `last_harvest` at a far-future sentinel so that no
//! second harvest starts. A generation counter lets the watchdog abandon a
//! stuck run: when the stale run eventually finishes it no longer owns the
//! clocks and leaves them alone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use newsdesk_harvester::Harvester;
use newsdesk_shared::{
    Article, ConductorSettings, FrontPageKind, FrontPageQuery, NewsdeskError, Result, SyncMode,
};
use newsdesk_storage::{InsertOutcome, Storage};
use newsdesk_sync::{Choker, FixedPool, Iterate};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::delegate::Summarizer;
use crate::grader::{Grader, lease};
use crate::journal::Journal;

pub(crate) const HEADER: &str = "Conductor";

/// Stored in `last_harvest`/`last_gc` while the corresponding job runs.
pub(crate) const SENTINEL: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

/// Characters stripped from extracted keywords.
const KEYWORD_NOISE: &str = r#"!@#$%^&*()-_=+~`{[}]\|;:"'<,>.?/"#;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one enrichment stage for one article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Pending,
    Done,
    Failed,
    Skipped,
}

/// Per-article completion record, keyed by URL in [`HarvestReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// Inserted now or already stored by an earlier harvest.
    pub stored: bool,
    pub keywords: StageOutcome,
    pub summary: StageOutcome,
}

/// Summary of a finished harvest.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub session_id: i64,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub insert_failures: usize,
    pub completion: BTreeMap<String, Completion>,
    /// False when the session row could not be marked finished.
    pub committed: bool,
    pub duration: Duration,
}

impl HarvestReport {
    pub fn keywords_done(&self) -> usize {
        self.count(|c| c.keywords == StageOutcome::Done)
    }

    pub fn summaries_done(&self) -> usize {
        self.count(|c| c.summary == StageOutcome::Done)
    }

    fn count(&self, pred: impl Fn(&Completion) -> bool) -> usize {
        self.completion.values().filter(|c| pred(c)).count()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Clocks {
    pub last_harvest: DateTime<Utc>,
    pub last_gc: DateTime<Utc>,
    pub open_session: Option<i64>,
    pub harvest_started: Option<DateTime<Utc>>,
    pub generation: u64,
}

impl Clocks {
    pub fn new(last_harvest: DateTime<Utc>) -> Self {
        Self {
            last_harvest,
            last_gc: DateTime::UNIX_EPOCH,
            open_session: None,
            harvest_started: None,
            generation: 0,
        }
    }

    /// Mark a harvest as running and return its generation.
    pub fn begin_harvest(&mut self, now: DateTime<Utc>) -> u64 {
        self.last_harvest = SENTINEL;
        self.harvest_started = Some(now);
        self.open_session = None;
        self.generation += 1;
        self.generation
    }

    pub fn harvest_in_flight(&self) -> bool {
        self.harvest_started.is_some()
    }

    /// Release the harvest clocks if `generation` still owns them.
    pub(crate) fn finish_harvest(&mut self, generation: u64, at: DateTime<Utc>) -> bool {
        if self.generation != generation {
            return false;
        }
        self.last_harvest = at;
        self.harvest_started = None;
        self.open_session = None;
        true
    }
}

/// Everything the daemon step, spawned jobs and the query surface share.
pub(crate) struct Shared {
    pub settings: ConductorSettings,
    pub harvester: Harvester,
    pub summarizer: Arc<dyn Summarizer>,
    pub grader: Grader,
    pub db: Arc<FixedPool<Storage>>,
    pub extractor_choker: Choker,
    pub summarizer_choker: Choker,
    pub journal: Journal,
    pub clocks: Mutex<Clocks>,
    pub runtime: tokio::runtime::Handle,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl Shared {
    pub fn clocks(&self) -> MutexGuard<'_, Clocks> {
        self.clocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Harvest
    // -----------------------------------------------------------------------

    /// Run a harvest claimed under `generation`, handling failure.
    pub async fn harvest(self: Arc<Self>, generation: u64) -> Result<HarvestReport> {
        match self.clone().run_pipeline(generation).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.journal
                    .exception(HEADER, "harvest failed, session left open", e.to_string());
                // Wait one full interval before trying again.
                self.clocks().finish_harvest(generation, Utc::now());
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(generation = generation))]
    async fn run_pipeline(self: Arc<Self>, generation: u64) -> Result<HarvestReport> {
        let started = Instant::now();
        let _watch = self.journal.stopwatch(HEADER, "harvest");

        let session_id = lease(&self.db).await?.create_session(Utc::now()).await?;
        {
            let mut clocks = self.clocks();
            if clocks.generation == generation {
                clocks.open_session = Some(session_id);
            }
        }
        self.journal
            .message(HEADER, format!("harvest session {session_id} opened"));

        let query = FrontPageQuery {
            kind: FrontPageKind::Articles,
            limit: self.settings.scrape_limit,
        };
        let articles: Vec<Arc<Article>> = self
            .harvester
            .harvest_all(&query)
            .await
            .into_iter()
            .map(Arc::new)
            .collect();
        let fetched = articles.len();

        // Persist.
        let mut handles = Vec::with_capacity(articles.len());
        for article in &articles {
            let shared = self.clone();
            let article = article.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match lease(&shared.db).await {
                    Ok(storage) => storage.insert_article(&article).await,
                    Err(e) => Err(e),
                };
                (article, outcome)
            }));
        }

        let mut completion = BTreeMap::new();
        let mut eligible = Vec::new();
        let (mut inserted, mut duplicates, mut insert_failures) = (0, 0, 0);
        for handle in handles {
            let (article, outcome) = handle
                .await
                .map_err(|e| NewsdeskError::Cancelled(format!("insert task: {e}")))?;
            let stored = match outcome {
                Ok(InsertOutcome::Inserted) => {
                    inserted += 1;
                    true
                }
                Ok(InsertOutcome::AlreadyPresent) => {
                    duplicates += 1;
                    true
                }
                Err(e) => {
                    insert_failures += 1;
                    self.journal.exception(
                        HEADER,
                        format!("failed to store {}", article.url),
                        e.to_string(),
                    );
                    false
                }
            };
            let stage = if stored {
                StageOutcome::Pending
            } else {
                self.journal.message(
                    HEADER,
                    format!("skipping enrichment for {}: article was not stored", article.url),
                );
                StageOutcome::Skipped
            };
            completion.insert(
                article.url.clone(),
                Completion {
                    stored,
                    keywords: stage,
                    summary: stage,
                },
            );
            if stored {
                eligible.push(article);
            }
        }
        info!(fetched, inserted, duplicates, insert_failures, "articles stored");

        // Enrich.
        match self.settings.sync_mode {
            SyncMode::Sequential => {
                let keywords = self.clone().extract_all(&eligible).await;
                apply(&mut completion, keywords, |c, outcome| c.keywords = outcome);
                let summaries = self.clone().summarize_all(&eligible).await;
                apply(&mut completion, summaries, |c, outcome| c.summary = outcome);
            }
            SyncMode::Dual => {
                for (url, keywords, summary) in self.clone().enrich_dual(&eligible).await {
                    if let Some(entry) = completion.get_mut(&url) {
                        entry.keywords = keywords;
                        entry.summary = summary;
                    }
                }
            }
        }

        // Commit.
        let ended = Utc::now();
        let affected = lease(&self.db).await?.commit_session(session_id, ended).await?;
        if affected == 0 {
            self.journal.warning(
                HEADER,
                format!("session {session_id} was not committed: no row affected"),
            );
        }
        if !self.clocks().finish_harvest(generation, ended) {
            warn!(generation, "harvest outlived its watchdog, clocks left untouched");
        }

        let report = HarvestReport {
            session_id,
            fetched,
            inserted,
            duplicates,
            insert_failures,
            completion,
            committed: affected > 0,
            duration: started.elapsed(),
        };
        self.journal.message(
            HEADER,
            format!(
                "harvest session {session_id} finished: {} articles, {} keyword sets, {} summaries",
                report.fetched,
                report.keywords_done(),
                report.summaries_done()
            ),
        );
        Ok(report)
    }

    async fn extract_all(self: Arc<Self>, articles: &[Arc<Article>]) -> Vec<(String, StageOutcome)> {
        let total = articles.len();
        let mut handles = Vec::with_capacity(total);
        for (index, article) in articles.iter().enumerate() {
            let shared = self.clone();
            let article = article.clone();
            handles.push(tokio::spawn(async move {
                let outcome = shared.extract_one(&article, index + 1, total).await;
                (article.url.clone(), outcome)
            }));
        }
        let results = join_stage(handles).await;
        self.stage_completed("keyword extraction", &results, total);
        results
    }

    async fn summarize_all(self: Arc<Self>, articles: &[Arc<Article>]) -> Vec<(String, StageOutcome)> {
        let total = articles.len();
        let mut handles = Vec::with_capacity(total);
        for (index, article) in articles.iter().enumerate() {
            let shared = self.clone();
            let article = article.clone();
            handles.push(tokio::spawn(async move {
                let outcome = shared.summarize_one(&article, index + 1, total).await;
                (article.url.clone(), outcome)
            }));
        }
        let results = join_stage(handles).await;
        self.stage_completed("summarization", &results, total);
        results
    }

    async fn enrich_dual(
        self: Arc<Self>,
        articles: &[Arc<Article>],
    ) -> Vec<(String, StageOutcome, StageOutcome)> {
        let total = articles.len();
        let mut handles = Vec::with_capacity(total);
        for (index, article) in articles.iter().enumerate() {
            let shared = self.clone();
            let article = article.clone();
            handles.push(tokio::spawn(async move {
                let (keywords, summary) = tokio::join!(
                    shared.extract_one(&article, index + 1, total),
                    shared.summarize_one(&article, index + 1, total),
                );
                (article.url.clone(), keywords, summary)
            }));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "enrichment task failed"),
            }
        }
        let keywords: Vec<_> = results.iter().map(|(url, k, _)| (url.clone(), *k)).collect();
        let summaries: Vec<_> = results.iter().map(|(url, _, s)| (url.clone(), *s)).collect();
        self.stage_completed("keyword extraction", &keywords, total);
        self.stage_completed("summarization", &summaries, total);
        results
    }

    fn stage_completed(&self, stage: &str, results: &[(String, StageOutcome)], total: usize) {
        let done = results
            .iter()
            .filter(|(_, outcome)| *outcome == StageOutcome::Done)
            .count();
        self.journal
            .message(HEADER, format!("{stage} completed: {done}/{total}"));
    }

    /// Extract, cleanse and store keywords for one article.
    pub async fn extract_one(&self, article: &Article, index: usize, total: usize) -> StageOutcome {
        self.journal.message(
            HEADER,
            format!("[{index}/{total}] extract_keywords starting ({})", article.url),
        );
        let started = Instant::now();
        let result = async {
            let keywords = self.extract_keywords(article).await?;
            let cleansed = cleanse_keywords(keywords);
            lease(&self.db).await?.insert_keywords(&article.url, &cleansed).await
        }
        .await;
        self.finish_call("extract_keywords", article, started, result.map(|_| ()))
    }

    /// Summarize and store one article.
    pub async fn summarize_one(&self, article: &Article, index: usize, total: usize) -> StageOutcome {
        self.journal.message(
            HEADER,
            format!("[{index}/{total}] summarize starting ({})", article.url),
        );
        let started = Instant::now();
        let result = async {
            let summary = self.summarize(article).await?;
            lease(&self.db).await?.insert_summary(&article.url, &summary).await
        }
        .await;
        self.finish_call("summarize", article, started, result.map(|_| ()))
    }

    fn finish_call(&self, function: &str, article: &Article, started: Instant, result: Result<()>) -> StageOutcome {
        match result {
            Ok(()) => {
                self.journal.message(
                    HEADER,
                    format!("{function} finished in {} ms", started.elapsed().as_millis()),
                );
                StageOutcome::Done
            }
            Err(e) => {
                self.journal.exception(
                    HEADER,
                    format!("{function} failed for {}", article.url),
                    e.to_string(),
                );
                StageOutcome::Failed
            }
        }
    }

    /// Keyword extraction gated by the extractor choker.
    pub async fn extract_keywords(&self, article: &Article) -> Result<HashMap<String, f64>> {
        let _permit = self
            .extractor_choker
            .enter()
            .await
            .map_err(|e| NewsdeskError::Cancelled(format!("extractor choker: {e}")))?;
        self.summarizer.extract_keywords(article).await
    }

    /// Summarization gated by the summarizer choker.
    pub async fn summarize(&self, article: &Article) -> Result<String> {
        let _permit = self
            .summarizer_choker
            .enter()
            .await
            .map_err(|e| NewsdeskError::Cancelled(format!("summarizer choker: {e}")))?;
        self.summarizer.summarize(article).await
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Delete articles older than one GC interval and return the affected
    /// rows. Failures are journaled and count as 0. Always refreshes `last_gc`.
    pub async fn collect_garbage(&self) -> u64 {
        let threshold = Utc::now() - delta(self.settings.gc_interval);
        let result = async { lease(&self.db).await?.collect_garbage(threshold).await }.await;
        self.clocks().last_gc = Utc::now();
        match result {
            Ok(0) => {
                debug!("garbage collection found nothing");
                0
            }
            Ok(affected) => {
                self.journal.message(
                    HEADER,
                    format!("garbage collection removed {affected} rows"),
                );
                affected
            }
            Err(e) => {
                self.journal
                    .exception(HEADER, "garbage collection failed", e.to_string());
                0
            }
        }
    }
}

/// Fold per-URL outcomes of one stage into the completion map.
fn apply(
    completion: &mut BTreeMap<String, Completion>,
    results: Vec<(String, StageOutcome)>,
    set: impl Fn(&mut Completion, StageOutcome),
) {
    for (url, outcome) in results {
        if let Some(entry) = completion.get_mut(&url) {
            set(entry, outcome);
        }
    }
}

async fn join_stage(handles: Vec<tokio::task::JoinHandle<(String, StageOutcome)>>) -> Vec<(String, StageOutcome)> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "enrichment task failed"),
        }
    }
    results
}

/// Strip punctuation noise, trim, and drop keywords left empty.
pub(crate) fn cleanse_keywords(keywords: HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut cleansed: Vec<(String, f64)> = keywords
        .into_iter()
        .filter_map(|(keyword, relevancy)| {
            let stripped: String = keyword.chars().filter(|c| !KEYWORD_NOISE.contains(*c)).collect();
            let trimmed = stripped.trim();
            (!trimmed.is_empty()).then(|| (trimmed.to_string(), relevancy))
        })
        .collect();
    cleansed.sort_by(|a, b| a.0.cmp(&b.0));
    cleansed.dedup_by(|a, b| a.0 == b.0);
    cleansed
}

// ---------------------------------------------------------------------------
// Daemon step
// ---------------------------------------------------------------------------

/// What one tick decided to start.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TickPlan {
    pub harvest: Option<u64>,
    pub gc: bool,
}

impl Shared {
    /// Advance the clocks for a tick at `now`.
    pub(crate) fn plan_tick(&self, now: DateTime<Utc>) -> TickPlan {
        let mut clocks = self.clocks();
        let mut plan = TickPlan::default();

        // Zero disables the watchdog.
        let watchdog = self.settings.harvest_watchdog;
        let stuck = clocks.harvest_started.filter(|started| {
            !watchdog.is_zero() && now.signed_duration_since(*started) >= delta(watchdog)
        });
        if let Some(started) = stuck {
            warn!(
                started = %started,
                session = ?clocks.open_session,
                "harvest exceeded its watchdog, scheduling a restart"
            );
            clocks.generation += 1;
            clocks.harvest_started = None;
            clocks.open_session = None;
            clocks.last_harvest = DateTime::UNIX_EPOCH;
        }

        if !clocks.harvest_in_flight()
            && now.signed_duration_since(clocks.last_harvest) >= delta(self.settings.harvest_interval)
        {
            plan.harvest = Some(clocks.begin_harvest(now));
        }

        if now.signed_duration_since(clocks.last_gc) >= delta(self.settings.gc_interval) {
            clocks.last_gc = SENTINEL;
            plan.gc = true;
        }
        plan
    }
}

/// [`Iterate`] adapter driving the conductor from its daemon.
pub(crate) struct Cycle {
    pub shared: Arc<Shared>,
}

impl Iterate for Cycle {
    fn iterate(&self) -> bool {
        let plan = self.shared.plan_tick(Utc::now());

        if let Some(generation) = plan.harvest {
            info!(generation, "harvest scheduled");
            let shared = self.shared.clone();
            self.shared.runtime.spawn(async move {
                // Failures are journaled inside.
                let _ = shared.harvest(generation).await;
            });
        }
        if plan.gc {
            let shared = self.shared.clone();
            self.shared.runtime.spawn(async move {
                shared.collect_garbage().await;
            });
        }
        true
    }

    fn on_stop(&self) {
        self.shared.journal.message(HEADER, "conductor stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_cleansed() {
        let raw = HashMap::from([
            ("\"inflation\"".to_string(), 0.5),
            ("  rates!?  ".to_string(), 0.3),
            ("...".to_string(), 0.1),
            ("hồ chí minh".to_string(), 0.1),
        ]);
        let cleansed = cleanse_keywords(raw);
        assert_eq!(
            cleansed,
            vec![
                ("hồ chí minh".to_string(), 0.1),
                ("inflation".to_string(), 0.5),
                ("rates".to_string(), 0.3),
            ]
        );
    }

    #[test]
    fn stale_generation_cannot_finish() {
        let mut clocks = Clocks::new(DateTime::UNIX_EPOCH);
        let first = clocks.begin_harvest(Utc::now());
        assert_eq!(clocks.last_harvest, SENTINEL);
        clocks.generation += 1;
        assert!(!clocks.finish_harvest(first, Utc::now()));
        assert_eq!(clocks.last_harvest, SENTINEL);

        let second = clocks.begin_harvest(Utc::now());
        let done = Utc::now();
        assert!(clocks.finish_harvest(second, done));
        assert_eq!(clocks.last_harvest, done);
        assert!(!clocks.harvest_in_flight());
    }
}
