//! The orchestration daemon and its query surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use newsdesk_harvester::Harvester;
use newsdesk_shared::{
    Article, ChokerLimit, ConductorSettings, FrontPageKind, FrontPageQuery, GraderQuery,
    NewsdeskError, Result, ScrapeSession,
};
use newsdesk_storage::{Storage, StorageSettings};
use newsdesk_sync::{Choker, Daemon, FixedPool, ResourcePool};
use tracing::{info, instrument};

use crate::cycle::{Clocks, Cycle, HEADER, HarvestReport, Shared};
use crate::delegate::Summarizer;
use crate::grader::{Grader, lease};
use crate::journal::Journal;

/// Owns the harvest/GC schedule, the database pool and the enrichment
/// chokers, and answers queries against the stored news.
pub struct Conductor {
    shared: Arc<Shared>,
    daemon: Option<Daemon>,
}

impl Conductor {
    /// Open everything and start the daemon loop.
    pub async fn start(
        settings: ConductorSettings,
        storage: StorageSettings,
        harvester: Harvester,
        summarizer: Arc<dyn Summarizer>,
        journal: Journal,
    ) -> Result<Self> {
        let mut conductor = Self::open(settings, storage, harvester, summarizer, journal).await?;
        let interval = conductor.shared.settings.loop_interval;
        conductor.daemon = Some(Daemon::start(
            "conductor",
            interval,
            Arc::new(Cycle {
                shared: conductor.shared.clone(),
            }),
        ));
        conductor.shared.journal.message(HEADER, "conductor online");
        Ok(conductor)
    }

    /// Open everything without a schedule. Harvests and GC then only run
    /// when requested.
    #[instrument(skip_all, fields(db = %storage.path.display()))]
    pub async fn open(
        settings: ConductorSettings,
        storage: StorageSettings,
        harvester: Harvester,
        summarizer: Arc<dyn Summarizer>,
        journal: Journal,
    ) -> Result<Self> {
        let first = Storage::open(storage).await?;
        let last_harvest = first
            .last_harvest_end()
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH);

        let pool_size = settings.db_pool_limit.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 1..pool_size {
            connections.push(first.fork().await?);
        }
        connections.push(first);
        let db = Arc::new(FixedPool::from_instances(connections));

        let extractor_choker = Choker::new("extractor", settings.extractor_limit);
        let summarizer_choker = match settings.summarizer_limit {
            ChokerLimit::Shared => Choker::shared("summarizer", &extractor_choker),
            ChokerLimit::Bounded(limit) => Choker::new("summarizer", limit),
        };
        let summarizer_label = if summarizer_choker.is_shared() {
            format!("{} (Shared)", summarizer_choker.capacity())
        } else {
            summarizer_choker.capacity().to_string()
        };
        info!(
            db_pool = pool_size,
            extractor = extractor_choker.capacity(),
            summarizer = %summarizer_label,
            sync_mode = ?settings.sync_mode,
            "conductor resources ready"
        );
        journal.message(
            HEADER,
            format!(
                "database pool: {pool_size}, extractor limit: {}, summarizer limit: {summarizer_label}",
                extractor_choker.capacity()
            ),
        );

        let grader = Grader::new(db.clone(), settings.tags_weight, journal.clone());
        let shared = Arc::new(Shared {
            settings,
            harvester,
            summarizer,
            grader,
            db,
            extractor_choker,
            summarizer_choker,
            journal,
            clocks: Mutex::new(Clocks::new(last_harvest)),
            runtime: tokio::runtime::Handle::current(),
        });
        Ok(Self {
            shared,
            daemon: None,
        })
    }

    pub fn settings(&self) -> &ConductorSettings {
        &self.shared.settings
    }

    pub fn harvester(&self) -> &Harvester {
        &self.shared.harvester
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    /// The daemon driving the schedule, if started with [`Conductor::start`].
    pub fn daemon(&self) -> Option<&Daemon> {
        self.daemon.as_ref()
    }

    // -----------------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------------

    /// When the next harvest is due. `MAX_UTC` while one is running.
    pub fn next_harvest_time(&self) -> DateTime<Utc> {
        let last = self.shared.clocks().last_harvest;
        chrono::TimeDelta::from_std(self.shared.settings.harvest_interval)
            .ok()
            .and_then(|interval| last.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Id of the session of the harvest in flight.
    pub fn open_session(&self) -> Option<i64> {
        self.shared.clocks().open_session
    }

    /// Run one harvest now and wait for it. Fails if one is already running.
    pub async fn run_harvest(&self) -> Result<HarvestReport> {
        let generation = {
            let mut clocks = self.shared.clocks();
            if clocks.harvest_in_flight() {
                return Err(NewsdeskError::validation("a harvest is already in progress"));
            }
            clocks.begin_harvest(Utc::now())
        };
        self.shared.clone().harvest(generation).await
    }

    /// Run garbage collection now. Returns affected rows, 0 when it failed.
    pub async fn run_garbage_collection(&self) -> u64 {
        self.shared.collect_garbage().await
    }

    /// Make the next tick start a harvest. Returns false when one is
    /// already running.
    pub async fn schedule_harvest_now(&self) -> Result<bool> {
        let shared = self.shared.clone();
        let rewind = move || {
            let mut clocks = shared.clocks();
            if clocks.harvest_in_flight() {
                return false;
            }
            clocks.last_harvest = DateTime::UNIX_EPOCH;
            true
        };
        match &self.daemon {
            Some(daemon) => daemon
                .dispatch(rewind)
                .map_err(|e| NewsdeskError::Cancelled(e.to_string()))?
                .await
                .map_err(|e| NewsdeskError::Cancelled(e.to_string())),
            None => Ok(rewind()),
        }
    }

    /// Stop the daemon, flush the journal and release the pools.
    ///
    /// Harvest or GC jobs still running lose their database access.
    pub async fn close(&self) {
        if let Some(daemon) = &self.daemon {
            daemon.stop().await;
        }
        self.shared.journal.message(HEADER, "conductor offline");
        self.shared.journal.sync().await;
        self.shared.extractor_choker.close();
        self.shared.summarizer_choker.close();
        self.shared.db.dispose();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    async fn storage(&self) -> Result<newsdesk_sync::Lease<Storage>> {
        lease(&self.shared.db).await
    }

    pub async fn summarized_text(&self, url: &str) -> Result<String> {
        self.storage()
            .await?
            .summary_of(url)
            .await?
            .ok_or_else(|| NewsdeskError::not_found(format!("summary of {url}")))
    }

    pub async fn article_tags(&self, url: &str) -> Result<Vec<String>> {
        self.storage().await?.tags_of(url).await
    }

    pub async fn article_keywords(&self, url: &str) -> Result<Vec<(String, f64)>> {
        self.storage().await?.keywords_of(url).await
    }

    pub async fn article(&self, url: &str) -> Result<Article> {
        self.storage()
            .await?
            .article(url)
            .await?
            .ok_or_else(|| NewsdeskError::not_found(format!("article {url}")))
    }

    pub async fn articles_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Article>> {
        self.storage().await?.articles_between(from, to).await
    }

    pub async fn latest_session(&self) -> Result<ScrapeSession> {
        self.storage()
            .await?
            .latest_session(None)
            .await?
            .ok_or_else(|| NewsdeskError::not_found("scrape session"))
    }

    pub async fn latest_session_by_state(&self, is_finished: bool) -> Result<ScrapeSession> {
        let state = if is_finished { "finished" } else { "unfinished" };
        self.storage()
            .await?
            .latest_session(Some(is_finished))
            .await?
            .ok_or_else(|| NewsdeskError::not_found(format!("{state} scrape session")))
    }

    pub async fn sessions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ScrapeSession>> {
        self.storage().await?.sessions_between(from, to, None).await
    }

    pub async fn sessions_between_by_state(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        is_finished: bool,
    ) -> Result<Vec<ScrapeSession>> {
        self.storage()
            .await?
            .sessions_between(from, to, Some(is_finished))
            .await
    }

    /// Scrape one outlet's front page outside the schedule. Nothing is stored.
    pub async fn scrape_outlet(&self, name: &str) -> Result<Vec<Article>> {
        let outlet = self
            .shared
            .harvester
            .outlet(name)
            .ok_or_else(|| NewsdeskError::not_found(format!("outlet '{name}'")))?;
        let query = FrontPageQuery {
            kind: FrontPageKind::Articles,
            limit: self.shared.settings.scrape_limit,
        };
        Ok(self.shared.harvester.aggregate_front_page(&outlet, &query).await)
    }

    /// Summarize without storing, through the summarizer choker.
    pub async fn summarize_article(&self, article: &Article) -> Result<String> {
        self.shared.summarize(article).await
    }

    /// Extract keywords without storing, through the extractor choker.
    pub async fn extract_keywords(&self, article: &Article) -> Result<HashMap<String, f64>> {
        self.shared.extract_keywords(article).await
    }

    /// Grade with outlets defaulting to every configured outlet.
    pub async fn grade(&self, query: &GraderQuery) -> Result<HashMap<String, f64>> {
        self.shared.grader.grade(&self.scoped(query)).await
    }

    pub async fn count(&self, query: &GraderQuery) -> Result<i64> {
        self.shared.grader.count(&self.scoped(query)).await
    }

    fn scoped(&self, query: &GraderQuery) -> GraderQuery {
        let mut query = query.clone();
        if query.outlets.is_empty() {
            query.outlets = self.shared.harvester.outlet_urls();
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeDelta;
    use newsdesk_harvester::{BoxFuture, Outlet};
    use newsdesk_shared::{Comment, GradeTarget, LogKind, SyncMode};
    use uuid::Uuid;

    use super::*;
    use crate::cycle::{SENTINEL, StageOutcome};
    use crate::journal::MemorySink;

    const BASE: &str = "https://daily.example/";
    const URL_A: &str = "https://daily.example/a.html";
    const URL_B: &str = "https://daily.example/b.html";

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    struct FakeOutlet {
        articles: Vec<Article>,
    }

    impl FakeOutlet {
        fn two_articles() -> Self {
            let now = Utc::now() - TimeDelta::minutes(10);
            let make = |url: &str, tags: &[&str], text: &str| Article {
                outlet_url: BASE.into(),
                language: "en_US".into(),
                url: url.into(),
                title: format!("title {url}"),
                author: "desk".into(),
                text: text.into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                time_posted: now,
                word_count: text.split_whitespace().count() as u32,
            };
            Self {
                articles: vec![
                    make(URL_A, &["economy", "rates"], "rates rise again"),
                    make(URL_B, &["economy"], "markets fall"),
                ],
            }
        }
    }

    impl Outlet for FakeOutlet {
        fn name(&self) -> &str {
            "daily"
        }

        fn base_url(&self) -> &str {
            BASE
        }

        fn language(&self) -> &str {
            "en_US"
        }

        fn blacklist(&self) -> &[String] {
            &[]
        }

        fn front_page_links<'a>(&'a self, _query: &'a FrontPageQuery) -> BoxFuture<'a, Result<Vec<String>>> {
            Box::pin(async move { Ok(self.articles.iter().map(|a| a.url.clone()).collect()) })
        }

        fn article<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<Article>>> {
            Box::pin(async move { Ok(self.articles.iter().find(|a| a.url == url).cloned()) })
        }

        fn comments<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Vec<Comment>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    #[derive(Default)]
    struct FakeSummarizer {
        failing_extraction: HashSet<String>,
        extractions: AtomicUsize,
        summaries: AtomicUsize,
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeSummarizer {
        async fn busy(&self) {
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Summarizer for FakeSummarizer {
        fn summarize<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.busy().await;
                self.summaries.fetch_add(1, Ordering::SeqCst);
                Ok(format!("summary of {}", article.title))
            })
        }

        fn extract_keywords<'a>(&'a self, article: &'a Article) -> BoxFuture<'a, Result<HashMap<String, f64>>> {
            Box::pin(async move {
                self.busy().await;
                self.extractions.fetch_add(1, Ordering::SeqCst);
                if self.failing_extraction.contains(&article.url) {
                    return Err(NewsdeskError::Delegate(format!(
                        "{}: HTTP request failed with status 500 Internal Server Error",
                        article.url
                    )));
                }
                Ok(article
                    .text
                    .split_whitespace()
                    .map(|word| (format!("{word}!"), 1.0 / word.len() as f64))
                    .collect())
            })
        }
    }

    fn settings(sync_mode: SyncMode) -> ConductorSettings {
        ConductorSettings {
            harvest_interval: Duration::from_secs(3600),
            gc_interval: Duration::from_secs(7 * 24 * 3600),
            db_pool_limit: 4,
            extractor_limit: 2,
            summarizer_limit: ChokerLimit::Bounded(2),
            tags_weight: 0.5,
            sync_mode,
            scrape_limit: usize::MAX,
            loop_interval: Duration::from_millis(10),
            harvest_watchdog: Duration::from_secs(3600),
        }
    }

    struct Fixture {
        conductor: Conductor,
        summarizer: Arc<FakeSummarizer>,
        sink: MemorySink,
    }

    async fn fixture(settings: ConductorSettings, summarizer: FakeSummarizer) -> Fixture {
        let tmp = std::env::temp_dir().join(format!("nd_test_{}.db", Uuid::now_v7()));
        let summarizer = Arc::new(summarizer);
        let sink = MemorySink::new();
        let journal = Journal::new(vec![Arc::new(sink.clone())]);
        let conductor = Conductor::open(
            settings,
            StorageSettings::new(tmp),
            Harvester::new(vec![Arc::new(FakeOutlet::two_articles())]),
            summarizer.clone(),
            journal,
        )
        .await
        .expect("open conductor");
        Fixture {
            conductor,
            summarizer,
            sink,
        }
    }

    /// Everything a harvest leaves behind, in comparable form.
    async fn stored_state(conductor: &Conductor) -> Vec<(String, Vec<String>, Vec<String>, Option<String>)> {
        let mut state = Vec::new();
        for url in [URL_A, URL_B] {
            let tags = conductor.article_tags(url).await.unwrap();
            let keywords = conductor
                .article_keywords(url)
                .await
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            let summary = conductor.summarized_text(url).await.ok();
            state.push((url.to_string(), tags, keywords, summary));
        }
        state
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_article_harvest() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        let report = f.conductor.run_harvest().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.inserted, 2);
        assert!(report.committed);
        assert_eq!(report.keywords_done(), 2);
        assert_eq!(report.summaries_done(), 2);

        let session = f.conductor.latest_session_by_state(true).await.unwrap();
        assert_eq!(session.id, report.session_id);
        assert!(session.end_time < ScrapeSession::OPEN_END);
        assert!(f.conductor.next_harvest_time() > Utc::now());
        assert!(f.conductor.open_session().is_none());

        let article = f.conductor.article(URL_A).await.unwrap();
        assert_eq!(article.tags, vec!["economy", "rates"]);
        let mut keywords: Vec<_> = f
            .conductor
            .article_keywords(URL_A)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keywords.sort();
        assert_eq!(keywords, vec!["again", "rates", "rise"]);
        assert_eq!(
            f.conductor.summarized_text(URL_B).await.unwrap(),
            format!("summary of title {URL_B}")
        );

        f.conductor.close().await;
    }

    #[tokio::test]
    async fn failed_extraction_is_journaled_and_isolated() {
        let summarizer = FakeSummarizer {
            failing_extraction: HashSet::from([URL_A.to_string()]),
            ..FakeSummarizer::default()
        };
        let f = fixture(settings(SyncMode::Dual), summarizer).await;
        let report = f.conductor.run_harvest().await.unwrap();

        assert_eq!(report.completion[URL_A].keywords, StageOutcome::Failed);
        assert_eq!(report.completion[URL_A].summary, StageOutcome::Done);
        assert_eq!(report.completion[URL_B].keywords, StageOutcome::Done);
        assert!(report.committed);

        assert!(f.conductor.article_keywords(URL_A).await.unwrap().is_empty());
        assert!(!f.conductor.article_keywords(URL_B).await.unwrap().is_empty());
        assert!(f.conductor.summarized_text(URL_A).await.is_ok());

        f.conductor.journal().sync().await;
        let entries = f.sink.entries();
        let failure = entries
            .iter()
            .find(|e| e.kind == LogKind::Exception)
            .expect("exception entry");
        assert!(failure.message.contains(URL_A));
        assert!(failure.metadata.as_deref().unwrap_or("").contains("500"));
        assert!(
            entries
                .iter()
                .any(|e| e.message == "keyword extraction completed: 1/2")
        );

        f.conductor.close().await;
    }

    #[tokio::test]
    async fn harvest_is_idempotent() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        f.conductor.run_harvest().await.unwrap();
        let first = stored_state(&f.conductor).await;

        let again = f.conductor.run_harvest().await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 2);
        assert!(again.completion.values().all(|c| c.stored));
        assert_eq!(stored_state(&f.conductor).await, first);

        let sessions = f
            .conductor
            .sessions_between_by_state(Utc::now() - TimeDelta::hours(1), Utc::now(), true)
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);

        f.conductor.close().await;
    }

    #[tokio::test]
    async fn sequential_and_dual_store_the_same_state() {
        let dual = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        let sequential = fixture(settings(SyncMode::Sequential), FakeSummarizer::default()).await;
        dual.conductor.run_harvest().await.unwrap();
        sequential.conductor.run_harvest().await.unwrap();

        assert_eq!(
            stored_state(&dual.conductor).await,
            stored_state(&sequential.conductor).await
        );
        dual.conductor.close().await;
        sequential.conductor.close().await;
    }

    #[tokio::test]
    async fn shared_choker_bounds_both_stages() {
        let mut s = settings(SyncMode::Dual);
        s.extractor_limit = 1;
        s.summarizer_limit = ChokerLimit::Shared;
        let f = fixture(s, FakeSummarizer::default()).await;
        f.conductor.run_harvest().await.unwrap();

        assert_eq!(f.summarizer.peak.load(Ordering::SeqCst), 1);
        assert_eq!(f.summarizer.extractions.load(Ordering::SeqCst), 2);
        assert_eq!(f.summarizer.summaries.load(Ordering::SeqCst), 2);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        assert!(f.conductor.latest_session().await.unwrap_err().is_not_found());

        f.conductor.run_harvest().await.unwrap();
        let err = f.conductor.latest_session_by_state(false).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(f.conductor.article("https://daily.example/zzz").await.unwrap_err().is_not_found());
        assert!(f.conductor.summarized_text("https://daily.example/zzz").await.unwrap_err().is_not_found());
        assert!(f.conductor.scrape_outlet("nope").await.unwrap_err().is_not_found());

        f.conductor.close().await;
    }

    #[tokio::test]
    async fn ad_hoc_operations_do_not_store() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        let scraped = f.conductor.scrape_outlet("daily").await.unwrap();
        assert_eq!(scraped.len(), 2);

        let summary = f.conductor.summarize_article(&scraped[0]).await.unwrap();
        assert!(summary.starts_with("summary of"));
        assert!(!f.conductor.extract_keywords(&scraped[0]).await.unwrap().is_empty());
        assert!(f.conductor.article(&scraped[0].url).await.is_err());

        f.conductor.close().await;
    }

    #[tokio::test]
    async fn grade_defaults_to_configured_outlets() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        f.conductor.run_harvest().await.unwrap();

        let tags = f
            .conductor
            .grade(&GraderQuery::new(GradeTarget::Tags, Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!((tags["economy"] - 2.0 / 3.0).abs() < 1e-9);

        let articles = f
            .conductor
            .count(&GraderQuery::new(GradeTarget::Articles, Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(articles, 2);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn garbage_collection_uses_the_gc_interval() {
        let mut s = settings(SyncMode::Dual);
        s.gc_interval = Duration::from_secs(60);
        let f = fixture(s, FakeSummarizer::default()).await;
        f.conductor.run_harvest().await.unwrap();

        // Articles were posted ten minutes ago, beyond the one minute interval.
        let affected = f.conductor.run_garbage_collection().await;
        assert!(affected >= 2);
        assert!(f.conductor.article(URL_A).await.unwrap_err().is_not_found());
        assert_eq!(f.conductor.run_garbage_collection().await, 0);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn garbage_collection_failure_is_journaled() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        f.conductor.shared.db.dispose();

        assert_eq!(f.conductor.run_garbage_collection().await, 0);
        assert!(f.conductor.shared.clocks().last_gc < SENTINEL);

        f.conductor.journal().sync().await;
        let failure = f
            .sink
            .entries()
            .into_iter()
            .find(|e| e.kind == LogKind::Exception)
            .expect("exception entry");
        assert_eq!(failure.message, "garbage collection failed");
        f.conductor.close().await;
    }

    // -----------------------------------------------------------------------
    // Tick planning
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn zero_interval_harvests_on_first_tick() {
        let mut s = settings(SyncMode::Dual);
        s.harvest_interval = Duration::ZERO;
        let f = fixture(s, FakeSummarizer::default()).await;
        let now = Utc::now();

        let plan = f.conductor.shared.plan_tick(now);
        assert_eq!(plan.harvest, Some(1));
        assert!(plan.gc);
        {
            let clocks = f.conductor.shared.clocks();
            assert_eq!(clocks.last_harvest, SENTINEL);
            assert_eq!(clocks.last_gc, SENTINEL);
            assert_eq!(clocks.harvest_started, Some(now));
        }

        // The harvest is still in flight and GC is parked at the sentinel.
        let plan = f.conductor.shared.plan_tick(now + TimeDelta::seconds(1));
        assert_eq!(plan.harvest, None);
        assert!(!plan.gc);
        assert_eq!(f.conductor.next_harvest_time(), DateTime::<Utc>::MAX_UTC);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn watchdog_abandons_a_stuck_harvest() {
        let mut s = settings(SyncMode::Dual);
        s.harvest_watchdog = Duration::from_secs(60);
        let f = fixture(s, FakeSummarizer::default()).await;
        let start = Utc::now();

        let stuck = f.conductor.shared.plan_tick(start).harvest.expect("first harvest");
        assert_eq!(f.conductor.shared.plan_tick(start + TimeDelta::seconds(30)).harvest, None);

        let later = start + TimeDelta::seconds(61);
        let restarted = f
            .conductor
            .shared
            .plan_tick(later)
            .harvest
            .expect("restarted harvest");
        assert_eq!(restarted, stuck + 2);

        let mut clocks = f.conductor.shared.clocks();
        assert_eq!(clocks.harvest_started, Some(later));
        assert!(!clocks.finish_harvest(stuck, later));
        assert_eq!(clocks.last_harvest, SENTINEL);
        assert!(clocks.finish_harvest(restarted, later));
        assert_eq!(clocks.last_harvest, later);
        drop(clocks);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn zero_watchdog_never_restarts() {
        let mut s = settings(SyncMode::Dual);
        s.harvest_watchdog = Duration::ZERO;
        let f = fixture(s, FakeSummarizer::default()).await;
        let now = Utc::now();

        let plans: Vec<Option<u64>> = (0..4)
            .map(|_| f.conductor.shared.plan_tick(now).harvest)
            .collect();
        assert_eq!(plans, vec![Some(1), None, None, None]);
        assert_eq!(f.conductor.shared.clocks().generation, 1);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn gc_waits_for_its_run_to_refresh_the_clock() {
        let f = fixture(settings(SyncMode::Dual), FakeSummarizer::default()).await;
        let now = Utc::now();
        let week_later = now + TimeDelta::days(8);

        assert!(f.conductor.shared.plan_tick(now).gc);
        assert!(!f.conductor.shared.plan_tick(week_later).gc);
        assert_eq!(f.conductor.shared.clocks().last_gc, SENTINEL);

        f.conductor.run_garbage_collection().await;
        let refreshed = f.conductor.shared.clocks().last_gc;
        assert!(refreshed >= now && refreshed < SENTINEL);
        assert!(!f.conductor.shared.plan_tick(refreshed).gc);
        assert!(f.conductor.shared.plan_tick(week_later).gc);
        f.conductor.close().await;
    }

    #[tokio::test]
    async fn daemon_harvests_on_schedule() {
        let tmp = std::env::temp_dir().join(format!("nd_test_{}.db", Uuid::now_v7()));
        let conductor = Conductor::start(
            settings(SyncMode::Dual),
            StorageSettings::new(tmp),
            Harvester::new(vec![Arc::new(FakeOutlet::two_articles())]),
            Arc::new(FakeSummarizer::default()),
            Journal::default(),
        )
        .await
        .unwrap();

        let mut finished = None;
        for _ in 0..300 {
            if let Ok(session) = conductor.latest_session_by_state(true).await {
                finished = Some(session);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let first = finished.expect("scheduled harvest finished");

        // The next harvest is an hour away until explicitly requested.
        assert!(conductor.next_harvest_time() > Utc::now() + TimeDelta::minutes(30));
        assert!(conductor.schedule_harvest_now().await.unwrap());

        let mut second = None;
        for _ in 0..300 {
            let latest = conductor.latest_session_by_state(true).await.unwrap();
            if latest.id != first.id {
                second = Some(latest);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(second.is_some());

        conductor.close().await;
        assert!(conductor.latest_session().await.is_err());
    }
}
