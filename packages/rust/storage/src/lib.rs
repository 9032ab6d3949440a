//! libSQL storage layer for harvested news.
//!
//! A [`Storage`] wraps one connection to the shared database file. The
//! conductor keeps several of them in a fixed pool, created with
//! [`Storage::fork`]. Every operation runs through a retry helper that
//! reconnects on transient failures (locked/busy database, I/O errors) and
//! gives up with [`NewsdeskError::ConnectionTimeout`] after a capped number
//! of attempts.

mod migrations;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, TransactionBehavior, params};
use newsdesk_shared::{Article, DatabaseConfig, NewsdeskError, Result, ScrapeSession};
use tracing::{debug, warn};

/// Connection and retry settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub path: PathBuf,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect.
    pub reconnect_delay: Duration,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl StorageSettings {
    /// Settings with default retry behavior for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(100),
            busy_timeout: Duration::from_millis(5000),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self {
            path: config.resolved_path()?,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        })
    }
}

/// Result of inserting an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The URL was already stored. Treated as success by callers.
    AlreadyPresent,
}

/// Storage handle owning one libSQL connection.
pub struct Storage {
    db: Arc<Database>,
    conn: Mutex<Connection>,
    settings: Arc<StorageSettings>,
}

impl Storage {
    /// Open or create the database, apply pending migrations, and return the
    /// first connection.
    pub async fn open(settings: StorageSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| NewsdeskError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(&settings.path)
            .build()
            .await
            .map_err(|e| NewsdeskError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| NewsdeskError::Storage(e.to_string()))?;
        configure(&conn, settings.busy_timeout)
            .await
            .map_err(|e| NewsdeskError::Storage(e.to_string()))?;

        let storage = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
            settings: Arc::new(settings),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Another connection to the same database.
    pub async fn fork(&self) -> Result<Self> {
        let conn = self
            .db
            .connect()
            .map_err(|e| NewsdeskError::Storage(e.to_string()))?;
        configure(&conn, self.settings.busy_timeout)
            .await
            .map_err(|e| NewsdeskError::Storage(e.to_string()))?;
        Ok(Self {
            db: self.db.clone(),
            conn: Mutex::new(conn),
            settings: self.settings.clone(),
        })
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.connection();

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    NewsdeskError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .connection()
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    fn connection(&self) -> Connection {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn reconnect(&self) {
        let fresh = match self.db.connect() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                return;
            }
        };
        if let Err(e) = configure(&fresh, self.settings.busy_timeout).await {
            warn!(error = %e, "failed to configure fresh connection");
            return;
        }
        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Run `attempt` against the current connection, reconnecting and
    /// retrying on transient failures.
    async fn retrying<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = libsql::Result<T>>,
    {
        let mut failures: u32 = 0;
        loop {
            match attempt(self.connection()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    failures += 1;
                    if failures > self.settings.max_reconnect_attempts {
                        warn!(op, attempts = failures, error = %e, "storage retries exhausted");
                        return Err(NewsdeskError::ConnectionTimeout {
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }
                    debug!(op, attempt = failures, error = %e, "transient storage failure, reconnecting");
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                    self.reconnect().await;
                }
                Err(e) => return Err(NewsdeskError::Storage(format!("{op}: {e}"))),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Open a session starting at `start`. Returns its id.
    pub async fn create_session(&self, start: DateTime<Utc>) -> Result<i64> {
        let start = millis(start);
        let open_end = millis(ScrapeSession::OPEN_END);
        self.retrying("create_session", |conn| async move {
            let mut rows = conn
                .query(
                    "INSERT INTO scrape_sessions (time_initialized, time_end, is_finished)
                     VALUES (?1, ?2, 0) RETURNING id",
                    params![start, open_end],
                )
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0),
                None => Err(libsql::Error::QueryReturnedNoRows),
            }
        })
        .await
    }

    /// Mark a session finished at `end`. Returns affected rows.
    pub async fn commit_session(&self, id: i64, end: DateTime<Utc>) -> Result<u64> {
        let end = millis(end);
        self.retrying("commit_session", |conn| async move {
            conn.execute(
                "UPDATE scrape_sessions SET time_end = ?1, is_finished = 1 WHERE id = ?2",
                params![end, id],
            )
            .await
        })
        .await
    }

    /// Most recent session, optionally restricted to one state.
    pub async fn latest_session(&self, is_finished: Option<bool>) -> Result<Option<ScrapeSession>> {
        let mut sessions = self
            .retrying("latest_session", |conn| async move {
                let rows = match is_finished {
                    None => {
                        conn.query(
                            "SELECT id, time_initialized, time_end, is_finished FROM scrape_sessions
                             ORDER BY time_initialized DESC, id DESC LIMIT 1",
                            params![],
                        )
                        .await?
                    }
                    Some(state) => {
                        conn.query(
                            "SELECT id, time_initialized, time_end, is_finished FROM scrape_sessions
                             WHERE is_finished = ?1
                             ORDER BY time_initialized DESC, id DESC LIMIT 1",
                            params![state as i64],
                        )
                        .await?
                    }
                };
                collect_sessions(rows).await
            })
            .await?;
        Ok(sessions.pop())
    }

    /// Sessions started in `(from, to]`, oldest first.
    pub async fn sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        is_finished: Option<bool>,
    ) -> Result<Vec<ScrapeSession>> {
        let (from, to) = (millis(from), millis(to));
        self.retrying("sessions_between", |conn| async move {
            let rows = match is_finished {
                None => {
                    conn.query(
                        "SELECT id, time_initialized, time_end, is_finished FROM scrape_sessions
                         WHERE time_initialized > ?1 AND time_initialized <= ?2
                         ORDER BY time_initialized, id",
                        params![from, to],
                    )
                    .await?
                }
                Some(state) => {
                    conn.query(
                        "SELECT id, time_initialized, time_end, is_finished FROM scrape_sessions
                         WHERE time_initialized > ?1 AND time_initialized <= ?2 AND is_finished = ?3
                         ORDER BY time_initialized, id",
                        params![from, to, state as i64],
                    )
                    .await?
                }
            };
            collect_sessions(rows).await
        })
        .await
    }

    /// End time of the latest finished session, used to seed the harvest clock.
    pub async fn last_harvest_end(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .latest_session(Some(true))
            .await?
            .map(|session| session.end_time))
    }

    // -----------------------------------------------------------------------
    // Articles
    // -----------------------------------------------------------------------

    /// Insert an article with its tags in one transaction.
    ///
    /// An already-stored URL rolls back and reports
    /// [`InsertOutcome::AlreadyPresent`].
    pub async fn insert_article(&self, article: &Article) -> Result<InsertOutcome> {
        let posted = millis(article.time_posted);
        let word_count = i64::from(article.word_count);
        self.retrying("insert_article", |conn| async move {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .await?;
            let inserted = tx
                .execute(
                    "INSERT INTO scrape_results
                     (url, outlet_url, language, title, author, time_posted, original_text, word_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        article.url.as_str(),
                        article.outlet_url.as_str(),
                        article.language.as_str(),
                        article.title.as_str(),
                        article.author.as_str(),
                        posted,
                        article.text.as_str(),
                        word_count
                    ],
                )
                .await;
            match inserted {
                Ok(_) => {}
                Err(e) if is_duplicate(&e) => {
                    tx.rollback().await?;
                    return Ok(InsertOutcome::AlreadyPresent);
                }
                Err(e) => return Err(e),
            }

            for tag in &article.tags {
                tx.execute(
                    "INSERT INTO article_tags (tag) VALUES (?1) ON CONFLICT DO NOTHING",
                    params![tag.as_str()],
                )
                .await?;
                tx.execute(
                    "INSERT INTO tags_used (article_url, tag) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                    params![article.url.as_str(), tag.as_str()],
                )
                .await?;
            }
            tx.commit().await?;
            Ok(InsertOutcome::Inserted)
        })
        .await
    }

    /// Store extracted keywords for an article. Returns newly stored pairs.
    pub async fn insert_keywords(&self, article_url: &str, keywords: &[(String, f64)]) -> Result<u64> {
        self.retrying("insert_keywords", |conn| async move {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .await?;
            let mut stored = 0;
            for (keyword, relevancy) in keywords {
                tx.execute(
                    "INSERT INTO unique_keywords (keyword) VALUES (?1) ON CONFLICT DO NOTHING",
                    params![keyword.as_str()],
                )
                .await?;
                stored += tx
                    .execute(
                        "INSERT INTO extracted_keywords (article_url, keyword, relevancy)
                         VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
                        params![article_url, keyword.as_str(), *relevancy],
                    )
                    .await?;
            }
            tx.commit().await?;
            Ok(stored)
        })
        .await
    }

    /// Store a summary. Returns false when one already existed.
    pub async fn insert_summary(&self, article_url: &str, summary: &str) -> Result<bool> {
        let affected = self
            .retrying("insert_summary", |conn| async move {
                conn.execute(
                    "INSERT INTO summarization_results (article_url, summarized_text)
                     VALUES (?1, ?2) ON CONFLICT DO NOTHING",
                    params![article_url, summary],
                )
                .await
            })
            .await?;
        Ok(affected > 0)
    }

    /// Look up one article with its tags.
    pub async fn article(&self, url: &str) -> Result<Option<Article>> {
        let found = self
            .retrying("article", |conn| async move {
                let rows = conn
                    .query(
                        "SELECT url, outlet_url, language, title, author, time_posted, original_text, word_count
                         FROM scrape_results WHERE url = ?1",
                        params![url],
                    )
                    .await?;
                collect_articles(rows).await
            })
            .await?;
        let Some(mut article) = found.into_iter().next() else {
            return Ok(None);
        };
        article.tags = self.tags_of(url).await?;
        Ok(Some(article))
    }

    /// Articles posted in `(from, to]`, with tags.
    pub async fn articles_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Article>> {
        let (from, to) = (millis(from), millis(to));
        let (mut articles, tags) = self
            .retrying("articles_between", |conn| async move {
                let rows = conn
                    .query(
                        "SELECT url, outlet_url, language, title, author, time_posted, original_text, word_count
                         FROM scrape_results WHERE time_posted > ?1 AND time_posted <= ?2
                         ORDER BY time_posted",
                        params![from, to],
                    )
                    .await?;
                let articles = collect_articles(rows).await?;

                let mut rows = conn
                    .query(
                        "SELECT tags_used.article_url, tags_used.tag FROM tags_used
                         INNER JOIN scrape_results ON scrape_results.url = tags_used.article_url
                         WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted <= ?2",
                        params![from, to],
                    )
                    .await?;
                let mut tags: HashMap<String, Vec<String>> = HashMap::new();
                while let Some(row) = rows.next().await? {
                    tags.entry(row.get::<String>(0)?)
                        .or_default()
                        .push(row.get::<String>(1)?);
                }
                Ok((articles, tags))
            })
            .await?;

        let mut tags = tags;
        for article in &mut articles {
            article.tags = tags.remove(&article.url).unwrap_or_default();
        }
        Ok(articles)
    }

    pub async fn tags_of(&self, url: &str) -> Result<Vec<String>> {
        self.retrying("tags_of", |conn| async move {
            let rows = conn
                .query(
                    "SELECT tag FROM tags_used WHERE article_url = ?1 ORDER BY tag",
                    params![url],
                )
                .await?;
            collect_strings(rows).await
        })
        .await
    }

    pub async fn keywords_of(&self, url: &str) -> Result<Vec<(String, f64)>> {
        self.retrying("keywords_of", |conn| async move {
            let rows = conn
                .query(
                    "SELECT keyword, relevancy FROM extracted_keywords WHERE article_url = ?1
                     ORDER BY relevancy DESC, keyword",
                    params![url],
                )
                .await?;
            collect_weighted(rows).await
        })
        .await
    }

    pub async fn summary_of(&self, url: &str) -> Result<Option<String>> {
        let mut found = self
            .retrying("summary_of", |conn| async move {
                let rows = conn
                    .query(
                        "SELECT summarized_text FROM summarization_results WHERE article_url = ?1",
                        params![url],
                    )
                    .await?;
                collect_strings(rows).await
            })
            .await?;
        Ok(found.pop())
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Delete articles posted before `threshold` and everything referencing
    /// them, in one transaction. Returns affected rows.
    pub async fn collect_garbage(&self, threshold: DateTime<Utc>) -> Result<u64> {
        let threshold = millis(threshold);
        self.retrying("collect_garbage", |conn| async move {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .await?;
            let mut affected = 0;
            for table in ["tags_used", "extracted_keywords", "summarization_results"] {
                affected += tx
                    .execute(
                        &format!(
                            "DELETE FROM {table} WHERE article_url IN
                             (SELECT url FROM scrape_results WHERE time_posted < ?1)"
                        ),
                        params![threshold],
                    )
                    .await?;
            }
            affected += tx
                .execute(
                    "DELETE FROM scrape_results WHERE time_posted < ?1",
                    params![threshold],
                )
                .await?;
            tx.commit().await?;
            Ok(affected)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Grading windows
    // -----------------------------------------------------------------------

    /// Every tag use on articles inside the window (one entry per use).
    pub async fn window_tags(&self, window: &Window<'_>) -> Result<Vec<String>> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("window_tags", |conn| async move {
            let rows = conn
                .query(
                    "SELECT tags_used.tag FROM scrape_results
                     INNER JOIN tags_used ON scrape_results.url = tags_used.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?3))",
                    params![begin, end, outlets],
                )
                .await?;
            collect_strings(rows).await
        })
        .await
    }

    /// Every extracted keyword on articles inside the window.
    pub async fn window_keywords(&self, window: &Window<'_>) -> Result<Vec<String>> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("window_keywords", |conn| async move {
            let rows = conn
                .query(
                    "SELECT extracted_keywords.keyword FROM scrape_results
                     INNER JOIN extracted_keywords ON scrape_results.url = extracted_keywords.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?3))",
                    params![begin, end, outlets],
                )
                .await?;
            collect_strings(rows).await
        })
        .await
    }

    /// URLs of articles inside the window.
    pub async fn window_articles(&self, window: &Window<'_>) -> Result<Vec<String>> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("window_articles", |conn| async move {
            let rows = conn
                .query(
                    "SELECT url FROM scrape_results
                     WHERE time_posted > ?1 AND time_posted < ?2
                     AND outlet_url IN (SELECT value FROM json_each(?3))",
                    params![begin, end, outlets],
                )
                .await?;
            collect_strings(rows).await
        })
        .await
    }

    /// Tags of one article, if it lies inside the window.
    pub async fn window_article_tags(&self, url: &str, window: &Window<'_>) -> Result<Vec<String>> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("window_article_tags", |conn| async move {
            let rows = conn
                .query(
                    "SELECT tags_used.tag FROM scrape_results
                     INNER JOIN tags_used ON scrape_results.url = tags_used.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND scrape_results.url = ?3
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?4))",
                    params![begin, end, url, outlets],
                )
                .await?;
            collect_strings(rows).await
        })
        .await
    }

    /// Keywords with relevancy of one article, if it lies inside the window.
    pub async fn window_article_keywords(
        &self,
        url: &str,
        window: &Window<'_>,
    ) -> Result<Vec<(String, f64)>> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("window_article_keywords", |conn| async move {
            let rows = conn
                .query(
                    "SELECT extracted_keywords.keyword, extracted_keywords.relevancy FROM scrape_results
                     INNER JOIN extracted_keywords ON scrape_results.url = extracted_keywords.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND scrape_results.url = ?3
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?4))",
                    params![begin, end, url, outlets],
                )
                .await?;
            collect_weighted(rows).await
        })
        .await
    }

    /// Tag uses matching a `LIKE` pattern inside the window.
    pub async fn count_tags(&self, pattern: &str, window: &Window<'_>) -> Result<i64> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("count_tags", |conn| async move {
            let rows = conn
                .query(
                    "SELECT COUNT(scrape_results.word_count) FROM scrape_results
                     INNER JOIN tags_used ON scrape_results.url = tags_used.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND tags_used.tag LIKE ?3
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?4))",
                    params![begin, end, pattern, outlets],
                )
                .await?;
            single_count(rows).await
        })
        .await
    }

    /// Keyword extractions matching a `LIKE` pattern inside the window.
    pub async fn count_keywords(&self, pattern: &str, window: &Window<'_>) -> Result<i64> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("count_keywords", |conn| async move {
            let rows = conn
                .query(
                    "SELECT COUNT(scrape_results.word_count) FROM scrape_results
                     INNER JOIN extracted_keywords ON scrape_results.url = extracted_keywords.article_url
                     WHERE scrape_results.time_posted > ?1 AND scrape_results.time_posted < ?2
                     AND extracted_keywords.keyword LIKE ?3
                     AND scrape_results.outlet_url IN (SELECT value FROM json_each(?4))",
                    params![begin, end, pattern, outlets],
                )
                .await?;
            single_count(rows).await
        })
        .await
    }

    /// Articles inside the window.
    pub async fn count_articles(&self, window: &Window<'_>) -> Result<i64> {
        let (begin, end, outlets) = window.bind()?;
        let outlets = outlets.as_str();
        self.retrying("count_articles", |conn| async move {
            let rows = conn
                .query(
                    "SELECT COUNT(word_count) FROM scrape_results
                     WHERE time_posted > ?1 AND time_posted < ?2
                     AND outlet_url IN (SELECT value FROM json_each(?3))",
                    params![begin, end, outlets],
                )
                .await?;
            single_count(rows).await
        })
        .await
    }
}

/// Time window `(begin, end)` restricted to a set of outlets.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub outlets: &'a [String],
}

impl Window<'_> {
    fn bind(&self) -> Result<(i64, i64, String)> {
        let outlets = serde_json::to_string(self.outlets)
            .map_err(|e| NewsdeskError::Storage(format!("failed to encode outlet list: {e}")))?;
        Ok((millis(self.begin), millis(self.end), outlets))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn configure(conn: &Connection, busy_timeout: Duration) -> libsql::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
        busy_timeout.as_millis()
    ))
    .await?;
    Ok(())
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn is_transient(e: &libsql::Error) -> bool {
    matches!(e, libsql::Error::ConnectionFailed(_)) || is_transient_message(&e.to_string())
}

fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["database is locked", "database table is locked", "busy", "disk i/o error", "unable to open database"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn is_duplicate(e: &libsql::Error) -> bool {
    is_duplicate_message(&e.to_string())
}

fn is_duplicate_message(message: &str) -> bool {
    message.contains("UNIQUE constraint failed") || message.contains("PRIMARY KEY constraint failed")
}

async fn collect_sessions(mut rows: libsql::Rows) -> libsql::Result<Vec<ScrapeSession>> {
    let mut sessions = Vec::new();
    while let Some(row) = rows.next().await? {
        let is_finished = row.get::<i64>(3)? != 0;
        sessions.push(ScrapeSession {
            id: row.get::<i64>(0)?,
            start_time: from_millis(row.get::<i64>(1)?),
            end_time: if is_finished {
                from_millis(row.get::<i64>(2)?)
            } else {
                ScrapeSession::OPEN_END
            },
            is_finished,
        });
    }
    Ok(sessions)
}

async fn collect_articles(mut rows: libsql::Rows) -> libsql::Result<Vec<Article>> {
    let mut articles = Vec::new();
    while let Some(row) = rows.next().await? {
        articles.push(Article {
            url: row.get::<String>(0)?,
            outlet_url: row.get::<String>(1)?,
            language: row.get::<String>(2)?,
            title: row.get::<String>(3)?,
            author: row.get::<String>(4)?,
            time_posted: from_millis(row.get::<i64>(5)?),
            text: row.get::<String>(6)?,
            word_count: u32::try_from(row.get::<i64>(7)?).unwrap_or(u32::MAX),
            tags: Vec::new(),
        });
    }
    Ok(articles)
}

async fn collect_strings(mut rows: libsql::Rows) -> libsql::Result<Vec<String>> {
    let mut values = Vec::new();
    while let Some(row) = rows.next().await? {
        values.push(row.get::<String>(0)?);
    }
    Ok(values)
}

async fn collect_weighted(mut rows: libsql::Rows) -> libsql::Result<Vec<(String, f64)>> {
    let mut values = Vec::new();
    while let Some(row) = rows.next().await? {
        values.push((row.get::<String>(0)?, row.get::<f64>(1)?));
    }
    Ok(values)
}

async fn single_count(mut rows: libsql::Rows) -> libsql::Result<i64> {
    match rows.next().await? {
        Some(row) => row.get::<i64>(0),
        None => Ok(0),
    }
}
