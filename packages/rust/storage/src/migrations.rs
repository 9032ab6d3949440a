//! SQL migration definitions for the Newsdesk database.
//!
//! Migrations are applied in order on database open. Times are stored as
//! UTC milliseconds so that window filters compare integers.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: sessions, articles, tags, keywords, summaries",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per harvest
CREATE TABLE IF NOT EXISTS scrape_sessions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    time_initialized INTEGER NOT NULL,
    time_end         INTEGER NOT NULL,
    is_finished      INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_scrape_sessions_time ON scrape_sessions(time_initialized);

-- Harvested articles, keyed by canonical URL
CREATE TABLE IF NOT EXISTS scrape_results (
    url           TEXT PRIMARY KEY,
    outlet_url    TEXT NOT NULL,
    language      TEXT NOT NULL DEFAULT '',
    title         TEXT NOT NULL DEFAULT '',
    author        TEXT NOT NULL DEFAULT '',
    time_posted   INTEGER NOT NULL,
    original_text TEXT NOT NULL DEFAULT '',
    word_count    INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_scrape_results_time ON scrape_results(time_posted);
CREATE INDEX IF NOT EXISTS idx_scrape_results_outlet ON scrape_results(outlet_url);

-- Tag vocabulary and usage
CREATE TABLE IF NOT EXISTS article_tags (
    tag TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS tags_used (
    article_url TEXT NOT NULL REFERENCES scrape_results(url),
    tag         TEXT NOT NULL REFERENCES article_tags(tag),
    PRIMARY KEY (article_url, tag)
);

CREATE INDEX IF NOT EXISTS idx_tags_used_tag ON tags_used(tag);

-- Keyword vocabulary and extraction results
CREATE TABLE IF NOT EXISTS unique_keywords (
    keyword TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS extracted_keywords (
    article_url TEXT NOT NULL REFERENCES scrape_results(url),
    keyword     TEXT NOT NULL REFERENCES unique_keywords(keyword),
    relevancy   REAL NOT NULL,
    PRIMARY KEY (article_url, keyword)
);

CREATE INDEX IF NOT EXISTS idx_extracted_keywords_keyword ON extracted_keywords(keyword);

-- Summaries
CREATE TABLE IF NOT EXISTS summarization_results (
    article_url     TEXT PRIMARY KEY REFERENCES scrape_results(url),
    summarized_text TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
