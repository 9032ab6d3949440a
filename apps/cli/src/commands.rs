//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use newsdesk_core::{Conductor, DelegatedSummarizer, HarvestReport, Journal, StageOutcome};
use newsdesk_harvester::Harvester;
use newsdesk_shared::{
    AppConfig, ConductorSettings, GradeTarget, GraderQuery, NewsdeskError, ScrapeSession, init_config, load_config,
    load_config_from, validate_outlets,
};
use newsdesk_storage::StorageSettings;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Newsdesk: harvest news outlets, enrich articles, grade what trends.
#[derive(Parser)]
#[command(
    name = "newsdesk",
    version,
    about = "Harvest news outlets on a schedule, summarize and grade what they publish.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.newsdesk/newsdesk.toml.
    #[arg(long, env = "NEWSDESK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the conductor daemon until interrupted.
    Run {
        /// Start with a harvest instead of waiting for the schedule.
        #[arg(long)]
        harvest_now: bool,
    },

    /// Run one harvest session and exit.
    Harvest,

    /// Delete articles older than the GC interval.
    Gc,

    /// Scrape one outlet's front page without storing anything.
    Scrape {
        /// Outlet name as configured.
        outlet: String,

        /// Print articles as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List scrape sessions.
    Sessions {
        /// Only the latest session.
        #[arg(long)]
        latest: bool,

        /// Filter by state: true for finished, false for unfinished.
        #[arg(long)]
        finished: Option<bool>,

        /// How far back to look, in hours.
        #[arg(long, default_value = "24")]
        since_hours: u64,
    },

    /// Show a stored article with its tags, keywords and summary.
    Article {
        url: String,
    },

    /// Grade tags, keywords or articles over a time window.
    Grade {
        /// tags, keywords or articles.
        target: GradeTarget,

        /// Window width ending now, in hours.
        #[arg(long, default_value = "24")]
        window_hours: u64,

        /// Restrict to these outlet base URLs. Defaults to every outlet.
        #[arg(long)]
        outlet: Vec<String>,

        /// Tags weight for article grading; 0 uses the configured weight.
        #[arg(long, default_value = "0")]
        scale: f64,

        /// Print only the best N entries.
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Count appearances of a tag or keyword pattern, or articles.
    Count {
        /// tags, keywords or articles.
        target: GradeTarget,

        /// SQL LIKE pattern; ignored for articles.
        #[arg(default_value = "%")]
        pattern: String,

        /// Window width ending now, in hours.
        #[arg(long, default_value = "24")]
        window_hours: u64,

        #[arg(long)]
        outlet: Vec<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Validate the configuration and report every problem found.
    Check,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "newsdesk=info",
        1 => "newsdesk=debug",
        _ => "newsdesk=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run { harvest_now } => cmd_run(config_path, harvest_now).await,
        Command::Harvest => cmd_harvest(config_path).await,
        Command::Gc => cmd_gc(config_path).await,
        Command::Scrape { outlet, json } => cmd_scrape(config_path, &outlet, json).await,
        Command::Sessions {
            latest,
            finished,
            since_hours,
        } => cmd_sessions(config_path, latest, finished, since_hours).await,
        Command::Article { url } => cmd_article(config_path, &url).await,
        Command::Grade {
            target,
            window_hours,
            outlet,
            scale,
            top,
        } => {
            let query = GraderQuery {
                outlets: outlet,
                normalized_scale: scale,
                ..GraderQuery::new(target, hours(window_hours))
            };
            cmd_grade(config_path, &query, top).await
        }
        Command::Count {
            target,
            pattern,
            window_hours,
            outlet,
        } => {
            let query = GraderQuery {
                outlets: outlet,
                selection: pattern,
                ..GraderQuery::new(target, hours(window_hours))
            };
            cmd_count(config_path, &query).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
            ConfigAction::Check => cmd_config_check(config_path).await,
        },
    }
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(3600))
}

fn read_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Everything needed to bring a conductor up.
struct Parts {
    settings: ConductorSettings,
    storage: StorageSettings,
    harvester: Harvester,
    summarizer: Arc<DelegatedSummarizer>,
}

fn parts(path: Option<PathBuf>) -> Result<Parts> {
    let config = read_config(path)?;
    validate_outlets(&config)?;
    Ok(Parts {
        settings: ConductorSettings::from_config(&config)?,
        storage: StorageSettings::from_config(&config.database)?,
        harvester: Harvester::from_config(&config)?,
        summarizer: Arc::new(DelegatedSummarizer::from_config(&config.delegate)?),
    })
}

/// Open a conductor without its daemon, for one-shot commands.
async fn open(path: Option<PathBuf>) -> Result<Conductor> {
    let p = parts(path)?;
    let conductor = Conductor::open(p.settings, p.storage, p.harvester, p.summarizer, Journal::tracing()).await?;
    Ok(conductor)
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

async fn cmd_run(path: Option<PathBuf>, harvest_now: bool) -> Result<()> {
    let p = parts(path)?;
    let outlets = p.harvester.outlets().len();
    let conductor = Conductor::start(p.settings, p.storage, p.harvester, p.summarizer, Journal::tracing()).await?;
    info!(
        outlets,
        next_harvest = %conductor.next_harvest_time(),
        "conductor running, press ctrl-c to stop"
    );
    if harvest_now {
        conductor.schedule_harvest_now().await?;
    }

    shutdown_signal().await;
    info!("shutting down");
    conductor.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

async fn cmd_harvest(path: Option<PathBuf>) -> Result<()> {
    let conductor = open(path).await?;
    let progress = spinner("Harvesting");
    let result = conductor.run_harvest().await;
    progress.finish_and_clear();
    conductor.close().await;
    print_report(&result?);
    Ok(())
}

fn print_report(report: &HarvestReport) {
    let with_failures = report
        .completion
        .values()
        .filter(|c| c.keywords == StageOutcome::Failed || c.summary == StageOutcome::Failed)
        .count();
    println!();
    println!("  Harvest session {} finished", report.session_id);
    println!("  Fetched:    {}", report.fetched);
    println!("  Inserted:   {}", report.inserted);
    println!("  Duplicates: {}", report.duplicates);
    if report.insert_failures > 0 {
        println!("  Not stored: {}", report.insert_failures);
    }
    println!("  Keywords:   {}/{}", report.keywords_done(), report.completion.len());
    println!("  Summaries:  {}/{}", report.summaries_done(), report.completion.len());
    if with_failures > 0 {
        println!("  With failed enrichment: {with_failures}");
    }
    if !report.committed {
        println!("  Warning: the session could not be marked finished");
    }
    println!("  Time:       {:.1}s", report.duration.as_secs_f64());
    println!();
}

async fn cmd_gc(path: Option<PathBuf>) -> Result<()> {
    let conductor = open(path).await?;
    let affected = conductor.run_garbage_collection().await;
    conductor.close().await;
    println!("Removed {affected} rows");
    Ok(())
}

async fn cmd_scrape(path: Option<PathBuf>, outlet: &str, json: bool) -> Result<()> {
    let conductor = open(path).await?;
    let progress = spinner(&format!("Scraping {outlet}"));
    let result = conductor.scrape_outlet(outlet).await;
    progress.finish_and_clear();
    conductor.close().await;
    let articles = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&articles)?);
        return Ok(());
    }
    for article in &articles {
        println!("{}  {}", article.time_posted.format("%Y-%m-%d %H:%M"), article.title);
        println!("    {} ({} words)", article.url, article.word_count);
    }
    println!("{} articles", articles.len());
    Ok(())
}

async fn cmd_sessions(
    path: Option<PathBuf>,
    latest: bool,
    finished: Option<bool>,
    since_hours: u64,
) -> Result<()> {
    let conductor = open(path).await?;
    let result = async {
        if latest {
            return match finished {
                Some(state) => conductor.latest_session_by_state(state).await.map(|s| vec![s]),
                None => conductor.latest_session().await.map(|s| vec![s]),
            };
        }
        let to = Utc::now();
        let from = TimeDelta::try_hours(i64::try_from(since_hours).unwrap_or(i64::MAX))
            .and_then(|width| to.checked_sub_signed(width))
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);
        match finished {
            Some(state) => conductor.sessions_between_by_state(from, to, state).await,
            None => conductor.sessions_between(from, to).await,
        }
    }
    .await;
    conductor.close().await;

    let sessions = result?;
    for session in &sessions {
        print_session(session);
    }
    if sessions.is_empty() {
        println!("No sessions");
    }
    Ok(())
}

fn print_session(session: &ScrapeSession) {
    let end = if session.is_finished {
        session.end_time.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        "open".to_string()
    };
    println!(
        "#{:<6} {} -> {}",
        session.id,
        session.start_time.format("%Y-%m-%d %H:%M:%S"),
        end
    );
}

async fn cmd_article(path: Option<PathBuf>, url: &str) -> Result<()> {
    let conductor = open(path).await?;
    let result = async {
        let article = conductor.article(url).await?;
        let keywords = conductor.article_keywords(url).await?;
        let summary = match conductor.summarized_text(url).await {
            Ok(summary) => Some(summary),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok::<_, NewsdeskError>((article, keywords, summary))
    }
    .await;
    conductor.close().await;
    let (article, keywords, summary) = result?;

    println!("{}", article.title);
    println!("  URL:      {}", article.url);
    println!("  Outlet:   {} ({})", article.outlet_url, article.language);
    if !article.author.is_empty() {
        println!("  Author:   {}", article.author);
    }
    println!("  Posted:   {}", article.time_posted.format("%Y-%m-%d %H:%M"));
    println!("  Words:    {}", article.word_count);
    println!("  Tags:     {}", article.tags.join(", "));
    let keywords: Vec<String> = keywords
        .iter()
        .map(|(keyword, relevancy)| format!("{keyword} ({relevancy:.3})"))
        .collect();
    println!("  Keywords: {}", keywords.join(", "));
    println!();
    println!("{}", summary.as_deref().unwrap_or("(not summarized)"));
    Ok(())
}

async fn cmd_grade(path: Option<PathBuf>, query: &GraderQuery, top: usize) -> Result<()> {
    let conductor = open(path).await?;
    let result = conductor.grade(query).await;
    conductor.close().await;

    let mut scores: Vec<(String, f64)> = result?.into_iter().collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (name, score) in scores.iter().take(top) {
        println!("{score:>8.5}  {name}");
    }
    if scores.is_empty() {
        println!("Nothing to grade in this window");
    }
    Ok(())
}

async fn cmd_count(path: Option<PathBuf>, query: &GraderQuery) -> Result<()> {
    let conductor = open(path).await?;
    let result = conductor.count(query).await;
    conductor.close().await;
    println!("{}", result?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<PathBuf>) -> Result<()> {
    let config = read_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_check(path: Option<PathBuf>) -> Result<()> {
    let config = read_config(path)?;
    let mut problems = Vec::new();
    if let Err(e) = validate_outlets(&config) {
        problems.push(e.to_string());
    }
    if let Err(e) = ConductorSettings::from_config(&config) {
        problems.push(e.to_string());
    }
    if let Err(e) = Harvester::from_config(&config) {
        problems.push(e.to_string());
    }
    if config.outlets.is_empty() {
        problems.push("no outlets configured".to_string());
    }

    if problems.is_empty() {
        println!("Configuration OK: {} outlets", config.outlets.len());
        return Ok(());
    }
    for problem in &problems {
        println!("  - {problem}");
    }
    Err(eyre!("configuration has {} problem(s)", problems.len()))
}
