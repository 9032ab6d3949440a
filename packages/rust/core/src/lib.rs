//! Orchestration and domain logic for Newsdesk.
//!
//! The [`Conductor`] ties the harvester, storage, delegated summarizer and
//! grader together: it schedules harvest sessions and garbage collection on a
//! daemon, bounds calls to the external services with chokers, and answers
//! queries against the stored news.

pub mod conductor;
mod cycle;
pub mod delegate;
pub mod grader;
pub mod journal;

pub use conductor::Conductor;
pub use cycle::{Completion, HarvestReport, StageOutcome};
pub use delegate::{DelegatedSummarizer, Summarizer};
pub use grader::Grader;
pub use journal::{Journal, JournalEntry, JournalSink, MemorySink, Stopwatch, TracingSink};
