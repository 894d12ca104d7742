//! Feed sources: classification, fetching and parsing.
//!
//! - [`source`] - Decides once, at config load, whether a source string is a
//!   remote URL, a local file, or literal feed markup
//! - [`fetcher`] - Proxy-aware HTTP and file retrieval with bounded concurrency
//! - [`parser`] - RSS/Atom/JSON Feed parsing via the `feed-rs` crate
//!
//! # Example
//!
//! ```ignore
//! use crate::feed::{fetch_all, FetchJob, FetchOptions, Source};
//!
//! let jobs = vec![FetchJob { source: Source::classify("https://example.org/rss"), proxy }];
//! let outcomes = fetch_all(jobs, &FetchOptions::default()).await;
//! ```

mod fetcher;
mod parser;
mod source;

pub use fetcher::{build_client, fetch_all, FetchError, FetchJob, FetchOptions, SourceOutcome};
pub use parser::{parse_entries, Entry, ParseResult};
pub use source::{Source, SourceKind};
