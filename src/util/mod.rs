//! Utility functions shared across the pipeline.
//!
//! - **Link titles**: sanitising feed text before it is written into wikitext
//! - **Log wording**: pluralised counts for run output and edit summaries

mod text;

pub use text::{plural, sanitize_link_title};
