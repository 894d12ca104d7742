//! Adds links from matching web feed entries to the "External links"
//! section of wiki pages.
//!
//! A run fetches every configured feed, matches each entry against the
//! configured queries and appends the links that a target page does not
//! list yet. See [`runner::Runner`] for the whole pipeline.

pub mod config;
pub mod feed;
pub mod links;
pub mod proxy;
pub mod query;
pub mod runner;
pub mod util;
pub mod wiki;
pub mod wikitext;
