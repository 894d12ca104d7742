//! Wiki page storage.
//!
//! [`PageStore`] is the seam between the link pipeline and wherever pages
//! live. Two implementations ship with the crate:
//!
//! - [`MediaWikiClient`] - the MediaWiki Action API, with bot-password login,
//!   CSRF tokens and timestamp-based edit conflict detection
//! - [`MemoryStore`] - an in-process store, used by tests and offline runs

mod mediawiki;
mod memory;

pub use mediawiki::{MediaWikiClient, MediaWikiConfig};
pub use memory::{Edit, MemoryStore};

use thiserror::Error;

/// Errors from reading or writing pages. A failed write affects only that page.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page changed since it was read
    #[error("Edit conflict on page \"{0}\"")]
    Conflict(String),

    /// Protected page, blocked account, missing rights, ...
    #[error("Permission denied [{code}]: {info}")]
    Permission { code: String, info: String },

    /// The wiki refused the request because of its rate limits
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Any other error reported by the wiki API
    #[error("API error [{code}]: {info}")]
    Api { code: String, info: String },

    /// Network-level error talking to the wiki
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    /// The response did not have the expected shape
    #[error("Unexpected API response: {0}")]
    Decode(String),

    /// Login failed
    #[error("Login failed: {0}")]
    Auth(String),
}

/// A page as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    /// Current text; empty for pages that do not exist yet.
    pub text: String,
    pub exists: bool,
    pub is_redirect: bool,
    /// Identifies the revision that was read, for conflict detection on save.
    pub revision: Option<String>,
    /// When the page was read, for detecting deletions since.
    pub read_at: Option<String>,
}

/// Outcome of reading one page in a batch.
pub type PageRead = Result<Page, PageError>;

/// Read/write access to wiki pages.
#[allow(async_fn_in_trait)]
pub trait PageStore {
    /// Reads several pages at once, one result per title in the order
    /// requested. The outer error means the whole request failed; an inner
    /// error affects only that title.
    async fn load_pages(&self, titles: &[String]) -> Result<Vec<PageRead>, PageError>;

    /// Reads one page.
    async fn load_page(&self, title: &str) -> Result<Page, PageError> {
        self.load_pages(&[title.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PageError::Decode(format!("no page returned for \"{title}\"")))?
    }

    /// Replaces the text of `page`, failing with [`PageError::Conflict`] if it
    /// changed since it was read.
    async fn save_page(&self, page: &Page, text: &str, summary: &str) -> Result<(), PageError>;
}

fn invalid_title(title: &str) -> PageError {
    PageError::Api {
        code: "invalidtitle".to_string(),
        info: format!("invalid page title \"{title}\""),
    }
}
