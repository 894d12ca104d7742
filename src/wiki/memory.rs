use super::{invalid_title, Page, PageError, PageRead, PageStore};
use std::collections::HashMap;
use std::sync::Mutex;

/// Characters MediaWiki never allows in a title.
const ILLEGAL_TITLE_CHARS: [char; 8] = ['#', '<', '>', '[', ']', '|', '{', '}'];

#[derive(Debug, Clone)]
struct StoredPage {
    text: String,
    revision: u64,
    redirect: bool,
}

/// A saved edit, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Default)]
struct State {
    pages: HashMap<String, StoredPage>,
    edits: Vec<Edit>,
    denied: HashMap<String, String>,
}

/// In-process page store.
///
/// Revisions are counters; saving against an outdated revision is reported
/// as a conflict, like a real wiki would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a page.
    pub fn with_page(self, title: &str, text: &str) -> Self {
        self.put(title, text);
        self
    }

    /// Adds a redirect page.
    pub fn with_redirect(self, title: &str, target: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.pages.insert(
                title.to_string(),
                StoredPage {
                    text: format!("#REDIRECT [[{target}]]"),
                    revision: 1,
                    redirect: true,
                },
            );
        }
        self
    }

    /// Makes every save to `title` fail with a permission error.
    pub fn deny_edits(self, title: &str, reason: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.denied.insert(title.to_string(), reason.to_string());
        }
        self
    }

    /// Writes a page directly, bumping its revision (simulates another editor).
    pub fn put(&self, title: &str, text: &str) {
        if let Ok(mut state) = self.state.lock() {
            let revision = state.pages.get(title).map_or(1, |p| p.revision + 1);
            state.pages.insert(
                title.to_string(),
                StoredPage {
                    text: text.to_string(),
                    revision,
                    redirect: false,
                },
            );
        }
    }

    pub fn text(&self, title: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.pages.get(title).map(|p| p.text.clone())
    }

    pub fn edits(&self) -> Vec<Edit> {
        self.state
            .lock()
            .map(|state| state.edits.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PageError> {
        self.state
            .lock()
            .map_err(|_| PageError::Decode("page store lock poisoned".to_string()))
    }
}

impl PageStore for MemoryStore {
    async fn load_pages(&self, titles: &[String]) -> Result<Vec<PageRead>, PageError> {
        let state = self.lock()?;
        Ok(titles
            .iter()
            .map(|title| {
                if title.trim().is_empty() || title.contains(ILLEGAL_TITLE_CHARS) {
                    return Err(invalid_title(title));
                }
                Ok(match state.pages.get(title) {
                    Some(stored) => Page {
                        title: title.clone(),
                        text: stored.text.clone(),
                        exists: true,
                        is_redirect: stored.redirect,
                        revision: Some(stored.revision.to_string()),
                        read_at: None,
                    },
                    None => Page {
                        title: title.clone(),
                        ..Page::default()
                    },
                })
            })
            .collect())
    }

    async fn save_page(&self, page: &Page, text: &str, summary: &str) -> Result<(), PageError> {
        let mut state = self.lock()?;

        if let Some(reason) = state.denied.get(&page.title) {
            return Err(PageError::Permission {
                code: "protectedpage".to_string(),
                info: reason.clone(),
            });
        }

        let current = state.pages.get(&page.title).map(|p| p.revision.to_string());
        if current != page.revision {
            return Err(PageError::Conflict(page.title.clone()));
        }

        let revision = state.pages.get(&page.title).map_or(1, |p| p.revision + 1);
        state.pages.insert(
            page.title.clone(),
            StoredPage {
                text: text.to_string(),
                revision,
                redirect: false,
            },
        );
        state.edits.push(Edit {
            title: page.title.clone(),
            summary: summary.to_string(),
        });
        Ok(())
    }
}
