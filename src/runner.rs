//! Run orchestration: fetch every source, match, then edit each target page.
//!
//! Only configuration errors abort a run, and those surface before a
//! [`Runner`] exists. Everything after that degrades per item: a bad source
//! is skipped, a bad query is skipped, a page that fails to save is counted
//! and the remaining pages still get their edits.

use crate::config::{FeedConfig, RunOptions};
use crate::feed::{fetch_all, Entry, FetchJob, FetchOptions};
use crate::links::{collect_matches, merge_links, order_candidates, plan_pages, Candidate, PagePlan};
use crate::proxy::ProxyResolver;
use crate::query::CompiledQuery;
use crate::util::plural;
use crate::wiki::{Page, PageRead, PageStore};
use std::fmt;
use tokio::time::Instant;

/// Something left out of a run, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub name: String,
    pub reason: String,
}

impl Skipped {
    fn new(name: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dry_run: bool,
    pub sources_fetched: usize,
    pub sources_skipped: Vec<Skipped>,
    /// Queries that matched at least one entry.
    pub queries_matched: usize,
    pub queries_skipped: Vec<Skipped>,
    /// Pages edited, or that would have been edited in a dry run.
    pub pages_updated: Vec<String>,
    pub pages_unchanged: usize,
    /// Redirects and pages left unwritten when the run deadline passed.
    pub pages_skipped: Vec<Skipped>,
    pub pages_failed: Vec<Skipped>,
    pub links_added: usize,
}

impl RunSummary {
    /// True when nothing failed or was skipped.
    pub fn is_clean(&self) -> bool {
        self.sources_skipped.is_empty()
            && self.queries_skipped.is_empty()
            && self.pages_skipped.is_empty()
            && self.pages_failed.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let updated = if self.dry_run { "would be updated" } else { "updated" };

        writeln!(
            f,
            "Sources: {} fetched, {} skipped",
            self.sources_fetched,
            self.sources_skipped.len()
        )?;
        for s in &self.sources_skipped {
            writeln!(f, "  - {}: {}", s.name, s.reason)?;
        }
        writeln!(
            f,
            "Queries: {} with matches, {} skipped",
            self.queries_matched,
            self.queries_skipped.len()
        )?;
        for q in &self.queries_skipped {
            writeln!(f, "  - {}: {}", q.name, q.reason)?;
        }
        writeln!(
            f,
            "Pages: {} {updated}, {} unchanged, {} skipped, {} failed",
            self.pages_updated.len(),
            self.pages_unchanged,
            self.pages_skipped.len(),
            self.pages_failed.len()
        )?;
        for p in self.pages_skipped.iter().chain(&self.pages_failed) {
            writeln!(f, "  - {}: {}", p.name, p.reason)?;
        }
        write!(f, "Links added: {}", self.links_added)
    }
}

/// Drives one run against a page store.
pub struct Runner<'a, S: PageStore> {
    options: &'a RunOptions,
    resolver: &'a ProxyResolver,
    store: &'a S,
}

impl<'a, S: PageStore> Runner<'a, S> {
    pub fn new(options: &'a RunOptions, resolver: &'a ProxyResolver, store: &'a S) -> Self {
        Self {
            options,
            resolver,
            store,
        }
    }

    pub async fn run(&self, config: &FeedConfig) -> RunSummary {
        let deadline = self.options.run_timeout.map(|t| Instant::now() + t);
        let mut summary = RunSummary {
            dry_run: self.options.dry_run,
            ..RunSummary::default()
        };

        // ====================================================================
        // Fetch
        // ====================================================================

        let jobs: Vec<FetchJob> = config
            .sources
            .iter()
            .map(|source| FetchJob {
                source: source.clone(),
                proxy: self.resolver.resolve(source),
            })
            .collect();
        let fetch_options = FetchOptions {
            deadline,
            ..self.options.fetch.clone()
        };

        tracing::info!(
            sources = jobs.len(),
            workers = fetch_options.workers,
            "Fetching feeds"
        );
        let outcomes = fetch_all(jobs, &fetch_options).await;

        let mut entries: Vec<Vec<Entry>> = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(parsed) => {
                    tracing::info!(
                        source = %outcome.source,
                        entries = parsed.entries.len(),
                        skipped = parsed.skipped,
                        "Fetched feed"
                    );
                    summary.sources_fetched += 1;
                    entries.push(parsed.entries);
                }
                Err(e) => {
                    tracing::warn!(source = %outcome.source, error = %e, "Skipping source");
                    summary
                        .sources_skipped
                        .push(Skipped::new(outcome.source.to_string(), &e));
                    entries.push(Vec::new());
                }
            }
        }

        // ====================================================================
        // Match
        // ====================================================================

        let mut queries = Vec::with_capacity(config.queries.len());
        for (i, query) in config.queries.iter().enumerate() {
            match CompiledQuery::compile(i, query) {
                Ok(compiled) => queries.push(compiled),
                Err(e) => {
                    let name = query
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("query #{}", i + 1));
                    tracing::warn!(query = %name, error = %e, "Skipping query");
                    summary.queries_skipped.push(Skipped::new(name, &e));
                }
            }
        }

        let scope = self
            .options
            .match_scope
            .or(config.match_scope)
            .unwrap_or_default();
        tracing::debug!(scope = %scope, "Matching entries");

        let matches = collect_matches(&entries, &queries, scope);
        for m in &matches {
            tracing::info!(
                query = %m.query,
                links = m.candidates.len(),
                "Found {} keyword matches and {} regex matches",
                m.keyword_hits,
                m.regex_hits
            );
        }
        summary.queries_matched = matches.iter().filter(|m| !m.candidates.is_empty()).count();

        // ====================================================================
        // Edit
        // ====================================================================

        let plans = plan_pages(&matches);
        let mut last_edit: Option<Instant> = None;

        for batch in plans.chunks(self.options.group.max(1)) {
            let titles: Vec<String> = batch.iter().map(|p| p.title.clone()).collect();
            let reads = match self.store.load_pages(&titles).await {
                Ok(reads) => reads,
                Err(e) => {
                    tracing::error!(pages = titles.len(), error = %e, "Failed to load pages");
                    summary
                        .pages_failed
                        .extend(titles.into_iter().map(|t| Skipped::new(t, &e)));
                    continue;
                }
            };

            for (page, mut candidates) in Self::group_by_page(batch, reads, &mut summary) {
                order_candidates(&mut candidates);
                self.apply(page, &candidates, deadline, &mut last_edit, &mut summary)
                    .await;
            }
        }

        tracing::info!(
            updated = summary.pages_updated.len(),
            failed = summary.pages_failed.len(),
            links = summary.links_added,
            "Run finished"
        );
        summary
    }

    /// Pairs each loaded page with its candidates. Titles the wiki resolves
    /// to the same page are merged so that page gets a single edit.
    fn group_by_page(
        batch: &[PagePlan],
        reads: Vec<PageRead>,
        summary: &mut RunSummary,
    ) -> Vec<(Page, Vec<Candidate>)> {
        let mut targets: Vec<(Page, Vec<Candidate>)> = Vec::with_capacity(batch.len());
        for (plan, read) in batch.iter().zip(reads) {
            let page = match read {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(page = %plan.title, error = %e, "Failed to load page");
                    summary.pages_failed.push(Skipped::new(&plan.title, &e));
                    continue;
                }
            };
            match targets.iter_mut().find(|(p, _)| p.title == page.title) {
                Some((_, candidates)) => {
                    tracing::debug!(requested = %plan.title, page = %page.title, "Merging links for the same page");
                    candidates.extend(plan.candidates.iter().cloned());
                }
                None => targets.push((page, plan.candidates.clone())),
            }
        }
        targets
    }

    async fn apply(
        &self,
        page: Page,
        candidates: &[Candidate],
        deadline: Option<Instant>,
        last_edit: &mut Option<Instant>,
        summary: &mut RunSummary,
    ) {
        if page.is_redirect {
            tracing::warn!(page = %page.title, "Page is a redirect, skipping");
            summary
                .pages_skipped
                .push(Skipped::new(&page.title, "page is a redirect"));
            return;
        }

        let merge = merge_links(&page.title, &page.text, candidates);
        if !merge.changed() {
            tracing::info!(page = %page.title, "No new links");
            summary.pages_unchanged += 1;
            return;
        }

        let added = merge.added.len();
        let edit_summary = format!("Add {}.", plural(added, "external link"));

        if self.options.dry_run {
            tracing::info!(page = %page.title, summary = %edit_summary, "Dry run, not saving");
            tracing::debug!(page = %page.title, text = %merge.text, "Revised text");
            summary.pages_updated.push(page.title.clone());
            summary.links_added += added;
            return;
        }

        if let Some(last) = *last_edit {
            let ready = last + self.options.edit_delay;
            if deadline.is_some_and(|d| ready >= d) {
                self.skip_for_deadline(&page.title, summary);
                return;
            }
            tokio::time::sleep_until(ready).await;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            self.skip_for_deadline(&page.title, summary);
            return;
        }

        if !page.exists {
            tracing::info!(page = %page.title, "Creating page");
        }
        tracing::debug!(page = %page.title, text = %merge.text, "Revised text");

        let result = self.store.save_page(&page, &merge.text, &edit_summary).await;
        *last_edit = Some(Instant::now());

        match result {
            Ok(()) => {
                tracing::info!(page = %page.title, summary = %edit_summary, "Saved page");
                summary.pages_updated.push(page.title.clone());
                summary.links_added += added;
            }
            Err(e) => {
                tracing::warn!(page = %page.title, error = %e, "Failed to save page");
                summary.pages_failed.push(Skipped::new(&page.title, &e));
            }
        }
    }

    fn skip_for_deadline(&self, title: &str, summary: &mut RunSummary) {
        tracing::warn!(page = %title, "Run deadline reached, not saving");
        summary
            .pages_skipped
            .push(Skipped::new(title, "run deadline reached"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Source;
    use crate::proxy::ProxyOverrides;
    use crate::query::{MatchScope, Query};
    use crate::wiki::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn rss(items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(title, link)| {
                format!("<item><title>{title}</title><link>{link}</link></item>")
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>{items}</channel></rss>"#
        )
    }

    fn query(pages: &[&str], keywords: &[&str]) -> Query {
        Query {
            name: None,
            pages: pages.iter().map(|p| p.to_string()).collect(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            regexes: Vec::new(),
        }
    }

    fn config(sources: Vec<String>, queries: Vec<Query>) -> FeedConfig {
        FeedConfig {
            sources: sources.into_iter().map(Source::classify).collect(),
            queries,
            match_scope: Some(MatchScope::Title),
        }
    }

    fn resolver() -> ProxyResolver {
        ProxyResolver::new(ProxyOverrides::default(), Vec::new())
    }

    #[tokio::test]
    async fn test_adds_links_and_is_idempotent() {
        let feed = rss(&[
            ("STEM funding grows", "https://n.example/1"),
            ("Sports roundup", "https://n.example/2"),
        ]);
        let config = config(vec![feed], vec![query(&["Test"], &["STEM"])]);
        let store = MemoryStore::new().with_page("Test", "Intro\n\n== External links ==\n");
        let options = RunOptions::default();
        let resolver = resolver();
        let runner = Runner::new(&options, &resolver, &store);

        let first = runner.run(&config).await;
        assert_eq!(first.pages_updated, vec!["Test".to_string()]);
        assert_eq!(first.links_added, 1);
        assert!(first.is_clean());
        assert_eq!(
            store.text("Test").unwrap(),
            "Intro\n\n== External links ==\n* [https://n.example/1 STEM funding grows]"
        );
        assert_eq!(store.edits()[0].summary, "Add 1 external link.");

        let second = runner.run(&config).await;
        assert!(second.pages_updated.is_empty());
        assert_eq!(second.pages_unchanged, 1);
        assert_eq!(store.edits().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_saves() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["Test"], &["STEM"])]);
        let store = MemoryStore::new().with_page("Test", "== External links ==");
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_updated.len(), 1);
        assert!(store.edits().is_empty());
        assert_eq!(store.text("Test").unwrap(), "== External links ==");
        assert!(summary.to_string().contains("would be updated"));
    }

    #[tokio::test]
    async fn test_redirect_is_skipped() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["Old"], &["STEM"])]);
        let store = MemoryStore::new().with_redirect("Old", "New");
        let options = RunOptions::default();
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_skipped[0].name, "Old");
        assert!(store.edits().is_empty());
    }

    #[tokio::test]
    async fn test_missing_page_is_created() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["Fresh"], &["STEM"])]);
        let store = MemoryStore::new();
        let options = RunOptions::default();
        let resolver = resolver();

        Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(
            store.text("Fresh").unwrap(),
            "== External links ==\n* [https://n.example/1 STEM]"
        );
    }

    #[tokio::test]
    async fn test_bad_query_is_skipped_others_run() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let mut bad = query(&["Bad"], &[]);
        bad.name = Some("broken".to_string());
        bad.regexes = vec![serde_json::from_str(r#""(unclosed""#).unwrap()];
        let config = config(vec![feed], vec![bad, query(&["Good"], &["STEM"])]);
        let store = MemoryStore::new();
        let options = RunOptions::default();
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.queries_skipped[0].name, "broken");
        assert_eq!(summary.queries_matched, 1);
        assert!(store.text("Good").is_some());
        assert!(store.text("Bad").is_none());
    }

    #[tokio::test]
    async fn test_failed_page_does_not_stop_others() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["A", "B"], &["STEM"])]);
        let store = MemoryStore::new()
            .with_page("A", "")
            .with_page("B", "")
            .deny_edits("A", "protected");
        let options = RunOptions::default();
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_failed[0].name, "A");
        assert_eq!(summary.pages_updated, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_title_fails_only_that_page() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["A", "Bad[x]", "C"], &["STEM"])]);
        let store = MemoryStore::new();
        let options = RunOptions::default();
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_failed.len(), 1);
        assert_eq!(summary.pages_failed[0].name, "Bad[x]");
        assert_eq!(summary.pages_updated, vec!["A".to_string(), "C".to_string()]);
    }

    /// Resolves every title to one canonical page, like a wiki resolving
    /// spelling variants.
    struct Canonical(MemoryStore);

    impl PageStore for Canonical {
        async fn load_pages(&self, titles: &[String]) -> Result<Vec<PageRead>, crate::wiki::PageError> {
            let canonical: Vec<String> = titles.iter().map(|_| "Target".to_string()).collect();
            self.0.load_pages(&canonical).await
        }

        async fn save_page(&self, page: &Page, text: &str, summary: &str) -> Result<(), crate::wiki::PageError> {
            self.0.save_page(page, text, summary).await
        }
    }

    #[tokio::test]
    async fn test_titles_resolving_to_one_page_make_one_edit() {
        let feed = rss(&[("STEM one", "https://n.example/1"), ("STEM two", "https://n.example/2")]);
        let mut second = query(&["Alias"], &["two"]);
        second.name = Some("second".to_string());
        let config = config(
            vec![feed],
            vec![query(&["Target"], &["one"]), second],
        );
        let store = Canonical(MemoryStore::new().with_page("Target", ""));
        let options = RunOptions::default();
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert!(summary.pages_failed.is_empty());
        assert_eq!(store.0.edits().len(), 1);
        assert_eq!(store.0.edits()[0].summary, "Add 2 external links.");
        assert_eq!(
            store.0.text("Target").unwrap(),
            "== External links ==\n* [https://n.example/1 STEM one]\n* [https://n.example/2 STEM two]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_delay_between_saves() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["A", "B", "C"], &["STEM"])]);
        let store = MemoryStore::new();
        let options = RunOptions {
            edit_delay: Duration::from_secs(10),
            ..RunOptions::default()
        };
        let resolver = resolver();

        let start = Instant::now();
        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_updated.len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_skips_pending_writes() {
        let feed = rss(&[("STEM", "https://n.example/1")]);
        let config = config(vec![feed], vec![query(&["A", "B"], &["STEM"])]);
        let store = MemoryStore::new();
        let options = RunOptions {
            edit_delay: Duration::from_secs(60),
            run_timeout: Some(Duration::from_secs(30)),
            ..RunOptions::default()
        };
        let resolver = resolver();

        let summary = Runner::new(&options, &resolver, &store).run(&config).await;
        assert_eq!(summary.pages_updated, vec!["A".to_string()]);
        assert_eq!(summary.pages_skipped[0].name, "B");
        assert_eq!(summary.pages_skipped[0].reason, "run deadline reached");
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            sources_fetched: 2,
            sources_skipped: vec![Skipped::new("https://x.example", "HTTP error: status 404")],
            pages_updated: vec!["A".to_string()],
            links_added: 3,
            ..RunSummary::default()
        };
        let text = summary.to_string();
        assert!(text.contains("Sources: 2 fetched, 1 skipped"));
        assert!(text.contains("https://x.example: HTTP error: status 404"));
        assert!(text.ends_with("Links added: 3"));
    }
}
