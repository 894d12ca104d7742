//! Link aggregation: from matched entries to per-page link additions.
//!
//! The pipeline is:
//!
//! 1. [`collect_matches`] - for each query, the entries that matched it, in
//!    source order then entry order, deduplicated by link
//! 2. [`plan_pages`] - fan each query's candidates out to its target pages;
//!    queries sharing a page are merged into one plan
//! 3. [`merge_links`] - append the candidates a page does not already list
//!
//! Merging only ever appends, and compares links by exact string equality,
//! so re-running with the same inputs changes nothing.

use crate::feed::Entry;
use crate::query::{CompiledQuery, MatchScope, Verdict};
use crate::util::sanitize_link_title;
use crate::wikitext;
use std::collections::{HashMap, HashSet};

/// A link waiting to be added to pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub link: String,
    pub title: String,
    /// `(source index, entry index)`; orders candidates deterministically.
    pub position: (usize, usize),
}

/// Entries matched by one query across every source.
#[derive(Debug, Clone)]
pub struct QueryMatches {
    pub query: String,
    pub pages: Vec<String>,
    pub candidates: Vec<Candidate>,
    pub keyword_hits: usize,
    pub regex_hits: usize,
}

/// Links to add to one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    pub title: String,
    pub candidates: Vec<Candidate>,
}

/// Runs every query over every entry.
///
/// `sources` holds each source's entries, indexed in configuration order.
/// Sources that failed to fetch are simply empty.
pub fn collect_matches(
    sources: &[Vec<Entry>],
    queries: &[CompiledQuery],
    scope: MatchScope,
) -> Vec<QueryMatches> {
    let mut results: Vec<QueryMatches> = queries
        .iter()
        .map(|q| QueryMatches {
            query: q.name.clone(),
            pages: q.pages.clone(),
            candidates: Vec::new(),
            keyword_hits: 0,
            regex_hits: 0,
        })
        .collect();
    let mut seen: Vec<HashSet<String>> = vec![HashSet::new(); queries.len()];

    for (source_idx, entries) in sources.iter().enumerate() {
        for (entry_idx, entry) in entries.iter().enumerate() {
            let text = scope.text(entry);
            for (q, query) in queries.iter().enumerate() {
                let Verdict {
                    keyword_hits,
                    regex_hits,
                } = query.evaluate(&text);
                if keyword_hits == 0 && regex_hits == 0 {
                    continue;
                }

                let result = &mut results[q];
                result.keyword_hits += keyword_hits;
                result.regex_hits += regex_hits;

                if !seen[q].insert(entry.link.clone()) {
                    tracing::debug!(
                        query = %result.query,
                        link = %entry.link,
                        "Discarded entry with duplicate link"
                    );
                    continue;
                }
                result.candidates.push(Candidate {
                    link: entry.link.clone(),
                    title: sanitize_link_title(&entry.title).into_owned(),
                    position: (source_idx, entry_idx),
                });
            }
        }
    }

    results
}

/// Groups candidates by target page.
///
/// Titles are normalized first, so `foo_bar` and `Foo bar` share one plan.
/// Pages appear in the order they are first named by a query with matches.
/// Within a page, candidates are ordered by position and deduplicated by link.
pub fn plan_pages(matches: &[QueryMatches]) -> Vec<PagePlan> {
    let mut plans: Vec<PagePlan> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for result in matches.iter().filter(|m| !m.candidates.is_empty()) {
        for page in &result.pages {
            let title = wikitext::normalize_title(page);
            let idx = *index.entry(title.clone()).or_insert_with(|| {
                plans.push(PagePlan {
                    title,
                    candidates: Vec::new(),
                });
                plans.len() - 1
            });
            plans[idx].candidates.extend(result.candidates.iter().cloned());
        }
    }

    for plan in &mut plans {
        order_candidates(&mut plan.candidates);
    }

    plans
}

/// Sorts candidates by position and drops repeated links.
pub fn order_candidates(candidates: &mut Vec<Candidate>) {
    // Stable sort: equal positions keep query order.
    candidates.sort_by_key(|c| c.position);
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.link.clone()));
}

/// The external links currently listed on a page, in page order.
///
/// Membership is exact string comparison: `https://a/` and `https://a`
/// are different links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLinkSet {
    links: Vec<String>,
    seen: HashSet<String>,
}

impl PageLinkSet {
    /// Reads the links in the "External links" section of `text`.
    pub fn parse(text: &str) -> Self {
        let mut set = Self::default();
        for link in wikitext::section_links(text) {
            set.insert(link);
        }
        set
    }

    pub fn contains(&self, link: &str) -> bool {
        self.seen.contains(link)
    }

    /// Appends `link`; returns `false` if it was already present.
    pub fn insert(&mut self, link: &str) -> bool {
        if !self.seen.insert(link.to_string()) {
            return false;
        }
        self.links.push(link.to_string());
        true
    }

    pub fn links(&self) -> &[String] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Result of merging candidates into one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMerge {
    /// Revised page text; equal to the input when nothing was added.
    pub text: String,
    pub added: Vec<Candidate>,
}

impl LinkMerge {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// Appends every candidate whose link the page does not list yet.
pub fn merge_links(page_title: &str, text: &str, candidates: &[Candidate]) -> LinkMerge {
    let mut links = PageLinkSet::parse(text);
    let mut added = Vec::new();

    for candidate in candidates {
        if !wikitext::is_listable(&candidate.link) {
            tracing::warn!(
                page = %page_title,
                link = %candidate.link,
                "Link cannot be written as an external link, skipping"
            );
            continue;
        }
        if links.insert(&candidate.link) {
            added.push(candidate.clone());
        } else {
            tracing::debug!(
                page = %page_title,
                link = %candidate.link,
                "Link already present, skipping"
            );
        }
    }

    if added.is_empty() {
        return LinkMerge {
            text: text.to_string(),
            added,
        };
    }

    let items: Vec<String> = added
        .iter()
        .map(|c| wikitext::link_item(&c.link, &c.title))
        .collect();

    LinkMerge {
        text: wikitext::insert_items(text, &items),
        added,
    }
}
