//! Query matching: decides which feed entries belong on which pages.
//!
//! A query matches an entry when **any** keyword or **any** regex matches the
//! entry's text. Keywords are literal, case-insensitive and must appear as
//! whole words; regexes use the flags listed with them and nothing else.

use crate::feed::Entry;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that disable a single query. Other queries still run.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid regex \"{pattern}\": {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown regex flag \"{0}\"")]
    UnknownFlag(String),
}

/// Which part of an entry queries are matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchScope {
    /// Entry title only.
    Title,
    /// Title, summary and link, one per line.
    #[default]
    Full,
}

impl MatchScope {
    pub fn text<'a>(&self, entry: &'a Entry) -> Cow<'a, str> {
        match self {
            MatchScope::Title => Cow::Borrowed(&entry.title),
            MatchScope::Full => {
                Cow::Owned(format!("{}\n{}\n{}", entry.title, entry.summary, entry.link))
            }
        }
    }
}

impl fmt::Display for MatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchScope::Title => f.write_str("title"),
            MatchScope::Full => f.write_str("full"),
        }
    }
}

/// Regex flags accepted in query configs.
///
/// Names follow the long and short spellings commonly used for regex flags
/// (`IGNORECASE` / `I`, ...) and are matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexFlag {
    CaseInsensitive,
    MultiLine,
    DotAll,
    Verbose,
    Ascii,
    Unicode,
}

impl FromStr for RegexFlag {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IGNORECASE" | "I" => Ok(RegexFlag::CaseInsensitive),
            "MULTILINE" | "M" => Ok(RegexFlag::MultiLine),
            "DOTALL" | "S" => Ok(RegexFlag::DotAll),
            "VERBOSE" | "X" => Ok(RegexFlag::Verbose),
            "ASCII" | "A" => Ok(RegexFlag::Ascii),
            "UNICODE" | "U" => Ok(RegexFlag::Unicode),
            _ => Err(QueryError::UnknownFlag(s.to_string())),
        }
    }
}

impl RegexFlag {
    fn apply(self, builder: &mut RegexBuilder) {
        match self {
            RegexFlag::CaseInsensitive => builder.case_insensitive(true),
            RegexFlag::MultiLine => builder.multi_line(true),
            RegexFlag::DotAll => builder.dot_matches_new_line(true),
            RegexFlag::Verbose => builder.ignore_whitespace(true),
            RegexFlag::Ascii => builder.unicode(false),
            RegexFlag::Unicode => builder.unicode(true),
        };
    }
}

/// `"flags"` may be a single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlagList {
    One(String),
    Many(Vec<String>),
}

impl Default for FlagList {
    fn default() -> Self {
        FlagList::Many(Vec::new())
    }
}

impl FlagList {
    pub fn names(&self) -> &[String] {
        match self {
            FlagList::One(name) => std::slice::from_ref(name),
            FlagList::Many(names) => names,
        }
    }
}

/// A regex criterion as written in the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegexSpec {
    Pattern(String),
    WithFlags {
        pattern: String,
        #[serde(default)]
        flags: FlagList,
    },
}

impl RegexSpec {
    pub fn compile(&self) -> Result<Regex, QueryError> {
        let (pattern, flags) = match self {
            RegexSpec::Pattern(pattern) => (pattern, &[][..]),
            RegexSpec::WithFlags { pattern, flags } => (pattern, flags.names()),
        };

        let mut builder = RegexBuilder::new(pattern);
        for name in flags {
            name.parse::<RegexFlag>()?.apply(&mut builder);
        }
        builder.build().map_err(|source| QueryError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })
    }
}

/// A query as written in the config.
#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub name: Option<String>,
    pub pages: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub regexes: Vec<RegexSpec>,
}

/// How many criteria of a query matched one piece of text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verdict {
    pub keyword_hits: usize,
    pub regex_hits: usize,
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        self.keyword_hits > 0 || self.regex_hits > 0
    }
}

/// A query with its criteria compiled, ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub name: String,
    pub pages: Vec<String>,
    keywords: Vec<Regex>,
    regexes: Vec<Regex>,
}

impl CompiledQuery {
    /// Compiles `query`. Unnamed queries are called `query #<index + 1>`.
    pub fn compile(index: usize, query: &Query) -> Result<Self, QueryError> {
        let keywords = query
            .keywords
            .iter()
            .map(|keyword| keyword_regex(keyword))
            .collect::<Result<Vec<_>, _>>()?;
        let regexes = query
            .regexes
            .iter()
            .map(RegexSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: query
                .name
                .clone()
                .unwrap_or_else(|| format!("query #{}", index + 1)),
            pages: query.pages.clone(),
            keywords,
            regexes,
        })
    }

    /// Counts matching keywords and regexes in `text`.
    pub fn evaluate(&self, text: &str) -> Verdict {
        Verdict {
            keyword_hits: self.keywords.iter().filter(|re| re.is_match(text)).count(),
            regex_hits: self.regexes.iter().filter(|re| re.is_match(text)).count(),
        }
    }

    pub fn matches_text(&self, text: &str) -> bool {
        self.keywords
            .iter()
            .chain(self.regexes.iter())
            .any(|re| re.is_match(text))
    }

    pub fn matches(&self, entry: &Entry, scope: MatchScope) -> bool {
        self.matches_text(&scope.text(entry))
    }
}

fn keyword_regex(keyword: &str) -> Result<Regex, QueryError> {
    let pattern = format!(r"\b{}\b", regex::escape(keyword.trim()));
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| QueryError::InvalidPattern { pattern, source })
}
