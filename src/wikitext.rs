//! Just enough wikitext handling to read and extend an "External links" section.
//!
//! Pages are treated as lines. A heading is a line of the form `== Title ==`
//! whose level is the smaller of its opening and closing `=` runs. The target
//! section is the **last** level-2 heading whose title contains
//! "External links" (case-insensitive); it runs until the next heading of
//! level 2 or lower. Only its lead, the part before any subsection, is read
//! and written.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

const SECTION_TITLE: &str = "External links";

fn heading_regex() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| {
        Regex::new(r"^(={1,6})(.+?)(={1,6})[ \t]*$").expect("heading regex is valid")
    })
}

/// Bracketed links `[url label]` first, bare URLs otherwise. Schemes are
/// case-insensitive, as the wiki treats them.
fn link_regex() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| {
        Regex::new(
            r#"\[(?P<bracketed>(?:(?i:https?|ftp):)?//[^\s\[\]<>"]+)[^\]\n]*\]|(?P<bare>(?i:https?|ftp)://[^\s\[\]<>"]+)"#,
        )
        .expect("link regex is valid")
    })
}

/// Drops the trailing punctuation the wiki leaves out of a bare URL.
/// A closing parenthesis stays only when the URL also opens one.
fn trim_bare_url(url: &str) -> &str {
    let keep_paren = url.contains('(');
    url.trim_end_matches(|c: char| {
        matches!(c, ',' | ';' | '.' | ':' | '!' | '?') || (c == ')' && !keep_paren)
    })
}

struct Line<'a> {
    /// Byte offset of the line start.
    start: usize,
    /// Byte offset of the line end, excluding the line terminator.
    end: usize,
    text: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\n', '\r']);
        lines.push(Line {
            start,
            end: start + content.len(),
            text: content,
        });
        start += raw.len();
    }
    lines
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let caps = heading_regex().captures(line)?;
    let level = caps[1].len().min(caps[3].len());
    let title = caps.get(2)?.as_str().trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title))
}

/// Line index of the section heading and the line range of its lead.
fn external_links_lead(lines: &[Line<'_>]) -> Option<(usize, Range<usize>)> {
    let needle = SECTION_TITLE.to_lowercase();
    let heading_idx = lines.iter().rposition(|line| {
        matches!(heading(line.text), Some((2, title)) if title.to_lowercase().contains(&needle))
    })?;

    let lead_start = heading_idx + 1;
    let lead_end = lines[lead_start..]
        .iter()
        .position(|line| heading(line.text).is_some())
        .map_or(lines.len(), |offset| lead_start + offset);

    Some((heading_idx, lead_start..lead_end))
}

/// All links found in `text`, in order of appearance.
pub fn find_links(text: &str) -> Vec<&str> {
    link_regex()
        .captures_iter(text)
        .filter_map(|caps| match caps.name("bracketed") {
            Some(m) => Some(m.as_str()),
            None => caps.name("bare").map(|m| trim_bare_url(m.as_str())),
        })
        .collect()
}

/// Whether `link`, written with [`link_item`], reads back as exactly `link`.
///
/// Links that fail this would be added again on every run.
pub fn is_listable(link: &str) -> bool {
    find_links(&link_item(link, "")) == [link]
}

/// Links listed in the lead of the page's "External links" section.
pub fn section_links(text: &str) -> Vec<&str> {
    let lines = split_lines(text);
    let Some((_, lead)) = external_links_lead(&lines) else {
        return Vec::new();
    };
    lines[lead]
        .iter()
        .flat_map(|line| find_links(line.text))
        .collect()
}

/// Page title as the wiki stores it: underscores read as spaces, runs of
/// whitespace collapsed, first letter capitalized.
pub fn normalize_title(title: &str) -> String {
    let spaced = title.replace('_', " ");
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Formats one list item: `* [url title]`.
pub fn link_item(link: &str, title: &str) -> String {
    if title.is_empty() {
        format!("* [{link}]")
    } else {
        format!("* [{link} {title}]")
    }
}

/// Inserts list items into the "External links" section, creating the section if needed.
///
/// Items go right after the last line of the lead that holds a link, so
/// anything trailing the list (navigation templates, notes) stays last.
/// Without existing links they go after the last non-blank line of the lead.
/// The result is trimmed at the end.
pub fn insert_items(text: &str, items: &[String]) -> String {
    if items.is_empty() {
        return text.to_string();
    }
    let block = items.join("\n");
    let lines = split_lines(text);

    let Some((heading_idx, lead)) = external_links_lead(&lines) else {
        let body = text.trim_end();
        let mut out = String::with_capacity(body.len() + block.len() + 32);
        if !body.is_empty() {
            out.push_str(body);
            out.push_str("\n\n");
        }
        out.push_str("== ");
        out.push_str(SECTION_TITLE);
        out.push_str(" ==\n");
        out.push_str(&block);
        return out;
    };

    let anchor = lines[lead.clone()]
        .iter()
        .rposition(|line| !find_links(line.text).is_empty())
        .or_else(|| {
            lines[lead.clone()]
                .iter()
                .rposition(|line| !line.text.trim().is_empty())
        })
        .map_or(heading_idx, |offset| lead.start + offset);

    let anchor_end = lines[anchor].end;
    let head = &text[..anchor_end];
    let rest = &text[anchor_end..];
    let remainder = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);

    let mut out = String::with_capacity(text.len() + block.len() + 2);
    out.push_str(head);
    out.push('\n');
    out.push_str(&block);
    if !remainder.is_empty() {
        out.push('\n');
        let next_line = remainder.lines().next().unwrap_or_default();
        if heading(next_line).is_some() {
            out.push('\n');
        }
        out.push_str(remainder);
    }

    out.truncate(out.trim_end().len());
    out
}
