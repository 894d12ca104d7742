use feed_rs::parser;
use url::Url;

/// One item of a parsed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub title: String,
    /// Absolute http(s) URL.
    pub link: String,
    /// Summary text, falling back to the content body; empty when neither exists.
    pub summary: String,
}

/// Entries extracted from a feed plus the number of items dropped for
/// having no usable link.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub entries: Vec<Entry>,
    pub skipped: usize,
}

/// Parses RSS/Atom/JSON Feed bytes into entries, preserving document order.
///
/// Relative links are resolved against `base`, the URL the feed was fetched
/// from. Items whose link is still not an absolute http(s) URL are skipped.
pub fn parse_entries(bytes: &[u8], base: Option<&Url>) -> Result<ParseResult, parser::ParseFeedError> {
    let feed = parser::Builder::new()
        .base_uri(base.map(Url::as_str))
        .build()
        .parse(bytes)?;

    let mut result = ParseResult::default();
    for item in feed.entries {
        let Some(link) = item
            .links
            .first()
            .and_then(|l| absolute_link(l.href.trim(), base))
        else {
            tracing::debug!(
                id = %item.id,
                href = ?item.links.first().map(|l| &l.href),
                "Skipping entry without a usable link"
            );
            result.skipped += 1;
            continue;
        };

        let title = item
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string());
        let summary = item
            .summary
            .map(|s| s.content)
            .or_else(|| item.content.and_then(|c| c.body))
            .unwrap_or_default();

        result.entries.push(Entry {
            title,
            link,
            summary,
        });
    }

    Ok(result)
}

/// The feed's own spelling of an absolute link is kept; relative links and
/// links with characters wikitext cannot hold use the URL's serialization.
fn absolute_link(href: &str, base: Option<&Url>) -> Option<String> {
    if href.is_empty() {
        return None;
    }
    let (url, relative) = match Url::parse(href) {
        Ok(url) => (url, false),
        Err(url::ParseError::RelativeUrlWithoutBase) => (base?.join(href).ok()?, true),
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let awkward = href.contains(|c: char| c.is_whitespace() || matches!(c, '"' | '<' | '>'));
    if relative || awkward {
        Some(url.into())
    } else {
        Some(href.to_string())
    }
}
