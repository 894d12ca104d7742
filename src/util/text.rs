use std::borrow::Cow;

/// Makes feed-supplied text safe to use as the label of a wikitext external link.
///
/// Feed titles are user-controlled and frequently carry stray markup:
///
/// - Control characters, tabs and newlines collapse into a single space
///   (a newline would terminate the list item the link lives in)
/// - Runs of whitespace collapse to one space, leading/trailing whitespace is trimmed
/// - `[` and `]` become `&#91;` / `&#93;` so they cannot close the link early
///
/// Returns `Cow::Borrowed` when the input needs no changes (common case).
///
/// # Examples
///
/// ```
/// use feedlinks::util::sanitize_link_title;
///
/// assert_eq!(sanitize_link_title("Plain title"), "Plain title");
/// assert_eq!(sanitize_link_title("Line\nbreak"), "Line break");
/// assert_eq!(sanitize_link_title("[Draft] notes"), "&#91;Draft&#93; notes");
/// ```
pub fn sanitize_link_title(s: &str) -> Cow<'_, str> {
    let needs_work = s.chars().any(|c| c.is_control() || c == '[' || c == ']')
        || s.contains("  ")
        || s.trim() != s;

    if !needs_work {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;

    for c in s.chars() {
        if c.is_whitespace() || c.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        match c {
            '[' => out.push_str("&#91;"),
            ']' => out.push_str("&#93;"),
            _ => out.push(c),
        }
    }

    Cow::Owned(out)
}

/// Formats `count` with a singular or plural noun ("1 external link", "3 external links").
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
