use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Where a feed's content comes from.
///
/// Config files list sources as bare strings; the kind is decided once, at
/// load time, by probing in order: remote URL, local path, literal markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// An `http` or `https` URL fetched over the network.
    RemoteUrl(Url),
    /// A file on disk, given either as a path or a `file://` URL.
    LocalPath(PathBuf),
    /// The string is itself feed markup.
    LiteralContent,
}

/// A configured feed source.
///
/// Keeps the string exactly as written in the config: proxy rules are
/// matched against it, and it is what the logs show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    raw: String,
    kind: SourceKind,
}

impl Source {
    /// Classifies a source string.
    ///
    /// - Parses as a URL with scheme `http`/`https` → [`SourceKind::RemoteUrl`]
    /// - Parses as a `file://` URL → [`SourceKind::LocalPath`]
    /// - Names an existing file → [`SourceKind::LocalPath`]
    /// - Anything else → [`SourceKind::LiteralContent`]
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let kind = Self::classify_kind(&raw);
        Self { raw, kind }
    }

    fn classify_kind(raw: &str) -> SourceKind {
        let trimmed = raw.trim();

        if let Ok(url) = Url::parse(trimmed) {
            match url.scheme() {
                "http" | "https" => return SourceKind::RemoteUrl(url),
                "file" => {
                    if let Ok(path) = url.to_file_path() {
                        return SourceKind::LocalPath(path);
                    }
                }
                _ => {}
            }
        }

        // Markup never names a file; skip the filesystem check for it.
        if !trimmed.starts_with('<') && !trimmed.starts_with('{') {
            let path = Path::new(trimmed);
            if path.is_file() {
                return SourceKind::LocalPath(path.to_path_buf());
            }
        }

        SourceKind::LiteralContent
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            // Literal markup can be kilobytes long; keep log lines readable.
            SourceKind::LiteralContent => {
                let preview: String = self.raw.trim().chars().take(40).collect();
                write!(f, "<literal feed: {preview}...>")
            }
            _ => f.write_str(&self.raw),
        }
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Source::classify)
    }
}
