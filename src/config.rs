//! Configuration loading.
//!
//! Three documents feed a run:
//!
//! - **Settings** (`settings.toml`, optional): wiki connection and run
//!   defaults. A missing file yields `Settings::default()`.
//! - **Feed config** (JSON): sources and queries, read from a local file or
//!   from a wiki page.
//! - **Proxies file** (JSON, optional): ordered pattern → proxy rules.
//!
//! Everything is validated up front; any error here aborts the run before
//! a single feed is fetched.
use crate::feed::{FetchOptions, Source};
use crate::proxy::{ProxyRule, ProxyRules};
use crate::query::{MatchScope, Query};
use crate::wiki::{PageError, PageStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the feed config file.
pub const DEFAULT_CONFIG_PATH: &str = "./config.json";
/// Default title of the wiki page holding the feed config.
pub const DEFAULT_CONFIG_PAGE_TITLE: &str = "MediaWiki:Feed external links/config.json";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in settings file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid proxy pattern \"{pattern}\": {source}")]
    InvalidProxyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Structurally valid JSON that breaks a config rule.
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to read config page: {0}")]
    Wiki(#[from] PageError),
}

/// Maximum size of any config document (1 MB).
const MAX_FILE_SIZE: u64 = 1_048_576;

fn read_limited(path: &Path) -> Result<String, ConfigError> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_FILE_SIZE {
        return Err(ConfigError::TooLarge(format!(
            "{} is {} bytes (max {} bytes)",
            path.display(),
            meta.len(),
            MAX_FILE_SIZE
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

// ============================================================================
// Settings
// ============================================================================

/// Wiki connection and run defaults from `settings.toml`.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Command-line flags take precedence over these values.
///
/// Custom Debug impl masks `password`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// MediaWiki Action API endpoint, e.g. `https://wiki.example.org/w/api.php`.
    pub api_url: Option<String>,

    /// Bot password user name (`User@BotName`).
    pub username: Option<String>,

    /// Bot password. The `FEEDLINKS_PASSWORD` env var takes precedence.
    pub password: Option<String>,

    pub user_agent: String,

    /// How many pages to preload at once.
    pub group: usize,

    /// Minimum seconds between two page edits.
    pub edit_delay_secs: u64,

    /// Maximum number of feeds fetched concurrently.
    pub workers: usize,

    /// Per-feed request timeout in seconds.
    pub fetch_timeout_secs: u64,

    /// Minimum milliseconds between two wiki API requests.
    pub request_interval_ms: u64,

    pub match_scope: Option<MatchScope>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: None,
            username: None,
            password: None,
            user_agent: concat!("feedlinks/", env!("CARGO_PKG_VERSION")).to_string(),
            group: 50,
            edit_delay_secs: 10,
            workers: 5,
            fetch_timeout_secs: 30,
            request_interval_ms: 100,
            match_scope: None,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("user_agent", &self.user_agent)
            .field("group", &self.group)
            .field("edit_delay_secs", &self.edit_delay_secs)
            .field("workers", &self.workers)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("request_interval_ms", &self.request_interval_ms)
            .field("match_scope", &self.match_scope)
            .finish()
    }
}

impl Settings {
    const KNOWN_KEYS: [&'static str; 10] = [
        "api_url",
        "username",
        "password",
        "user_agent",
        "group",
        "edit_delay_secs",
        "workers",
        "fetch_timeout_secs",
        "request_interval_ms",
        "match_scope",
    ];

    /// Load settings from a TOML file.
    ///
    /// - Missing file → `Ok(Settings::default())`
    /// - Empty file → `Ok(Settings::default())`
    /// - Invalid TOML → `Err(ConfigError::Toml)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match read_limited(path) {
            Ok(c) => c,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Settings file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in settings file, ignoring");
                }
            }
        }

        let settings: Settings = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }
}

// ============================================================================
// Feed Config
// ============================================================================

/// Sources and queries for a run.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub sources: Vec<Source>,
    pub queries: Vec<Query>,
    /// Used when neither the command line nor the settings choose a scope.
    #[serde(default)]
    pub match_scope: Option<MatchScope>,
}

/// Where the feed config is read from.
#[derive(Debug, Clone)]
pub enum ConfigLocation {
    File(PathBuf),
    /// A wiki page; `fallback` is read if the page is missing or not valid JSON.
    Wiki { title: String, fallback: PathBuf },
}

impl FeedConfig {
    /// Parses and validates a feed config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: FeedConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::from_json(&read_limited(path)?)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            queries = config.queries.len(),
            "Loaded feed config"
        );
        Ok(config)
    }

    /// Loads from `location`, falling back to the local file when the wiki
    /// page does not exist or does not hold valid JSON.
    pub async fn load<S: PageStore>(
        location: &ConfigLocation,
        store: &S,
    ) -> Result<Self, ConfigError> {
        let (title, fallback) = match location {
            ConfigLocation::File(path) => return Self::load_file(path),
            ConfigLocation::Wiki { title, fallback } => (title, fallback),
        };

        let page = store.load_page(title).await?;
        if !page.exists {
            tracing::error!(page = %title, "Config page does not exist, using local file");
            return Self::load_file(fallback);
        }

        match serde_json::from_str::<FeedConfig>(&page.text) {
            Ok(config) => {
                config.validate()?;
                tracing::info!(
                    page = %title,
                    sources = config.sources.len(),
                    queries = config.queries.len(),
                    "Loaded feed config from wiki"
                );
                Ok(config)
            }
            Err(e) => {
                tracing::error!(page = %title, error = %e, "Config page is not valid JSON, using local file");
                Self::load_file(fallback)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, query) in self.queries.iter().enumerate() {
            let name = query
                .name
                .clone()
                .unwrap_or_else(|| format!("query #{}", i + 1));
            if query.pages.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} has no pages")));
            }
            if query.pages.iter().any(|p| p.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("{name} has an empty page title")));
            }
            if query.keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("{name} has an empty keyword")));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Proxies File
// ============================================================================

/// Loads and compiles the proxies file. Rules keep their file order.
pub fn load_proxy_rules(path: &Path) -> Result<Vec<ProxyRule>, ConfigError> {
    let rules: ProxyRules = serde_json::from_str(&read_limited(path)?)?;
    let count = rules.0.len();
    let compiled = rules
        .compile()
        .map_err(|(pattern, source)| ConfigError::InvalidProxyPattern { pattern, source })?;
    tracing::info!(path = %path.display(), rules = count, "Loaded proxy rules");
    Ok(compiled)
}

// ============================================================================
// Run Options
// ============================================================================

/// Everything a run needs besides its inputs, assembled once at startup.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How many pages to preload at once.
    pub group: usize,
    /// Minimum time between two edits.
    pub edit_delay: Duration,
    /// Compute and log edits without saving them.
    pub dry_run: bool,
    /// Explicit scope; `None` defers to the feed config, then to the default.
    pub match_scope: Option<MatchScope>,
    pub fetch: FetchOptions,
    /// Remaining fetches and page writes are abandoned after this long.
    pub run_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            group: 50,
            edit_delay: Duration::ZERO,
            dry_run: false,
            match_scope: None,
            fetch: FetchOptions::default(),
            run_timeout: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wiki::MemoryStore;

    fn temp_file(dir_name: &str, file: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    const CONFIG: &str = r#"{
        "sources": ["https://example.org/rss"],
        "queries": [{"pages": ["Test"], "keywords": ["STEM"], "regexes": []}]
    }"#;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.group, 50);
        assert_eq!(settings.workers, 5);
        assert!(settings.api_url.is_none());
        assert!(settings.match_scope.is_none());
    }

    #[test]
    fn test_missing_settings_file_returns_default() {
        let path = Path::new("/tmp/feedlinks_test_nonexistent_settings.toml");
        let settings = Settings::load(path).unwrap();
        assert_eq!(settings.group, 50);
    }

    #[test]
    fn test_partial_settings_use_defaults_for_missing() {
        let (dir, path) = temp_file(
            "feedlinks_settings_test_partial",
            "settings.toml",
            "group = 10\nmatch_scope = \"title\"\n",
        );

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.group, 10);
        assert_eq!(settings.match_scope, Some(MatchScope::Title));
        assert_eq!(settings.workers, 5); // default

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = temp_file(
            "feedlinks_settings_test_invalid",
            "settings.toml",
            "this is not [valid toml",
        );

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
        assert!(err.to_string().contains("Invalid TOML"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = temp_file(
            "feedlinks_settings_test_too_large",
            "settings.toml",
            &"a".repeat(1_048_577),
        );

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_debug_masks_password() {
        let settings = Settings {
            password: Some("super-secret-password".to_string()),
            ..Settings::default()
        };
        let output = format!("{:?}", settings);
        assert!(!output.contains("super-secret-password"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn test_feed_config_parses() {
        let config = FeedConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.queries[0].pages, vec!["Test"]);
        assert!(config.match_scope.is_none());
    }

    #[test]
    fn test_feed_config_regex_forms() {
        let config = FeedConfig::from_json(
            r#"{"sources": [], "queries": [{"pages": ["P"], "regexes": ["a", {"pattern": "b", "flags": ["IGNORECASE"]}, {"pattern": "c"}]}]}"#,
        )
        .unwrap();
        assert_eq!(config.queries[0].regexes.len(), 3);
    }

    #[test]
    fn test_feed_config_rejects_empty_pages() {
        let err = FeedConfig::from_json(r#"{"sources": [], "queries": [{"pages": []}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("query #1")));
    }

    #[test]
    fn test_feed_config_missing_field_is_json_error() {
        let err = FeedConfig::from_json(r#"{"queries": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_proxy_rules_file() {
        let (dir, path) = temp_file(
            "feedlinks_proxies_test_ok",
            "proxies.json",
            r#"{"^https://a\\.": "http://p1:1", ".*": {"http": "http://p2:2"}}"#,
        );

        let rules = load_proxy_rules(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern.as_str(), r"^https://a\.");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_proxy_rules_invalid_pattern_is_fatal() {
        let (dir, path) = temp_file(
            "feedlinks_proxies_test_bad",
            "proxies.json",
            r#"{"[unclosed": "http://p:1"}"#,
        );

        let err = load_proxy_rules(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProxyPattern { pattern, .. } if pattern == "[unclosed"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_load_from_wiki_page() {
        let store = MemoryStore::new().with_page(DEFAULT_CONFIG_PAGE_TITLE, CONFIG);
        let location = ConfigLocation::Wiki {
            title: DEFAULT_CONFIG_PAGE_TITLE.to_string(),
            fallback: PathBuf::from("/nonexistent/config.json"),
        };
        let config = FeedConfig::load(&location, &store).await.unwrap();
        assert_eq!(config.queries.len(), 1);
    }

    #[tokio::test]
    async fn test_wiki_missing_page_falls_back_to_file() {
        let (dir, path) = temp_file("feedlinks_config_test_fallback", "config.json", CONFIG);
        let location = ConfigLocation::Wiki {
            title: "MediaWiki:Missing".to_string(),
            fallback: path,
        };

        let config = FeedConfig::load(&location, &MemoryStore::new()).await.unwrap();
        assert_eq!(config.sources.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_wiki_invalid_json_falls_back_to_file() {
        let (dir, path) = temp_file("feedlinks_config_test_badjson", "config.json", CONFIG);
        let store = MemoryStore::new().with_page("MediaWiki:Cfg", "{ not json");
        let location = ConfigLocation::Wiki {
            title: "MediaWiki:Cfg".to_string(),
            fallback: path,
        };

        let config = FeedConfig::load(&location, &store).await.unwrap();
        assert_eq!(config.queries.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
