use super::{invalid_title, Page, PageError, PageRead, PageStore};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

/// Titles per `action=query` request (the API limit for non-bot accounts).
const MAX_TITLES_PER_QUERY: usize = 50;

/// Connection settings for a MediaWiki Action API endpoint.
#[derive(Clone)]
pub struct MediaWikiConfig {
    /// e.g. `https://wiki.example.org/w/api.php`
    pub api_url: Url,
    pub user_agent: String,
    /// Bot password credentials (`User@BotName`). Anonymous when absent.
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub timeout: Duration,
    /// Minimum spacing between any two API requests.
    pub request_interval: Duration,
}

impl std::fmt::Debug for MediaWikiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaWikiConfig")
            .field("api_url", &self.api_url.as_str())
            .field("user_agent", &self.user_agent)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("request_interval", &self.request_interval)
            .finish()
    }
}

/// [`PageStore`] backed by the MediaWiki Action API (`formatversion=2`).
pub struct MediaWikiClient {
    client: reqwest::Client,
    config: MediaWikiConfig,
    last_request: Mutex<Option<Instant>>,
    csrf_token: Mutex<Option<String>>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    curtimestamp: Option<String>,
    #[serde(default)]
    query: QueryBody,
}

#[derive(Debug, Default, Deserialize)]
struct QueryBody {
    #[serde(default)]
    normalized: Vec<Normalized>,
    #[serde(default)]
    pages: Vec<ApiPage>,
    #[serde(default)]
    tokens: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Normalized {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    redirect: bool,
    #[serde(default)]
    revisions: Vec<ApiRevision>,
}

#[derive(Debug, Deserialize)]
struct ApiRevision {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    slots: Option<ApiSlots>,
}

#[derive(Debug, Deserialize)]
struct ApiSlots {
    main: ApiSlot,
}

#[derive(Debug, Deserialize)]
struct ApiSlot {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

impl MediaWikiClient {
    pub fn new(config: MediaWikiConfig) -> Result<Self, PageError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            config,
            last_request: Mutex::new(None),
            csrf_token: Mutex::new(None),
        })
    }

    /// Logs in with the configured bot password. No-op without credentials.
    pub async fn login(&self) -> Result<(), PageError> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            tracing::debug!("No wiki credentials configured, editing anonymously");
            return Ok(());
        };

        let tokens: QueryResponse = decode(
            self.get(&[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ])
            .await?,
        )?;
        let login_token = tokens
            .query
            .tokens
            .get("logintoken")
            .cloned()
            .ok_or_else(|| PageError::Decode("missing login token".to_string()))?;

        let response = self
            .post(&[
                ("action", "login".to_string()),
                ("lgname", username.clone()),
                ("lgpassword", password.expose_secret().to_string()),
                ("lgtoken", login_token),
            ])
            .await?;

        let result = response
            .pointer("/login/result")
            .and_then(Value::as_str)
            .unwrap_or("Failed");
        if result != "Success" {
            let reason = response
                .pointer("/login/reason")
                .and_then(Value::as_str)
                .unwrap_or(result);
            return Err(PageError::Auth(reason.to_string()));
        }

        tracing::info!(user = %username, "Logged in to wiki");
        Ok(())
    }

    async fn csrf_token(&self) -> Result<String, PageError> {
        let mut cached = self.csrf_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let tokens: QueryResponse = decode(
            self.get(&[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
            ])
            .await?,
        )?;
        let token = tokens
            .query
            .tokens
            .get("csrftoken")
            .cloned()
            .ok_or_else(|| PageError::Decode("missing CSRF token".to_string()))?;

        *cached = Some(token.clone());
        Ok(token)
    }

    async fn get(&self, params: &[(&str, String)]) -> Result<Value, PageError> {
        self.throttle().await;
        let response = self
            .client
            .get(self.config.api_url.clone())
            .query(&with_format(params))
            .send()
            .await?;
        read_response(response).await
    }

    async fn post(&self, params: &[(&str, String)]) -> Result<Value, PageError> {
        self.throttle().await;
        let response = self
            .client
            .post(self.config.api_url.clone())
            .form(&with_format(params))
            .send()
            .await?;
        read_response(response).await
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let next_allowed = previous + self.config.request_interval;
            if Instant::now() < next_allowed {
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn load_chunk(&self, titles: &[String]) -> Result<Vec<PageRead>, PageError> {
        let response: QueryResponse = decode(
            self.get(&[
                ("action", "query".to_string()),
                ("prop", "revisions|info".to_string()),
                ("rvprop", "content|timestamp".to_string()),
                ("rvslots", "main".to_string()),
                ("curtimestamp", "1".to_string()),
                ("titles", titles.join("|")),
            ])
            .await?,
        )?;

        let normalized: HashMap<&str, &str> = response
            .query
            .normalized
            .iter()
            .map(|n| (n.from.as_str(), n.to.as_str()))
            .collect();
        let by_title: HashMap<&str, &ApiPage> = response
            .query
            .pages
            .iter()
            .map(|p| (p.title.as_str(), p))
            .collect();

        Ok(titles
            .iter()
            .map(|requested| {
                let canonical = normalized
                    .get(requested.as_str())
                    .copied()
                    .unwrap_or(requested.as_str());
                // Interwiki titles come back under `interwiki`, not `pages`.
                let api_page = by_title.get(canonical).ok_or_else(|| {
                    PageError::Decode(format!("page \"{requested}\" missing from response"))
                })?;
                if api_page.invalid {
                    return Err(invalid_title(requested));
                }

                let revision = api_page.revisions.first();
                Ok(Page {
                    title: api_page.title.clone(),
                    text: revision
                        .and_then(|r| r.slots.as_ref())
                        .and_then(|s| s.main.content.clone())
                        .unwrap_or_default(),
                    exists: !api_page.missing,
                    is_redirect: api_page.redirect,
                    revision: revision.and_then(|r| r.timestamp.clone()),
                    read_at: response.curtimestamp.clone(),
                })
            })
            .collect())
    }
}

impl PageStore for MediaWikiClient {
    async fn load_pages(&self, titles: &[String]) -> Result<Vec<PageRead>, PageError> {
        let mut pages = Vec::with_capacity(titles.len());
        for chunk in titles.chunks(MAX_TITLES_PER_QUERY) {
            pages.extend(self.load_chunk(chunk).await?);
        }
        Ok(pages)
    }

    async fn save_page(&self, page: &Page, text: &str, summary: &str) -> Result<(), PageError> {
        let token = self.csrf_token().await?;

        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", page.title.clone()),
            ("text", text.to_string()),
            ("summary", summary.to_string()),
            ("token", token),
        ];
        if page.exists {
            params.push(("nocreate", "1".to_string()));
        } else {
            params.push(("createonly", "1".to_string()));
        }
        if let Some(revision) = &page.revision {
            params.push(("basetimestamp", revision.clone()));
        }
        if let Some(read_at) = &page.read_at {
            params.push(("starttimestamp", read_at.clone()));
        }

        let response = match self.post(&params).await {
            Err(PageError::Api { code, info }) if code == "badtoken" => {
                // Session expired between token fetch and edit; next save refetches.
                *self.csrf_token.lock().await = None;
                return Err(PageError::Api { code, info });
            }
            other => other?,
        };

        let result = response
            .pointer("/edit/result")
            .and_then(Value::as_str)
            .unwrap_or("Failure");
        if result != "Success" {
            return Err(PageError::Api {
                code: result.to_string(),
                info: response
                    .get("edit")
                    .map(Value::to_string)
                    .unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn with_format(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    pairs.extend(params.iter().map(|(k, v)| ((*k).to_string(), v.clone())));
    pairs
}

async fn read_response(response: reqwest::Response) -> Result<Value, PageError> {
    let status = response.status();
    if !status.is_success() {
        return Err(PageError::HttpStatus(status.as_u16()));
    }

    let payload: Value = response.json().await?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info")
            .to_string();
        return Err(classify_error(code, info));
    }
    Ok(payload)
}

fn classify_error(code: String, info: String) -> PageError {
    match code.as_str() {
        "editconflict" | "pagedeleted" => PageError::Conflict(info),
        "ratelimited" => PageError::RateLimited(info),
        "permissiondenied" | "protectedpage" | "cascadeprotected" | "blocked"
        | "autoblocked" | "writeapidenied" | "readonly" => PageError::Permission { code, info },
        _ => PageError::Api { code, info },
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, PageError> {
    serde_json::from_value(value).map_err(|e| PageError::Decode(e.to_string()))
}
