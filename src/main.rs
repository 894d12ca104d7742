use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

use feedlinks::config::{
    load_proxy_rules, ConfigLocation, FeedConfig, RunOptions, Settings, DEFAULT_CONFIG_PAGE_TITLE,
    DEFAULT_CONFIG_PATH,
};
use feedlinks::feed::FetchOptions;
use feedlinks::proxy::{ProxyOverrides, ProxyResolver};
use feedlinks::query::MatchScope;
use feedlinks::runner::{RunSummary, Runner};
use feedlinks::wiki::{MediaWikiClient, MediaWikiConfig, MemoryStore, PageStore};

/// Env var holding the bot password; overrides the settings file.
const PASSWORD_ENV: &str = "FEEDLINKS_PASSWORD";

/// Get the config directory path (~/.config/feedlinks/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedlinks"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigType {
    File,
    Wiki,
}

#[derive(Parser, Debug)]
#[command(
    name = "feedlinks",
    version,
    about = "Add links from matching feed entries to wiki External links sections"
)]
struct Args {
    /// Where to read the feed config from
    #[arg(long, value_enum, default_value = "file")]
    config_type: ConfigType,

    /// Feed config file (also the fallback for --config-type wiki)
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Wiki page holding the feed config
    #[arg(long, value_name = "TITLE", default_value = DEFAULT_CONFIG_PAGE_TITLE)]
    config_page_title: String,

    /// JSON file mapping source patterns to proxies
    #[arg(long, value_name = "FILE")]
    proxies_path: Option<PathBuf>,

    /// Proxy for every source and scheme
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Proxy for http sources
    #[arg(long, value_name = "URL")]
    http_proxy: Option<String>,

    /// Proxy for https sources
    #[arg(long, value_name = "URL")]
    https_proxy: Option<String>,

    /// How many pages to preload at once
    #[arg(long, value_name = "N")]
    group: Option<usize>,

    /// Settings file [default: ~/.config/feedlinks/settings.toml]
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Compute edits and log them without saving
    #[arg(long)]
    dry_run: bool,

    /// Seconds to wait between edits
    #[arg(long, value_name = "SECS")]
    edit_delay: Option<u64>,

    /// Feeds fetched concurrently
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Part of each entry that queries are matched against
    #[arg(long, value_enum)]
    match_scope: Option<MatchScope>,

    /// Give up on outstanding fetches and edits after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run_options(args: &Args, settings: &Settings) -> RunOptions {
    RunOptions {
        group: args.group.unwrap_or(settings.group),
        edit_delay: Duration::from_secs(args.edit_delay.unwrap_or(settings.edit_delay_secs)),
        dry_run: args.dry_run,
        match_scope: args.match_scope.or(settings.match_scope),
        fetch: FetchOptions {
            workers: args.workers.unwrap_or(settings.workers),
            timeout: Duration::from_secs(settings.fetch_timeout_secs),
            user_agent: settings.user_agent.clone(),
            deadline: None,
        },
        run_timeout: args.timeout.map(Duration::from_secs),
    }
}

async fn connect(settings: &Settings, api_url: &str) -> Result<MediaWikiClient> {
    let password = std::env::var(PASSWORD_ENV)
        .ok()
        .or_else(|| settings.password.clone())
        .map(SecretString::from);

    let client = MediaWikiClient::new(MediaWikiConfig {
        api_url: api_url
            .parse()
            .with_context(|| format!("Invalid api_url: {api_url}"))?,
        user_agent: settings.user_agent.clone(),
        username: settings.username.clone(),
        password,
        timeout: Duration::from_secs(settings.fetch_timeout_secs),
        request_interval: Duration::from_millis(settings.request_interval_ms),
    })
    .context("Failed to create wiki client")?;
    client.login().await.context("Failed to log in to wiki")?;
    Ok(client)
}

async fn execute<S: PageStore>(
    args: &Args,
    options: &RunOptions,
    resolver: &ProxyResolver,
    store: &S,
) -> Result<RunSummary> {
    let location = match args.config_type {
        ConfigType::File => ConfigLocation::File(args.config_path.clone()),
        ConfigType::Wiki => ConfigLocation::Wiki {
            title: args.config_page_title.clone(),
            fallback: args.config_path.clone(),
        },
    };
    let config = FeedConfig::load(&location, store)
        .await
        .context("Failed to load feed config")?;

    let runner = Runner::new(options, resolver, store);
    tokio::select! {
        summary = runner.run(&config) => Ok(summary),
        _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let settings_path = match &args.settings {
        Some(path) => path.clone(),
        None => get_config_dir()?.join("settings.toml"),
    };
    let settings = Settings::load(&settings_path).context("Failed to load settings")?;
    tracing::debug!(?settings, "Effective settings");

    let rules = match &args.proxies_path {
        Some(path) => load_proxy_rules(path).context("Failed to load proxies file")?,
        None => Vec::new(),
    };
    let resolver = ProxyResolver::new(
        ProxyOverrides {
            proxy: args.proxy.clone(),
            http: args.http_proxy.clone(),
            https: args.https_proxy.clone(),
        },
        rules,
    );
    let options = run_options(&args, &settings);

    let summary = match settings.api_url.as_deref() {
        Some(api_url) => {
            let client = connect(&settings, api_url).await?;
            execute(&args, &options, &resolver, &client).await?
        }
        None if args.dry_run => {
            tracing::warn!("No api_url configured, dry run against empty pages");
            execute(&args, &options, &resolver, &MemoryStore::new()).await?
        }
        None => anyhow::bail!(
            "No api_url set in {}; add one or use --dry-run",
            settings_path.display()
        ),
    };

    println!("{summary}");
    Ok(())
}
