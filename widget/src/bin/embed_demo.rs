//! Loads a page with the widget embedded and performs one action against the API.
//!
//! Point it at a local simulator with `PSICASH_API_URL=http://127.0.0.1:8080/v1`.

use anyhow::{Context, Result};
use clap::Parser;
use psicash_client::{ApiConfig, Client};
use psicash_types::{codec, Action, ActionOptions, ParamSet, SystemClock};
use psicash_widget::config::{IFRAME_PATH, WIDGET_ORIGIN};
use psicash_widget::{
    EmbedOptions, Embedding, Error, LocalStore, MemoryBackend, WidgetConfig,
};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host page URL.
    #[arg(long, default_value = "https://example.com/")]
    page_url: String,

    /// Earner token handed to the page by the app (omit to load without params).
    #[arg(long)]
    tokens: Option<String>,

    /// Action to perform: init, page-view, or click-through.
    #[arg(long, default_value = "page-view")]
    action: String,

    /// Explicit distinguisher (defaults to the page host).
    #[arg(long)]
    distinguisher: Option<String>,

    /// Action timeout in milliseconds (defaults to the action's default).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Use the dev API environment.
    #[arg(long, default_value_t = false)]
    dev: bool,
}

fn page_url(args: &Args) -> Result<String> {
    let Some(tokens) = &args.tokens else {
        return Ok(args.page_url.clone());
    };
    let mut params = ParamSet::with_tokens(tokens).stamped(chrono::Utc::now());
    params.dev = args.dev;
    let payload = codec::encode(&params).context("failed to encode params")?;
    let base = codec::strip_query_and_fragment(&args.page_url).context("invalid page URL")?;
    Ok(format!("{base}#!psicash={payload}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let api = ApiConfig::from_env();
    let client = Client::new(&api).context("failed to build API client")?;
    let url = page_url(&args)?;
    let embedding = Embedding::launch(EmbedOptions {
        page_url: url,
        script_url: format!("{WIDGET_ORIGIN}/v2/psicash.js"),
        iframe_script_url: Some(format!("{WIDGET_ORIGIN}{IFRAME_PATH}")),
        send_referrer: true,
        page_store: LocalStore::new(MemoryBackend::new()),
        iframe_store: LocalStore::new(MemoryBackend::new()),
        client,
        clock: Arc::new(SystemClock),
        config: WidgetConfig::from_env(),
    })
    .context("failed to embed widget")?;
    info!(state = ?embedding.state(), api = %api.prod_url, "widget loaded");

    let mut options = match &args.distinguisher {
        Some(distinguisher) => ActionOptions::distinguisher(distinguisher),
        None => ActionOptions::default(),
    };
    options.timeout = args.timeout_ms;

    let action: Action = args
        .action
        .parse()
        .map_err(|_| Error::UnknownAction(args.action.clone()))?;
    let outcome = embedding.page.call(action, options).await?;

    info!(
        %action,
        error = ?outcome.error,
        success = outcome.success,
        detail = %outcome.detail,
        "action complete"
    );
    println!(
        "error={} success={} detail={}",
        outcome.error.as_deref().unwrap_or("none"),
        outcome.success,
        outcome.detail
    );
    Ok(())
}
