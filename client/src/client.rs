use crate::transport::{HttpRequest, HttpTransport, Method, Transport, TransportError};
use crate::{Error, Result};
use psicash_types::api::{
    TokensValid, TransactionBody, AUTH_HEADER, METADATA_HEADER, TRANSACTION_PATH,
    VALIDATE_TOKENS_PATH,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use psicash_types::ParamSet;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Characters `encodeURIComponent` leaves as is.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Production API prefix.
pub const API_URL: &str = "https://api.psi.cash/v1";

/// Dev API prefix.
pub const API_URL_DEV: &str = "https://api.dev.psi.cash/v1";

/// Environment variable overriding the production API prefix.
pub const API_URL_ENV: &str = "PSICASH_API_URL";

/// Environment variable overriding the dev API prefix.
pub const API_URL_DEV_ENV: &str = "PSICASH_API_URL_DEV";

/// Where requests go, selected per request by [ParamSet::dev].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    pub prod_url: String,
    pub dev_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            prod_url: API_URL.to_string(),
            dev_url: API_URL_DEV.to_string(),
        }
    }
}

impl ApiConfig {
    /// Sends both environments to the same prefix (e.g. a local simulator).
    pub fn single(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            prod_url: url.clone(),
            dev_url: url,
        }
    }

    /// Defaults, with `PSICASH_API_URL` and `PSICASH_API_URL_DEV` overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_url(API_URL_ENV) {
            config.prod_url = url;
        }
        if let Some(url) = env_url(API_URL_DEV_ENV) {
            config.dev_url = url;
        }
        config
    }
}

fn env_url(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// How hard to try before giving up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time allowed when a request doesn't name one.
    pub default_budget: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Lower bound on a single attempt's timeout, so the mandatory first attempt of an
    /// already-exhausted budget still has a chance.
    pub min_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_budget: Duration::from_secs(100),
            retry_delay: Duration::from_millis(100),
            min_attempt_timeout: Duration::from_secs(1),
        }
    }
}

/// A request to the reward API.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// Path below the API prefix, e.g. `/transaction`.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Supplies tokens, metadata, and the environment.
    pub params: ParamSet,
    /// Total time allowed, retries included. Uses [RetryPolicy::default_budget] if `None`.
    pub budget: Option<Duration>,
}

impl Request {
    pub fn transaction(class: &str, distinguisher: &str, params: ParamSet) -> Self {
        Self {
            method: Method::Post,
            path: TRANSACTION_PATH.to_string(),
            query: vec![
                ("class".to_string(), class.to_string()),
                ("distinguisher".to_string(), distinguisher.to_string()),
            ],
            params,
            budget: None,
        }
    }

    pub fn validate_tokens(params: ParamSet) -> Self {
        Self {
            method: Method::Get,
            path: VALIDATE_TOKENS_PATH.to_string(),
            query: Vec::new(),
            params,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }
}

/// A terminal (non-5xx) response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    /// The cooldown hint of a transaction response.
    pub fn next_allowed(&self) -> Option<String> {
        TransactionBody::next_allowed_from(&self.body)
    }
}

/// Client for the reward API.
#[derive(Clone)]
pub struct Client<T: Transport = HttpTransport> {
    transport: T,
    prod_url: Url,
    dev_url: Url,
    retry_policy: RetryPolicy,
}

impl Client<HttpTransport> {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Self::with_transport(config, HttpTransport::new()?)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(config: &ApiConfig, transport: T) -> Result<Self> {
        Ok(Self {
            transport,
            prod_url: parse_base(&config.prod_url)?,
            dev_url: parse_base(&config.dev_url)?,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn base_url(&self, dev: bool) -> &Url {
        if dev {
            &self.dev_url
        } else {
            &self.prod_url
        }
    }

    fn endpoint(&self, dev: bool, path: &str, query: &[(String, String)]) -> Result<Url> {
        let base = self.base_url(dev).as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/{}", path.trim_start_matches('/')))?;
        if !query.is_empty() {
            let query = query
                .iter()
                .map(|(name, value)| {
                    format!(
                        "{}={}",
                        utf8_percent_encode(name, COMPONENT),
                        utf8_percent_encode(value, COMPONENT)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    /// Sends a request, retrying transport errors, attempt timeouts, and 5xx responses
    /// every [RetryPolicy::retry_delay] while the budget lasts.
    ///
    /// At least one attempt is always made. Any status below 500 is returned as is; the
    /// caller decides what it means.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let tokens = request
            .params
            .tokens
            .as_deref()
            .filter(|tokens| !tokens.is_empty())
            .ok_or(Error::MissingTokens)?
            .to_string();
        let url = self.endpoint(request.params.dev, &request.path, &request.query)?;
        let budget = request.budget.unwrap_or(self.retry_policy.default_budget);
        let mut metadata = request.params.metadata.clone();

        let start = Instant::now();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            metadata.insert("attempt".to_string(), Value::from(attempt));

            let remaining = budget.saturating_sub(start.elapsed());
            let attempt_timeout = remaining.max(self.retry_policy.min_attempt_timeout);
            let http_request = HttpRequest {
                method: request.method,
                url: url.clone(),
                headers: vec![
                    ("X-Requested-With", "XMLHttpRequest".to_string()),
                    (AUTH_HEADER, tokens.clone()),
                    (METADATA_HEADER, Value::Object(metadata.clone()).to_string()),
                ],
                timeout: attempt_timeout,
            };

            let last = match timeout(attempt_timeout, self.transport.execute(http_request)).await
            {
                Ok(Ok(response)) if response.status < 500 => {
                    debug!(
                        path = %request.path,
                        status = response.status,
                        attempt,
                        dev_env = request.params.dev,
                        "request complete"
                    );
                    return Ok(Response {
                        status: response.status,
                        body: response.body,
                    });
                }
                Ok(Ok(response)) => format!("server error {}", response.status),
                Ok(Err(err)) => err.to_string(),
                Err(_) => TransportError::Timeout.to_string(),
            };

            if start.elapsed() + self.retry_policy.retry_delay > budget {
                warn!(
                    path = %request.path,
                    attempts = attempt,
                    error = %last,
                    dev_env = request.params.dev,
                    "request budget exhausted"
                );
                return Err(Error::Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            debug!(path = %request.path, attempt, error = %last, "request failed; retrying");
            sleep(self.retry_policy.retry_delay).await;
        }
    }

    /// Claims a reward of `class` for `distinguisher`.
    pub async fn transaction(
        &self,
        class: &str,
        distinguisher: &str,
        params: ParamSet,
        budget: Option<Duration>,
    ) -> Result<Response> {
        self.send(Request::transaction(class, distinguisher, params).with_budget(budget))
            .await
    }

    /// Checks whether the params' tokens are still accepted by the server.
    ///
    /// Params without tokens are never valid and cause no network call.
    pub async fn validate_tokens(&self, params: ParamSet) -> Result<bool> {
        if !params.has_tokens() {
            return Ok(false);
        }
        let response = self.send(Request::validate_tokens(params)).await?;
        match response.status {
            200 => {
                let body: TokensValid = serde_json::from_str(&response.body)?;
                let valid = body.any_valid();
                info!(valid, "validated tokens");
                Ok(valid)
            }
            401 => Ok(false),
            status => Err(Error::Failed(status)),
        }
    }
}

fn parse_base(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::InvalidScheme(scheme.to_string())),
    }
}
