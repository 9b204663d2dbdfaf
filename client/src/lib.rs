//! Client for the PsiCash reward API.
//!
//! Every request is retried within a time budget, so callers get a single definitive
//! answer: a response with a status below 500, or an error once the budget is spent.

pub mod client;
pub mod transport;

pub use client::{ApiConfig, Client, Request, Response, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError};
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("no tokens available")]
    MissingTokens,
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("failed: {0}")]
    Failed(u16),
    #[error("{last} (after {attempts} attempts)")]
    Exhausted { attempts: u64, last: String },
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
