//! Types shared by the PsiCash widget page script, iframe script, and reward API client.

pub mod api;
pub mod clock;
pub mod codec;
pub mod distinguisher;
pub mod message;
pub mod params;

pub use clock::{Clock, ManualClock, SystemClock};
pub use message::{Action, ActionOptions, Kind, Message, MessageId, Outcome, StorageCommand};
pub use params::{newest, Freshness, ParamSet};

use thiserror::Error;

/// The query or hash param key for tokens, metadata, etc. passed by the app into the
/// landing page, and by the page script into the iframe.
pub const PSICASH_URL_PARAM: &str = "psicash";

/// URL flag enabling verbose widget behavior.
pub const DEBUG_URL_PARAM: &str = "debug";

/// URL flag selecting the dev API and dev storage namespace.
pub const DEV_URL_PARAM: &str = "dev";

/// Storage key (before namespacing) for the reconciled [ParamSet].
pub const PARAMS_STORAGE_KEY: &str = "PsiCashParams";

/// Storage key component for per-(class, distinguisher) cooldowns.
pub const NEXT_ALLOWED_KEY: &str = "nextAllowed";

/// Prefix for everything the widget keeps in prod local storage.
pub const STORAGE_PREFIX: &str = "PsiCash::v2::";

/// Prefix for everything the widget keeps in dev local storage.
pub const STORAGE_PREFIX_DEV: &str = "PsiCash-Dev::v2::";

/// Returns the storage namespace prefix for the given environment.
pub fn storage_prefix(dev: bool) -> &'static str {
    if dev {
        STORAGE_PREFIX_DEV
    } else {
        STORAGE_PREFIX
    }
}

/// Builds a namespaced storage key. Keys that already carry the prefix are returned as-is.
pub fn storage_key(suffix: &str, dev: bool) -> String {
    let prefix = storage_prefix(dev);
    if suffix.starts_with(prefix) {
        suffix.to_string()
    } else {
        format!("{prefix}{suffix}")
    }
}

/// Storage key suffix for the cooldown of a transaction class on a distinguisher.
pub fn next_allowed_key(class: &str, distinguisher: &str) -> String {
    format!("{NEXT_ALLOWED_KEY}::{class}::{distinguisher}")
}

/// Error type for decoding shared types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid timestamp {value:?}: {reason}")]
    Timestamp { value: String, reason: String },
    #[error("timestamp {0} is in the future")]
    FutureTimestamp(String),
    #[error("timestamp {0} is too old")]
    StaleTimestamp(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("message has no id")]
    MissingId,
}

/// Result type for decoding shared types.
pub type Result<T> = std::result::Result<T, Error>;
