//! The PsiCash earning widget.
//!
//! A host page loads [page::PageController], which embeds an iframe served from the widget
//! origin running [iframe::IframeController]. The page asks for actions (`init`,
//! `page-view`, `click-through`); the iframe holds the user's tokens, enforces cooldowns,
//! and talks to the PsiCash API. The two sides only communicate through
//! [protocol] messages, each checked against the origin it should come from.

pub mod config;
pub mod embed;
pub mod iframe;
pub mod page;
pub mod protocol;
pub mod reconcile;
pub mod storage;

pub use config::{ActionTimeouts, WidgetConfig};
pub use embed::{EmbedOptions, Embedding};
pub use iframe::{IframeController, IframeEnv, SessionState};
pub use page::{Callback, PageController, PageEnv};
pub use protocol::{ChannelPort, FramePort, MessageEvent};
pub use storage::{BlockedBackend, LocalStore, MemoryBackend, StorageBackend, StorageError};
use thiserror::Error;

/// Error type for widget operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("PsiCash action name is invalid: {0}")]
    UnknownAction(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("only allowed when local testing is enabled")]
    NotLocalTesting,
    #[error("no async runtime available")]
    NoRuntime,
    #[error(transparent)]
    Types(#[from] psicash_types::Error),
    #[error(transparent)]
    Client(#[from] psicash_client::Error),
}

/// Result type for widget operations.
pub type Result<T> = std::result::Result<T, Error>;
