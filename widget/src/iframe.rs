//! The widget iframe: holds the session, validates actions against the embedding page,
//! and claims rewards from the API.

use crate::config::WidgetConfig;
use crate::protocol::{accept, new_message_id, origin_of, post, FramePort, MessageEvent, ANY_ORIGIN};
use crate::reconcile::{reconcile, UrlFlags};
use crate::storage::LocalStore;
use chrono::{DateTime, Utc};
use psicash_client::{Client, Transport};
use psicash_types::{
    distinguisher, next_allowed_key, Action, Clock, Kind, Message, ParamSet, StorageCommand,
    PARAMS_STORAGE_KEY,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Error attached to every reply when the embedding page can't be identified.
pub const NO_REFERRER_ERROR: &str = "document.referrer is unavailable";

/// Error attached to actions when there are no usable tokens.
pub const NO_TOKENS_ERROR: &str = "no tokens available";

/// What the iframe knows about where it was loaded.
#[derive(Clone, Debug, Default)]
pub struct IframeEnv {
    /// The iframe document URL, carrying the page's params in its hash.
    pub url: String,
    /// The iframe script URL, which may carry `dev`/`debug` flags.
    pub script_url: Option<String>,
    /// `document.referrer`: the URL of the embedding page, if the browser sent one.
    pub referrer: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    ParamsResolved,
    /// `ready` was sent; actions are served.
    Ready,
    /// Unrecoverable; every reply carries the fatal error.
    Fatal,
}

struct Session {
    state: SessionState,
    params: ParamSet,
    fatal: Option<String>,
    referrer: Option<Url>,
    page_origin: Option<String>,
}

struct Inner<T: Transport, P: FramePort> {
    client: Client<T>,
    port: P,
    store: LocalStore,
    clock: Arc<dyn Clock>,
    config: WidgetConfig,
    session: Mutex<Session>,
    in_flight: AtomicUsize,
}

/// The iframe side of the widget. Clones share the same session.
pub struct IframeController<T: Transport, P: FramePort> {
    inner: Arc<Inner<T, P>>,
}

impl<T: Transport, P: FramePort> Clone for IframeController<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Decrements the in-flight count when an action completes.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Transport, P: FramePort> IframeController<T, P> {
    pub fn new(
        client: Client<T>,
        port: P,
        store: LocalStore,
        clock: Arc<dyn Clock>,
        config: WidgetConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                port,
                store,
                clock,
                config,
                session: Mutex::new(Session {
                    state: SessionState::Uninitialized,
                    params: ParamSet::default(),
                    fatal: None,
                    referrer: None,
                    page_origin: None,
                }),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    /// The session params.
    pub fn params(&self) -> ParamSet {
        self.session().params.clone()
    }

    fn is_fatal(&self) -> bool {
        self.session().fatal.is_some()
    }

    /// The origin of the embedding page, once known.
    pub fn page_origin(&self) -> Option<String> {
        self.session().page_origin.clone()
    }

    /// Number of actions currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves the session params and announces readiness to the page.
    ///
    /// A missing referrer makes the session fatal, but `ready` is still sent so the page
    /// learns the error from its first reply.
    pub fn initialize(&self, env: &IframeEnv) -> SessionState {
        let inner = &self.inner;
        let referrer = env
            .referrer
            .as_deref()
            .filter(|referrer| !referrer.is_empty())
            .and_then(|referrer| Url::parse(referrer).ok());
        let page_origin = referrer.as_ref().and_then(|url| origin_of(url.as_str()));
        let fatal = match (&referrer, &page_origin) {
            (Some(_), Some(_)) => None,
            _ => {
                error!(error = NO_REFERRER_ERROR, "cannot validate distinguishers");
                Some(NO_REFERRER_ERROR.to_string())
            }
        };

        let urls = std::iter::once(env.url.as_str()).chain(env.script_url.as_deref());
        let flags = UrlFlags::from_urls(urls);
        let reconciled = reconcile(
            &env.url,
            flags,
            &inner.store,
            inner.clock.now(),
            &inner.config.freshness,
        );

        // New tokens may mean a new user, so nothing stored for the old ones survives
        let params = reconciled.params.clone();
        if reconciled.identity_changed() {
            debug!(dev_env = params.dev, "tokens changed; clearing local storage");
            inner.store.clear_all(params.dev);
        }
        if reconciled.needs_store() {
            inner.store.set(PARAMS_STORAGE_KEY, &params, params.dev);
        }

        {
            let mut session = self.session();
            session.params = params;
            session.referrer = referrer;
            session.page_origin = page_origin;
            session.fatal = fatal;
            session.state = SessionState::ParamsResolved;
        }

        self.send_to_page(Message::new(new_message_id(), Kind::Ready));

        let mut session = self.session();
        session.state = if session.fatal.is_some() {
            SessionState::Fatal
        } else {
            SessionState::Ready
        };
        info!(state = ?session.state, has_tokens = session.params.has_tokens(), "iframe initialized");
        session.state
    }

    /// Handles a posted event, if it comes from the embedding page.
    ///
    /// Without a page origin (fatal session) no sender can be verified, so every event is
    /// dropped. The page learns of the fatal error from `ready`.
    pub async fn handle_event(&self, event: MessageEvent) {
        let Some(expected) = self.page_origin() else {
            debug!(origin = %event.origin, "page origin unknown; dropping event");
            return;
        };
        if let Some(message) = accept(&event, &expected) {
            self.handle_message(message).await;
        }
    }

    /// Processes a message from the page and posts the reply.
    pub async fn handle_message(&self, mut message: Message) {
        debug!(id = %message.id, kind = %message.kind, "page message");
        match message.kind {
            Kind::Storage(_) if self.is_fatal() => self.send_to_page(message),
            Kind::Storage(command) => {
                if !self.inner.config.local_testing {
                    warn!(kind = %message.kind, "storage command outside local testing");
                    message.set_error("only allowed when testing");
                } else {
                    self.storage_command(command, &mut message);
                }
                self.send_to_page(message);
            }
            Kind::Ready => debug!("ignoring ready from page"),
            Kind::Action(action) => self.handle_action(action, message).await,
        }
    }

    fn storage_command(&self, command: StorageCommand, message: &mut Message) {
        match command {
            StorageCommand::Clear => {
                info!("iframe local storage clearing");
                self.inner.store.clear_everything();
            }
            StorageCommand::Get => message.dump = Some(self.inner.store.dump()),
        }
    }

    async fn handle_action(&self, action: Action, mut message: Message) {
        let (mut params, referrer, page_origin) = {
            let session = self.session();
            if let Some(fatal) = &session.fatal {
                message.set_error(fatal.clone());
                drop(session);
                self.send_to_page(message);
                return;
            }
            (
                session.params.clone(),
                session.referrer.clone(),
                session.page_origin.clone(),
            )
        };
        let (Some(referrer), Some(page_origin)) = (referrer, page_origin) else {
            message.set_error(NO_REFERRER_ERROR);
            self.send_to_page(message);
            return;
        };

        if !params.has_tokens() {
            message.set_error(NO_TOKENS_ERROR);
            self.send_to_page(message);
            return;
        }

        // Init only acknowledges that tokens are available
        let Some(class) = action.transaction_class() else {
            self.send_to_page(message);
            return;
        };

        let distinguisher = message
            .options
            .distinguisher
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| distinguisher::host(&referrer))
            .unwrap_or_default();
        if !distinguisher::validate(&distinguisher, &referrer) {
            warn!(class, distinguisher = %distinguisher, referrer = %page_origin, "invalid distinguisher");
            message.set_error(format!(
                "distinguisher is invalid for this page: {distinguisher}"
            ));
            self.send_to_page(message);
            return;
        }

        let dev = params.dev;
        if !self.reward_allowed(class, &distinguisher, dev) {
            message.set_success(false, "not yet allowed");
            self.send_to_page(message);
            return;
        }

        let _in_flight = InFlight::enter(&self.inner.in_flight);
        params.metadata.insert(
            "referrer".to_string(),
            Value::String(format!("{page_origin}{}", referrer.path())),
        );
        let budget = message.timeout.map(Duration::from_millis);
        let result = self
            .inner
            .client
            .transaction(class, &distinguisher, params, budget)
            .await;

        match result {
            Err(err) => {
                // Possibly transient, so not an error
                warn!(class, distinguisher = %distinguisher, error = %err, "reward request failed");
                message.set_success(false, format!("request error: {err}"));
            }
            Ok(response) if response.status == 401 => {
                self.invalidate_tokens();
                warn!(class, dev_env = dev, "request failed with 401");
                message.set_success(false, "401 access denied");
            }
            Ok(response) if response.status == 200 => {
                info!(class, distinguisher = %distinguisher, dev_env = dev, "reward succeeded");
                if let Some(next_allowed) = response.next_allowed() {
                    self.inner.store.set(
                        &next_allowed_key(class, &distinguisher),
                        &next_allowed,
                        dev,
                    );
                }
                message.set_success(true, "200");
            }
            Ok(response) => {
                info!(class, status = response.status, "reward not granted");
                message.set_success(false, response.status.to_string());
            }
        }
        self.send_to_page(message);
    }

    /// Checks the stored cooldown for (`class`, `distinguisher`).
    fn reward_allowed(&self, class: &str, distinguisher: &str, dev: bool) -> bool {
        let Some(stored) = self
            .inner
            .store
            .get::<String>(&next_allowed_key(class, distinguisher), dev)
        else {
            return true;
        };
        let next_allowed = match DateTime::parse_from_rfc3339(&stored) {
            Ok(next_allowed) => next_allowed.with_timezone(&Utc),
            Err(err) => {
                warn!(value = %stored, error = %err, "ignoring malformed next-allowed value");
                return true;
            }
        };
        let allowed = next_allowed < self.inner.clock.now();
        if !allowed {
            info!(class, distinguisher, next_allowed = %next_allowed, dev_env = dev, "reward not yet allowed");
        }
        allowed
    }

    /// Drops the session tokens and everything stored for them.
    fn invalidate_tokens(&self) {
        let params = {
            let mut session = self.session();
            session.params.tokens = None;
            session.params.clone()
        };
        self.inner.store.clear_all(params.dev);
        self.inner.store.set(PARAMS_STORAGE_KEY, &params, params.dev);
    }

    /// Posts to the page, forcing any fatal error onto the message. Storage dumps are
    /// never posted to an unverified origin.
    fn send_to_page(&self, mut message: Message) {
        let target = {
            let session = self.session();
            if let Some(fatal) = &session.fatal {
                message.set_error(fatal.clone());
            }
            session
                .page_origin
                .clone()
                .unwrap_or_else(|| ANY_ORIGIN.to_string())
        };
        if target == ANY_ORIGIN {
            message.dump = None;
        }
        post(&self.inner.port, &message, &target);
    }
}
