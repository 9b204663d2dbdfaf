//! The host page side of the widget.
//!
//! Host pages call [PageController::invoke] and get exactly one [Outcome] per call,
//! within the action's timeout, whether or not the iframe ever answers.

use crate::config::{WidgetConfig, IFRAME_PATH, IFRAME_PATH_DEBUG};
use crate::protocol::{accept, new_message_id, origin_of, post, FramePort, MessageEvent};
use crate::reconcile::{reconcile, UrlFlags};
use crate::storage::LocalStore;
use crate::{Error, Result};
use psicash_types::{
    codec, Action, ActionOptions, Clock, Kind, Message, MessageId, Outcome, ParamSet,
    StorageCommand, PARAMS_STORAGE_KEY, PSICASH_URL_PARAM,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Receives the outcome of an action.
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

type Pending = Arc<Mutex<HashMap<MessageId, Callback>>>;

/// What the page script knows about where it was loaded.
#[derive(Clone, Debug, Default)]
pub struct PageEnv {
    /// The host page URL, possibly carrying params from the app.
    pub url: String,
    /// The widget script URL. Its origin is the widget origin; it may carry `dev`/`debug`.
    pub script_url: String,
}

enum Readiness {
    /// Messages posted before the iframe said `ready`, in invocation order.
    Waiting(Vec<Message>),
    Ready,
}

struct Inner<P: FramePort> {
    port: P,
    store: LocalStore,
    config: WidgetConfig,
    params: ParamSet,
    widget_origin: String,
    iframe_src: String,
    pending: Pending,
    readiness: Mutex<Readiness>,
}

/// The page side of the widget. Clones share the same state.
pub struct PageController<P: FramePort> {
    inner: Arc<Inner<P>>,
}

impl<P: FramePort> Clone for PageController<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn take(pending: &Pending, id: &MessageId) -> Option<Callback> {
    pending.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
}

impl<P: FramePort> PageController<P> {
    /// Reconciles the page params and builds the iframe URL.
    pub fn new(
        env: &PageEnv,
        port: P,
        store: LocalStore,
        clock: &dyn Clock,
        config: WidgetConfig,
    ) -> Result<Self> {
        let widget_origin = origin_of(&env.script_url)
            .ok_or_else(|| Error::InvalidUrl(env.script_url.clone()))?;

        let flags = UrlFlags::from_urls([env.script_url.as_str()]);
        let reconciled = reconcile(&env.url, flags, &store, clock.now(), &config.freshness);
        if reconciled.needs_store() {
            store.set(PARAMS_STORAGE_KEY, &reconciled.params, reconciled.stored_dev);
        }
        let params = reconciled.params;

        let path = if params.debug {
            IFRAME_PATH_DEBUG
        } else {
            IFRAME_PATH
        };
        let iframe_src = format!(
            "{widget_origin}{path}#!{PSICASH_URL_PARAM}={}&dev={}&debug={}",
            codec::encode(&params)?,
            params.dev,
            params.debug
        );
        info!(
            has_tokens = params.has_tokens(),
            dev_env = params.dev,
            widget_origin = %widget_origin,
            "page initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                port,
                store,
                config,
                params,
                widget_origin,
                iframe_src,
                pending: Arc::new(Mutex::new(HashMap::new())),
                readiness: Mutex::new(Readiness::Waiting(Vec::new())),
            }),
        })
    }

    /// A copy of the page params, for host pages that need platform or version metadata.
    pub fn params(&self) -> ParamSet {
        self.inner.params.clone()
    }

    /// The URL the widget iframe should load.
    pub fn iframe_src(&self) -> &str {
        &self.inner.iframe_src
    }

    pub fn widget_origin(&self) -> &str {
        &self.inner.widget_origin
    }

    /// True once the iframe has announced itself.
    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness(), Readiness::Ready)
    }

    /// Number of callbacks still waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn readiness(&self) -> MutexGuard<'_, Readiness> {
        self.inner.readiness.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Performs `action`, reporting to `callback` exactly once.
    ///
    /// The timeout is `options.timeout` or the action's default. If no reply arrives in
    /// that time, `callback` gets `(None, false, "timeout")` and any later reply is
    /// ignored. Actions invoked before the iframe is ready are queued.
    ///
    /// Must be called within a Tokio runtime; [Error::NoRuntime] otherwise.
    pub fn invoke(
        &self,
        action: Action,
        options: ActionOptions,
        callback: Option<Callback>,
    ) -> Result<MessageId> {
        let timeout = options
            .timeout
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.timeouts.for_action(action));
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let message = Message::action(new_message_id(), action, Some(timeout_ms), options);
        self.dispatch(message, timeout, callback)
    }

    /// [PageController::invoke] with an action name, as a host page passes it.
    pub fn invoke_named(
        &self,
        action: &str,
        options: ActionOptions,
        callback: Option<Callback>,
    ) -> Result<MessageId> {
        let action: Action = action
            .parse()
            .map_err(|_| Error::UnknownAction(action.to_string()))?;
        self.invoke(action, options, callback)
    }

    /// Performs `action` and waits for its outcome.
    pub async fn call(&self, action: Action, options: ActionOptions) -> Result<Outcome> {
        let (sender, receiver) = oneshot::channel();
        self.invoke(
            action,
            options,
            Some(Box::new(move |outcome| {
                let _ = sender.send(outcome);
            })),
        )?;
        Ok(receiver.await.unwrap_or_else(|_| Outcome::timeout()))
    }

    /// Clears the page storage, the iframe storage, or both. Local testing only.
    pub fn clear_local_storage(
        &self,
        page: bool,
        iframe: bool,
        callback: Option<Callback>,
    ) -> Result<()> {
        if !self.inner.config.local_testing {
            return Err(Error::NotLocalTesting);
        }
        if page {
            info!("page local storage clearing");
            self.inner.store.clear_everything();
        }
        if iframe {
            self.storage_command(StorageCommand::Clear, callback)?;
        } else if let Some(callback) = callback {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
            handle.spawn(async move {
                callback(Outcome {
                    error: None,
                    success: true,
                    detail: String::new(),
                })
            });
        }
        Ok(())
    }

    /// Fetches the iframe storage. The callback's `detail` is the JSON-encoded contents.
    /// Local testing only.
    pub fn iframe_local_storage(&self, callback: Callback) -> Result<()> {
        if !self.inner.config.local_testing {
            return Err(Error::NotLocalTesting);
        }
        self.storage_command(StorageCommand::Get, Some(callback))
    }

    fn storage_command(&self, command: StorageCommand, callback: Option<Callback>) -> Result<()> {
        let message = Message::new(new_message_id(), Kind::Storage(command));
        self.dispatch(message, self.inner.config.timeouts.init, callback)
            .map(|_| ())
    }

    /// Registers the callback with its safety timer, then posts or queues the message.
    fn dispatch(
        &self,
        message: Message,
        timeout: Duration,
        callback: Option<Callback>,
    ) -> Result<MessageId> {
        let id = message.id.clone();
        if let Some(callback) = callback {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), callback);

            let pending = self.inner.pending.clone();
            let timer_id = id.clone();
            let kind = message.kind;
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(callback) = take(&pending, &timer_id) {
                    info!(id = %timer_id, kind = %kind, "action timed out");
                    callback(Outcome::timeout());
                }
            });
        }

        // Posts happen under the readiness lock so nothing overtakes a flush
        let mut readiness = self.readiness();
        match &mut *readiness {
            Readiness::Waiting(queue) => {
                debug!(id = %id, kind = %message.kind, "queueing until iframe is ready");
                queue.push(message);
            }
            Readiness::Ready => self.post(&message),
        }
        Ok(id)
    }

    fn post(&self, message: &Message) {
        post(&self.inner.port, message, &self.inner.widget_origin);
    }

    /// Handles a posted event, if it comes from the widget iframe.
    pub fn handle_event(&self, event: MessageEvent) {
        if let Some(message) = accept(&event, &self.inner.widget_origin) {
            self.handle_message(message);
        }
    }

    /// Routes an iframe message: `ready` flushes the queue, replies go to their callback.
    pub fn handle_message(&self, mut message: Message) {
        debug!(id = %message.id, kind = %message.kind, "iframe message");
        if let Some(error) = message.error() {
            warn!(id = %message.id, kind = %message.kind, error, "iframe reported an error");
        }

        match message.kind {
            Kind::Ready => self.flush(),
            Kind::Storage(StorageCommand::Get) => {
                let dump = message.dump.clone().unwrap_or_default();
                message.detail = serde_json::to_string(&dump).unwrap_or_default();
            }
            _ => {}
        }

        if let Some(callback) = take(&self.inner.pending, &message.id) {
            callback(message.outcome());
        }
    }

    /// Posts everything queued before `ready`, with an `init` first.
    fn flush(&self) {
        let mut readiness = self.readiness();
        let queue = match std::mem::replace(&mut *readiness, Readiness::Ready) {
            Readiness::Waiting(queue) => queue,
            Readiness::Ready => {
                debug!("ignoring repeated ready");
                return;
            }
        };

        let starts_with_init = queue
            .first()
            .is_some_and(|message| message.kind == Kind::Action(Action::Init));
        if !starts_with_init {
            let timeout = self.inner.config.timeouts.init;
            let init = Message::action(
                new_message_id(),
                Action::Init,
                Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
                ActionOptions::default(),
            );
            self.post(&init);
        }
        info!(queued = queue.len(), "iframe ready");
        for message in &queue {
            self.post(message);
        }
        drop(readiness);
    }
}
