//! A host page with the widget iframe embedded, connected through in-process channels.
//!
//! Each frame gets its own [LocalStore], as a browser partitions storage by origin.

use crate::config::WidgetConfig;
use crate::iframe::{IframeController, IframeEnv, SessionState};
use crate::page::{PageController, PageEnv};
use crate::protocol::{origin_of, ChannelPort};
use crate::storage::LocalStore;
use crate::{Error, Result};
use psicash_client::{Client, Transport};
use psicash_types::Clock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Everything needed to load a page that embeds the widget.
pub struct EmbedOptions<T: Transport> {
    /// The host page URL.
    pub page_url: String,
    /// The page script URL, served from the widget origin.
    pub script_url: String,
    /// The iframe script URL, if it carries flags of its own.
    pub iframe_script_url: Option<String>,
    /// Whether the browser sends a referrer to the iframe.
    pub send_referrer: bool,
    pub page_store: LocalStore,
    pub iframe_store: LocalStore,
    pub client: Client<T>,
    pub clock: Arc<dyn Clock>,
    pub config: WidgetConfig,
}

/// A loaded page and its iframe. Dropping it unloads both.
pub struct Embedding<T: Transport> {
    pub page: PageController<ChannelPort>,
    pub iframe: IframeController<T, ChannelPort>,
    pumps: Vec<JoinHandle<()>>,
}

impl<T: Transport> Embedding<T> {
    /// Loads the page, then the iframe at the URL the page computed.
    ///
    /// Must be called within a Tokio runtime.
    pub fn launch(options: EmbedOptions<T>) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let page_origin =
            origin_of(&options.page_url).ok_or_else(|| Error::InvalidUrl(options.page_url.clone()))?;
        let widget_origin = origin_of(&options.script_url)
            .ok_or_else(|| Error::InvalidUrl(options.script_url.clone()))?;

        let (to_iframe, mut iframe_events) = ChannelPort::new(&page_origin, &widget_origin);
        let (to_page, mut page_events) = ChannelPort::new(&widget_origin, &page_origin);

        let page = PageController::new(
            &PageEnv {
                url: options.page_url.clone(),
                script_url: options.script_url.clone(),
            },
            to_iframe,
            options.page_store,
            options.clock.as_ref(),
            options.config.clone(),
        )?;
        let iframe = IframeController::new(
            options.client,
            to_page,
            options.iframe_store,
            options.clock,
            options.config,
        );

        let page_pump = {
            let page = page.clone();
            handle.spawn(async move {
                while let Some(event) = page_events.recv().await {
                    page.handle_event(event);
                }
                debug!("page listener stopped");
            })
        };
        let iframe_pump = {
            let iframe = iframe.clone();
            let handle = handle.clone();
            handle.clone().spawn(async move {
                while let Some(event) = iframe_events.recv().await {
                    // Actions run concurrently, as they would in the browser
                    let iframe = iframe.clone();
                    handle.spawn(async move { iframe.handle_event(event).await });
                }
                debug!("iframe listener stopped");
            })
        };

        let referrer = if options.send_referrer {
            Some(without_fragment(&options.page_url)?)
        } else {
            None
        };
        let state = iframe.initialize(&IframeEnv {
            url: page.iframe_src().to_string(),
            script_url: options.iframe_script_url,
            referrer,
        });
        info!(state = ?state, page_origin = %page_origin, "widget embedded");

        Ok(Self {
            page,
            iframe,
            pumps: vec![page_pump, iframe_pump],
        })
    }

    pub fn state(&self) -> SessionState {
        self.iframe.state()
    }
}

impl<T: Transport> Drop for Embedding<T> {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// The URL as browsers send it in `document.referrer`.
fn without_fragment(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
    parsed.set_fragment(None);
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use chrono::{DateTime, Utc};
    use psicash_client::transport::mocks::{Mock, Reply};
    use psicash_client::ApiConfig;
    use psicash_types::api::TransactionBody;
    use psicash_types::{codec, Action, ActionOptions, ManualClock, Outcome, ParamSet};

    const SCRIPT: &str = "https://widget.psi.cash/v2/psicash.js";

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn options(page_url: String, mock: Mock, send_referrer: bool) -> EmbedOptions<Mock> {
        EmbedOptions {
            page_url,
            script_url: SCRIPT.to_string(),
            iframe_script_url: None,
            send_referrer,
            page_store: LocalStore::new(MemoryBackend::new()),
            iframe_store: LocalStore::new(MemoryBackend::new()),
            client: Client::with_transport(&ApiConfig::default(), mock).unwrap(),
            clock: Arc::new(ManualClock::new(now())),
            config: WidgetConfig::default(),
        }
    }

    fn landing_url() -> String {
        let params = ParamSet::with_tokens("earner-token").stamped(now());
        format!(
            "https://example.com/landing#!psicash={}",
            codec::encode(&params).unwrap()
        )
    }

    #[tokio::test]
    async fn test_page_view_round_trip() {
        let next_allowed = "2023-11-14T23:13:20Z";
        let body = TransactionBody::with_next_allowed("tx-1", next_allowed);
        let mock = Mock::new([Reply::Status(200, serde_json::to_string(&body).unwrap())]);
        let embedding = Embedding::launch(options(landing_url(), mock.clone(), true)).unwrap();
        assert_eq!(embedding.state(), SessionState::Ready);
        assert_eq!(
            embedding.iframe.page_origin().as_deref(),
            Some("https://example.com")
        );

        let outcome = embedding
            .page
            .call(Action::PageView, ActionOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.error, None);
        assert!(outcome.success);
        assert_eq!(outcome.detail, "200");
        assert_eq!(mock.attempts(), 1);

        // The referrer sent upstream has no fragment
        let request = &mock.recorded()[0];
        assert!(request.url.as_str().contains("distinguisher=example.com"));
        let metadata = request.header("X-PsiCash-Metadata").unwrap();
        assert!(metadata.contains("https://example.com/landing"));
        assert!(!metadata.contains("psicash="));
    }

    #[tokio::test]
    async fn test_missing_referrer_is_reported() {
        let mock = Mock::new([]);
        let embedding = Embedding::launch(options(landing_url(), mock.clone(), false)).unwrap();
        assert_eq!(embedding.state(), SessionState::Fatal);

        assert_eq!(embedding.iframe.page_origin(), None);

        // With no page origin to verify, the iframe ignores everything posted to it
        let outcome = embedding
            .page
            .call(Action::Init, ActionOptions::default().with_timeout(200))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::timeout());
        assert!(embedding.page.is_ready());
        assert_eq!(embedding.page.pending(), 0);
        assert_eq!(mock.attempts(), 0);
    }

    #[tokio::test]
    async fn test_rejects_unusable_urls() {
        let result = Embedding::launch(options("about:blank".to_string(), Mock::new([]), true));
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_referrer_drops_fragment() {
        assert_eq!(
            without_fragment("https://example.com/a?b=1#!psicash=x").unwrap(),
            "https://example.com/a?b=1"
        );
    }
}
