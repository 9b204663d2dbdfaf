//! Picking the [ParamSet] a frame runs with, from its URL and its local storage.

use crate::storage::LocalStore;
use chrono::{DateTime, Utc};
use psicash_types::{
    codec, newest, params::flag_from_str, Freshness, ParamSet, DEBUG_URL_PARAM, DEV_URL_PARAM,
    PARAMS_STORAGE_KEY,
};
use tracing::debug;

/// `dev`/`debug` overrides found on a frame's URLs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UrlFlags {
    pub dev: Option<bool>,
    pub debug: Option<bool>,
}

impl UrlFlags {
    /// Reads the flags from `urls`; for each flag the first URL carrying it wins.
    pub fn from_urls<'a>(urls: impl IntoIterator<Item = &'a str>) -> Self {
        let mut flags = Self::default();
        for url in urls {
            if flags.dev.is_none() {
                flags.dev = codec::url_param(url, DEV_URL_PARAM).map(|v| flag_from_str(&v));
            }
            if flags.debug.is_none() {
                flags.debug = codec::url_param(url, DEBUG_URL_PARAM).map(|v| flag_from_str(&v));
            }
        }
        flags
    }
}

/// The outcome of reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    /// The params to run with, overrides applied.
    pub params: ParamSet,
    /// What was in storage before reconciliation.
    pub stored: Option<ParamSet>,
    /// The namespace `stored` was read from.
    pub stored_dev: bool,
}

impl Reconciled {
    /// True if the tokens differ from the stored ones, or nothing was stored: possibly
    /// a different user.
    pub fn identity_changed(&self) -> bool {
        self.stored
            .as_ref()
            .map_or(true, |stored| stored.tokens != self.params.tokens)
    }

    /// True if the params should be written back to storage.
    pub fn needs_store(&self) -> bool {
        self.stored.as_ref() != Some(&self.params)
    }
}

/// Merges the params carried by `url` with those in `store`, preferring the newest.
///
/// Storage is read from the dev namespace if either the flags or the URL params say dev.
/// Nothing is written here; callers decide what to persist.
pub fn reconcile(
    url: &str,
    flags: UrlFlags,
    store: &LocalStore,
    now: DateTime<Utc>,
    freshness: &Freshness,
) -> Reconciled {
    let from_url = codec::decode_from_url(url, now, freshness);
    let stored_dev =
        flags.dev.unwrap_or(false) || from_url.as_ref().is_some_and(|params| params.dev);
    let stored: Option<ParamSet> = store.get(PARAMS_STORAGE_KEY, stored_dev);

    let mut params = newest(from_url, stored.clone()).unwrap_or_default();
    if let Some(debug) = flags.debug {
        params.debug = debug;
    }
    if let Some(dev) = flags.dev {
        params.dev = dev;
    }
    debug!(
        has_tokens = params.has_tokens(),
        had_stored = stored.is_some(),
        dev_env = params.dev,
        "reconciled params"
    );

    Reconciled {
        params,
        stored,
        stored_dev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn url_with(params: &ParamSet) -> String {
        format!(
            "https://example.com/landing#!psicash={}",
            codec::encode(params).unwrap()
        )
    }

    #[test]
    fn flags_prefer_earlier_urls() {
        let flags = UrlFlags::from_urls([
            "https://widget.psi.cash/v2/iframe.html#!psicash=x&dev=1",
            "https://widget.psi.cash/v2/iframe.js?dev=0&debug=1",
        ]);
        assert_eq!(
            flags,
            UrlFlags {
                dev: Some(true),
                debug: Some(true)
            }
        );
        assert_eq!(UrlFlags::from_urls(["https://example.com/"]), UrlFlags::default());
    }

    #[test]
    fn newer_url_params_beat_stored_params() {
        let store = LocalStore::new(MemoryBackend::new());
        let stored = ParamSet::with_tokens("old").stamped(now() - Duration::seconds(3600));
        store.set(PARAMS_STORAGE_KEY, &stored, false);

        let fresh = ParamSet::with_tokens("new").stamped(now() - Duration::seconds(5));
        let reconciled = reconcile(
            &url_with(&fresh),
            UrlFlags::default(),
            &store,
            now(),
            &Freshness::default(),
        );
        assert_eq!(reconciled.params, fresh);
        assert_eq!(reconciled.stored, Some(stored));
        assert!(reconciled.identity_changed());
        assert!(reconciled.needs_store());
    }

    #[test]
    fn stale_url_params_fall_back_to_storage() {
        let store = LocalStore::new(MemoryBackend::new());
        let stored = ParamSet::with_tokens("stored").stamped(now() - Duration::seconds(3600));
        store.set(PARAMS_STORAGE_KEY, &stored, false);

        let replayed = ParamSet::with_tokens("replayed").stamped(now() - Duration::seconds(120));
        let reconciled = reconcile(
            &url_with(&replayed),
            UrlFlags::default(),
            &store,
            now(),
            &Freshness::default(),
        );
        assert_eq!(reconciled.params, stored);
        assert!(!reconciled.identity_changed());
        assert!(!reconciled.needs_store());
    }

    #[test]
    fn dev_url_params_read_dev_storage() {
        let store = LocalStore::new(MemoryBackend::new());
        let mut stored = ParamSet::with_tokens("dev-stored").stamped(now() - Duration::seconds(10));
        stored.dev = true;
        store.set(PARAMS_STORAGE_KEY, &stored, true);

        let mut older = ParamSet::with_tokens("dev-url").stamped(now() - Duration::seconds(20));
        older.dev = true;
        let reconciled = reconcile(
            &url_with(&older),
            UrlFlags::default(),
            &store,
            now(),
            &Freshness::default(),
        );
        assert!(reconciled.stored_dev);
        assert_eq!(reconciled.params.tokens.as_deref(), Some("dev-stored"));
    }

    #[test]
    fn nothing_anywhere_yields_empty_params() {
        let store = LocalStore::new(MemoryBackend::new());
        let reconciled = reconcile(
            "https://example.com/",
            UrlFlags {
                dev: None,
                debug: Some(true),
            },
            &store,
            now(),
            &Freshness::default(),
        );
        assert!(!reconciled.params.has_tokens());
        assert!(reconciled.params.debug);
        assert!(reconciled.identity_changed());
    }
}
