use psicash_types::{params::DEFAULT_MAX_AGE_SECS, Action, Freshness};
use std::time::Duration;

/// Origin serving the widget scripts and iframe.
pub const WIDGET_ORIGIN: &str = "https://widget.psi.cash";

/// Path of the widget iframe.
pub const IFRAME_PATH: &str = "/v2/iframe.html";

/// Path of the widget iframe when debugging.
pub const IFRAME_PATH_DEBUG: &str = "/v2/iframe.debug.html";

/// Enables the storage-debug commands and helpers.
pub const LOCAL_TESTING_ENV: &str = "PSICASH_LOCAL_TESTING";

/// Overrides the URL params acceptance window, in seconds.
pub const PARAMS_MAX_AGE_ENV: &str = "PSICASH_PARAMS_MAX_AGE_SECS";

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|v| psicash_types::params::flag_from_str(&v))
}

/// Default time a host page waits for each action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionTimeouts {
    pub init: Duration,
    pub page_view: Duration,
    /// Kept short: a click-through usually gates navigation away from the page.
    pub click_through: Duration,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_millis(10_000),
            page_view: Duration::from_millis(10_000),
            click_through: Duration::from_millis(1_000),
        }
    }
}

impl ActionTimeouts {
    pub fn for_action(&self, action: Action) -> Duration {
        match action {
            Action::Init => self.init,
            Action::PageView => self.page_view,
            Action::ClickThrough => self.click_through,
        }
    }
}

/// Configuration shared by the page and iframe controllers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WidgetConfig {
    /// Allows the storage-debug commands. Never enabled in production builds.
    pub local_testing: bool,
    pub freshness: Freshness,
    pub timeouts: ActionTimeouts,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            local_testing: false,
            freshness: Freshness::default(),
            timeouts: ActionTimeouts::default(),
        }
    }
}

impl WidgetConfig {
    /// Defaults with `PSICASH_LOCAL_TESTING` and `PSICASH_PARAMS_MAX_AGE_SECS` applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_age = parse_env_u64(PARAMS_MAX_AGE_ENV)
            .and_then(|secs| i64::try_from(secs).ok())
            .unwrap_or(DEFAULT_MAX_AGE_SECS);
        Self {
            local_testing: parse_env_bool(LOCAL_TESTING_ENV).unwrap_or(defaults.local_testing),
            freshness: Freshness {
                max_age: chrono::Duration::seconds(max_age),
                ..defaults.freshness
            },
            ..defaults
        }
    }

    /// Testing configuration: storage-debug commands enabled.
    pub fn local_testing() -> Self {
        Self {
            local_testing: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_through_is_short() {
        let timeouts = ActionTimeouts::default();
        assert_eq!(timeouts.for_action(Action::Init), Duration::from_secs(10));
        assert_eq!(timeouts.for_action(Action::PageView), Duration::from_secs(10));
        assert_eq!(timeouts.for_action(Action::ClickThrough), Duration::from_secs(1));
    }

    #[test]
    fn defaults_are_production_safe() {
        let config = WidgetConfig::default();
        assert!(!config.local_testing);
        assert_eq!(config.freshness.max_age, chrono::Duration::seconds(60));
        assert!(WidgetConfig::local_testing().local_testing);
    }
}
