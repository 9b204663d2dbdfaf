use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_COOLDOWN_SECS: u64 = 3600;
pub const DEFAULT_REQUEST_LOG_LIMIT: usize = 10_000;

/// Transaction classes the simulator rewards.
pub const REWARD_CLASSES: [&str; 2] = ["page-view", "click-through"];

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Time between rewards for the same token, class, and distinguisher.
    pub cooldown: Duration,
    /// Accept any token that hasn't been revoked, not just registered ones.
    pub accept_any_token: bool,
    /// Tokens registered at startup.
    pub tokens: Vec<String>,
    /// Extra delay before every API response.
    pub latency: std::time::Duration,
    /// Maximum number of requests kept in the log (0 disables the limit).
    pub request_log_limit: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS as i64),
            accept_any_token: true,
            tokens: Vec::new(),
            latency: std::time::Duration::ZERO,
            request_log_limit: Some(DEFAULT_REQUEST_LOG_LIMIT),
        }
    }
}

/// A request as the simulator saw it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub class: Option<String>,
    pub distinguisher: Option<String>,
    pub tokens: Option<String>,
    pub metadata: Option<Value>,
    pub status: u16,
}

/// Result of a reward transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    Rewarded {
        transaction_id: String,
        next_allowed: String,
    },
    CoolingDown {
        next_allowed: String,
    },
    UnknownToken,
    UnknownClass,
    /// An injected failure.
    Unavailable,
}

impl TransactionOutcome {
    pub fn status(&self) -> u16 {
        match self {
            TransactionOutcome::Rewarded { .. } => 200,
            TransactionOutcome::UnknownClass => 400,
            TransactionOutcome::UnknownToken => 401,
            TransactionOutcome::CoolingDown { .. } => 429,
            TransactionOutcome::Unavailable => 503,
        }
    }
}

type CooldownKey = (String, String, String);

/// Tokens, cooldowns, injected failures, and the request log.
#[derive(Default)]
pub struct State {
    known_tokens: HashSet<String>,
    revoked_tokens: HashSet<String>,
    accept_any_token: bool,
    cooldowns: HashMap<CooldownKey, DateTime<Utc>>,
    failures_remaining: usize,
    requests: Vec<RequestRecord>,
    request_log_limit: Option<usize>,
    latency: std::time::Duration,
    transactions: u64,
}

impl State {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            known_tokens: config.tokens.iter().cloned().collect(),
            accept_any_token: config.accept_any_token,
            request_log_limit: config.request_log_limit,
            latency: config.latency,
            ..Default::default()
        }
    }

    pub fn add_token(&mut self, token: &str) {
        self.revoked_tokens.remove(token);
        self.known_tokens.insert(token.to_string());
    }

    pub fn revoke_token(&mut self, token: &str) {
        self.known_tokens.remove(token);
        self.revoked_tokens.insert(token.to_string());
    }

    pub fn token_valid(&self, token: &str) -> bool {
        !token.is_empty()
            && !self.revoked_tokens.contains(token)
            && (self.accept_any_token || self.known_tokens.contains(token))
    }

    /// The first valid token in a comma-separated auth header.
    pub fn authenticate<'a>(&self, header: Option<&'a str>) -> Option<&'a str> {
        header?
            .split(',')
            .map(str::trim)
            .find(|token| self.token_valid(token))
    }

    pub fn fail_next(&mut self, count: usize) {
        self.failures_remaining += count;
    }

    /// Consumes one injected failure, if any are left.
    pub fn take_failure(&mut self) -> bool {
        if self.failures_remaining == 0 {
            return false;
        }
        self.failures_remaining -= 1;
        true
    }

    pub fn latency(&self) -> std::time::Duration {
        self.latency
    }

    pub fn set_latency(&mut self, latency: std::time::Duration) {
        self.latency = latency;
    }

    pub fn transaction(
        &mut self,
        auth: Option<&str>,
        class: &str,
        distinguisher: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> TransactionOutcome {
        let Some(token) = self.authenticate(auth).map(str::to_string) else {
            return TransactionOutcome::UnknownToken;
        };
        if !REWARD_CLASSES.contains(&class) || distinguisher.is_empty() {
            return TransactionOutcome::UnknownClass;
        }

        let key = (token, class.to_string(), distinguisher.to_string());
        if let Some(next_allowed) = self.cooldowns.get(&key) {
            if now < *next_allowed {
                return TransactionOutcome::CoolingDown {
                    next_allowed: format_time(*next_allowed),
                };
            }
        }
        let next_allowed = now + cooldown;
        self.cooldowns.insert(key, next_allowed);
        self.transactions += 1;
        TransactionOutcome::Rewarded {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            next_allowed: format_time(next_allowed),
        }
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    pub fn record(&mut self, record: RequestRecord) {
        if let Some(limit) = self.request_log_limit {
            if self.requests.len() >= limit {
                let excess = self.requests.len() + 1 - limit;
                self.requests.drain(..excess.min(self.requests.len()));
            }
        }
        self.requests.push(record);
    }

    pub fn requests(&self) -> &[RequestRecord] {
        &self.requests
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }
}

/// ISO-8601 with a `Z` suffix, as the API formats timestamps.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_cooldown_per_token_class_and_distinguisher() {
        let mut state = State::new(&SimulatorConfig::default());
        let cooldown = Duration::seconds(60);

        let first = state.transaction(Some("a"), "page-view", "example.com", now(), cooldown);
        match first {
            TransactionOutcome::Rewarded { next_allowed, .. } => {
                assert_eq!(next_allowed, "2023-11-14T22:14:20.000Z")
            }
            other => panic!("expected a reward, got {other:?}"),
        }
        assert_eq!(
            state.transaction(Some("a"), "page-view", "example.com", now(), cooldown),
            TransactionOutcome::CoolingDown {
                next_allowed: "2023-11-14T22:14:20.000Z".to_string()
            }
        );

        // Other keys are independent
        for (token, class, distinguisher) in [
            ("b", "page-view", "example.com"),
            ("a", "click-through", "example.com"),
            ("a", "page-view", "example.com/a"),
        ] {
            assert_eq!(
                state
                    .transaction(Some(token), class, distinguisher, now(), cooldown)
                    .status(),
                200
            );
        }

        // Allowed again once the cooldown passes
        let later = now() + Duration::seconds(60);
        assert_eq!(
            state
                .transaction(Some("a"), "page-view", "example.com", later, cooldown)
                .status(),
            200
        );
        assert_eq!(state.transactions(), 5);
    }

    #[test]
    fn test_token_checks() {
        let config = SimulatorConfig {
            accept_any_token: false,
            tokens: vec!["known".to_string()],
            ..Default::default()
        };
        let mut state = State::new(&config);
        let cooldown = Duration::seconds(60);

        assert_eq!(
            state.transaction(None, "page-view", "example.com", now(), cooldown),
            TransactionOutcome::UnknownToken
        );
        assert_eq!(
            state.transaction(Some("stranger"), "page-view", "example.com", now(), cooldown),
            TransactionOutcome::UnknownToken
        );
        assert_eq!(state.authenticate(Some("stranger, known")), Some("known"));

        state.revoke_token("known");
        assert!(!state.token_valid("known"));
        state.add_token("known");
        assert!(state.token_valid("known"));
        assert_eq!(
            state.transaction(Some("known"), "spin-the-wheel", "example.com", now(), cooldown),
            TransactionOutcome::UnknownClass
        );
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let mut state = State::default();
        state.fail_next(2);
        assert!(state.take_failure());
        assert!(state.take_failure());
        assert!(!state.take_failure());
    }

    #[test]
    fn test_request_log_is_bounded() {
        let mut state = State::new(&SimulatorConfig {
            request_log_limit: Some(2),
            ..Default::default()
        });
        for status in [200, 429, 401] {
            state.record(RequestRecord {
                method: "POST".to_string(),
                path: "/v1/transaction".to_string(),
                class: None,
                distinguisher: None,
                tokens: None,
                metadata: None,
                status,
            });
        }
        let statuses: Vec<u16> = state.requests().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![429, 401]);
    }
}
