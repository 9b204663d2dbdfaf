use psicash_client::{ApiConfig, Client, HttpTransport};
use psicash_simulator::{serve, Simulator, SimulatorConfig};
use psicash_types::{codec, Action, ActionOptions, Outcome, ParamSet, SystemClock};
use psicash_widget::iframe::NO_TOKENS_ERROR;
use psicash_widget::{
    EmbedOptions, Embedding, LocalStore, MemoryBackend, SessionState, StorageBackend, WidgetConfig,
};
use std::sync::Arc;
use std::time::Duration;

const SCRIPT: &str = "https://widget.psi.cash/v2/psicash.js";

struct Harness {
    simulator: Arc<Simulator>,
    api: ApiConfig,
    iframe_backend: MemoryBackend,
}

impl Harness {
    async fn start() -> Self {
        let simulator = Arc::new(Simulator::new(SimulatorConfig::default()));
        let (addr, _) = serve(simulator.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Self {
            simulator,
            api: ApiConfig::single(format!("http://{addr}/v1")),
            iframe_backend: MemoryBackend::new(),
        }
    }

    fn embed(&self, page_url: &str) -> Embedding<HttpTransport> {
        Embedding::launch(EmbedOptions {
            page_url: page_url.to_string(),
            script_url: SCRIPT.to_string(),
            iframe_script_url: None,
            send_referrer: true,
            page_store: LocalStore::new(MemoryBackend::new()),
            // Shared across loads, like the widget origin's storage in one browser
            iframe_store: LocalStore::new(self.iframe_backend.clone()),
            client: Client::new(&self.api).unwrap(),
            clock: Arc::new(SystemClock),
            config: WidgetConfig::default(),
        })
        .unwrap()
    }
}

fn landing_url(tokens: &str) -> String {
    let params = ParamSet::with_tokens(tokens).stamped(chrono::Utc::now());
    format!(
        "https://example.com/landing?utm=1#!psicash={}",
        codec::encode(&params).unwrap()
    )
}

async fn call(embedding: &Embedding<HttpTransport>, action: Action) -> Outcome {
    embedding
        .page
        .call(action, ActionOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn no_tokens_means_no_requests() {
    let harness = Harness::start().await;
    let embedding = harness.embed("https://example.com/landing");
    assert_eq!(embedding.state(), SessionState::Ready);

    for action in [Action::Init, Action::PageView, Action::ClickThrough] {
        let outcome = call(&embedding, action).await;
        assert_eq!(outcome.error.as_deref(), Some(NO_TOKENS_ERROR), "{action}");
        assert!(!outcome.success);
    }
    assert!(harness.simulator.requests().is_empty());
}

#[tokio::test]
async fn earns_then_respects_cooldown() {
    let harness = Harness::start().await;
    let embedding = harness.embed(&landing_url("earner"));

    let init = call(&embedding, Action::Init).await;
    assert_eq!(init.error, None);
    assert!(init.success);

    let page_view = call(&embedding, Action::PageView).await;
    assert_eq!(page_view.error, None);
    assert!(page_view.success);
    assert_eq!(page_view.detail, "200");

    let click = call(&embedding, Action::ClickThrough).await;
    assert!(click.success, "{click:?}");

    // The stored cooldown stops a second request before it is sent
    let again = call(&embedding, Action::PageView).await;
    assert_eq!(again.error, None);
    assert!(!again.success);
    assert_eq!(again.detail, "not yet allowed");

    let requests = harness.simulator.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|r| r.distinguisher.as_deref() == Some("example.com")));
    let referrer = requests[0]
        .metadata
        .as_ref()
        .and_then(|m| m.get("referrer"))
        .and_then(|r| r.as_str());
    assert_eq!(referrer, Some("https://example.com/landing"));
}

#[tokio::test]
async fn server_cooldown_without_local_record() {
    let harness = Harness::start().await;
    let first = harness.embed(&landing_url("earner"));
    assert!(call(&first, Action::PageView).await.success);
    drop(first);

    // Same tokens, but the browser lost the iframe's storage
    harness.iframe_backend.clear().unwrap();
    let second = harness.embed(&landing_url("earner"));
    let outcome = call(&second, Action::PageView).await;
    assert_eq!(outcome.error, None);
    assert!(!outcome.success);
    assert_eq!(outcome.detail, "429");
}

#[tokio::test]
async fn explicit_distinguisher_must_match_the_page() {
    let harness = Harness::start().await;
    let embedding = harness.embed(&landing_url("earner"));

    let outcome = embedding
        .page
        .call(Action::PageView, ActionOptions::distinguisher("example.com/landing"))
        .await
        .unwrap();
    assert!(outcome.success, "{outcome:?}");

    let outcome = embedding
        .page
        .call(Action::PageView, ActionOptions::distinguisher("other.example.net"))
        .await
        .unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("distinguisher is invalid for this page: other.example.net")
    );
    assert_eq!(harness.simulator.requests().len(), 1);
}

#[tokio::test]
async fn revoked_tokens_are_forgotten() {
    let harness = Harness::start().await;
    harness.simulator.revoke_token("earner");
    let embedding = harness.embed(&landing_url("earner"));

    let outcome = call(&embedding, Action::PageView).await;
    assert!(!outcome.success);
    assert_eq!(outcome.detail, "401 access denied");

    let outcome = call(&embedding, Action::ClickThrough).await;
    assert_eq!(outcome.error.as_deref(), Some(NO_TOKENS_ERROR));
    assert_eq!(harness.simulator.requests().len(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let harness = Harness::start().await;
    harness.simulator.fail_next(2);
    let embedding = harness.embed(&landing_url("earner"));

    let outcome = call(&embedding, Action::PageView).await;
    assert!(outcome.success, "{outcome:?}");
    let statuses: Vec<u16> = harness
        .simulator
        .requests()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![503, 503, 200]);
}

#[tokio::test]
async fn slow_server_times_out_on_the_page() {
    let harness = Harness::start().await;
    harness.simulator.set_latency(Duration::from_secs(5));
    let embedding = harness.embed(&landing_url("earner"));

    let started = std::time::Instant::now();
    let outcome = embedding
        .page
        .call(Action::ClickThrough, ActionOptions::default().with_timeout(300))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::timeout());
    assert!(started.elapsed() < Duration::from_secs(3));
}
