use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use psicash_simulator::{serve, Simulator, SimulatorConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "psicash-simulator".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("psicash-simulator");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Seconds between rewards for the same token, class, and distinguisher.
    #[arg(long)]
    cooldown_secs: Option<u64>,

    /// Token to accept (repeatable). When any are given, only these are accepted.
    #[arg(long = "token")]
    tokens: Vec<String>,

    /// Delay before every API response, in milliseconds.
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Number of initial API requests to fail with 503.
    #[arg(long, default_value_t = 0)]
    fail_first: usize,

    /// Maximum number of requests kept in the log (0 disables limit).
    #[arg(long)]
    request_log_limit: Option<usize>,
}

fn build_config(args: &Args) -> Result<SimulatorConfig> {
    let defaults = SimulatorConfig::default();
    let cooldown = match args.cooldown_secs {
        Some(secs) => {
            let secs = i64::try_from(secs).context("cooldown_secs is too large")?;
            chrono::Duration::try_seconds(secs).context("cooldown_secs is too large")?
        }
        None => defaults.cooldown,
    };
    if args.tokens.iter().any(|token| token.trim().is_empty() || token.contains(',')) {
        anyhow::bail!("tokens must be non-empty and must not contain commas");
    }

    Ok(SimulatorConfig {
        cooldown,
        accept_any_token: args.tokens.is_empty(),
        tokens: args.tokens.clone(),
        latency: args
            .latency_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(defaults.latency),
        request_log_limit: match args.request_log_limit {
            Some(0) => None,
            Some(limit) => Some(limit),
            None => defaults.request_log_limit,
        },
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    let config = build_config(&args)?;
    info!(
        cooldown_secs = config.cooldown.num_seconds(),
        accept_any_token = config.accept_any_token,
        tokens = config.tokens.len(),
        "simulator configured"
    );
    let simulator = Arc::new(Simulator::new(config));
    simulator.fail_next(args.fail_first);

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let (addr, server) = serve(simulator, addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    server.await.context("server task failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_fields() {
        let args = Args::parse_from([
            "simulator",
            "--cooldown-secs",
            "5",
            "--token",
            "earner",
            "--token",
            "spender",
            "--latency-ms",
            "250",
            "--request-log-limit",
            "0",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.cooldown, chrono::Duration::seconds(5));
        assert!(!config.accept_any_token);
        assert_eq!(config.tokens, vec!["earner", "spender"]);
        assert_eq!(config.latency, std::time::Duration::from_millis(250));
        assert_eq!(config.request_log_limit, None);
    }

    #[test]
    fn defaults_accept_any_token() {
        let args = Args::parse_from(["simulator"]);
        let config = build_config(&args).unwrap();
        assert!(config.accept_any_token);
        assert_eq!(config.cooldown, SimulatorConfig::default().cooldown);
    }

    #[test]
    fn rejects_tokens_with_commas() {
        let args = Args::parse_from(["simulator", "--token", "a,b"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("commas"), "unexpected error: {err}");
    }
}
