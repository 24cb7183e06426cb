use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{core::Collector, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::thread;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<T: Collector + Clone + 'static>(metric: T) -> T {
    // registering twice only happens if a name is reused; keep the first
    let _ = REGISTRY.register(Box::new(metric.clone()));
    metric
}

fn counter(name: &str, help: &str) -> IntCounter {
    register(IntCounter::new(name, help).expect("valid counter definition"))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    register(IntGauge::new(name, help).expect("valid gauge definition"))
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter vec definition"))
}

pub static ODR_REQUESTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("unchained_light_odr_requests_total", "ODR calls by data kind", "kind"));
pub static ODR_OUTCOMES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("unchained_light_odr_outcomes_total", "Completed ODR calls by outcome", "outcome"));
pub static WIRE_REQUESTS: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_wire_requests_total", "Requests sent to light servers"));
pub static DEDUP_ATTACHES: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_dedup_attaches_total", "Callers attached to an existing session"));
pub static TIMEOUTS: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_timeouts_total", "Wire requests that timed out"));
pub static INVALID_RESPONSES: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_invalid_responses_total", "Responses rejected by validation"));
pub static RETRIEVAL_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_retrieval_failures_total", "Sessions that ended without a result"));
pub static VERIFIED: Lazy<IntCounter> =
    Lazy::new(|| counter("unchained_light_verified_total", "Sessions that produced a verified result"));
pub static LIGHT_PEERS: Lazy<IntGauge> =
    Lazy::new(|| gauge("unchained_light_peers", "Registered light servers"));
pub static IN_FLIGHT: Lazy<IntGauge> =
    Lazy::new(|| gauge("unchained_light_in_flight", "Wire requests awaiting a response"));
pub static ACTIVE_SESSIONS: Lazy<IntGauge> =
    Lazy::new(|| gauge("unchained_light_active_sessions", "Retrieval sessions in progress"));

/// Expose the registry in text format on `cfg.bind` from a background thread.
pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    let bind_addr = cfg.bind.clone();
    let server = tiny_http::Server::http(&bind_addr)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", bind_addr, e))?;
    let content_type = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow::anyhow!("invalid content type header"))?;
    tracing::info!(bind = %bind_addr, "📊 Metrics exporter listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                tracing::warn!(error = %e, "🔥 Could not encode metrics");
                continue;
            }
            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
