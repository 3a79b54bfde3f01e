/*!
 * Tracing
 * Subscriber setup and spans around negotiation using the tracing crate
 *
 * The library only emits events; installing a subscriber is left to the
 * host application, which may call `init_tracing`.
 */

use crate::core::types::Direction;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Negotiations slower than this are reported at warn level
const SLOW_NEGOTIATION: Duration = Duration::from_secs(1);

/// Install a global tracing subscriber
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - PIPE_BYPASS_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("PIPE_BYPASS_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Pipe bypass tracing initialized");
    }
    installed
}

/// Span covering one startup stall on one direction
pub struct NegotiationSpan {
    span: tracing::Span,
    start: Instant,
    trace_id: String,
}

impl NegotiationSpan {
    pub fn new(resource: &str, direction: Direction) -> Self {
        let trace_id = Uuid::new_v4().to_string();
        let span = span!(
            Level::DEBUG,
            "negotiation",
            trace_id = %trace_id,
            resource = resource,
            direction = %direction,
            verdict = tracing::field::Empty,
            stream_id = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn record_verdict<V: std::fmt::Debug>(&self, verdict: V) {
        self.span.record("verdict", format!("{:?}", verdict).as_str());
    }

    pub fn record_stream_id(&self, stream_id: u16) {
        self.span.record("stream_id", stream_id);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for NegotiationSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_millis() as u64);
        let _entered = self.span.enter();

        if duration > SLOW_NEGOTIATION {
            warn!(
                trace_id = %self.trace_id,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow negotiation"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                duration_us = duration.as_micros() as u64,
                "negotiation finished"
            );
        }
    }
}

#[inline]
pub fn span_negotiation(resource: &str, direction: Direction) -> NegotiationSpan {
    NegotiationSpan::new(resource, direction)
}
