/*!
 * Monitoring
 * Structured tracing setup and negotiation spans
 */

mod tracer;

pub use tracer::{init_tracing, span_negotiation, NegotiationSpan};
