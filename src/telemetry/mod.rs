pub mod metrics;
pub mod spans;

pub use self::metrics::Metrics;
pub use spans::{RequestTracer, SpanTracer};
