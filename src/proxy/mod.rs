pub mod context;
pub mod forward;
pub mod pipeline;

pub use context::{BoxBody, RequestContext};
pub use forward::{Forwarder, HttpForwarder};
pub use pipeline::DispatchPipeline;
