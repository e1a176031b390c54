pub mod chain;
pub mod table;

pub use chain::{Middleware, MiddlewareChain, MiddlewareOutcome, MiddlewareRegistry};
pub use table::{Route, RouteTable};
