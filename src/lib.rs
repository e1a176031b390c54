pub mod balancer;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod telemetry;
pub mod traffic;
pub mod upstream;
