pub mod server;
pub mod config;
pub mod api;
pub mod metrics;

pub use server::BrokerServer;
pub use config::BrokerConfig;
