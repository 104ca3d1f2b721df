mod remote;
mod url;

pub use remote::RemoteBroker;
pub use url::BrokerUrl;

use std::sync::Arc;
use std::time::Duration;
use tasklane_core::{Broker, BrokerError, MemoryBroker, DEFAULT_SWEEP_INTERVAL};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<ClientError> for BrokerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ServerError(msg) => BrokerError::Rejected(msg),
            ClientError::ProtocolError(msg) => BrokerError::Protocol(msg),
            ClientError::ConnectionError(msg) => BrokerError::Connection(msg),
            other => BrokerError::Connection(other.to_string()),
        }
    }
}

/// Build an unconnected broker handle for `url`.
///
/// `memory://` gives an in-process broker, `tcp://host:port` a client of `tl-broker`.
pub fn broker_from_url(url: &str) -> Result<Arc<dyn Broker>> {
    broker_from_url_with_sweep(url, DEFAULT_SWEEP_INTERVAL)
}

/// Like `broker_from_url`, with the retention sweep period of an in-process broker
pub fn broker_from_url_with_sweep(url: &str, sweep_interval: Duration) -> Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match url.parse::<BrokerUrl>()? {
        BrokerUrl::Memory => Arc::new(MemoryBroker::with_sweep_interval(sweep_interval)),
        BrokerUrl::Tcp { host, port } => Arc::new(RemoteBroker::new(format!("{}:{}", host, port))),
    };
    Ok(broker)
}
