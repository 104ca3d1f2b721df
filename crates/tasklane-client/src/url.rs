use crate::ClientError;
use std::fmt;
use std::str::FromStr;

/// Parsed broker connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerUrl {
    Memory,
    Tcp { host: String, port: u16 },
}

impl FromStr for BrokerUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidUrl(s.to_string());

        if s == "memory://" {
            return Ok(BrokerUrl::Memory);
        }

        let rest = s.strip_prefix("tcp://").ok_or_else(invalid)?;
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(BrokerUrl::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerUrl::Memory => write!(f, "memory://"),
            BrokerUrl::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        assert_eq!("memory://".parse::<BrokerUrl>().unwrap(), BrokerUrl::Memory);
        assert_eq!(
            "tcp://localhost:6380".parse::<BrokerUrl>().unwrap(),
            BrokerUrl::Tcp {
                host: "localhost".to_string(),
                port: 6380
            }
        );
        assert!("redis://localhost:6379".parse::<BrokerUrl>().is_err());
        assert!("tcp://localhost".parse::<BrokerUrl>().is_err());
        assert!("tcp://:6380".parse::<BrokerUrl>().is_err());
    }
}
