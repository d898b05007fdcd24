//! Protocol-qualified port specifications (`"5432/tcp"`, `"53/udp"`, `"8080"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::request::DEFAULT_PROTOCOL;
use crate::error::TestbedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = match s.trim().split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (s.trim(), DEFAULT_PROTOCOL),
        };

        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(TestbedError::configuration(format!(
                    "unsupported protocol '{other}' in port spec '{s}'"
                )))
            }
        };

        let port: u16 = port
            .parse()
            .map_err(|_| TestbedError::configuration(format!("invalid port in spec '{s}'")))?;
        if port == 0 {
            return Err(TestbedError::configuration(format!(
                "port 0 cannot be exposed ('{s}')"
            )));
        }

        Ok(Self { port, protocol })
    }
}

impl TryFrom<&str> for PortSpec {
    type Error = TestbedError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::tcp(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_specs() {
        assert_eq!("5432/tcp".parse::<PortSpec>().unwrap(), PortSpec::tcp(5432));
        assert_eq!("53/UDP".parse::<PortSpec>().unwrap(), PortSpec::udp(53));
        assert_eq!("8080".parse::<PortSpec>().unwrap(), PortSpec::tcp(8080));
    }

    #[test]
    fn test_reject_bad_specs() {
        for bad in ["", "abc/tcp", "70000/tcp", "80/sctp", "0/tcp"] {
            let err = bad.parse::<PortSpec>().unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Configuration, "spec {bad:?}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(PortSpec::udp(10001).to_string(), "10001/udp");
    }
}
