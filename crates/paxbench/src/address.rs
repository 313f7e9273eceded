use std::{convert::TryFrom, fmt::Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Where a role process serves its Prometheus metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub scheme: Scheme,
    host: url::Host,
    port: u16,
}

impl Address {
    pub fn http(host: &str, port: u16) -> Result<Self, Error> {
        Ok(Self {
            scheme: Scheme::Http,
            host: url::Host::parse(host)?,
            port,
        })
    }

    pub fn host(&self) -> String {
        self.host.to_string()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metrics_url(&self) -> String {
        format!("{}/metrics", self)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse url")]
    ParseError(#[from] url::ParseError),
    #[error("found an unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("host missing in url")]
    MissingHost,
    #[error("port missing in url")]
    MissingPort,
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(value)?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            e => return Err(Error::UnsupportedScheme(e.to_owned())),
        };
        let host = match url.host() {
            Some(h) => h.to_owned(),
            None => return Err(Error::MissingHost),
        };
        let port = match url.port_or_known_default() {
            Some(p) => p,
            None => return Err(Error::MissingPort),
        };
        Ok(Self { scheme, host, port })
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Http => "http",
                Self::Https => "https",
            }
        )
    }
}
