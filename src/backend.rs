// Copyright 2020 Joyent, Inc.

use std::fmt;

use crate::error::Error;

/// The canonical `host:port` string for a server. Every pool map is keyed
/// by this.
pub type BackendKey = String;
pub type BackendPort = u16;

/// One memcached endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub name: BackendKey,
    pub host: String,
    pub port: BackendPort,
}

impl Backend {
    /// Parse a `host:port` address string.
    pub fn parse(addr: &str) -> Result<Self, Error> {
        let (host, port) = match addr.rfind(':') {
            Some(colon) => (&addr[..colon], &addr[colon + 1..]),
            None => {
                return Err(Error::BadServerList(format!(
                    "missing port in {:?}",
                    addr
                )));
            }
        };
        if host.is_empty() {
            return Err(Error::BadServerList(format!(
                "missing host in {:?}",
                addr
            )));
        }
        let port = port.parse::<BackendPort>().map_err(|_| {
            Error::BadServerList(format!("bad port in {:?}", addr))
        })?;
        Ok(Backend {
            name: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(fmt)
    }
}
