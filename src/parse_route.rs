//! Route specification: where to listen and where to relay to.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::codec::{FramingKind, InvalidFraming};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

#[cfg(not(feature = "default-is-ipv6"))]
/// Default host for local and unspecified addresses.
macro_rules! default_host {
    (local) => {
        String::from("127.0.0.1")
    };
    (unspec) => {
        String::from("0.0.0.0")
    };
}
#[cfg(feature = "default-is-ipv6")]
/// Default host for local and unspecified addresses.
macro_rules! default_host {
    (local) => {
        String::from("::1")
    };
    (unspec) => {
        String::from("::")
    };
}

/// One listener and the remote endpoint its connections are relayed to.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Route {
    /// Address to accept connections on
    pub local: (String, u16),
    /// Endpoint every accepted connection is relayed to
    pub remote: (String, u16),
    /// Framing installed on both legs
    pub framing: FramingKind,
}

/// Errors that can occur when parsing a route.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid route specification
    #[error("Invalid format")]
    Format,
    /// Invalid host or address
    #[error("Invalid host")]
    Host,
    /// Invalid port
    #[error("Invalid port")]
    Port(#[from] std::num::ParseIntError),
    /// Invalid framing
    #[error(transparent)]
    Framing(#[from] InvalidFraming),
}

/// Split on `:`, keeping bracketed IPv6 addresses together.
fn tokenize(s: &str) -> Result<Vec<&str>, Error> {
    let mut tokens = Vec::new();
    let mut rest = s;
    loop {
        if rest.starts_with('[') {
            let end = rest.find(']').ok_or(Error::Host)? + 1;
            tokens.push(&rest[..end]);
            if rest[end..].is_empty() {
                return Ok(tokens);
            }
            if !rest[end..].starts_with(':') {
                return Err(Error::Format);
            }
            rest = &rest[end + 1..];
        } else if let Some((token, tail)) = rest.split_once(':') {
            tokens.push(token);
            rest = tail;
        } else {
            tokens.push(rest);
            return Ok(tokens);
        }
    }
}

/// Remove brackets from possibly an IPv6 address
#[must_use]
pub fn remove_brackets(s: &str) -> &str {
    s.strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(s)
}

fn host(token: &str) -> Result<String, Error> {
    let host = remove_brackets(token);
    if host.is_empty() {
        Err(Error::Host)
    } else {
        Ok(host.to_string())
    }
}

fn write_host_port(
    f: &mut std::fmt::Formatter<'_>,
    (host, port): &(String, u16),
) -> std::fmt::Result {
    if host.contains(':') {
        write!(f, "[{host}]:{port}")
    } else {
        write!(f, "{host}:{port}")
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_host_port(f, &self.local)?;
        f.write_str(":")?;
        write_host_port(f, &self.remote)?;
        write!(f, "/{}", self.framing)
    }
}

impl FromStr for Route {
    type Err = Error;

    /// Parse `[local-host:]local-port:remote-host:remote-port[/framing]`,
    /// or the `port` and `remote-host:port` shorthands.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, framing) = match s.rsplit_once('/') {
            Some((rest, framing)) => (rest, framing.parse()?),
            None => (s, FramingKind::default()),
        };
        let tokens = tokenize(rest)?;
        let (local, remote) = match tokens[..] {
            [port] => {
                let port = port.parse()?;
                ((default_host!(unspec), port), (default_host!(local), port))
            }
            [remote_host, port] => {
                let port = port.parse()?;
                ((default_host!(unspec), port), (host(remote_host)?, port))
            }
            [local_port, remote_host, remote_port] => (
                (default_host!(unspec), local_port.parse()?),
                (host(remote_host)?, remote_port.parse()?),
            ),
            [local_host, local_port, remote_host, remote_port] => (
                (host(local_host)?, local_port.parse()?),
                (host(remote_host)?, remote_port.parse()?),
            ),
            _ => return Err(Error::Format),
        };
        Ok(Self {
            local,
            remote,
            framing,
        })
    }
}
