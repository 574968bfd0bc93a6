// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Daemon endpoint addresses
//!
//! Config form is `{ type, address }` with type one of `local`, `inet4`,
//! `inet6`. Local addresses starting with `@` are abstract sockets;
//! filesystem paths must fit the kernel's `sun_path` limit.

use std::fmt;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// `sun_path` bytes available for a non-abstract local address, minus the
/// NUL terminator
pub const LOCAL_PATH_MAX: usize = {
    let sun_path = std::mem::size_of::<libc::sockaddr_un>() - std::mem::size_of::<libc::sa_family_t>();
    sun_path - 1
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "address", rename_all = "lowercase")]
pub enum Address {
    /// AF_UNIX; `@name` addresses the abstract namespace
    Local(String),
    Inet4(SocketAddrV4),
    Inet6(SocketAddrV6),
}

impl Address {
    pub fn local(path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();

        if path.is_empty() {
            return Err(Error::MalformedAddress(path, "empty local address"));
        }
        if !path.starts_with('@') && path.len() > LOCAL_PATH_MAX {
            return Err(Error::MalformedAddress(path, "path exceeds the socket path limit"));
        }

        Ok(Address::Local(path))
    }

    /// Whether this is an abstract-namespace local address
    pub fn is_abstract(&self) -> bool {
        matches!(self, Address::Local(path) if path.starts_with('@'))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v4) = s.parse::<SocketAddrV4>() {
            return Ok(Address::Inet4(v4));
        }
        if let Ok(v6) = s.parse::<SocketAddrV6>() {
            return Ok(Address::Inet6(v6));
        }
        Address::local(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Local(path) => write!(f, "{path}"),
            Address::Inet4(addr) => write!(f, "{addr}"),
            Address::Inet6(addr) => write!(f, "{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert!(matches!("/run/chef/cvd.sock".parse::<Address>().unwrap(), Address::Local(_)));
        assert!(matches!("@chef-cvd".parse::<Address>().unwrap(), Address::Local(_)));
        assert!(matches!("127.0.0.1:7811".parse::<Address>().unwrap(), Address::Inet4(_)));
        assert!(matches!("[::1]:7811".parse::<Address>().unwrap(), Address::Inet6(_)));
    }

    #[test]
    fn abstract_detection() {
        assert!("@chef-cvd".parse::<Address>().unwrap().is_abstract());
        assert!(!"/run/chef/cvd.sock".parse::<Address>().unwrap().is_abstract());
    }

    #[test]
    fn overlong_path_is_rejected() {
        let path = format!("/run/{}", "x".repeat(200));

        assert!(matches!(path.parse::<Address>(), Err(Error::MalformedAddress(..))));
    }

    #[test]
    fn config_serialization() {
        let address: Address = serde_json::from_str(r#"{"type":"local","address":"@cvd"}"#).unwrap();
        assert_eq!(address, Address::Local("@cvd".into()));

        let address: Address = serde_json::from_str(r#"{"type":"inet4","address":"0.0.0.0:7811"}"#).unwrap();
        assert!(matches!(address, Address::Inet4(_)));
    }
}
