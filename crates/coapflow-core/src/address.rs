//! Endpoint addressing and URI paths
//!
//! Paths are carried as ordered segment lists, the way Uri-Path options
//! arrive on the wire:
//! ```text
//! /sensors/temp   ->  ["sensors", "temp"]
//! /               ->  []
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identity of a remote client: address plus port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for EndpointAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Split a path string into segments, dropping empty ones
pub fn parse_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect()
}

/// Join segments back into a `/`-prefixed path
pub fn format_path(segments: &[String]) -> String {
    let mut path = String::from("/");
    path.push_str(&segments.join("/"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("/sensors/temp"), vec!["sensors", "temp"]);
        assert_eq!(parse_path("sensors//temp/"), vec!["sensors", "temp"]);
        assert!(parse_path("/").is_empty());
    }

    #[test]
    fn test_format_path() {
        assert_eq!(format_path(&parse_path("/a/b")), "/a/b");
        assert_eq!(format_path(&[]), "/");
    }

    #[test]
    fn test_endpoint_from_socket() {
        let addr: SocketAddr = "10.0.0.7:5683".parse().unwrap();
        let endpoint = EndpointAddress::from(addr);
        assert_eq!(endpoint.port, 5683);
        assert_eq!(endpoint.to_string(), "10.0.0.7:5683");
    }
}
