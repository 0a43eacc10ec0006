//! Address codec: pure parsing/formatting of IPv4/IPv6 literals and
//! `host:port` pairs. No I/O lives here.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl HostAddress {
    pub fn is_v4(&self) -> bool {
        matches!(self, HostAddress::V4(_))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, HostAddress::V6(_))
    }
}

impl From<Ipv4Addr> for HostAddress {
    fn from(a: Ipv4Addr) -> Self {
        HostAddress::V4(a.octets())
    }
}

impl From<Ipv6Addr> for HostAddress {
    fn from(a: Ipv6Addr) -> Self {
        HostAddress::V6(a.octets())
    }
}

impl From<HostAddress> for std::net::IpAddr {
    fn from(h: HostAddress) -> Self {
        match h {
            HostAddress::V4(o) => std::net::IpAddr::V4(Ipv4Addr::from(o)),
            HostAddress::V6(o) => std::net::IpAddr::V6(Ipv6Addr::from(o)),
        }
    }
}

impl From<std::net::IpAddr> for HostAddress {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(a) => a.into(),
            std::net::IpAddr::V6(a) => a.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    pub host: HostAddress,
    pub port: u16,
}

impl SocketAddress {
    pub fn new(host: HostAddress, port: u16) -> Self {
        Self { host, port }
    }
}

impl From<std::net::SocketAddr> for SocketAddress {
    fn from(sa: std::net::SocketAddr) -> Self {
        SocketAddress::new(sa.ip().into(), sa.port())
    }
}

impl From<SocketAddress> for std::net::SocketAddr {
    fn from(sa: SocketAddress) -> Self {
        std::net::SocketAddr::new(sa.host.into(), sa.port)
    }
}

/// Parses a bare IPv4 dotted-quad or bracketed IPv6 literal.
/// Leading whitespace is skipped; any trailing bytes are an error.
pub fn parse_host(s: &str) -> Result<HostAddress> {
    let s = s.trim_start();
    if s.is_empty() {
        return Err(Error::invalid_address("empty host"));
    }
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::invalid_address("unterminated IPv6 literal"))?;
        let (inner, trailing) = rest.split_at(end);
        let trailing = &trailing[1..]; // drop ']'
        if !trailing.is_empty() {
            return Err(Error::invalid_address("trailing data after IPv6 literal"));
        }
        let addr: Ipv6Addr = inner
            .parse()
            .map_err(|_| Error::invalid_address(format!("invalid IPv6 literal: {inner}")))?;
        Ok(addr.into())
    } else {
        let addr: Ipv4Addr = s
            .parse()
            .map_err(|_| Error::invalid_address(format!("invalid IPv4 literal: {s}")))?;
        Ok(addr.into())
    }
}

/// Formats a host per RFC 5952: IPv4 dotted-quad; IPv6 bracketed, lowercase,
/// with the longest (leftmost-on-tie) run of zero groups compressed to `::`.
pub fn format_host(h: HostAddress) -> String {
    match h {
        HostAddress::V4(o) => format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3]),
        HostAddress::V6(o) => format!("[{}]", format_ipv6_compressed(&o)),
    }
}

fn groups_of(o: &[u8; 16]) -> [u16; 8] {
    let mut g = [0u16; 8];
    for i in 0..8 {
        g[i] = u16::from_be_bytes([o[2 * i], o[2 * i + 1]]);
    }
    g
}

/// Finds the longest run of all-zero groups, leftmost on ties. Returns
/// `None` if no run of length >= 2 exists.
fn longest_zero_run(groups: &[u16; 8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut run_start = None;
    for i in 0..=8 {
        let is_zero = i < 8 && groups[i] == 0;
        if is_zero {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(start) = run_start.take() {
            let len = i - start;
            if len >= 2 {
                let better = match best {
                    None => true,
                    Some((bstart, bend)) => len > bend - bstart,
                };
                if better {
                    best = Some((start, i));
                }
            }
        }
    }
    best
}

fn format_ipv6_compressed(o: &[u8; 16]) -> String {
    let groups = groups_of(o);
    let run = longest_zero_run(&groups);

    match run {
        None => groups
            .iter()
            .map(|g| format!("{:x}", g))
            .collect::<Vec<_>>()
            .join(":"),
        Some((start, end)) => {
            let left = groups[..start]
                .iter()
                .map(|g| format!("{:x}", g))
                .collect::<Vec<_>>()
                .join(":");
            let right = groups[end..]
                .iter()
                .map(|g| format!("{:x}", g))
                .collect::<Vec<_>>()
                .join(":");
            format!("{left}::{right}")
        }
    }
}

/// Splits at the last top-level `:` (not inside brackets), parses host via
/// `parse_host` and port as a decimal in `[1, 65535]`.
pub fn parse_socket(s: &str) -> Result<SocketAddress> {
    let s = s.trim_start();
    let split_at = if s.starts_with('[') {
        let close = s
            .find(']')
            .ok_or_else(|| Error::invalid_address("unterminated IPv6 literal"))?;
        s[close..]
            .rfind(':')
            .map(|i| close + i)
            .ok_or_else(|| Error::invalid_address("missing port"))?
    } else {
        s.rfind(':')
            .ok_or_else(|| Error::invalid_address("missing port"))?
    };

    let (host_part, port_part) = s.split_at(split_at);
    let port_part = &port_part[1..]; // drop ':'

    let host = parse_host(host_part)?;
    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::invalid_address(format!("invalid port: {port_part}")))?;
    if port == 0 {
        return Err(Error::invalid_address("port must be in [1, 65535]"));
    }
    Ok(SocketAddress::new(host, port))
}

pub fn format_socket(a: SocketAddress) -> String {
    format!("{}:{}", format_host(a.host), a.port)
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_socket(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4() {
        assert_eq!(parse_host("127.0.0.1").unwrap(), HostAddress::V4([127, 0, 0, 1]));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let h = parse_host("[::1]").unwrap();
        assert_eq!(h, HostAddress::V6(Ipv6Addr::LOCALHOST.octets()));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_host("127.0.0.1x").is_err());
        assert!(parse_host("[::1]x").is_err());
    }

    #[test]
    fn formats_ipv4() {
        assert_eq!(format_host(HostAddress::V4([10, 0, 0, 1])), "10.0.0.1");
    }

    #[test]
    fn compresses_longest_zero_run_leftmost_tie() {
        // two equal-length zero runs: groups [1,0,0,2,0,0,3,4] -> leftmost wins
        let groups: [u16; 8] = [1, 0, 0, 2, 0, 0, 3, 4];
        let mut octets = [0u8; 16];
        for (i, g) in groups.iter().enumerate() {
            let b = g.to_be_bytes();
            octets[2 * i] = b[0];
            octets[2 * i + 1] = b[1];
        }
        let s = format_ipv6_compressed(&octets);
        assert_eq!(s, "1::2:0:0:3:4");
    }

    #[test]
    fn single_zero_group_not_compressed_alone() {
        // run of length 1 must not become "::"
        let groups: [u16; 8] = [1, 2, 3, 4, 5, 0, 6, 7];
        let mut octets = [0u8; 16];
        for (i, g) in groups.iter().enumerate() {
            let b = g.to_be_bytes();
            octets[2 * i] = b[0];
            octets[2 * i + 1] = b[1];
        }
        assert_eq!(format_ipv6_compressed(&octets), "1:2:3:4:5:0:6:7");
    }

    #[test]
    fn all_zero_compresses_to_double_colon() {
        assert_eq!(format_host(HostAddress::V6([0; 16])), "[::]");
    }

    #[test]
    fn socket_roundtrip_ipv4() {
        let a = parse_socket("192.168.1.1:8080").unwrap();
        assert_eq!(format_socket(a), "192.168.1.1:8080");
        assert_eq!(parse_socket(&format_socket(a)).unwrap(), a);
    }

    #[test]
    fn socket_roundtrip_ipv6() {
        let a = parse_socket("[::1]:1080").unwrap();
        assert_eq!(format_socket(a), "[::1]:1080");
        assert_eq!(parse_socket(&format_socket(a)).unwrap(), a);
    }

    #[test]
    fn rejects_zero_port() {
        assert!(parse_socket("127.0.0.1:0").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_socket("127.0.0.1").is_err());
    }
}
