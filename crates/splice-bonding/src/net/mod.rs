//! UDP helpers shared by the client and server sessions.

pub mod udp;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Resolve a server given as `ip`, `host`, `ip:port` or `host:port`. A
/// missing port falls back to `default_port`.
pub fn parse_server_addr(input: &str, default_port: u16) -> Option<SocketAddr> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    let with_port = if input.contains(':') {
        input.to_string()
    } else {
        format!("{}:{}", input, default_port)
    };
    with_port.to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ip_gets_default_port() {
        assert_eq!(
            parse_server_addr("10.0.0.7", 55555),
            Some("10.0.0.7:55555".parse().unwrap())
        );
    }

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(
            parse_server_addr(" 127.0.0.1:6000 ", 55555),
            Some("127.0.0.1:6000".parse().unwrap())
        );
    }

    #[test]
    fn localhost_resolves() {
        let addr = parse_server_addr("localhost", 55555).unwrap();
        assert_eq!(addr.port(), 55555);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn empty_is_rejected() {
        assert_eq!(parse_server_addr("  ", 1), None);
    }
}
