/// Small helpers shared across the router modules
use std::net::IpAddr;
use std::time::Duration;

/// Split a destination entry into host and port.
///
/// Accepts `host`, `host:port`, `[v6addr]` and `[v6addr]:port`. A bare IPv6
/// address without brackets is treated as a host without a port. A returned
/// port of 0 means "not given"; callers substitute the protocol default.
/// The error is a human-readable reason suitable for configuration messages.
pub fn split_addr_port(entry: &str) -> Result<(String, u16), String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err("address is empty".to_string());
    }

    if let Some(rest) = entry.strip_prefix('[') {
        // Bracketed IPv6: [::1] or [::1]:3306
        let close = rest
            .find(']')
            .ok_or_else(|| format!("invalid address '{}': missing ']'", entry))?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(format!("invalid address '{}': empty host", entry));
        }
        let tail = &rest[close + 1..];
        if tail.is_empty() {
            return Ok((host.to_string(), 0));
        }
        let port_str = tail
            .strip_prefix(':')
            .ok_or_else(|| format!("invalid address '{}': unexpected '{}'", entry, tail))?;
        let port = parse_port(port_str, entry)?;
        return Ok((host.to_string(), port));
    }

    match entry.split_once(':') {
        None => Ok((entry.to_string(), 0)),
        // More than one colon without brackets: bare IPv6 host
        Some(_) if entry.matches(':').count() > 1 => Ok((entry.to_string(), 0)),
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(format!("invalid address '{}': empty host", entry));
            }
            let port = parse_port(port_str, entry)?;
            Ok((host.to_string(), port))
        }
    }
}

fn parse_port(port_str: &str, entry: &str) -> Result<u16, String> {
    match port_str.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!(
            "invalid TCP port in address '{}' (was '{}')",
            entry, port_str
        )),
        Ok(port) => Ok(port),
    }
}

/// Normalized 16-byte fingerprint of a client source address.
///
/// IPv4 addresses occupy the first four bytes, IPv6 all sixteen. Sources
/// without an IP address (local stream sockets) share the all-zero key.
pub fn ip_fingerprint(ip: Option<IpAddr>) -> [u8; 16] {
    match ip {
        Some(IpAddr::V4(v4)) => {
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&v4.octets());
            key
        }
        Some(IpAddr::V6(v6)) => v6.octets(),
        None => [0u8; 16],
    }
}

/// Whether a path can be used as a local stream socket.
///
/// The kernel limit for sockaddr_un paths is 108 bytes on Linux and less on
/// some BSDs; 100 keeps a margin for the trailing NUL.
pub fn is_valid_socket_path(path: &str) -> bool {
    !path.is_empty() && path.len() <= 100
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_split_addr_port_host_only() {
        assert_eq!(
            split_addr_port("db1.example.com").unwrap(),
            ("db1.example.com".to_string(), 0)
        );
    }

    #[test]
    fn test_split_addr_port_host_and_port() {
        assert_eq!(
            split_addr_port("10.0.0.1:3306").unwrap(),
            ("10.0.0.1".to_string(), 3306)
        );
    }

    #[test]
    fn test_split_addr_port_bracketed_ipv6() {
        assert_eq!(
            split_addr_port("[::1]:3306").unwrap(),
            ("::1".to_string(), 3306)
        );
        assert_eq!(
            split_addr_port("[fd00::2]").unwrap(),
            ("fd00::2".to_string(), 0)
        );
    }

    #[test]
    fn test_split_addr_port_bare_ipv6() {
        assert_eq!(split_addr_port("fd00::2").unwrap(), ("fd00::2".to_string(), 0));
    }

    #[test]
    fn test_split_addr_port_rejects_bad_ports() {
        assert!(split_addr_port("host:0").is_err());
        assert!(split_addr_port("host:65536").is_err());
        assert!(split_addr_port("host:abc").is_err());
        assert!(split_addr_port(":3306").is_err());
        assert!(split_addr_port("").is_err());
    }

    #[test]
    fn test_ip_fingerprint_v4() {
        let key = ip_fingerprint(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))));
        assert_eq!(&key[..4], &[192, 168, 1, 7]);
        assert_eq!(&key[4..], &[0u8; 12]);
    }

    #[test]
    fn test_ip_fingerprint_v6() {
        let v6: Ipv6Addr = "fd00::1".parse().unwrap();
        assert_eq!(ip_fingerprint(Some(IpAddr::V6(v6))), v6.octets());
    }

    #[test]
    fn test_ip_fingerprint_none_is_zero() {
        assert_eq!(ip_fingerprint(None), [0u8; 16]);
    }

    #[test]
    fn test_socket_path_limits() {
        assert!(is_valid_socket_path("/tmp/router.sock"));
        assert!(!is_valid_socket_path(""));
        assert!(!is_valid_socket_path(&"x".repeat(101)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3720)), "1h 2m");
    }
}
