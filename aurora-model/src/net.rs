//! Address classification helpers used by rule validation and DNS handling.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// True when the string parses as an IPv4 literal.
pub fn is_ipv4(candidate: &str) -> bool {
    candidate.parse::<Ipv4Addr>().is_ok()
}

/// True when the string parses as an IPv6 literal.
pub fn is_ipv6(candidate: &str) -> bool {
    candidate.parse::<Ipv6Addr>().is_ok()
}

/// True when the string parses as an IP literal of either family.
pub fn is_ip(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}

/// Wrap IPv6 literals in brackets for host:port composition.
pub fn bracketed(address: &str) -> String {
    if is_ipv6(address) {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_literals() {
        assert!(is_ipv4("1.2.3.4"));
        assert!(!is_ipv4("example.com"));
        assert!(is_ipv6("2001:db8::1"));
        assert!(!is_ipv6("1.2.3.4"));
        assert!(is_ip("1.2.3.4"));
        assert!(is_ip("2001:db8::1"));
        assert!(!is_ip("nat.example.com"));
    }

    #[test]
    fn brackets_only_v6() {
        assert_eq!(bracketed("2001:db8::1"), "[2001:db8::1]");
        assert_eq!(bracketed("1.2.3.4"), "1.2.3.4");
        assert_eq!(bracketed("example.com"), "example.com");
    }
}
