//! Textual IP address classification
//!
//! Only exact canonical forms are accepted: no surrounding whitespace, no
//! partial matches, no leading zeros in IPv4 octets. IPv6 literals may carry
//! a zone suffix (`fe80::1%eth0`).

use std::net::Ipv6Addr;

/// Address family of a textual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressKind {
    /// Not an IP address
    None = 0,
    /// Dotted-quad IPv4
    V4 = 4,
    /// IPv6 literal
    V6 = 6,
}

impl AddressKind {
    /// Numeric family (0, 4 or 6)
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for AddressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// Classify `input` as IPv4, IPv6 or neither.
pub fn classify(input: &str) -> AddressKind {
    if is_dotted_quad(input) {
        AddressKind::V4
    } else if is_ipv6_literal(input) {
        AddressKind::V6
    } else {
        AddressKind::None
    }
}

/// Numeric address family of `input`: 4, 6, or 0 when it is not an IP.
pub fn is_ip(input: &str) -> u8 {
    classify(input).as_u8()
}

/// Whether `input` is an exact IPv4 address
pub fn is_ipv4(input: &str) -> bool {
    classify(input) == AddressKind::V4
}

/// Whether `input` is an exact IPv6 address
pub fn is_ipv6(input: &str) -> bool {
    classify(input) == AddressKind::V6
}

fn is_dotted_quad(input: &str) -> bool {
    let mut octets = 0;
    for part in input.split('.') {
        octets += 1;
        if octets > 4 || !is_octet(part) {
            return false;
        }
    }
    octets == 4
}

fn is_octet(part: &str) -> bool {
    let bytes = part.as_bytes();
    if bytes.is_empty() || bytes.len() > 3 || !bytes.iter().all(u8::is_ascii_digit) {
        return false;
    }
    // "0" is fine, "01" is not
    if bytes.len() > 1 && bytes[0] == b'0' {
        return false;
    }
    part.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
}

fn is_ipv6_literal(input: &str) -> bool {
    let (addr, zone) = match input.split_once('%') {
        Some((addr, zone)) => (addr, Some(zone)),
        None => (input, None),
    };

    if let Some(zone) = zone {
        if zone.is_empty() || !zone.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return false;
        }
    }

    addr.parse::<Ipv6Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_scenarios() {
        assert_eq!(classify("192.168.1.1"), AddressKind::V4);
        assert_eq!(classify("::1"), AddressKind::V6);
        assert_eq!(classify("not-an-ip"), AddressKind::None);

        assert_eq!(is_ip("192.168.1.1"), 4);
        assert_eq!(is_ip("::1"), 6);
        assert_eq!(is_ip("not-an-ip"), 0);
    }

    #[test]
    fn test_valid_ipv4() {
        for addr in [
            "0.0.0.0",
            "127.0.0.1",
            "255.255.255.255",
            "10.0.0.254",
            "1.2.3.4",
        ] {
            assert!(is_ipv4(addr), "{} should be IPv4", addr);
            assert!(!is_ipv6(addr));
        }
    }

    #[test]
    fn test_partial_matches_rejected() {
        for input in [
            "1.2.3.4 ",
            " 1.2.3.4",
            "1.2.3.4extra",
            "x1.2.3.4",
            "1.2.3",
            "1.2.3.4.5",
            "1.2.3.",
            "256.1.1.1",
            "01.2.3.4",
            "1.2.3.-4",
            "1..2.3",
            "",
            "::1 ",
            "[::1]",
        ] {
            assert_eq!(classify(input), AddressKind::None, "{:?}", input);
        }
    }

    #[test]
    fn test_valid_ipv6() {
        for addr in [
            "::",
            "::1",
            "fe80::1",
            "2001:db8::8a2e:370:7334",
            "2001:0db8:0000:0000:0000:ff00:0042:8329",
            "::ffff:192.168.1.1",
            "fe80::1%eth0",
            "FE80::ABCD",
        ] {
            assert!(is_ipv6(addr), "{} should be IPv6", addr);
            assert_eq!(is_ip(addr), 6);
        }
    }

    #[test]
    fn test_invalid_ipv6() {
        for input in [
            "1:2:3:4:5:6:7:8:9",
            "2001:db8::g",
            ":::1",
            "fe80::1%",
            "fe80::1%eth 0",
            "12345::1",
        ] {
            assert!(!is_ipv6(input), "{:?} should not be IPv6", input);
        }
    }

    #[test]
    fn test_address_kind_display() {
        assert_eq!(AddressKind::V4.to_string(), "ipv4");
        assert_eq!(AddressKind::V6.to_string(), "ipv6");
        assert_eq!(AddressKind::None.to_string(), "none");
    }
}
