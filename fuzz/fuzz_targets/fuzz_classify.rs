#![no_main]

use libfuzzer_sys::fuzz_target;
use tls_sockets::{classify, is_ip, is_ipv4, is_ipv6, AddressKind};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let kind = classify(input);
    assert_eq!(is_ip(input), kind.as_u8());
    assert_eq!(is_ipv4(input), kind == AddressKind::V4);
    assert_eq!(is_ipv6(input), kind == AddressKind::V6);

    if is_ipv4(input) {
        assert!(input.parse::<std::net::Ipv4Addr>().is_ok());
    }
});
