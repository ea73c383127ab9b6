#![no_main]

use libfuzzer_sys::fuzz_target;
use tls_sockets::factory::{normalize, ConnectOptions};

fuzz_target!(|data: &[u8]| {
    if let Ok(options) = serde_json::from_slice::<ConnectOptions>(data) {
        let _ = normalize(options.into());
    }
});
