//! Fuzz testing for admission input parsing.
//!
//! Checks that client identity resolution, rate string parsing, credential
//! store parsing and image validation never panic on arbitrary input.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the admission fuzz target
//! cargo +nightly fuzz run fuzz_admission
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_admission -- -max_total_time=60
//! ```

#![no_main]

use std::net::{IpAddr, Ipv4Addr};

use inference_gate::middleware::ip::{ProxyTrust, resolve_client_ip};
use inference_gate::services::credentials::parse_credentials;
use inference_gate::services::rate_limiter::{Rate, RatePolicy};
use inference_gate::validation::{sniff_image_format, validate_image};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes as an image payload after decoding
    let _ = sniff_image_format(data);

    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Forwarded-for chains under every small hop count
    let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    for hops in 0..4 {
        let trust = ProxyTrust::new(true, hops);
        let ip = resolve_client_ip(peer, Some(s), trust);
        assert!(!ip.is_empty());
        let _ = resolve_client_ip(None, Some(s), trust);
    }

    // Rate strings and policies
    if let Ok(rate) = s.parse::<Rate>() {
        assert!(rate.count > 0);
        assert!(rate.per_second() > 0.0);
    }
    let _ = RatePolicy::parse(s, u32::from(data.first().copied().unwrap_or(0)));

    // Credential stores and base64 images
    let _ = parse_credentials(s);
    let _ = validate_image(s, 1.0);
});
