#![no_main]

use libfuzzer_sys::fuzz_target;
use sieve_normalizer::normalize;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let once = normalize(&raw);
    assert_eq!(normalize(&once), once);
});
