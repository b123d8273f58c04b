#![no_main]

use grix::populate::accumulator::{decode_values, encode_values};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder; anything it does accept
    // must survive a re-encode/re-decode unchanged.
    let mut cursor = data;
    if let Ok(values) = decode_values(&mut cursor) {
        let mut encoded = Vec::new();
        encode_values(&values, &mut encoded);
        let mut cursor: &[u8] = &encoded;
        let decoded = decode_values(&mut cursor).unwrap();
        assert_eq!(decoded, values);
    }
});
