//! Fuzz test for owner-scoped cache key decoding
//!
//! Any byte string may be found in the durable store. `OwnerScopedKey::decode`
//! must never panic, and a key it accepts must encode back to the same bytes
//! and sit under its owner's prefix.
//!
//! Run with: cargo +nightly fuzz run owner_key_fuzz -- -max_total_time=60

#![no_main]

use entitle_storage::OwnerScopedKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some(key) = OwnerScopedKey::decode(data) else {
        return;
    };

    let encoded = key.encode();
    assert_eq!(encoded, data, "Decoded key should encode to its input");
    assert!(
        encoded.starts_with(&OwnerScopedKey::owner_prefix(key.owner())),
        "Key should sit under its owner's prefix"
    );
    assert_eq!(OwnerScopedKey::decode(&encoded), Some(key));
});
