//! Fuzz test for persisted customer state decoding
//!
//! Feeds arbitrary bytes to `CustomerState::decode`, the path every durable
//! cache read goes through. Decoding must never panic; anything it accepts
//! must have a compatible schema version and survive a re-encode.
//!
//! Run with: cargo +nightly fuzz run snapshot_decode_fuzz -- -max_total_time=60

#![no_main]

use entitle_core::{CustomerState, COMPATIBLE_SCHEMA_VERSIONS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(state) = CustomerState::decode(data) else {
        return;
    };

    assert!(
        COMPATIBLE_SCHEMA_VERSIONS.contains(&state.schema_version.as_str()),
        "Accepted incompatible schema version {}",
        state.schema_version
    );

    let bytes = state.encode().expect("decoded snapshot should re-encode");
    let again = CustomerState::decode(&bytes).expect("re-encoded snapshot should decode");
    assert_eq!(again, state, "Re-decoded snapshot should keep its content");
    assert_eq!(again.app_user_id, state.app_user_id);
});
