#![no_main]

use gh_aw::types::{ImportRef, RemoteRef};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let _ = ImportRef::parse(data);
    let _ = RemoteRef::classify(data);
    let _ = RemoteRef::looks_like_short_sha(data);
});
