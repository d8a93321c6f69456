#![no_main]

use std::path::Path;

use gh_aw::frontmatter::parse_bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    let _ = parse_bytes(Path::new("fuzz.md"), content, false);
    let _ = parse_bytes(Path::new("fuzz.md"), content, true);
});
