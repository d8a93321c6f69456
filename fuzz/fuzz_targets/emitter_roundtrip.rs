#![no_main]

use gh_aw::emit::{Node, render_document};
use libfuzzer_sys::fuzz_target;

// Any scalar the emitter writes must re-parse to the same string.
fuzz_target!(|data: &str| {
    if data.contains('\n') {
        return;
    }
    let doc = Node::map(vec![("key", Node::str(data))]);
    let rendered = render_document(&doc);
    let Ok(parsed) = serde_yaml::from_str::<serde_yaml::Mapping>(&rendered) else {
        panic!("emitted YAML failed to parse: {rendered:?}");
    };
    let roundtripped = parsed
        .get(serde_yaml::Value::String("key".to_string()))
        .and_then(serde_yaml::Value::as_str);
    assert_eq!(roundtripped, Some(data), "rendered: {rendered:?}");
});
