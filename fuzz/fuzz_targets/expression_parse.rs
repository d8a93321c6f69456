#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(expr) = gh_aw_expr::parse(data) {
        let _ = gh_aw_expr::validate(&expr);
    }
    let _ = gh_aw_expr::validate_text(data);
});
