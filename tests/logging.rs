//! Global subscriber installation, kept in its own test binary so it cannot
//! pre-empt the log capture used by the library's unit tests.

use rust_tsp::logging;

#[test]
fn test_second_init_is_harmless() {
    let _ = logging::init("debug");
    assert!(!logging::init("info"));
    assert!(!logging::init_json("info"));
}
