#![no_main]
use dlpipe::filename::{parse_content_disposition, sanitize_file_name};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Whatever the header says, the name it yields must stay a single path component
    if let Some(name) = parse_content_disposition(data) {
        let name = sanitize_file_name(&name);
        assert!(!name.contains('/') && !name.contains('\\'));
    }
});
