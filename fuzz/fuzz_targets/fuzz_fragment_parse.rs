#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_dnp3::app;
use voltage_dnp3::object::encode_objects;

// Any fragment that parses must re-encode to the same object bytes
fuzz_target!(|data: &[u8]| {
    let Ok(fragment) = app::parse(data) else {
        return;
    };
    let header_len = if fragment.function.is_response() { 4 } else { 2 };
    if let Ok(encoded) = encode_objects(&fragment.objects) {
        let reparsed = app::parse(
            &[&data[..header_len], encoded.as_slice()].concat(),
        )
        .expect("re-encoded fragment must parse");
        assert_eq!(reparsed.objects.len(), fragment.objects.len());
    }
});
