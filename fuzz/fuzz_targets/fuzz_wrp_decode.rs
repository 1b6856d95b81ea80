#![no_main]

use libfuzzer_sys::fuzz_target;

use wrphub::device::DeviceId;
use wrphub::wrp::{self, Format};

fuzz_target!(|data: &[u8]| {
    for format in [Format::Msgpack, Format::Json] {
        let Ok(message) = wrp::decode(data, format) else {
            continue;
        };

        // Anything that decodes must re-encode and decode to the same message.
        let encoded = wrp::encode(&message, format).expect("decoded message re-encodes");
        let again = wrp::decode(&encoded, format).expect("re-encoded message decodes");
        assert_eq!(again, message);

        if let Some(key) = message.transaction_key() {
            assert!(!key.is_empty());
        }
        let _ = DeviceId::from_destination(&message.destination);
    }
});
