//! Fuzz target for client frame decoding
//!
//! Arbitrary text goes through `Envelope::decode` and then through a
//! multiplexer with a handler on every event name it might carry. Neither
//! may panic; malformed frames are dropped.

#![no_main]

use libfuzzer_sys::fuzz_target;
use roomcast_core::{
    ConnectionId, ControlEvent, ControlHandler, Envelope, Multiplexer, Transport,
};

#[derive(Clone)]
struct Discard;

impl Transport for Discard {
    fn send(&self, _frame: String) {}

    fn close(&self) {}

    fn on_control(&self, _event: ControlEvent, _handler: ControlHandler) {}
}

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(envelope) = Envelope::decode(frame) {
        // Anything that decodes must encode again
        assert!(envelope.encode().is_ok());

        let mut multiplexer = Multiplexer::new(ConnectionId(1), Discard);
        multiplexer.subscribe(&envelope.event_name, |_data, responder| {
            if let Some(responder) = responder {
                responder.respond(serde_json::Value::Null);
            }
        });
        multiplexer.handle_frame(frame);
    }
});
